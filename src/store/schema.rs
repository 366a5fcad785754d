//! SQLite schema definition

/// SQL schema for the canonical store
pub const SCHEMA_SQL: &str = r#"
-- Teams
CREATE TABLE IF NOT EXISTS teams (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    tag TEXT,
    region TEXT,
    logo_url TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Players
CREATE TABLE IF NOT EXISTS players (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    real_name TEXT,
    nation TEXT,
    team_id TEXT REFERENCES teams(id),
    version INTEGER NOT NULL DEFAULT 1,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Matches: one series between two teams
CREATE TABLE IF NOT EXISTS matches (
    id TEXT PRIMARY KEY,
    status TEXT,
    event_name TEXT,
    series_name TEXT,
    scheduled_at TEXT,
    patch TEXT,
    team1_id TEXT REFERENCES teams(id),
    team2_id TEXT REFERENCES teams(id),
    team1_score INTEGER,
    team2_score INTEGER,
    url TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Games: individual maps within a match
CREATE TABLE IF NOT EXISTS games (
    id TEXT PRIMARY KEY,
    match_id TEXT NOT NULL REFERENCES matches(id),
    ordinal INTEGER,
    map_name TEXT,
    team1_score INTEGER,
    team2_score INTEGER,
    picked_by TEXT REFERENCES teams(id),
    duration TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Stat lines: one player's performance in one game
CREATE TABLE IF NOT EXISTS stat_lines (
    id TEXT PRIMARY KEY,
    game_id TEXT NOT NULL REFERENCES games(id),
    player_id TEXT NOT NULL REFERENCES players(id),
    team_id TEXT REFERENCES teams(id),
    agent TEXT,
    rating REAL,
    acs REAL,
    kills INTEGER,
    deaths INTEGER,
    assists INTEGER,
    kd_diff INTEGER,
    kast REAL,
    adr REAL,
    hs_pct REAL,
    first_kills INTEGER,
    first_deaths INTEGER,
    fk_diff INTEGER,
    version INTEGER NOT NULL DEFAULT 1,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Provenance: which fetch last set each field
CREATE TABLE IF NOT EXISTS provenance (
    entity_id TEXT NOT NULL,
    field TEXT NOT NULL,
    source TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    snapshot_id TEXT,
    PRIMARY KEY (entity_id, field)
);

-- External ids: source-local references mapped to canonical ids
CREATE TABLE IF NOT EXISTS external_ids (
    source TEXT NOT NULL,
    kind TEXT NOT NULL,
    external_ref TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (source, kind, external_ref)
);

-- Raw snapshots: content-addressed page captures
CREATE TABLE IF NOT EXISTS raw_snapshots (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    url TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    path TEXT NOT NULL
);

-- Orphaned records: candidates whose references never resolved
CREATE TABLE IF NOT EXISTS orphaned_records (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    kind TEXT NOT NULL,
    external_ref TEXT NOT NULL,
    missing_json TEXT NOT NULL,
    record_json TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_teams_name ON teams(lower(name));
CREATE INDEX IF NOT EXISTS idx_players_name ON players(lower(name));
CREATE INDEX IF NOT EXISTS idx_matches_scheduled ON matches(scheduled_at);
CREATE INDEX IF NOT EXISTS idx_matches_status ON matches(status);
CREATE INDEX IF NOT EXISTS idx_games_match ON games(match_id);
CREATE INDEX IF NOT EXISTS idx_stat_lines_game ON stat_lines(game_id);
CREATE INDEX IF NOT EXISTS idx_stat_lines_player ON stat_lines(player_id);
CREATE INDEX IF NOT EXISTS idx_external_ids_entity ON external_ids(entity_id);
CREATE INDEX IF NOT EXISTS idx_snapshots_hash ON raw_snapshots(content_hash);
"#;
