//! Canonical storage using SQLite
//!
//! This module handles all persistence:
//! - Canonical entities (teams, players, matches, games, stat lines)
//! - Per-field provenance and external id mappings
//! - Raw page snapshots and orphaned records
//! - Read queries for downstream consumers
//!
//! Entity writes take an explicit connection so the ingestor can run them
//! inside its own transaction; nothing else writes canonical rows.

mod schema;

pub use schema::*;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{
    CanonicalEntity, EntityKind, Game, Match, MatchStatus, Player, Provenance, StatLine, Team,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePool,
    SqlitePoolOptions,
};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// A stored entity together with its bookkeeping columns
#[derive(Debug, Clone)]
pub struct StoredEntity {
    pub entity: CanonicalEntity,
    pub version: i64,
    pub content_hash: String,
}

/// A raw page capture
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub id: String,
    pub source: String,
    pub url: String,
    pub fetched_at: String,
    pub content_hash: String,
    pub path: String,
}

impl RawSnapshot {
    pub fn new(source: &str, url: &str, fetched_at: DateTime<Utc>, content_hash: String, path: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            url: url.to_string(),
            fetched_at: fetched_at.to_rfc3339(),
            content_hash,
            path,
        }
    }
}

/// A candidate whose references never resolved
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OrphanedRecord {
    pub id: String,
    pub source: String,
    pub kind: String,
    pub external_ref: String,
    pub missing_json: String,
    pub record_json: String,
    pub attempts: i64,
    pub created_at: String,
}

/// A match joined with its team names
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MatchRow {
    pub id: String,
    pub status: Option<MatchStatus>,
    pub event_name: Option<String>,
    pub series_name: Option<String>,
    pub scheduled_at: Option<String>,
    pub team1_name: Option<String>,
    pub team2_name: Option<String>,
    pub team1_score: Option<i64>,
    pub team2_score: Option<i64>,
    pub url: Option<String>,
    pub version: i64,
    pub updated_at: String,
}

/// A stat line joined with player, team, map and match context
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StatLineRow {
    pub id: String,
    pub player_name: Option<String>,
    pub team_name: Option<String>,
    pub match_id: Option<String>,
    pub scheduled_at: Option<String>,
    pub map_name: Option<String>,
    pub agent: Option<String>,
    pub rating: Option<f64>,
    pub acs: Option<f64>,
    pub kills: Option<i64>,
    pub deaths: Option<i64>,
    pub assists: Option<i64>,
    pub kast: Option<f64>,
    pub adr: Option<f64>,
    pub hs_pct: Option<f64>,
    pub first_kills: Option<i64>,
    pub first_deaths: Option<i64>,
}

/// A match mapped back to the source that knows it, for scheduler hydration
#[derive(Debug, Clone, FromRow)]
pub struct MatchTargetRow {
    pub source: String,
    pub external_ref: String,
    pub status: Option<MatchStatus>,
    pub updated_at: String,
}

/// Filter for match queries
#[derive(Debug, Clone, Default)]
pub struct MatchQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Team id or case-insensitive team name
    pub team: Option<String>,
    pub status: Option<MatchStatus>,
    pub limit: Option<u32>,
}

/// Filter for stat line queries
#[derive(Debug, Clone, Default)]
pub struct StatQuery {
    /// Player id or case-insensitive player name
    pub player: Option<String>,
    /// Team id or case-insensitive team name
    pub team: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Statistics for a single source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStats {
    pub mapped_ids: BTreeMap<String, usize>,
    pub snapshot_count: usize,
    pub last_fetched_at: Option<String>,
}

/// Global statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    pub team_count: usize,
    pub player_count: usize,
    pub match_count: usize,
    pub game_count: usize,
    pub stat_line_count: usize,
    pub snapshot_count: usize,
    pub orphan_count: usize,
    pub last_updated_at: Option<String>,
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("Invalid timestamp '{}': {}", s, e)))
}

fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Canonical store handle
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to the store database
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::open(&config.paths.db_file).await
    }

    /// Create database with path directly (without full config), initializing the schema
    pub async fn new(db_path: &Path) -> Result<Self> {
        let store = Self::open(db_path).await?;

        if !store.is_initialized().await? {
            store.init_schema().await?;
        }

        Ok(store)
    }

    async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='matches'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ===== Identity =====

    /// Canonical id mapped to a source-local reference
    pub async fn lookup_external_id(
        &self,
        source: &str,
        kind: EntityKind,
        external_ref: &str,
    ) -> Result<Option<String>> {
        let id = sqlx::query_scalar::<_, String>(
            "SELECT entity_id FROM external_ids WHERE source = ? AND kind = ? AND external_ref = ?",
        )
        .bind(source)
        .bind(kind.as_str())
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Canonical id of a team or player by case-insensitive name
    pub async fn find_id_by_name(&self, kind: EntityKind, name: &str) -> Result<Option<String>> {
        if !matches!(kind, EntityKind::Team | EntityKind::Player) {
            return Ok(None);
        }
        let sql = format!(
            "SELECT id FROM {} WHERE lower(name) = lower(?) ORDER BY created_at LIMIT 1",
            kind.table()
        );
        let id = sqlx::query_scalar::<_, String>(&sql)
            .bind(name.trim())
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// Load an entity with its bookkeeping columns
    pub async fn get_entity(&self, kind: EntityKind, id: &str) -> Result<Option<StoredEntity>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_entity(&mut conn, kind, id).await
    }

    /// Current version of an entity
    pub async fn entity_version(&self, kind: EntityKind, id: &str) -> Result<Option<i64>> {
        let sql = format!("SELECT version FROM {} WHERE id = ?", kind.table());
        let version = sqlx::query_scalar::<_, i64>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(version)
    }

    /// Per-field provenance of an entity
    pub async fn get_provenance(&self, entity_id: &str) -> Result<BTreeMap<String, Provenance>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_provenance(&mut conn, entity_id).await
    }

    // ===== Transactional Entity Operations =====

    pub(crate) async fn load_entity(
        conn: &mut SqliteConnection,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<StoredEntity>> {
        let sql = format!("SELECT * FROM {} WHERE id = ?", kind.table());
        let entity = match kind {
            EntityKind::Team => sqlx::query_as::<_, Team>(&sql)
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?
                .map(CanonicalEntity::Team),
            EntityKind::Player => sqlx::query_as::<_, Player>(&sql)
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?
                .map(CanonicalEntity::Player),
            EntityKind::Match => sqlx::query_as::<_, Match>(&sql)
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?
                .map(CanonicalEntity::Match),
            EntityKind::Game => sqlx::query_as::<_, Game>(&sql)
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?
                .map(CanonicalEntity::Game),
            EntityKind::StatLine => sqlx::query_as::<_, StatLine>(&sql)
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?
                .map(CanonicalEntity::StatLine),
        };

        let Some(entity) = entity else {
            return Ok(None);
        };

        let sql = format!("SELECT version, content_hash FROM {} WHERE id = ?", kind.table());
        let (version, content_hash): (i64, String) = sqlx::query_as(&sql)
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;

        Ok(Some(StoredEntity {
            entity,
            version,
            content_hash,
        }))
    }

    pub(crate) async fn entity_exists(
        conn: &mut SqliteConnection,
        kind: EntityKind,
        id: &str,
    ) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE id = ?", kind.table());
        let row: Option<(i32,)> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    pub(crate) async fn load_provenance(
        conn: &mut SqliteConnection,
        entity_id: &str,
    ) -> Result<BTreeMap<String, Provenance>> {
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            "SELECT field, source, fetched_at, snapshot_id FROM provenance WHERE entity_id = ?",
        )
        .bind(entity_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut out = BTreeMap::new();
        for (field, source, fetched_at, snapshot_id) in rows {
            out.insert(
                field,
                Provenance {
                    source,
                    fetched_at: parse_timestamp(&fetched_at)?,
                    snapshot_id,
                },
            );
        }
        Ok(out)
    }

    /// Insert or update an entity row with its version and content hash
    pub(crate) async fn write_entity(
        conn: &mut SqliteConnection,
        entity: &CanonicalEntity,
        version: i64,
        content_hash: &str,
    ) -> Result<()> {
        let fields = entity.to_fields()?;
        let columns: Vec<&str> = fields.keys().map(String::as_str).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let updates = columns
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            r#"
            INSERT INTO {table} (id, {cols}, version, content_hash, created_at, updated_at)
            VALUES (?, {placeholders}, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                {updates},
                version = excluded.version,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at
            "#,
            table = entity.kind().table(),
            cols = columns.join(", "),
        );

        let now = Utc::now().to_rfc3339();
        let mut query = sqlx::query(&sql).bind(entity.id().to_string());
        for value in fields.values() {
            query = bind_json(query, value);
        }
        query
            .bind(version)
            .bind(content_hash.to_string())
            .bind(now.clone())
            .bind(now)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub(crate) async fn write_provenance(
        conn: &mut SqliteConnection,
        entity_id: &str,
        field: &str,
        provenance: &Provenance,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provenance (entity_id, field, source, fetched_at, snapshot_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(entity_id, field) DO UPDATE SET
                source = excluded.source,
                fetched_at = excluded.fetched_at,
                snapshot_id = excluded.snapshot_id
            "#,
        )
        .bind(entity_id)
        .bind(field)
        .bind(&provenance.source)
        .bind(provenance.fetched_at.to_rfc3339())
        .bind(&provenance.snapshot_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Record a source-local reference; an existing mapping is never repointed
    pub(crate) async fn map_external_id(
        conn: &mut SqliteConnection,
        source: &str,
        kind: EntityKind,
        external_ref: &str,
        entity_id: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO external_ids (source, kind, external_ref, entity_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source, kind, external_ref) DO NOTHING
            "#,
        )
        .bind(source)
        .bind(kind.as_str())
        .bind(external_ref)
        .bind(entity_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    // ===== Snapshot Operations =====

    pub async fn insert_snapshot(&self, snapshot: &RawSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO raw_snapshots (id, source, url, fetched_at, content_hash, path)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.source)
        .bind(&snapshot.url)
        .bind(&snapshot.fetched_at)
        .bind(&snapshot.content_hash)
        .bind(&snapshot.path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_snapshot(&self, id: &str) -> Result<Option<RawSnapshot>> {
        let snapshot = sqlx::query_as::<_, RawSnapshot>("SELECT * FROM raw_snapshots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(snapshot)
    }

    /// Latest snapshot captured for a URL
    pub async fn latest_snapshot_for_url(&self, url: &str) -> Result<Option<RawSnapshot>> {
        let snapshot = sqlx::query_as::<_, RawSnapshot>(
            "SELECT * FROM raw_snapshots WHERE url = ? ORDER BY fetched_at DESC LIMIT 1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(snapshot)
    }

    // ===== Orphan Operations =====

    pub async fn insert_orphan(&self, orphan: &OrphanedRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orphaned_records (id, source, kind, external_ref, missing_json, record_json, attempts, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&orphan.id)
        .bind(&orphan.source)
        .bind(&orphan.kind)
        .bind(&orphan.external_ref)
        .bind(&orphan.missing_json)
        .bind(&orphan.record_json)
        .bind(orphan.attempts)
        .bind(&orphan.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_orphans(&self, limit: u32) -> Result<Vec<OrphanedRecord>> {
        let orphans = sqlx::query_as::<_, OrphanedRecord>(
            "SELECT * FROM orphaned_records ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(orphans)
    }

    // ===== Read Contracts =====

    /// Matches filtered by scheduled time, team and status, newest first
    pub async fn matches_in_range(&self, filter: &MatchQuery) -> Result<Vec<MatchRow>> {
        let mut sql = String::from(
            r#"
            SELECT m.id, m.status, m.event_name, m.series_name, m.scheduled_at,
                   t1.name AS team1_name, t2.name AS team2_name,
                   m.team1_score, m.team2_score, m.url, m.version, m.updated_at
            FROM matches m
            LEFT JOIN teams t1 ON t1.id = m.team1_id
            LEFT JOIN teams t2 ON t2.id = m.team2_id
            WHERE 1 = 1
            "#,
        );
        let mut binds: Vec<String> = Vec::new();

        if let Some(from) = filter.from {
            sql.push_str(" AND m.scheduled_at >= ?");
            binds.push(from.to_rfc3339());
        }
        if let Some(to) = filter.to {
            sql.push_str(" AND m.scheduled_at < ?");
            binds.push(to.to_rfc3339());
        }
        if let Some(team) = &filter.team {
            sql.push_str(
                " AND (m.team1_id = ? OR m.team2_id = ? OR lower(t1.name) = lower(?) OR lower(t2.name) = lower(?))",
            );
            binds.extend(std::iter::repeat(team.clone()).take(4));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND m.status = ?");
            binds.push(status.to_string());
        }
        sql.push_str(" ORDER BY m.scheduled_at DESC, m.updated_at DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, MatchRow>(&sql);
        for b in binds {
            query = query.bind(b);
        }
        let rows = query
            .bind(filter.limit.unwrap_or(50) as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Stat lines filtered by player, team and match date, newest first
    pub async fn stat_lines(&self, filter: &StatQuery) -> Result<Vec<StatLineRow>> {
        let mut sql = String::from(
            r#"
            SELECT s.id, p.name AS player_name, t.name AS team_name,
                   g.match_id, m.scheduled_at, g.map_name, s.agent,
                   s.rating, s.acs, s.kills, s.deaths, s.assists,
                   s.kast, s.adr, s.hs_pct, s.first_kills, s.first_deaths
            FROM stat_lines s
            JOIN games g ON g.id = s.game_id
            JOIN matches m ON m.id = g.match_id
            LEFT JOIN players p ON p.id = s.player_id
            LEFT JOIN teams t ON t.id = s.team_id
            WHERE 1 = 1
            "#,
        );
        let mut binds: Vec<String> = Vec::new();

        if let Some(player) = &filter.player {
            sql.push_str(" AND (s.player_id = ? OR lower(p.name) = lower(?))");
            binds.push(player.clone());
            binds.push(player.clone());
        }
        if let Some(team) = &filter.team {
            sql.push_str(" AND (s.team_id = ? OR lower(t.name) = lower(?))");
            binds.push(team.clone());
            binds.push(team.clone());
        }
        if let Some(from) = filter.from {
            sql.push_str(" AND m.scheduled_at >= ?");
            binds.push(from.to_rfc3339());
        }
        if let Some(to) = filter.to {
            sql.push_str(" AND m.scheduled_at < ?");
            binds.push(to.to_rfc3339());
        }
        sql.push_str(" ORDER BY m.scheduled_at DESC, g.ordinal, s.rating DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, StatLineRow>(&sql);
        for b in binds {
            query = query.bind(b);
        }
        let rows = query
            .bind(filter.limit.unwrap_or(100) as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Games of a match in map order
    pub async fn games_for_match(&self, match_id: &str) -> Result<Vec<Game>> {
        let games = sqlx::query_as::<_, Game>(
            "SELECT * FROM games WHERE match_id = ? ORDER BY ordinal",
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(games)
    }

    /// Stat lines of a game
    pub async fn stat_lines_for_game(&self, game_id: &str) -> Result<Vec<StatLine>> {
        let lines = sqlx::query_as::<_, StatLine>(
            "SELECT * FROM stat_lines WHERE game_id = ? ORDER BY player_id",
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(lines)
    }

    /// Every match a source knows about, for scheduler hydration
    pub async fn match_targets(&self) -> Result<Vec<MatchTargetRow>> {
        let rows = sqlx::query_as::<_, MatchTargetRow>(
            r#"
            SELECT e.source, e.external_ref, m.status, m.updated_at
            FROM matches m
            JOIN external_ids e ON e.entity_id = m.id AND e.kind = 'match'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ===== Statistics =====

    /// Get source statistics
    pub async fn get_source_stats(&self, source: &str) -> Result<SourceStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT kind, COUNT(*) FROM external_ids WHERE source = ? GROUP BY kind",
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        let (snapshot_count, last_fetched_at): (i64, Option<String>) = sqlx::query_as(
            "SELECT COUNT(*), MAX(fetched_at) FROM raw_snapshots WHERE source = ?",
        )
        .bind(source)
        .fetch_one(&self.pool)
        .await?;

        Ok(SourceStats {
            mapped_ids: rows.into_iter().map(|(k, c)| (k, c as usize)).collect(),
            snapshot_count: snapshot_count as usize,
            last_fetched_at,
        })
    }

    async fn count_rows(&self, table: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    /// Get global statistics
    pub async fn get_global_stats(&self) -> Result<GlobalStats> {
        let last_updated_at: Option<String> = sqlx::query_scalar(
            r#"
            SELECT MAX(updated_at) FROM (
                SELECT updated_at FROM teams
                UNION ALL SELECT updated_at FROM players
                UNION ALL SELECT updated_at FROM matches
                UNION ALL SELECT updated_at FROM games
                UNION ALL SELECT updated_at FROM stat_lines
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(GlobalStats {
            team_count: self.count_rows("teams").await?,
            player_count: self.count_rows("players").await?,
            match_count: self.count_rows("matches").await?,
            game_count: self.count_rows("games").await?,
            stat_line_count: self.count_rows("stat_lines").await?,
            snapshot_count: self.count_rows("raw_snapshots").await?,
            orphan_count: self.count_rows("orphaned_records").await?,
            last_updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_test_store() -> (Store, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.db_file = tmp.path().join("test.db");

        let store = Store::connect(&config).await.unwrap();
        store.init_schema().await.unwrap();
        (store, tmp)
    }

    fn team(id: &str, name: &str) -> CanonicalEntity {
        CanonicalEntity::Team(Team {
            id: id.to_string(),
            name: Some(name.to_string()),
            tag: None,
            region: Some("NA".to_string()),
            logo_url: None,
        })
    }

    #[tokio::test]
    async fn test_entity_write_and_load() {
        let (store, _tmp) = setup_test_store().await;
        let entity = team("t1", "Sentinels");
        let hash = entity.content_hash().unwrap();

        let mut conn = store.pool().acquire().await.unwrap();
        Store::write_entity(&mut conn, &entity, 1, &hash).await.unwrap();
        drop(conn);

        let loaded = store.get_entity(EntityKind::Team, "t1").await.unwrap().unwrap();
        assert_eq!(loaded.entity, entity);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.content_hash, hash);

        assert_eq!(
            store.find_id_by_name(EntityKind::Team, "sentinels").await.unwrap(),
            Some("t1".to_string())
        );
        assert_eq!(store.find_id_by_name(EntityKind::Match, "x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_external_id_mapping_is_stable() {
        let (store, _tmp) = setup_test_store().await;
        let mut conn = store.pool().acquire().await.unwrap();
        Store::map_external_id(&mut conn, "vlr", EntityKind::Team, "2", "t1")
            .await
            .unwrap();
        Store::map_external_id(&mut conn, "vlr", EntityKind::Team, "2", "t2")
            .await
            .unwrap();
        drop(conn);

        let id = store
            .lookup_external_id("vlr", EntityKind::Team, "2")
            .await
            .unwrap();
        assert_eq!(id, Some("t1".to_string()));
        assert!(store
            .lookup_external_id("vlr", EntityKind::Player, "2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_provenance_roundtrip() {
        let (store, _tmp) = setup_test_store().await;
        let fetched_at = DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let prov = Provenance {
            source: "vlr".to_string(),
            fetched_at,
            snapshot_id: Some("snap".to_string()),
        };

        let mut conn = store.pool().acquire().await.unwrap();
        Store::write_provenance(&mut conn, "t1", "name", &prov).await.unwrap();
        drop(conn);

        let loaded = store.get_provenance("t1").await.unwrap();
        assert_eq!(loaded.get("name"), Some(&prov));
    }

    #[tokio::test]
    async fn test_snapshot_and_orphan_records() {
        let (store, _tmp) = setup_test_store().await;
        let snap = RawSnapshot::new(
            "vlr",
            "https://www.vlr.gg/1",
            Utc::now(),
            "abc".to_string(),
            "snapshots/abc.html".to_string(),
        );
        store.insert_snapshot(&snap).await.unwrap();
        let loaded = store.get_snapshot(&snap.id).await.unwrap().unwrap();
        assert_eq!(loaded.url, "https://www.vlr.gg/1");
        assert!(store
            .latest_snapshot_for_url("https://www.vlr.gg/1")
            .await
            .unwrap()
            .is_some());

        let orphan = OrphanedRecord {
            id: "o1".to_string(),
            source: "vlr".to_string(),
            kind: "game".to_string(),
            external_ref: "1/2".to_string(),
            missing_json: "[]".to_string(),
            record_json: "{}".to_string(),
            attempts: 5,
            created_at: Utc::now().to_rfc3339(),
        };
        store.insert_orphan(&orphan).await.unwrap();
        assert_eq!(store.list_orphans(10).await.unwrap().len(), 1);

        let stats = store.get_global_stats().await.unwrap();
        assert_eq!(stats.snapshot_count, 1);
        assert_eq!(stats.orphan_count, 1);
        assert_eq!(stats.team_count, 0);

        let source_stats = store.get_source_stats("vlr").await.unwrap();
        assert_eq!(source_stats.snapshot_count, 1);
    }

    #[tokio::test]
    async fn test_matches_in_range_filters() {
        let (store, _tmp) = setup_test_store().await;
        let mut conn = store.pool().acquire().await.unwrap();
        for (id, name) in [("t1", "Sentinels"), ("t2", "LOUD"), ("t3", "FNATIC")] {
            let e = team(id, name);
            Store::write_entity(&mut conn, &e, 1, &e.content_hash().unwrap())
                .await
                .unwrap();
        }
        let matches = [
            ("m1", "t1", "t2", "2024-06-01T10:00:00+00:00"),
            ("m2", "t2", "t3", "2024-06-02T10:00:00+00:00"),
            ("m3", "t1", "t3", "2024-07-01T10:00:00+00:00"),
        ];
        for (id, a, b, at) in matches {
            let e = CanonicalEntity::Match(Match {
                id: id.to_string(),
                status: Some(MatchStatus::Completed),
                event_name: Some("Masters".to_string()),
                series_name: None,
                scheduled_at: Some(at.to_string()),
                patch: None,
                team1_id: Some(a.to_string()),
                team2_id: Some(b.to_string()),
                team1_score: Some(2),
                team2_score: Some(1),
                url: None,
            });
            Store::write_entity(&mut conn, &e, 1, &e.content_hash().unwrap())
                .await
                .unwrap();
        }
        drop(conn);

        let june = MatchQuery {
            from: Some(parse_timestamp("2024-06-01T00:00:00Z").unwrap()),
            to: Some(parse_timestamp("2024-07-01T00:00:00Z").unwrap()),
            ..Default::default()
        };
        let rows = store.matches_in_range(&june).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "m2");

        let sen = MatchQuery {
            team: Some("sentinels".to_string()),
            ..Default::default()
        };
        let rows = store.matches_in_range(&sen).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.id == "m1" || r.id == "m3"));
        assert_eq!(rows[0].team1_name.as_deref(), Some("Sentinels"));
    }
}
