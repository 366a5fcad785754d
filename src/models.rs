//! Domain types shared by every pipeline stage.
//!
//! Candidate records are loosely typed field bags produced by extraction;
//! canonical entities are the typed rows the store persists.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

/// Kinds of canonical entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Team,
    Player,
    Match,
    Game,
    StatLine,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Team,
        EntityKind::Player,
        EntityKind::Match,
        EntityKind::Game,
        EntityKind::StatLine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Team => "team",
            EntityKind::Player => "player",
            EntityKind::Match => "match",
            EntityKind::Game => "game",
            EntityKind::StatLine => "stat_line",
        }
    }

    /// Backing table in the store
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Team => "teams",
            EntityKind::Player => "players",
            EntityKind::Match => "matches",
            EntityKind::Game => "games",
            EntityKind::StatLine => "stat_lines",
        }
    }

    /// Ingestion order: referenced kinds come first
    pub fn dependency_rank(&self) -> u8 {
        match self {
            EntityKind::Team => 0,
            EntityKind::Player => 1,
            EntityKind::Match => 2,
            EntityKind::Game => 3,
            EntityKind::StatLine => 4,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "team" => Ok(EntityKind::Team),
            "player" => Ok(EntityKind::Player),
            "match" => Ok(EntityKind::Match),
            "game" => Ok(EntityKind::Game),
            "stat_line" | "statline" => Ok(EntityKind::StatLine),
            _ => Err(Error::Other(format!("Unknown entity kind: {}", s))),
        }
    }
}

/// Kinds of page the scheduler can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    MatchList,
    Match,
    Team,
    Player,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::MatchList => "match_list",
            TargetKind::Match => "match",
            TargetKind::Team => "team",
            TargetKind::Player => "player",
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "match_list" | "matches" => Ok(TargetKind::MatchList),
            "match" => Ok(TargetKind::Match),
            "team" => Ok(TargetKind::Team),
            "player" => Ok(TargetKind::Player),
            _ => Err(Error::Other(format!("Unknown target kind: {}", s))),
        }
    }
}

/// Lifecycle state of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MatchStatus {
    Upcoming,
    Live,
    Completed,
}

impl MatchStatus {
    /// Map the status text shown on listing and match pages
    pub fn from_page_text(text: &str) -> Option<Self> {
        let t = text.trim().to_lowercase();
        if t.is_empty() {
            return None;
        }
        if t.contains("live") {
            Some(MatchStatus::Live)
        } else if t.contains("final") || t.contains("completed") || t.contains("ago") {
            Some(MatchStatus::Completed)
        } else {
            Some(MatchStatus::Upcoming)
        }
    }
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchStatus::Upcoming => write!(f, "upcoming"),
            MatchStatus::Live => write!(f, "live"),
            MatchStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Where and when a value was observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub snapshot_id: Option<String>,
}

/// Reference to another entity by its source-local identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub external_ref: String,
}

/// Loosely typed record produced by an extraction rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub kind: EntityKind,
    pub external_ref: String,
    pub fields: BTreeMap<String, Value>,
    /// Field name -> referenced entity; filled with canonical ids on resolution
    pub refs: BTreeMap<String, EntityRef>,
    pub provenance: Provenance,
}

impl CandidateRecord {
    pub fn new(kind: EntityKind, external_ref: impl Into<String>, provenance: Provenance) -> Self {
        Self {
            kind,
            external_ref: external_ref.into(),
            fields: BTreeMap::new(),
            refs: BTreeMap::new(),
            provenance,
        }
    }

    /// Set a field; `None` leaves the field unobserved
    pub fn with_field<V: Into<Value>>(mut self, name: &str, value: Option<V>) -> Self {
        if let Some(v) = value {
            let v = v.into();
            if !v.is_null() {
                self.fields.insert(name.to_string(), v);
            }
        }
        self
    }

    pub fn with_ref(mut self, field: &str, kind: EntityKind, external_ref: impl Into<String>) -> Self {
        self.refs.insert(
            field.to_string(),
            EntityRef {
                kind,
                external_ref: external_ref.into(),
            },
        );
        self
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn source(&self) -> &str {
        &self.provenance.source
    }
}

/// Deterministic identifier for a first sighting, so concurrent discovery converges
pub fn canonical_id(kind: EntityKind, source: &str, external_ref: &str) -> String {
    let key = format!("{}:{}:{}", kind.as_str(), source, external_ref);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: Option<String>,
    pub tag: Option<String>,
    pub region: Option<String>,
    pub logo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub name: Option<String>,
    pub real_name: Option<String>,
    pub nation: Option<String>,
    pub team_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub status: Option<MatchStatus>,
    pub event_name: Option<String>,
    pub series_name: Option<String>,
    /// RFC 3339
    pub scheduled_at: Option<String>,
    pub patch: Option<String>,
    pub team1_id: Option<String>,
    pub team2_id: Option<String>,
    pub team1_score: Option<i64>,
    pub team2_score: Option<i64>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub match_id: Option<String>,
    pub ordinal: Option<i64>,
    pub map_name: Option<String>,
    pub team1_score: Option<i64>,
    pub team2_score: Option<i64>,
    pub picked_by: Option<String>,
    /// Map duration as displayed, e.g. "42:17"
    pub duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct StatLine {
    pub id: String,
    pub game_id: Option<String>,
    pub player_id: Option<String>,
    pub team_id: Option<String>,
    pub agent: Option<String>,
    pub rating: Option<f64>,
    pub acs: Option<f64>,
    pub kills: Option<i64>,
    pub deaths: Option<i64>,
    pub assists: Option<i64>,
    pub kd_diff: Option<i64>,
    pub kast: Option<f64>,
    pub adr: Option<f64>,
    pub hs_pct: Option<f64>,
    pub first_kills: Option<i64>,
    pub first_deaths: Option<i64>,
    pub fk_diff: Option<i64>,
}

/// A typed, persisted entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalEntity {
    Team(Team),
    Player(Player),
    Match(Match),
    Game(Game),
    StatLine(StatLine),
}

impl CanonicalEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            CanonicalEntity::Team(_) => EntityKind::Team,
            CanonicalEntity::Player(_) => EntityKind::Player,
            CanonicalEntity::Match(_) => EntityKind::Match,
            CanonicalEntity::Game(_) => EntityKind::Game,
            CanonicalEntity::StatLine(_) => EntityKind::StatLine,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            CanonicalEntity::Team(e) => &e.id,
            CanonicalEntity::Player(e) => &e.id,
            CanonicalEntity::Match(e) => &e.id,
            CanonicalEntity::Game(e) => &e.id,
            CanonicalEntity::StatLine(e) => &e.id,
        }
    }

    /// Every column except `id`, with unset fields as `null`
    pub fn to_fields(&self) -> Result<BTreeMap<String, Value>> {
        let value = match self {
            CanonicalEntity::Team(e) => serde_json::to_value(e)?,
            CanonicalEntity::Player(e) => serde_json::to_value(e)?,
            CanonicalEntity::Match(e) => serde_json::to_value(e)?,
            CanonicalEntity::Game(e) => serde_json::to_value(e)?,
            CanonicalEntity::StatLine(e) => serde_json::to_value(e)?,
        };
        let Value::Object(map) = value else {
            return Err(Error::Other("entity did not serialize to an object".to_string()));
        };
        Ok(map.into_iter().filter(|(k, _)| k != "id").collect())
    }

    /// Build a typed entity from a field bag; unknown fields are ignored
    pub fn from_fields(kind: EntityKind, id: &str, fields: &BTreeMap<String, Value>) -> Result<Self> {
        let mut map = Map::new();
        for (k, v) in fields {
            map.insert(k.clone(), v.clone());
        }
        map.insert("id".to_string(), Value::String(id.to_string()));
        let value = Value::Object(map);

        Ok(match kind {
            EntityKind::Team => CanonicalEntity::Team(serde_json::from_value(value)?),
            EntityKind::Player => CanonicalEntity::Player(serde_json::from_value(value)?),
            EntityKind::Match => CanonicalEntity::Match(serde_json::from_value(value)?),
            EntityKind::Game => CanonicalEntity::Game(serde_json::from_value(value)?),
            EntityKind::StatLine => CanonicalEntity::StatLine(serde_json::from_value(value)?),
        })
    }

    /// blake3 over the canonical JSON of the fields
    pub fn content_hash(&self) -> Result<String> {
        // BTreeMap keeps key order stable
        let canonical = serde_json::to_string(&self.to_fields()?)?;
        Ok(blake3::hash(canonical.as_bytes()).to_hex().to_string())
    }

    /// Display name used for alias and name lookups
    pub fn name(&self) -> Option<&str> {
        match self {
            CanonicalEntity::Team(t) => t.name.as_deref(),
            CanonicalEntity::Player(p) => p.name.as_deref(),
            _ => None,
        }
    }
}

/// Source-local identifier mapped to a canonical entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalRef {
    pub source: String,
    pub external_ref: String,
}

/// A candidate reconciled against canonical identity, ready to ingest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub entity: CanonicalEntity,
    /// Observed fields only; unobserved fields never overwrite stored values
    pub provenance: BTreeMap<String, Provenance>,
    pub external_refs: Vec<ExternalRef>,
    /// Canonical ids this entity points at, for dependency tracking
    pub depends_on: Vec<String>,
}

impl ResolvedEntity {
    pub fn kind(&self) -> EntityKind {
        self.entity.kind()
    }

    pub fn id(&self) -> &str {
        self.entity.id()
    }
}

/// A page retrieved by the fetcher
#[derive(Debug, Clone)]
pub struct RawPage {
    pub source: String,
    pub url: String,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
    pub snapshot_id: Option<String>,
}

impl RawPage {
    pub fn provenance(&self) -> Provenance {
        Provenance {
            source: self.source.clone(),
            fetched_at: self.fetched_at,
            snapshot_id: self.snapshot_id.clone(),
        }
    }
}
