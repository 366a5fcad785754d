//! Per-source alias tables
//!
//! An alias table maps names a source uses to the canonical display name,
//! e.g. `"GEN" = "Gen.G"`. Lookups ignore case.
//!
//! ```toml
//! [teams]
//! "GEN" = "Gen.G"
//! "Gen.G Esports" = "Gen.G"
//!
//! [players]
//! "tenz" = "TenZ"
//! ```

use crate::error::{Error, Result};
use crate::models::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AliasTable {
    #[serde(default)]
    pub teams: BTreeMap<String, String>,

    #[serde(default)]
    pub players: BTreeMap<String, String>,

    #[serde(skip)]
    index: HashMap<(EntityKind, String), String>,
}

impl AliasTable {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read alias table {}: {}", path.display(), e))
        })?;
        let table = Self::from_toml(&content)?;
        debug!(
            "Loaded {} team and {} player aliases from {}",
            table.teams.len(),
            table.players.len(),
            path.display()
        );
        Ok(table)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut table: AliasTable = toml::from_str(content)?;
        table.build_index();
        Ok(table)
    }

    fn build_index(&mut self) {
        self.index.clear();
        for (kind, map) in [
            (EntityKind::Team, &self.teams),
            (EntityKind::Player, &self.players),
        ] {
            for (alias, canonical) in map {
                self.index
                    .insert((kind, alias.trim().to_lowercase()), canonical.clone());
            }
        }
    }

    /// Canonical name for `name`, or `name` itself when no alias applies
    pub fn canonical_name<'a>(&'a self, kind: EntityKind, name: &'a str) -> &'a str {
        self.index
            .get(&(kind, name.trim().to_lowercase()))
            .map(String::as_str)
            .unwrap_or(name)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
