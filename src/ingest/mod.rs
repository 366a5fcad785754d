//! Transactional upserts of resolved entities
//!
//! Each entity commits in its own transaction while holding a lock on its
//! canonical id. Fields merge one at a time: an incoming value replaces the
//! stored one only when its provenance is strictly newer. The merged row is
//! hashed; an unchanged hash keeps the version as is.
//!
//! Reading, merging and validating run under the id lock alone, so unrelated
//! entities proceed concurrently. Only the final write transaction takes the
//! store-wide writer lock.

use crate::error::IngestError;
use crate::models::{CanonicalEntity, EntityKind, Provenance, ResolvedEntity};
use crate::store::Store;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What a commit did to the stored row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    Created,
    Updated { version: i64 },
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitResult {
    pub id: String,
    pub kind: EntityKind,
    pub outcome: CommitOutcome,
    pub version: i64,
    /// Fields whose value or provenance was replaced
    pub fields_updated: Vec<String>,
}

/// Result of a composite write
#[derive(Debug, Default)]
pub struct GroupReport {
    pub committed: Vec<CommitResult>,
    pub failed: Vec<(String, IngestError)>,
}

impl GroupReport {
    pub fn created(&self) -> usize {
        self.count(|o| matches!(o, CommitOutcome::Created))
    }

    pub fn updated(&self) -> usize {
        self.count(|o| matches!(o, CommitOutcome::Updated { .. }))
    }

    pub fn unchanged(&self) -> usize {
        self.count(|o| matches!(o, CommitOutcome::Unchanged))
    }

    fn count(&self, f: impl Fn(&CommitOutcome) -> bool) -> usize {
        self.committed.iter().filter(|c| f(&c.outcome)).count()
    }
}

/// Foreign keys per kind: (field, referenced kind, required)
fn reference_fields(kind: EntityKind) -> &'static [(&'static str, EntityKind, bool)] {
    match kind {
        EntityKind::Team => &[],
        EntityKind::Player => &[("team_id", EntityKind::Team, false)],
        EntityKind::Match => &[
            ("team1_id", EntityKind::Team, false),
            ("team2_id", EntityKind::Team, false),
        ],
        EntityKind::Game => &[
            ("match_id", EntityKind::Match, true),
            ("picked_by", EntityKind::Team, false),
        ],
        EntityKind::StatLine => &[
            ("game_id", EntityKind::Game, true),
            ("player_id", EntityKind::Player, true),
            ("team_id", EntityKind::Team, false),
        ],
    }
}

/// The only writer of canonical entities
pub struct Ingestor {
    store: Store,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Held for write transactions only; SQLite admits one writer and a
    /// deferred transaction that loses the upgrade race fails with SQLITE_BUSY
    writer: Mutex<()>,
}

impl Ingestor {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release(&self, id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // Map entry plus ours: nobody else is waiting
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(id);
        }
    }

    /// Commit one entity
    pub async fn ingest(&self, resolved: &ResolvedEntity) -> Result<CommitResult, IngestError> {
        let id = resolved.id().to_string();
        let lock = self.lock_for(&id).await;
        let result = {
            let _guard = lock.lock().await;
            self.commit(resolved).await
        };
        self.release(&id, lock).await;
        result
    }

    /// Commit a page's entities dependency-first
    ///
    /// Valid units commit even when others fail; a unit whose dependency
    /// failed in this group fails with `DependencyFailed`.
    pub async fn ingest_group(&self, mut units: Vec<ResolvedEntity>) -> GroupReport {
        units.sort_by_key(|u| u.kind().dependency_rank());

        let mut report = GroupReport::default();
        let mut failed_ids: HashSet<String> = HashSet::new();

        for unit in &units {
            if let Some(dependency) = unit.depends_on.iter().find(|d| failed_ids.contains(*d)) {
                let err = IngestError::DependencyFailed {
                    entity: unit.id().to_string(),
                    dependency: dependency.clone(),
                };
                debug!("{}", err);
                failed_ids.insert(unit.id().to_string());
                report.failed.push((unit.id().to_string(), err));
                continue;
            }

            match self.ingest(unit).await {
                Ok(result) => report.committed.push(result),
                Err(e) => {
                    warn!("Failed to ingest {} {}: {}", unit.kind(), unit.id(), e);
                    failed_ids.insert(unit.id().to_string());
                    report.failed.push((unit.id().to_string(), e));
                }
            }
        }

        if !report.committed.is_empty() {
            info!(
                "Ingested {} entities ({} created, {} updated, {} unchanged, {} failed)",
                report.committed.len(),
                report.created(),
                report.updated(),
                report.unchanged(),
                report.failed.len()
            );
        }
        report
    }

    async fn commit(&self, resolved: &ResolvedEntity) -> Result<CommitResult, IngestError> {
        let kind = resolved.kind();
        let id = resolved.id();

        // The id lock keeps this row stable until the write below
        let mut conn = self.store.pool().acquire().await?;
        let stored = Store::load_entity(&mut conn, kind, id).await?;
        let current_prov = Store::load_provenance(&mut conn, id).await?;
        let incoming = resolved.entity.to_fields()?;

        let mut merged: BTreeMap<String, Value> = match &stored {
            Some(s) => s.entity.to_fields()?,
            None => incoming.clone(),
        };
        let mut winners: Vec<(&String, &Provenance)> = Vec::new();
        for (field, prov) in &resolved.provenance {
            let newer = match current_prov.get(field) {
                Some(current) => prov.fetched_at > current.fetched_at,
                None => true,
            };
            if !newer {
                continue;
            }
            if let Some(value) = incoming.get(field) {
                merged.insert(field.clone(), value.clone());
                winners.push((field, prov));
            }
        }

        let entity = CanonicalEntity::from_fields(kind, id, &merged)?;
        Self::validate(&mut conn, &entity, &merged).await?;
        let hash = entity.content_hash()?;
        // Released before waiting on the writer so waiters never starve the pool
        drop(conn);

        let _writer = self.writer.lock().await;
        let mut tx = self.store.pool().begin().await?;
        let (outcome, version) = match &stored {
            None => {
                Store::write_entity(&mut tx, &entity, 1, &hash).await?;
                (CommitOutcome::Created, 1)
            }
            Some(s) if s.content_hash == hash => (CommitOutcome::Unchanged, s.version),
            Some(s) => {
                let version = s.version + 1;
                Store::write_entity(&mut tx, &entity, version, &hash).await?;
                (CommitOutcome::Updated { version }, version)
            }
        };

        for (field, prov) in &winners {
            Store::write_provenance(&mut tx, id, field, prov).await?;
        }
        for external in &resolved.external_refs {
            Store::map_external_id(&mut tx, &external.source, kind, &external.external_ref, id)
                .await?;
        }

        tx.commit().await?;

        debug!("{} {} -> {:?}", kind, id, outcome);
        Ok(CommitResult {
            id: id.to_string(),
            kind,
            outcome,
            version,
            fields_updated: winners.iter().map(|(f, _)| (*f).clone()).collect(),
        })
    }

    /// Reject rows the store could not hold consistently
    async fn validate(
        conn: &mut sqlx::SqliteConnection,
        entity: &CanonicalEntity,
        fields: &BTreeMap<String, Value>,
    ) -> Result<(), IngestError> {
        let kind = entity.kind();
        let conflict = |reason: String| IngestError::Conflict {
            entity: format!("{} {}", kind, entity.id()),
            reason,
        };

        if matches!(kind, EntityKind::Team | EntityKind::Player)
            && entity.name().map(str::trim).unwrap_or_default().is_empty()
        {
            return Err(conflict("name is required".to_string()));
        }

        for (field, target_kind, required) in reference_fields(kind) {
            match fields.get(*field).and_then(Value::as_str) {
                Some(target) => {
                    if !Store::entity_exists(conn, *target_kind, target).await? {
                        return Err(conflict(format!(
                            "{} references missing {} {}",
                            field, target_kind, target
                        )));
                    }
                }
                None if *required => {
                    return Err(conflict(format!("{} is required", field)));
                }
                None => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExternalRef, Game, Match, MatchStatus, Team};
    use chrono::{DateTime, Duration, Utc};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Store, Ingestor) {
        let tmp = TempDir::new().unwrap();
        let store = Store::new(&tmp.path().join("test.db")).await.unwrap();
        let ingestor = Ingestor::new(store.clone());
        (tmp, store, ingestor)
    }

    fn prov(at: DateTime<Utc>) -> Provenance {
        Provenance {
            source: "vlr".to_string(),
            fetched_at: at,
            snapshot_id: None,
        }
    }

    /// Build a resolved entity observing exactly the non-null fields
    fn resolved(entity: CanonicalEntity, at: DateTime<Utc>, external_ref: &str) -> ResolvedEntity {
        let fields = entity.to_fields().unwrap();
        let provenance = fields
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| (k.clone(), prov(at)))
            .collect();
        let depends_on = reference_fields(entity.kind())
            .iter()
            .filter_map(|(f, _, _)| fields.get(*f).and_then(Value::as_str).map(str::to_string))
            .collect();
        ResolvedEntity {
            entity,
            provenance,
            external_refs: vec![ExternalRef {
                source: "vlr".to_string(),
                external_ref: external_ref.to_string(),
            }],
            depends_on,
        }
    }

    fn team(id: &str, name: &str) -> CanonicalEntity {
        CanonicalEntity::Team(Team {
            id: id.to_string(),
            name: Some(name.to_string()),
            tag: None,
            region: None,
            logo_url: None,
        })
    }

    fn match_with_score(status: MatchStatus, s1: i64, s2: i64) -> CanonicalEntity {
        CanonicalEntity::Match(Match {
            id: "m1".to_string(),
            status: Some(status),
            event_name: Some("Masters Shanghai".to_string()),
            series_name: None,
            scheduled_at: None,
            patch: None,
            team1_id: Some("t1".to_string()),
            team2_id: Some("t2".to_string()),
            team1_score: Some(s1),
            team2_score: Some(s2),
            url: None,
        })
    }

    async fn seed_teams(ingestor: &Ingestor, at: DateTime<Utc>) {
        ingestor.ingest(&resolved(team("t1", "Gen.G"), at, "17")).await.unwrap();
        ingestor.ingest(&resolved(team("t2", "Sentinels"), at, "2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_identical_ingest_is_idempotent() {
        let (_tmp, store, ingestor) = setup().await;
        let now = Utc::now();

        let first = ingestor.ingest(&resolved(team("t1", "Gen.G"), now, "17")).await.unwrap();
        assert_eq!(first.outcome, CommitOutcome::Created);
        assert_eq!(first.version, 1);

        let again = ingestor.ingest(&resolved(team("t1", "Gen.G"), now, "17")).await.unwrap();
        assert_eq!(again.outcome, CommitOutcome::Unchanged);
        assert_eq!(again.version, 1);
        assert!(again.fields_updated.is_empty());

        // Same content seen later refreshes provenance but not the version
        let later = now + Duration::minutes(5);
        let refreshed = ingestor.ingest(&resolved(team("t1", "Gen.G"), later, "17")).await.unwrap();
        assert_eq!(refreshed.outcome, CommitOutcome::Unchanged);
        assert_eq!(store.get_provenance("t1").await.unwrap()["name"].fetched_at, later);

        assert_eq!(store.get_global_stats().await.unwrap().team_count, 1);
        assert_eq!(
            store.lookup_external_id("vlr", EntityKind::Team, "17").await.unwrap(),
            Some("t1".to_string())
        );
    }

    #[tokio::test]
    async fn test_older_fetch_never_overwrites() {
        let (_tmp, store, ingestor) = setup().await;
        let now = Utc::now();
        seed_teams(&ingestor, now).await;

        let fresh = match_with_score(MatchStatus::Completed, 2, 1);
        let stale = match_with_score(MatchStatus::Live, 1, 0);

        ingestor.ingest(&resolved(fresh, now, "100")).await.unwrap();
        let result = ingestor
            .ingest(&resolved(stale.clone(), now - Duration::minutes(30), "100"))
            .await
            .unwrap();
        assert_eq!(result.outcome, CommitOutcome::Unchanged);

        // Equal timestamps do not overwrite either
        let result = ingestor.ingest(&resolved(stale, now, "100")).await.unwrap();
        assert_eq!(result.outcome, CommitOutcome::Unchanged);

        let stored = store.get_entity(EntityKind::Match, "m1").await.unwrap().unwrap();
        let CanonicalEntity::Match(m) = stored.entity else {
            panic!("expected match");
        };
        assert_eq!(m.status, Some(MatchStatus::Completed));
        assert_eq!((m.team1_score, m.team2_score), (Some(2), Some(1)));
    }

    #[tokio::test]
    async fn test_two_fetch_score_scenario() {
        let (_tmp, store, ingestor) = setup().await;
        let t0 = Utc::now() - Duration::hours(1);
        seed_teams(&ingestor, t0).await;

        let live = ingestor
            .ingest(&resolved(match_with_score(MatchStatus::Live, 1, 0), t0, "100"))
            .await
            .unwrap();
        assert_eq!(live.outcome, CommitOutcome::Created);

        let done = ingestor
            .ingest(&resolved(
                match_with_score(MatchStatus::Completed, 2, 1),
                t0 + Duration::minutes(40),
                "100",
            ))
            .await
            .unwrap();
        assert_eq!(done.outcome, CommitOutcome::Updated { version: 2 });
        assert!(done.fields_updated.contains(&"team1_score".to_string()));
        // Unchanged values still take the newer provenance
        assert!(done.fields_updated.contains(&"event_name".to_string()));

        let stored = store.get_entity(EntityKind::Match, "m1").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        let CanonicalEntity::Match(m) = stored.entity else {
            panic!("expected match");
        };
        assert_eq!((m.team1_score, m.team2_score), (Some(2), Some(1)));
    }

    #[tokio::test]
    async fn test_unobserved_fields_are_kept() {
        let (_tmp, store, ingestor) = setup().await;
        let now = Utc::now();
        let mut full = team("t1", "Gen.G");
        if let CanonicalEntity::Team(t) = &mut full {
            t.tag = Some("GEN".to_string());
        }
        ingestor.ingest(&resolved(full, now, "17")).await.unwrap();

        // A later page that only shows the name leaves the tag alone
        let result = ingestor
            .ingest(&resolved(team("t1", "Gen.G"), now + Duration::minutes(1), "17"))
            .await
            .unwrap();
        assert_eq!(result.outcome, CommitOutcome::Unchanged);

        let stored = store.get_entity(EntityKind::Team, "t1").await.unwrap().unwrap();
        let CanonicalEntity::Team(t) = stored.entity else {
            panic!("expected team");
        };
        assert_eq!(t.tag.as_deref(), Some("GEN"));
    }

    #[tokio::test]
    async fn test_missing_dependency_is_conflict() {
        let (_tmp, store, ingestor) = setup().await;
        let game = CanonicalEntity::Game(Game {
            id: "g1".to_string(),
            match_id: Some("missing".to_string()),
            ordinal: Some(1),
            map_name: Some("Bind".to_string()),
            team1_score: None,
            team2_score: None,
            picked_by: None,
            duration: None,
        });

        let err = ingestor.ingest(&resolved(game, Utc::now(), "100/1")).await.unwrap_err();
        assert!(matches!(err, IngestError::Conflict { .. }));
        assert_eq!(err.class(), crate::error::ErrorClass::IngestConflict);
        assert_eq!(store.get_global_stats().await.unwrap().game_count, 0);
    }

    #[tokio::test]
    async fn test_group_commits_valid_subset() {
        let (_tmp, store, ingestor) = setup().await;
        let now = Utc::now();

        // Match references a team that is not in the store or the group
        let mut bad_match = match_with_score(MatchStatus::Completed, 2, 0);
        if let CanonicalEntity::Match(m) = &mut bad_match {
            m.team2_id = Some("ghost".to_string());
        }
        let game = CanonicalEntity::Game(Game {
            id: "g1".to_string(),
            match_id: Some("m1".to_string()),
            ordinal: Some(1),
            map_name: Some("Bind".to_string()),
            team1_score: Some(13),
            team2_score: Some(5),
            picked_by: None,
            duration: None,
        });

        let report = ingestor
            .ingest_group(vec![
                resolved(game, now, "100/1"),
                resolved(bad_match, now, "100"),
                resolved(team("t1", "Gen.G"), now, "17"),
            ])
            .await;

        assert_eq!(report.committed.len(), 1);
        assert_eq!(report.committed[0].id, "t1");
        assert_eq!(report.failed.len(), 2);
        assert!(matches!(report.failed[0].1, IngestError::Conflict { .. }));
        assert!(matches!(
            report.failed[1].1,
            IngestError::DependencyFailed { .. }
        ));
        assert_eq!(store.get_global_stats().await.unwrap().match_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_commits_on_one_id() {
        let (_tmp, store, ingestor) = setup().await;
        let ingestor = Arc::new(ingestor);
        let base = Utc::now();

        let mut handles = Vec::new();
        for i in 0..8 {
            let ingestor = ingestor.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("Gen.G {}", i);
                ingestor
                    .ingest(&resolved(team("t1", &name), base + Duration::seconds(i), "17"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.get_entity(EntityKind::Team, "t1").await.unwrap().unwrap();
        assert_eq!(stored.entity.name(), Some("Gen.G 7"));
        assert!(ingestor.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_commits_on_unrelated_ids() {
        let (_tmp, store, ingestor) = setup().await;
        let ingestor = Arc::new(ingestor);
        let at = Utc::now();

        let mut handles = Vec::new();
        for i in 0..16 {
            let ingestor = ingestor.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("t{}", i);
                ingestor
                    .ingest(&resolved(team(&id, &format!("Team {}", i)), at, &i.to_string()))
                    .await
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.outcome, CommitOutcome::Created);
        }

        assert_eq!(store.get_global_stats().await.unwrap().team_count, 16);
        assert!(ingestor.locks.lock().await.is_empty());
    }
}
