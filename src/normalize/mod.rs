//! Identity resolution for candidate records
//!
//! A candidate's own identity resolves in this order:
//! 1. An existing `(source, kind, external_ref)` mapping
//! 2. For teams and players, the source's alias table and a canonical name lookup
//! 3. A fresh UUIDv5 derived from kind, source and reference
//!
//! References to other entities only resolve through mappings (in the batch or
//! in the store). A record with a required reference that does not resolve is
//! queued and re-resolved after later ingestions. Attempts are charged at most
//! once per retry interval, so busy pages do not exhaust them; past the attempt
//! limit the record is persisted as an orphan.

mod alias;
mod merge;

pub use alias::*;
pub use merge::*;

use crate::config::Config;
use crate::error::Result;
use crate::models::{
    canonical_id, CandidateRecord, CanonicalEntity, EntityKind, EntityRef, Provenance,
    ResolvedEntity, TargetKind,
};
use crate::store::{OrphanedRecord, Store};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// A candidate waiting on references that do not resolve yet
#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedReference {
    pub record: CandidateRecord,
    pub missing: Vec<EntityRef>,
    pub attempts: u32,
    pub last_attempt_at: DateTime<Utc>,
}

impl UnresolvedReference {
    fn key(&self) -> RecordKey {
        record_key(&self.record)
    }
}

/// Result of normalizing one candidate
#[derive(Debug, Clone)]
pub enum Normalized {
    Resolved(ResolvedEntity),
    Unresolved(UnresolvedReference),
}

/// A reference seen in a batch that the store does not know yet
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredRef {
    pub source: String,
    pub entity_ref: EntityRef,
}

impl DiscoveredRef {
    /// Page kind that would describe the referenced entity
    pub fn target_kind(&self) -> Option<TargetKind> {
        match self.entity_ref.kind {
            EntityKind::Team => Some(TargetKind::Team),
            EntityKind::Player => Some(TargetKind::Player),
            EntityKind::Match => Some(TargetKind::Match),
            EntityKind::Game | EntityKind::StatLine => None,
        }
    }
}

/// Output of a batch, in dependency order
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub resolved: Vec<ResolvedEntity>,
    pub unresolved: Vec<UnresolvedReference>,
    pub discovered: Vec<DiscoveredRef>,
    /// Candidates whose fields did not fit the entity type
    pub rejected: usize,
    /// Records given up on during this call
    pub orphaned: usize,
}

type RecordKey = (EntityKind, String, String);

fn record_key(record: &CandidateRecord) -> RecordKey {
    (
        record.kind,
        record.source().to_string(),
        record.external_ref.clone(),
    )
}

/// References a record can be stored without
fn is_optional_ref(kind: EntityKind, field: &str) -> bool {
    matches!(
        (kind, field),
        (EntityKind::Player, "team_id") | (EntityKind::Game, "picked_by")
    )
}

/// Identities assigned so far within one batch
#[derive(Default)]
struct BatchContext {
    ids: HashMap<RecordKey, String>,
    names: HashMap<(EntityKind, String), String>,
}

pub struct Normalizer {
    store: Store,
    aliases: HashMap<String, AliasTable>,
    priority: SourcePriority,
    max_attempts: u32,
    attempt_interval: ChronoDuration,
    pending: Mutex<Vec<UnresolvedReference>>,
}

impl Normalizer {
    pub fn new(store: Store, priority: SourcePriority, max_attempts: u32) -> Self {
        Self {
            store,
            aliases: HashMap::new(),
            priority,
            max_attempts: max_attempts.max(1),
            attempt_interval: ChronoDuration::seconds(
                crate::config::default_unresolved_retry_interval_secs() as i64,
            ),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Minimum spacing between two charged attempts of a queued record
    pub fn with_attempt_interval(mut self, interval: std::time::Duration) -> Self {
        self.attempt_interval =
            ChronoDuration::from_std(interval).unwrap_or_else(|_| ChronoDuration::zero());
        self
    }

    /// Build from configuration, loading every source's alias table
    pub fn from_config(config: &Config, store: Store) -> Result<Self> {
        let mut normalizer = Self::new(
            store,
            SourcePriority::new(config.normalize.source_priority.clone()),
            config.normalize.max_unresolved_attempts,
        )
        .with_attempt_interval(std::time::Duration::from_secs(
            config.normalize.unresolved_retry_interval_secs,
        ));
        for source in &config.sources {
            if let Some(path) = config.alias_table_path(source) {
                normalizer = normalizer.with_aliases(&source.id, AliasTable::load(&path)?);
            }
        }
        Ok(normalizer)
    }

    pub fn with_aliases(mut self, source: &str, table: AliasTable) -> Self {
        self.aliases.insert(source.to_string(), table);
        self
    }

    /// Normalize one candidate on its own
    pub async fn normalize(&self, record: CandidateRecord) -> Result<Option<Normalized>> {
        let mut batch = self.normalize_batch(vec![record]).await?;
        if let Some(resolved) = batch.resolved.pop() {
            return Ok(Some(Normalized::Resolved(resolved)));
        }
        Ok(batch.unresolved.pop().map(Normalized::Unresolved))
    }

    /// Normalize the records of one page together
    ///
    /// Records are resolved dependency-first so a page's games can point at the
    /// match extracted from the same page. Unresolved records are queued.
    pub async fn normalize_batch(&self, records: Vec<CandidateRecord>) -> Result<NormalizedBatch> {
        let now = Utc::now();
        let mut batch = self.resolve_all(records).await?;
        for unresolved in &mut batch.unresolved {
            unresolved.attempts = 1;
            unresolved.last_attempt_at = now;
        }
        self.enqueue(batch.unresolved.clone()).await;
        Ok(batch)
    }

    /// Retry queued records; exhausted ones become orphans
    pub async fn retry_pending(&self) -> Result<NormalizedBatch> {
        self.retry_pending_at(Utc::now()).await
    }

    /// Re-resolve every queued record, charging an attempt to those whose
    /// last one is at least the retry interval old
    pub async fn retry_pending_at(&self, now: DateTime<Utc>) -> Result<NormalizedBatch> {
        let pending = std::mem::take(&mut *self.pending.lock().await);
        if pending.is_empty() {
            return Ok(NormalizedBatch::default());
        }

        let counters: HashMap<RecordKey, (u32, DateTime<Utc>)> = pending
            .iter()
            .map(|u| (u.key(), (u.attempts, u.last_attempt_at)))
            .collect();
        let records = pending.into_iter().map(|u| u.record).collect();

        let mut batch = self.resolve_all(records).await?;
        let mut keep = Vec::new();
        for mut unresolved in std::mem::take(&mut batch.unresolved) {
            let (attempts, last) = counters
                .get(&unresolved.key())
                .copied()
                .unwrap_or((0, now - self.attempt_interval));
            unresolved.attempts = attempts;
            unresolved.last_attempt_at = last;
            if now - last >= self.attempt_interval {
                unresolved.attempts += 1;
                unresolved.last_attempt_at = now;
            }
            if unresolved.attempts >= self.max_attempts {
                self.orphan(&unresolved).await?;
                batch.orphaned += 1;
            } else {
                keep.push(unresolved);
            }
        }

        if !batch.resolved.is_empty() {
            debug!("Resolved {} queued records", batch.resolved.len());
        }
        self.enqueue(keep.clone()).await;
        batch.unresolved = keep;
        Ok(batch)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn enqueue(&self, items: Vec<UnresolvedReference>) {
        if items.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().await;
        for item in items {
            match pending.iter_mut().find(|p| p.key() == item.key()) {
                Some(existing) => {
                    if item.attempts > existing.attempts {
                        existing.attempts = item.attempts;
                        existing.last_attempt_at = item.last_attempt_at;
                    }
                    existing.record = item.record;
                    existing.missing = item.missing;
                }
                None => pending.push(item),
            }
        }
    }

    async fn orphan(&self, unresolved: &UnresolvedReference) -> Result<()> {
        let record = &unresolved.record;
        warn!(
            "Orphaning {} {}/{} after {} attempts; missing {:?}",
            record.kind,
            record.source(),
            record.external_ref,
            unresolved.attempts,
            unresolved.missing
        );
        let orphan = OrphanedRecord {
            id: Uuid::new_v4().to_string(),
            source: record.source().to_string(),
            kind: record.kind.to_string(),
            external_ref: record.external_ref.clone(),
            missing_json: serde_json::to_string(&unresolved.missing)?,
            record_json: serde_json::to_string(record)?,
            attempts: unresolved.attempts as i64,
            created_at: Utc::now().to_rfc3339(),
        };
        self.store.insert_orphan(&orphan).await
    }

    // ===== Resolution =====

    async fn resolve_all(&self, mut records: Vec<CandidateRecord>) -> Result<NormalizedBatch> {
        records.sort_by_key(|r| r.kind.dependency_rank());

        let mut ctx = BatchContext::default();
        let mut merged: Vec<MergedCandidate> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();

        for mut record in records {
            let id = self.resolve_id(&mut record, &mut ctx).await?;
            match by_id.get(&id) {
                Some(&i) => merged[i].absorb(record, &self.priority),
                None => {
                    let mut candidate = MergedCandidate::new(record.kind, id.clone());
                    candidate.absorb(record, &self.priority);
                    by_id.insert(id, merged.len());
                    merged.push(candidate);
                }
            }
        }

        let mut batch = NormalizedBatch::default();
        for candidate in merged {
            self.resolve_refs(candidate, &mut ctx, &mut batch).await?;
        }
        Ok(batch)
    }

    /// Canonical id of the record itself
    async fn resolve_id(&self, record: &mut CandidateRecord, ctx: &mut BatchContext) -> Result<String> {
        let key = record_key(record);
        if let Some(id) = ctx.ids.get(&key) {
            return Ok(id.clone());
        }

        let source = record.source().to_string();
        let mut id = self
            .store
            .lookup_external_id(&source, record.kind, &record.external_ref)
            .await?;

        let mut name_key = None;
        if matches!(record.kind, EntityKind::Team | EntityKind::Player) {
            if let Some(name) = record.field_str("name").map(str::to_string) {
                let canonical = match self.aliases.get(&source) {
                    Some(table) => table.canonical_name(record.kind, &name).to_string(),
                    None => name.clone(),
                };
                if canonical != name {
                    debug!("Alias {} -> {}", name, canonical);
                    record
                        .fields
                        .insert("name".to_string(), Value::String(canonical.clone()));
                }

                let lookup = (record.kind, canonical.to_lowercase());
                if id.is_none() {
                    id = ctx.names.get(&lookup).cloned();
                }
                if id.is_none() {
                    id = self.store.find_id_by_name(record.kind, &canonical).await?;
                }
                name_key = Some(lookup);
            }
        }

        let id = id.unwrap_or_else(|| canonical_id(record.kind, &source, &record.external_ref));
        if let Some(lookup) = name_key {
            ctx.names.entry(lookup).or_insert_with(|| id.clone());
        }
        ctx.ids.insert(key, id.clone());
        Ok(id)
    }

    async fn lookup_ref(
        &self,
        source: &str,
        target: &EntityRef,
        ctx: &BatchContext,
    ) -> Result<Option<String>> {
        let key = (target.kind, source.to_string(), target.external_ref.clone());
        if let Some(id) = ctx.ids.get(&key) {
            return Ok(Some(id.clone()));
        }
        self.store
            .lookup_external_id(source, target.kind, &target.external_ref)
            .await
    }

    async fn resolve_refs(
        &self,
        candidate: MergedCandidate,
        ctx: &mut BatchContext,
        batch: &mut NormalizedBatch,
    ) -> Result<()> {
        let mut fields: BTreeMap<String, Value> = BTreeMap::new();
        let mut provenance: BTreeMap<String, Provenance> = BTreeMap::new();
        for (name, (value, prov)) in &candidate.fields {
            fields.insert(name.clone(), value.clone());
            provenance.insert(name.clone(), prov.clone());
        }

        let mut missing = Vec::new();
        let mut depends_on = Vec::new();
        for (field, (target, prov)) in &candidate.refs {
            match self.lookup_ref(&prov.source, target, ctx).await? {
                Some(id) => {
                    fields.insert(field.clone(), Value::String(id.clone()));
                    provenance.insert(field.clone(), prov.clone());
                    if !depends_on.contains(&id) {
                        depends_on.push(id);
                    }
                }
                None => {
                    let discovered = DiscoveredRef {
                        source: prov.source.clone(),
                        entity_ref: target.clone(),
                    };
                    if !batch.discovered.contains(&discovered) {
                        batch.discovered.push(discovered);
                    }
                    if is_optional_ref(candidate.kind, field) {
                        debug!("Dropping unresolved {}.{} -> {}", candidate.kind, field, target.external_ref);
                    } else {
                        missing.push(target.clone());
                    }
                }
            }
        }

        if !missing.is_empty() {
            // Dependents later in the batch must not point at this id
            ctx.ids.retain(|_, id| *id != candidate.id);
            for record in candidate.records {
                debug!(
                    "{} {} waiting on {} references",
                    record.kind,
                    record.external_ref,
                    missing.len()
                );
                batch.unresolved.push(UnresolvedReference {
                    record,
                    missing: missing.clone(),
                    attempts: 0,
                    last_attempt_at: Utc::now(),
                });
            }
            return Ok(());
        }

        let entity = match CanonicalEntity::from_fields(candidate.kind, &candidate.id, &fields) {
            Ok(entity) => entity,
            Err(e) => {
                warn!("Rejecting {} {}: {}", candidate.kind, candidate.id, e);
                ctx.ids.retain(|_, id| *id != candidate.id);
                batch.rejected += 1;
                return Ok(());
            }
        };

        batch.resolved.push(ResolvedEntity {
            entity,
            provenance,
            external_refs: candidate.external_refs,
            depends_on,
        });
        Ok(())
    }
}
