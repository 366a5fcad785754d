//! Merging candidates that describe the same entity

use crate::models::{CandidateRecord, EntityKind, EntityRef, ExternalRef, Provenance};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Sources in descending authority
#[derive(Debug, Clone, Default)]
pub struct SourcePriority {
    order: Vec<String>,
}

impl SourcePriority {
    pub fn new(order: Vec<String>) -> Self {
        Self { order }
    }

    /// Lower is more authoritative; unlisted sources rank last
    pub fn rank(&self, source: &str) -> usize {
        self.order
            .iter()
            .position(|s| s == source)
            .unwrap_or(self.order.len())
    }

    /// Whether an observation `a` should replace an observation `b`
    pub fn prefers(&self, a: &Provenance, b: &Provenance) -> bool {
        match self.rank(&a.source).cmp(&self.rank(&b.source)) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => a.fetched_at > b.fetched_at,
        }
    }
}

/// All candidates of one canonical entity within a batch, folded field by field
#[derive(Debug, Clone)]
pub struct MergedCandidate {
    pub kind: EntityKind,
    pub id: String,
    pub fields: BTreeMap<String, (Value, Provenance)>,
    pub refs: BTreeMap<String, (EntityRef, Provenance)>,
    pub external_refs: Vec<ExternalRef>,
    pub records: Vec<CandidateRecord>,
}

impl MergedCandidate {
    pub fn new(kind: EntityKind, id: String) -> Self {
        Self {
            kind,
            id,
            fields: BTreeMap::new(),
            refs: BTreeMap::new(),
            external_refs: Vec::new(),
            records: Vec::new(),
        }
    }

    pub fn absorb(&mut self, record: CandidateRecord, priority: &SourcePriority) {
        let prov = &record.provenance;

        for (name, value) in &record.fields {
            let replace = match self.fields.get(name) {
                Some((_, current)) => priority.prefers(prov, current),
                None => true,
            };
            if replace {
                self.fields
                    .insert(name.clone(), (value.clone(), prov.clone()));
            }
        }

        for (name, target) in &record.refs {
            let replace = match self.refs.get(name) {
                Some((_, current)) => priority.prefers(prov, current),
                None => true,
            };
            if replace {
                self.refs.insert(name.clone(), (target.clone(), prov.clone()));
            }
        }

        let external = ExternalRef {
            source: prov.source.clone(),
            external_ref: record.external_ref.clone(),
        };
        if !self.external_refs.contains(&external) {
            self.external_refs.push(external);
        }
        self.records.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn prov(source: &str, age_secs: i64) -> Provenance {
        Provenance {
            source: source.to_string(),
            fetched_at: Utc::now() - Duration::seconds(age_secs),
            snapshot_id: None,
        }
    }

    #[test]
    fn test_rank_and_ties() {
        let priority = SourcePriority::new(vec!["vlr".to_string(), "liquipedia".to_string()]);
        assert_eq!(priority.rank("vlr"), 0);
        assert_eq!(priority.rank("unknown"), 2);

        assert!(priority.prefers(&prov("vlr", 100), &prov("liquipedia", 0)));
        assert!(!priority.prefers(&prov("liquipedia", 0), &prov("vlr", 100)));
        assert!(priority.prefers(&prov("vlr", 0), &prov("vlr", 100)));
        assert!(!priority.prefers(&prov("vlr", 100), &prov("vlr", 0)));
    }

    #[test]
    fn test_fields_follow_priority_independently() {
        let priority = SourcePriority::new(vec!["vlr".to_string(), "liquipedia".to_string()]);
        let mut merged = MergedCandidate::new(EntityKind::Team, "t".to_string());

        merged.absorb(
            CandidateRecord::new(EntityKind::Team, "Sentinels", prov("liquipedia", 0))
                .with_field("name", Some("Sentinels"))
                .with_field("region", Some("North America")),
            &priority,
        );
        merged.absorb(
            CandidateRecord::new(EntityKind::Team, "2", prov("vlr", 60))
                .with_field("name", Some("Sentinels"))
                .with_field("tag", Some("SEN")),
            &priority,
        );

        assert_eq!(merged.fields["name"].1.source, "vlr");
        assert_eq!(merged.fields["tag"].0, Value::from("SEN"));
        // Only liquipedia saw the region, so it stays
        assert_eq!(merged.fields["region"].1.source, "liquipedia");
        assert_eq!(merged.external_refs.len(), 2);
        assert_eq!(merged.records.len(), 2);
    }
}
