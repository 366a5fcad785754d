//! Deciding what to fetch next
//!
//! Targets are ranked by priority class (live matches first, then matches
//! awaiting their finalization re-fetch, then stale entities, then freshly
//! discovered ones) plus a bonus that decays with the age of the entity.
//! Failures back off per source; a block pauses the whole source.
//!
//! All state lives behind one mutex and no method awaits anything but that
//! lock, so emitting a batch never waits on fetch or ingest work.

use crate::config::{BackoffPolicy, Config, SchedulerConfig};
use crate::error::{ErrorClass, Result};
use crate::models::{MatchStatus, TargetKind};
use crate::store::Store;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// External reference used for listing targets
pub const LISTING_REF: &str = "matches";

/// Priority classes, most urgent first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Live,
    PendingFinalization,
    Stale,
    Discovered,
}

impl PriorityClass {
    fn weight(&self) -> f64 {
        match self {
            PriorityClass::Live => 3.0,
            PriorityClass::PendingFinalization => 2.0,
            PriorityClass::Stale => 1.0,
            PriorityClass::Discovered => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Pending,
    InFlight,
}

/// Identity of a target
pub type TargetKey = (String, TargetKind, String);

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeTarget {
    pub source: String,
    pub kind: TargetKind,
    pub external_ref: String,
    pub priority: PriorityClass,
    pub next_eligible: DateTime<Utc>,
    pub attempts: u32,
    pub state: TargetState,
    /// When the entity was last known to change; drives the decay bonus
    pub observed_at: DateTime<Utc>,
    /// A completed match has had its finalization re-fetch
    pub finalized: bool,
}

impl ScrapeTarget {
    pub fn new(
        source: &str,
        kind: TargetKind,
        external_ref: &str,
        priority: PriorityClass,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.to_string(),
            kind,
            external_ref: external_ref.to_string(),
            priority,
            next_eligible: now,
            attempts: 0,
            state: TargetState::Pending,
            observed_at: now,
            finalized: false,
        }
    }

    pub fn key(&self) -> TargetKey {
        (self.source.clone(), self.kind, self.external_ref.clone())
    }

    fn score(&self, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
        let age_hours = (now - self.observed_at).num_seconds().max(0) as f64 / 3600.0;
        self.priority.weight() + 1.0 / (1.0 + age_hours / half_life_hours)
    }
}

/// Targets issued together
#[derive(Debug, Clone)]
pub struct Batch {
    pub seq: u64,
    pub targets: Vec<ScrapeTarget>,
}

/// How a fetch attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Page fetched and processed; the match status seen, if any
    Succeeded { match_status: Option<MatchStatus> },
    Failed(ErrorClass),
    /// Not completed because of shutdown
    Abandoned,
}

#[derive(Debug, Clone)]
struct SourceState {
    policy: BackoffPolicy,
    delay: Option<Duration>,
    paused_until: Option<DateTime<Utc>>,
}

impl SourceState {
    fn escalate(&mut self, steps: usize) -> Duration {
        for _ in 0..steps {
            self.delay = Some(self.policy.next(self.delay));
        }
        self.delay.unwrap_or_else(|| self.policy.initial())
    }
}

/// Per-source view for the status report
#[derive(Debug, Clone, Serialize)]
pub struct SourceBacklog {
    pub source: String,
    pub pending: usize,
    pub in_flight: usize,
    pub current_delay_ms: Option<u64>,
    pub paused_until: Option<DateTime<Utc>>,
}

struct State {
    targets: HashMap<TargetKey, ScrapeTarget>,
    sources: HashMap<String, SourceState>,
    seq: u64,
}

pub struct Scheduler {
    config: SchedulerConfig,
    state: Mutex<State>,
}

fn secs(n: u64) -> ChronoDuration {
    ChronoDuration::seconds(n as i64)
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(d.as_millis() as i64)
}

impl Scheduler {
    pub fn new(config: &Config) -> Self {
        let sources = config
            .sources
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    SourceState {
                        policy: s.retry_backoff,
                        delay: None,
                        paused_until: None,
                    },
                )
            })
            .collect();

        Self {
            config: config.scheduler.clone(),
            state: Mutex::new(State {
                targets: HashMap::new(),
                sources,
                seq: 0,
            }),
        }
    }

    /// Seed listing targets and re-check work from the store
    pub async fn hydrate(&self, store: &Store) -> Result<usize> {
        let now = Utc::now();
        let rows = store.match_targets().await?;
        let source_ids: Vec<String> = self.state.lock().await.sources.keys().cloned().collect();

        let mut added = 0;
        for source in &source_ids {
            if self
                .add_target(ScrapeTarget::new(source, TargetKind::MatchList, LISTING_REF, PriorityClass::Live, now))
                .await
            {
                added += 1;
            }
        }

        for row in rows {
            if !source_ids.contains(&row.source) {
                continue;
            }
            let updated_at = DateTime::parse_from_rfc3339(&row.updated_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or(now);
            let mut target =
                ScrapeTarget::new(&row.source, TargetKind::Match, &row.external_ref, PriorityClass::Discovered, now);
            target.observed_at = updated_at;
            match row.status {
                Some(MatchStatus::Live) => target.priority = PriorityClass::Live,
                Some(MatchStatus::Completed) => {
                    target.priority = PriorityClass::Stale;
                    target.finalized = true;
                    target.next_eligible = updated_at + secs(self.config.stale_after_secs);
                }
                Some(MatchStatus::Upcoming) | None => {}
            }
            if self.add_target(target).await {
                added += 1;
            }
        }

        info!("Scheduler hydrated with {} targets", added);
        Ok(added)
    }

    /// Add a target, or raise the class of a known pending one
    ///
    /// Returns true when the target is new.
    pub async fn add_target(&self, target: ScrapeTarget) -> bool {
        let mut state = self.state.lock().await;
        if !state.sources.contains_key(&target.source) {
            warn!("Ignoring target for unknown source {}", target.source);
            return false;
        }
        match state.targets.get_mut(&target.key()) {
            Some(existing) => {
                if existing.state == TargetState::Pending && target.priority < existing.priority {
                    existing.priority = target.priority;
                    existing.next_eligible = existing.next_eligible.min(target.next_eligible);
                }
                false
            }
            None => {
                debug!(
                    "New target {}/{}/{} ({:?})",
                    target.source, target.kind, target.external_ref, target.priority
                );
                state.targets.insert(target.key(), target);
                true
            }
        }
    }

    /// Register a discovered entity page
    pub async fn discover(&self, source: &str, kind: TargetKind, external_ref: &str) -> bool {
        self.add_target(ScrapeTarget::new(
            source,
            kind,
            external_ref,
            PriorityClass::Discovered,
            Utc::now(),
        ))
        .await
    }

    pub async fn next_batch(&self, max_n: usize) -> Option<Batch> {
        self.next_batch_at(max_n, Utc::now()).await
    }

    /// Highest-ranked eligible targets, marked in flight
    pub async fn next_batch_at(&self, max_n: usize, now: DateTime<Utc>) -> Option<Batch> {
        let mut state = self.state.lock().await;
        let half_life = self.config.decay_half_life_hours.max(f64::EPSILON);

        let mut eligible: Vec<(f64, TargetKey)> = state
            .targets
            .values()
            .filter(|t| t.state == TargetState::Pending && t.next_eligible <= now)
            .filter(|t| {
                state
                    .sources
                    .get(&t.source)
                    .and_then(|s| s.paused_until)
                    .map(|until| until <= now)
                    .unwrap_or(true)
            })
            .map(|t| (t.score(now, half_life), t.key()))
            .collect();
        if eligible.is_empty() || max_n == 0 {
            return None;
        }

        eligible.sort_by(|a, b| b.0.total_cmp(&a.0));
        eligible.truncate(max_n);

        let mut targets = Vec::with_capacity(eligible.len());
        for (_, key) in eligible {
            if let Some(target) = state.targets.get_mut(&key) {
                target.state = TargetState::InFlight;
                targets.push(target.clone());
            }
        }

        state.seq += 1;
        debug!("Batch {} with {} targets", state.seq, targets.len());
        Some(Batch {
            seq: state.seq,
            targets,
        })
    }

    pub async fn record_outcome(&self, target: &ScrapeTarget, outcome: FetchOutcome) -> bool {
        self.record_outcome_at(target, outcome, Utc::now()).await
    }

    /// Feed a fetch outcome back; returns false for targets not in flight
    pub async fn record_outcome_at(
        &self,
        target: &ScrapeTarget,
        outcome: FetchOutcome,
        now: DateTime<Utc>,
    ) -> bool {
        let key = target.key();
        let mut state = self.state.lock().await;
        let in_flight = state
            .targets
            .get(&key)
            .map(|t| t.state == TargetState::InFlight)
            .unwrap_or(false);
        if !in_flight {
            warn!(
                "Outcome for {}/{}/{} which is not in flight",
                key.0, key.1, key.2
            );
            return false;
        }

        match outcome {
            FetchOutcome::Abandoned => {
                if let Some(t) = state.targets.get_mut(&key) {
                    t.state = TargetState::Pending;
                }
            }

            FetchOutcome::Succeeded { match_status } => {
                if let Some(source) = state.sources.get_mut(&key.0) {
                    source.delay = None;
                    source.paused_until = None;
                }
                if let Some(t) = state.targets.get_mut(&key) {
                    self.reschedule(t, match_status, now);
                }
            }

            FetchOutcome::Failed(class) if class.is_retryable() => {
                let steps = if class == ErrorClass::Blocked { 2 } else { 1 };
                let Some(source) = state.sources.get_mut(&key.0) else {
                    warn!("No backoff policy for source {}", key.0);
                    return false;
                };
                let delay = source.escalate(steps);
                let until = now + to_chrono(delay);
                if class == ErrorClass::Blocked {
                    source.paused_until = Some(until);
                    warn!("Source {} blocked; pausing for {:?}", key.0, delay);
                }
                if let Some(t) = state.targets.get_mut(&key) {
                    t.state = TargetState::Pending;
                    t.attempts += 1;
                    t.next_eligible = until;
                }
            }

            FetchOutcome::Failed(class) => {
                warn!(
                    "Dropping {}/{}/{} after {:?} failure",
                    key.0, key.1, key.2, class
                );
                state.targets.remove(&key);
            }
        }
        true
    }

    /// Next visit after a successful fetch
    fn reschedule(&self, t: &mut ScrapeTarget, status: Option<MatchStatus>, now: DateTime<Utc>) {
        t.state = TargetState::Pending;
        t.attempts = 0;

        let (priority, delay) = match (t.kind, status) {
            (TargetKind::MatchList, _) => (PriorityClass::Live, secs(self.config.listing_refresh_secs)),
            (TargetKind::Match, Some(MatchStatus::Live)) => {
                t.observed_at = now;
                (PriorityClass::Live, secs(self.config.live_refresh_secs))
            }
            (TargetKind::Match, Some(MatchStatus::Completed)) if !t.finalized => {
                if t.priority == PriorityClass::PendingFinalization {
                    t.finalized = true;
                    (PriorityClass::Stale, secs(self.config.stale_after_secs))
                } else {
                    t.observed_at = now;
                    (PriorityClass::PendingFinalization, secs(self.config.finalize_after_secs))
                }
            }
            (TargetKind::Match, Some(MatchStatus::Completed)) => {
                (PriorityClass::Stale, secs(self.config.stale_after_secs))
            }
            (TargetKind::Match, _) => (PriorityClass::Discovered, secs(self.config.listing_refresh_secs)),
            (TargetKind::Team | TargetKind::Player, _) => {
                (PriorityClass::Stale, secs(self.config.stale_after_secs))
            }
        };
        t.priority = priority;
        t.next_eligible = now + delay;
    }

    pub async fn backlog(&self) -> Vec<SourceBacklog> {
        let state = self.state.lock().await;
        let mut out: Vec<SourceBacklog> = state
            .sources
            .iter()
            .map(|(id, s)| SourceBacklog {
                source: id.clone(),
                pending: 0,
                in_flight: 0,
                current_delay_ms: s.delay.map(|d| d.as_millis() as u64),
                paused_until: s.paused_until,
            })
            .collect();
        for target in state.targets.values() {
            if let Some(entry) = out.iter_mut().find(|b| b.source == target.source) {
                match target.state {
                    TargetState::Pending => entry.pending += 1,
                    TargetState::InFlight => entry.in_flight += 1,
                }
            }
        }
        out.sort_by(|a, b| a.source.cmp(&b.source));
        out
    }

    pub async fn target(&self, key: &TargetKey) -> Option<ScrapeTarget> {
        self.state.lock().await.targets.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.targets.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_sources;

    fn config() -> Config {
        let mut config = Config::default();
        config.sources = default_sources();
        config.sources[0].retry_backoff = BackoffPolicy {
            initial_ms: 1000,
            multiplier: 2.0,
            max_ms: 8000,
        };
        config
    }

    fn match_target(external_ref: &str, priority: PriorityClass, now: DateTime<Utc>) -> ScrapeTarget {
        ScrapeTarget::new("vlr", TargetKind::Match, external_ref, priority, now)
    }

    #[tokio::test]
    async fn test_priority_order() {
        let scheduler = Scheduler::new(&config());
        let now = Utc::now();
        scheduler.add_target(match_target("1", PriorityClass::Discovered, now)).await;
        scheduler.add_target(match_target("2", PriorityClass::Stale, now)).await;
        scheduler.add_target(match_target("3", PriorityClass::Live, now)).await;
        scheduler
            .add_target(match_target("4", PriorityClass::PendingFinalization, now))
            .await;

        // An old stale entity ranks below a recent one of the same class
        let mut old = match_target("5", PriorityClass::Stale, now);
        old.observed_at = now - ChronoDuration::days(30);
        scheduler.add_target(old).await;

        let batch = scheduler.next_batch_at(10, now).await.unwrap();
        let refs: Vec<&str> = batch.targets.iter().map(|t| t.external_ref.as_str()).collect();
        assert_eq!(refs, vec!["3", "4", "2", "5", "1"]);
    }

    #[tokio::test]
    async fn test_in_flight_targets_are_not_reissued() {
        let scheduler = Scheduler::new(&config());
        let now = Utc::now();
        scheduler.add_target(match_target("1", PriorityClass::Live, now)).await;
        scheduler.add_target(match_target("2", PriorityClass::Live, now)).await;

        let first = scheduler.next_batch_at(1, now).await.unwrap();
        let second = scheduler.next_batch_at(5, now).await.unwrap();
        assert!(second.seq > first.seq);
        assert_eq!(second.targets.len(), 1);
        assert_ne!(first.targets[0].external_ref, second.targets[0].external_ref);
        assert!(scheduler.next_batch_at(5, now).await.is_none());

        // Rediscovery while in flight does not duplicate the target
        assert!(!scheduler.discover("vlr", TargetKind::Match, "1").await);
        assert_eq!(scheduler.len().await, 2);

        // Outcomes for targets that are not in flight are ignored
        let stray = match_target("9", PriorityClass::Live, now);
        assert!(!scheduler.record_outcome_at(&stray, FetchOutcome::Abandoned, now).await);
    }

    #[tokio::test]
    async fn test_backoff_grows_caps_and_resets() {
        let scheduler = Scheduler::new(&config());
        let mut now = Utc::now();
        scheduler.add_target(match_target("1", PriorityClass::Live, now)).await;

        let mut delays = Vec::new();
        for _ in 0..6 {
            let batch = scheduler.next_batch_at(1, now).await.unwrap();
            let target = &batch.targets[0];
            scheduler
                .record_outcome_at(target, FetchOutcome::Failed(ErrorClass::Transient), now)
                .await;
            let backlog = scheduler.backlog().await;
            delays.push(backlog[0].current_delay_ms.unwrap());

            let t = scheduler.target(&target.key()).await.unwrap();
            assert!(t.next_eligible > now);
            now = t.next_eligible;
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 8000, 8000]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));

        let batch = scheduler.next_batch_at(1, now).await.unwrap();
        scheduler
            .record_outcome_at(
                &batch.targets[0],
                FetchOutcome::Succeeded { match_status: Some(MatchStatus::Live) },
                now,
            )
            .await;
        assert_eq!(scheduler.backlog().await[0].current_delay_ms, None);
    }

    #[tokio::test]
    async fn test_block_pauses_source() {
        let scheduler = Scheduler::new(&config());
        let now = Utc::now();
        scheduler.add_target(match_target("1", PriorityClass::Live, now)).await;
        scheduler.add_target(match_target("2", PriorityClass::Live, now)).await;

        let batch = scheduler.next_batch_at(1, now).await.unwrap();
        scheduler
            .record_outcome_at(&batch.targets[0], FetchOutcome::Failed(ErrorClass::Blocked), now)
            .await;

        let backlog = scheduler.backlog().await;
        // Two steps: initial then doubled
        assert_eq!(backlog[0].current_delay_ms, Some(2000));
        assert!(backlog[0].paused_until.is_some());

        // The other target is eligible but its source is paused
        assert!(scheduler.next_batch_at(5, now).await.is_none());
        let later = now + ChronoDuration::seconds(3);
        assert_eq!(scheduler.next_batch_at(5, later).await.unwrap().targets.len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_failure_drops_target() {
        let scheduler = Scheduler::new(&config());
        let now = Utc::now();
        scheduler.add_target(match_target("1", PriorityClass::Discovered, now)).await;

        let batch = scheduler.next_batch_at(1, now).await.unwrap();
        scheduler
            .record_outcome_at(&batch.targets[0], FetchOutcome::Failed(ErrorClass::Terminal), now)
            .await;
        assert!(scheduler.is_empty().await);
        // Dropping does not penalize the source
        assert_eq!(scheduler.backlog().await[0].current_delay_ms, None);
    }

    #[tokio::test]
    async fn test_abandoned_target_returns_without_penalty() {
        let scheduler = Scheduler::new(&config());
        let now = Utc::now();
        scheduler.add_target(match_target("1", PriorityClass::Live, now)).await;

        let batch = scheduler.next_batch_at(1, now).await.unwrap();
        assert!(
            scheduler
                .record_outcome(&batch.targets[0], FetchOutcome::Abandoned)
                .await
        );
        let again = scheduler.next_batch_at(1, now).await.unwrap();
        assert_eq!(again.targets[0].attempts, 0);
    }

    async fn succeed(scheduler: &Scheduler, status: MatchStatus, now: DateTime<Utc>) {
        let batch = scheduler.next_batch_at(1, now).await.unwrap();
        scheduler
            .record_outcome_at(
                &batch.targets[0],
                FetchOutcome::Succeeded { match_status: Some(status) },
                now,
            )
            .await;
    }

    #[tokio::test]
    async fn test_live_then_finalization_then_stale() {
        let config = config();
        let scheduler = Scheduler::new(&config);
        let mut now = Utc::now();
        scheduler.add_target(match_target("1", PriorityClass::Discovered, now)).await;
        let key = ("vlr".to_string(), TargetKind::Match, "1".to_string());

        succeed(&scheduler, MatchStatus::Live, now).await;
        let t = scheduler.target(&key).await.unwrap();
        assert_eq!(t.priority, PriorityClass::Live);
        assert_eq!(t.next_eligible, now + secs(config.scheduler.live_refresh_secs));

        now = t.next_eligible;
        succeed(&scheduler, MatchStatus::Completed, now).await;
        let t = scheduler.target(&key).await.unwrap();
        assert_eq!(t.priority, PriorityClass::PendingFinalization);
        assert_eq!(t.next_eligible, now + secs(config.scheduler.finalize_after_secs));

        now = t.next_eligible;
        succeed(&scheduler, MatchStatus::Completed, now).await;
        let t = scheduler.target(&key).await.unwrap();
        assert_eq!(t.priority, PriorityClass::Stale);
        assert!(t.finalized);
        assert_eq!(t.next_eligible, now + secs(config.scheduler.stale_after_secs));

        // Nothing to do until the staleness window passes
        assert!(scheduler.next_batch_at(1, now).await.is_none());
    }

    #[tokio::test]
    async fn test_hydrate_seeds_listing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Store::new(&tmp.path().join("test.db")).await.unwrap();
        let scheduler = Scheduler::new(&config());

        assert_eq!(scheduler.hydrate(&store).await.unwrap(), 1);
        let batch = scheduler.next_batch(5).await.unwrap();
        assert_eq!(batch.targets[0].kind, TargetKind::MatchList);
        assert_eq!(batch.targets[0].external_ref, LISTING_REF);
    }
}
