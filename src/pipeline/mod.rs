//! Scrape pipeline
//!
//! Wires the stages together: the scheduler emits batches, each target is
//! fetched through the per-source gate, extracted off the async runtime,
//! normalized, and committed. Discovered references flow back into the
//! scheduler as new targets.
//!
//! Shutdown stops batch emission, abandons fetches that have not completed,
//! and lets every ingestion that already started run to completion.

use crate::config::Config;
use crate::error::{Error, ErrorClass, ExtractError, Result};
use crate::extract::RuleRegistry;
use crate::fetch::{Browser, Fetcher, SnapshotWriter};
use crate::ingest::Ingestor;
use crate::models::{CandidateRecord, EntityKind, MatchStatus, RawPage, TargetKind};
use crate::normalize::Normalizer;
use crate::schedule::{FetchOutcome, PriorityClass, Scheduler, ScrapeTarget, SourceBacklog};
use crate::store::{GlobalStats, Store};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// What processing one page produced
#[derive(Debug, Clone, Default, Serialize)]
pub struct PageReport {
    pub rule: String,
    pub records: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub unresolved: usize,
    pub rejected: usize,
    pub orphaned: usize,
    pub discovered: usize,
    /// Status of the match the page describes, when it describes one
    #[serde(skip)]
    pub match_status: Option<MatchStatus>,
}

impl PageReport {
    pub fn committed(&self) -> usize {
        self.created + self.updated + self.unchanged
    }
}

/// Result of one target
#[derive(Debug, Clone)]
pub struct TargetReport {
    pub target: ScrapeTarget,
    pub outcome: FetchOutcome,
    pub page: Option<PageReport>,
    /// Raw page kept for this fetch, for re-extraction after a rule update
    pub snapshot_id: Option<String>,
}

/// Counters accumulated over a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub started_at: Option<DateTime<Utc>>,
    pub batches: u64,
    pub targets_succeeded: u64,
    pub targets_failed: u64,
    pub targets_abandoned: u64,
    pub entities_created: u64,
    pub entities_updated: u64,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl RunStats {
    fn record(&mut self, report: &TargetReport) {
        match report.outcome {
            FetchOutcome::Succeeded { .. } => {
                self.targets_succeeded += 1;
                self.last_success_at = Some(Utc::now());
            }
            FetchOutcome::Failed(_) => self.targets_failed += 1,
            FetchOutcome::Abandoned => self.targets_abandoned += 1,
        }
        if let Some(page) = &report.page {
            self.entities_created += page.created as u64;
            self.entities_updated += page.updated as u64;
        }
    }
}

/// What read consumers see about ingestion health
///
/// Internal failures never appear here; consumers only learn that data may
/// be stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub stale: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub sources: Vec<SourceStatus>,
    pub entities: GlobalStats,
    pub run: RunStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source: String,
    pub pending: usize,
    pub in_flight: usize,
    pub current_delay_ms: Option<u64>,
    pub paused_until: Option<DateTime<Utc>>,
}

impl From<SourceBacklog> for SourceStatus {
    fn from(b: SourceBacklog) -> Self {
        Self {
            source: b.source,
            pending: b.pending,
            in_flight: b.in_flight,
            current_delay_ms: b.current_delay_ms,
            paused_until: b.paused_until,
        }
    }
}

impl StatusReport {
    /// Read a report written by a running pipeline
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn record_match_status(record: &CandidateRecord) -> Option<MatchStatus> {
    record
        .fields
        .get("status")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Status of the match a page describes, read from its own candidate
fn page_match_status(
    records: &[CandidateRecord],
    describes: impl Fn(&CandidateRecord) -> bool,
) -> Option<MatchStatus> {
    records
        .iter()
        .find(|r| r.kind == EntityKind::Match && describes(r))
        .and_then(record_match_status)
}

/// The assembled pipeline; cheap to clone into workers
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    store: Store,
    fetcher: Fetcher,
    rules: Arc<RuleRegistry>,
    normalizer: Arc<Normalizer>,
    ingestor: Arc<Ingestor>,
    scheduler: Arc<Scheduler>,
    stats: Arc<Mutex<RunStats>>,
}

impl Pipeline {
    pub fn new(config: Config, store: Store, browser: Arc<dyn Browser>) -> Result<Self> {
        let snapshots = SnapshotWriter::new(config.paths.snapshot_dir.clone(), store.clone());
        let fetcher = Fetcher::new(&config, browser).with_snapshots(snapshots);
        let normalizer = Normalizer::from_config(&config, store.clone())?;
        let scheduler = Scheduler::new(&config);

        Ok(Self {
            fetcher,
            rules: Arc::new(RuleRegistry::with_builtin_rules()),
            normalizer: Arc::new(normalizer),
            ingestor: Arc::new(Ingestor::new(store.clone())),
            scheduler: Arc::new(scheduler),
            stats: Arc::new(Mutex::new(RunStats::default())),
            store,
            config: Arc::new(config),
        })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Seed the scheduler from the store
    pub async fn hydrate(&self) -> Result<usize> {
        self.scheduler.hydrate(&self.store).await
    }

    /// Upper bound on concurrently running workers
    fn max_in_flight(&self) -> usize {
        self.config
            .sources
            .iter()
            .map(|s| s.concurrency)
            .sum::<usize>()
            .max(1)
    }

    /// Run until shutdown is requested
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<RunStats> {
        self.stats.lock().await.started_at = Some(Utc::now());
        let max_in_flight = self.max_in_flight();
        let worker_rx = shutdown.clone();
        let mut workers: JoinSet<TargetReport> = JoinSet::new();
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.scheduler.tick_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "Pipeline running ({} browser, up to {} workers)",
            self.fetcher.browser_name(),
            max_in_flight
        );

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Shutdown requested; draining {} workers", workers.len());
                    break;
                }
                _ = tick.tick() => {
                    let capacity = max_in_flight
                        .saturating_sub(workers.len())
                        .min(self.config.scheduler.batch_size);
                    if capacity > 0 {
                        if let Some(batch) = self.scheduler.next_batch(capacity).await {
                            debug!("Batch {} with {} targets", batch.seq, batch.targets.len());
                            self.stats.lock().await.batches += 1;
                            for target in batch.targets {
                                let pipeline = self.clone();
                                let rx = worker_rx.clone();
                                workers.spawn(async move { pipeline.run_target(target, rx).await });
                            }
                        }
                    }
                    if let Err(e) = self.write_status().await {
                        warn!("Failed to write status report: {}", e);
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    self.finish_worker(joined).await;
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            self.finish_worker(joined).await;
        }
        if let Err(e) = self.write_status().await {
            warn!("Failed to write status report: {}", e);
        }

        let stats = self.stats.lock().await.clone();
        info!(
            "Pipeline stopped: {} succeeded, {} failed, {} abandoned",
            stats.targets_succeeded, stats.targets_failed, stats.targets_abandoned
        );
        Ok(stats)
    }

    async fn finish_worker(&self, joined: std::result::Result<TargetReport, tokio::task::JoinError>) {
        match joined {
            Ok(report) => self.stats.lock().await.record(&report),
            Err(e) => warn!("Worker task failed: {}", e),
        }
    }

    /// Process a single batch and wait for every target in it
    pub async fn run_once(&self) -> Result<Vec<TargetReport>> {
        let Some(batch) = self
            .scheduler
            .next_batch(self.config.scheduler.batch_size)
            .await
        else {
            debug!("No targets eligible");
            return Ok(Vec::new());
        };
        self.stats.lock().await.batches += 1;

        // Sender held for the whole batch so workers never observe a shutdown
        let (_tx, rx) = watch::channel(false);
        let mut workers = JoinSet::new();
        for target in batch.targets {
            let pipeline = self.clone();
            let rx = rx.clone();
            workers.spawn(async move { pipeline.run_target(target, rx).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => {
                    self.stats.lock().await.record(&report);
                    reports.push(report);
                }
                Err(e) => warn!("Worker task failed: {}", e),
            }
        }
        self.write_status().await?;
        Ok(reports)
    }

    /// Fetch and process one target, then report the outcome to the scheduler
    pub async fn run_target(
        &self,
        target: ScrapeTarget,
        mut shutdown: watch::Receiver<bool>,
    ) -> TargetReport {
        let mut snapshot_id = None;
        let (outcome, page) = match self.config.source(&target.source) {
            Err(e) => {
                warn!("Dropping target {:?}: {}", target.key(), e);
                (FetchOutcome::Failed(ErrorClass::Terminal), None)
            }
            Ok(source) => {
                let url = source.url_for(target.kind, &target.external_ref);
                let wait = self.rules.wait_policy(&target.source, target.kind);

                let fetched = tokio::select! {
                    r = self.fetcher.fetch(&target.source, &url, &wait) => Some(r),
                    _ = shutdown_requested(&mut shutdown) => None,
                };

                match fetched {
                    None => {
                        debug!("Abandoned fetch of {}", url);
                        (FetchOutcome::Abandoned, None)
                    }
                    Some(Err(e)) => {
                        warn!("Fetch failed for {}: {}", url, e);
                        (FetchOutcome::Failed(e.class()), None)
                    }
                    Some(Ok(raw)) => {
                        snapshot_id = raw.snapshot_id.clone();
                        match self.process_target_page(&target, raw).await {
                            Ok(report) => (
                                FetchOutcome::Succeeded {
                                    match_status: report.match_status,
                                },
                                Some(report),
                            ),
                            Err(e) => {
                                warn!("Processing failed for {}: {}", url, e);
                                (FetchOutcome::Failed(e.class()), None)
                            }
                        }
                    }
                }
            }
        };

        self.scheduler.record_outcome(&target, outcome).await;
        TargetReport {
            target,
            outcome,
            page,
            snapshot_id,
        }
    }

    async fn process_target_page(&self, target: &ScrapeTarget, raw: RawPage) -> Result<PageReport> {
        let (rule, records) = self.extract(raw, target.kind).await?;
        let status = page_match_status(&records, |r| r.external_ref == target.external_ref);
        let mut report = self.ingest_records(records, rule, target.kind).await?;
        report.match_status = status;
        Ok(report)
    }

    /// Run extraction on the blocking pool
    async fn extract(&self, raw: RawPage, kind: TargetKind) -> Result<(String, Vec<CandidateRecord>)> {
        let url = raw.url.clone();
        let snapshot_id = raw.snapshot_id.clone();
        let rules = Arc::clone(&self.rules);
        let extraction = tokio::task::spawn_blocking(move || rules.extract(&raw, kind))
            .await
            .map_err(|e| Error::Other(format!("Extraction task failed: {}", e)))?
            .inspect_err(|e| {
                if let ExtractError::SchemaMismatch { rule, anchor } = e {
                    warn!(
                        "Layout change on {}: rule {} missing {}; raw page kept as snapshot {}",
                        url,
                        rule,
                        anchor,
                        snapshot_id.as_deref().unwrap_or("<none>")
                    );
                }
            })?;
        Ok((extraction.rule, extraction.records))
    }

    /// Extract, normalize and ingest a page already in hand
    pub async fn process_page(&self, raw: RawPage, kind: TargetKind) -> Result<PageReport> {
        let (rule, records) = self.extract(raw, kind).await?;
        let status = match kind {
            TargetKind::Match => page_match_status(&records, |_| true),
            _ => None,
        };
        let mut report = self.ingest_records(records, rule, kind).await?;
        report.match_status = status;
        Ok(report)
    }

    async fn ingest_records(
        &self,
        records: Vec<CandidateRecord>,
        rule: String,
        kind: TargetKind,
    ) -> Result<PageReport> {
        let mut report = PageReport {
            rule,
            records: records.len(),
            ..Default::default()
        };

        if kind == TargetKind::MatchList {
            for record in records.iter().filter(|r| r.kind == EntityKind::Match) {
                let class = match record_match_status(record) {
                    Some(MatchStatus::Live) => PriorityClass::Live,
                    _ => PriorityClass::Discovered,
                };
                let target = ScrapeTarget::new(
                    record.source(),
                    TargetKind::Match,
                    &record.external_ref,
                    class,
                    Utc::now(),
                );
                if self.scheduler.add_target(target).await {
                    report.discovered += 1;
                }
            }
        }

        let batch = self.normalizer.normalize_batch(records).await?;
        report.unresolved = batch.unresolved.len();
        report.rejected = batch.rejected;
        for found in &batch.discovered {
            if let Some(target_kind) = found.target_kind() {
                if self
                    .scheduler
                    .discover(&found.source, target_kind, &found.entity_ref.external_ref)
                    .await
                {
                    report.discovered += 1;
                }
            }
        }

        let group = self.ingestor.ingest_group(batch.resolved).await;
        report.created += group.created();
        report.updated += group.updated();
        report.unchanged += group.unchanged();
        report.failed += group.failed.len();

        // Entities committed above may satisfy records queued earlier
        if self.normalizer.pending_count().await > 0 {
            let retry = self.normalizer.retry_pending().await?;
            report.orphaned += retry.orphaned;
            if !retry.resolved.is_empty() {
                let group = self.ingestor.ingest_group(retry.resolved).await;
                report.created += group.created();
                report.updated += group.updated();
                report.unchanged += group.unchanged();
                report.failed += group.failed.len();
            }
        }

        debug!(
            "Page via {}: {} records, {} committed, {} unresolved",
            report.rule,
            report.records,
            report.committed(),
            report.unresolved
        );
        Ok(report)
    }

    /// Current health for read consumers
    pub async fn status_report(&self) -> Result<StatusReport> {
        let entities = self.store.get_global_stats().await?;
        let sources: Vec<SourceStatus> = self
            .scheduler
            .backlog()
            .await
            .into_iter()
            .map(SourceStatus::from)
            .collect();
        let run = self.stats.lock().await.clone();
        let now = Utc::now();

        let window = ChronoDuration::seconds((self.config.scheduler.listing_refresh_secs * 2) as i64);
        let behind = match run.last_success_at {
            Some(t) => now - t > window,
            None => true,
        };
        let paused = sources
            .iter()
            .any(|s| s.paused_until.map(|u| u > now).unwrap_or(false));

        Ok(StatusReport {
            generated_at: now,
            stale: behind || paused,
            last_success_at: run.last_success_at,
            sources,
            entities,
            run,
        })
    }

    /// Write the status report next to the database
    pub async fn write_status(&self) -> Result<()> {
        let report = self.status_report().await?;
        let path = &self.config.paths.status_file;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(&report)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
