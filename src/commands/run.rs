//! Run and once command implementations

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::build_browser;
use crate::pipeline::{Pipeline, RunStats, TargetReport};
use crate::schedule::FetchOutcome;
use crate::store::Store;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

fn build_pipeline(config: &Config, store: Store) -> Result<Pipeline> {
    let browser = build_browser(&config.fetch)?;
    Pipeline::new(config.clone(), store, browser)
}

/// Run the pipeline until Ctrl-C
pub async fn cmd_run(config: &Config, store: Store) -> Result<RunStats> {
    let pipeline = build_pipeline(config, store)?;
    pipeline.hydrate().await?;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = tx.send(true);
    });

    pipeline.run(rx).await
}

/// One line per processed target
#[derive(Debug, Clone, Serialize)]
pub struct OnceTarget {
    pub source: String,
    pub kind: String,
    pub external_ref: String,
    pub outcome: String,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub unresolved: usize,
    pub discovered: usize,
    pub snapshot_id: Option<String>,
}

impl From<&TargetReport> for OnceTarget {
    fn from(r: &TargetReport) -> Self {
        let outcome = match r.outcome {
            FetchOutcome::Succeeded {
                match_status: Some(status),
            } => format!("ok ({})", status),
            FetchOutcome::Succeeded { match_status: None } => "ok".to_string(),
            FetchOutcome::Failed(class) => format!("failed ({:?})", class),
            FetchOutcome::Abandoned => "abandoned".to_string(),
        };
        let page = r.page.clone().unwrap_or_default();
        Self {
            source: r.target.source.clone(),
            kind: r.target.kind.to_string(),
            external_ref: r.target.external_ref.clone(),
            outcome,
            created: page.created,
            updated: page.updated,
            unchanged: page.unchanged,
            unresolved: page.unresolved,
            discovered: page.discovered,
            snapshot_id: r.snapshot_id.clone(),
        }
    }
}

/// Process up to `batches` batches and stop
pub async fn cmd_once(config: &Config, store: Store, batches: u32) -> Result<Vec<OnceTarget>> {
    if batches == 0 {
        return Err(Error::Config("--batches must be at least 1".to_string()));
    }
    let pipeline = build_pipeline(config, store)?;
    pipeline.hydrate().await?;

    let mut processed = Vec::new();
    for n in 0..batches {
        let reports = pipeline.run_once().await?;
        if reports.is_empty() {
            info!("No eligible targets after {} batches", n);
            break;
        }
        processed.extend(reports.iter().map(OnceTarget::from));
    }
    Ok(processed)
}

/// Print run statistics to console
pub fn print_run_stats(stats: &RunStats) {
    println!("\n✓ Pipeline stopped\n");
    println!("  Batches:    {}", stats.batches);
    println!("  Succeeded:  {}", stats.targets_succeeded);
    println!("  Failed:     {}", stats.targets_failed);
    println!("  Abandoned:  {}", stats.targets_abandoned);
    println!("  Created:    {}", stats.entities_created);
    println!("  Updated:    {}", stats.entities_updated);
}

/// Print the targets processed by `once`
pub fn print_once_results(targets: &[OnceTarget]) {
    if targets.is_empty() {
        println!("Nothing to do: no targets are eligible yet.");
        return;
    }

    for t in targets {
        println!(
            "• {}/{} {} → {}",
            t.source, t.kind, t.external_ref, t.outcome
        );
        if t.created + t.updated + t.unchanged + t.unresolved > 0 {
            println!(
                "  created {}, updated {}, unchanged {}, unresolved {}, discovered {}",
                t.created, t.updated, t.unchanged, t.unresolved, t.discovered
            );
        }
        if t.outcome.starts_with("failed") {
            if let Some(id) = &t.snapshot_id {
                println!("  snapshot {}", id);
            }
        }
    }
}
