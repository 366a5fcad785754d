//! Status command implementation

use crate::config::Config;
use crate::error::Result;
use crate::fetch::is_js_rendering_available;
use crate::pipeline::StatusReport;
use crate::store::{GlobalStats, Store};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub db_path: String,
    pub snapshot_dir: String,
    pub js_rendering: bool,
    pub js_rendering_available: bool,
    pub db_stats: GlobalStats,
    /// Last report written by `run` or `once`, if any
    pub pipeline: Option<StatusReport>,
}

/// Get system status
pub async fn cmd_status(config: &Config, store: &Store) -> Result<StatusInfo> {
    info!("Getting status");

    let db_stats = store.get_global_stats().await?;
    let pipeline = StatusReport::load(&config.paths.status_file).await?;

    Ok(StatusInfo {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        snapshot_dir: config.paths.snapshot_dir.display().to_string(),
        js_rendering: config.fetch.js_rendering,
        js_rendering_available: is_js_rendering_available(),
        db_stats,
        pipeline,
    })
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    println!("\n📊 vct-ingest Status\n");
    println!("Configuration: {}", status.config_path);
    println!("Database: {}", status.db_path);
    println!("Snapshots: {}", status.snapshot_dir);

    let rendering = match (status.js_rendering, status.js_rendering_available) {
        (true, true) => "headless browser",
        (true, false) => "⚠ plain HTTP (build lacks js-rendering)",
        (false, _) => "plain HTTP",
    };
    println!("Fetching: {}", rendering);

    println!("\nDatabase Stats:");
    println!("  Teams: {}", status.db_stats.team_count);
    println!("  Players: {}", status.db_stats.player_count);
    println!("  Matches: {}", status.db_stats.match_count);
    println!("  Games: {}", status.db_stats.game_count);
    println!("  Stat lines: {}", status.db_stats.stat_line_count);
    println!("  Snapshots: {}", status.db_stats.snapshot_count);
    println!("  Orphaned records: {}", status.db_stats.orphan_count);
    if let Some(updated) = &status.db_stats.last_updated_at {
        println!("  Last updated: {}", updated);
    }

    println!("\nPipeline:");
    match &status.pipeline {
        None => println!("  No report yet. Run 'vct-ingest run' or 'vct-ingest once'."),
        Some(report) => {
            let freshness = if report.stale {
                "⚠ data temporarily stale"
            } else {
                "✓ fresh"
            };
            println!("  {} (as of {})", freshness, report.generated_at.to_rfc3339());
            for source in &report.sources {
                print!(
                    "  {}: {} pending, {} in flight",
                    source.source, source.pending, source.in_flight
                );
                if let Some(delay) = source.current_delay_ms {
                    print!(", backing off {}ms", delay);
                }
                if let Some(until) = source.paused_until {
                    print!(", paused until {}", until.to_rfc3339());
                }
                println!();
            }
        }
    }
}
