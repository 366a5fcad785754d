//! Sources command implementation

use crate::config::{BackoffPolicy, Config, RateLimitPolicy};
use crate::error::Result;
use crate::store::{SourceStats, Store};
use serde::Serialize;

/// A configured source with what the store knows about it
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub base_url: String,
    pub rate_limit: RateLimitPolicy,
    pub retry_backoff: BackoffPolicy,
    pub concurrency: usize,
    pub alias_table: Option<String>,
    pub stats: SourceStats,
}

pub async fn cmd_list_sources(config: &Config, store: &Store) -> Result<Vec<SourceInfo>> {
    let mut result = Vec::with_capacity(config.sources.len());
    for source in &config.sources {
        result.push(SourceInfo {
            id: source.id.clone(),
            base_url: source.base_url.clone(),
            rate_limit: source.rate_limit,
            retry_backoff: source.retry_backoff,
            concurrency: source.concurrency,
            alias_table: config
                .alias_table_path(source)
                .map(|p| p.display().to_string()),
            stats: store.get_source_stats(&source.id).await?,
        });
    }
    Ok(result)
}

/// Print sources list to console
pub fn print_sources(sources: &[SourceInfo]) {
    println!("\n🌐 Configured Sources\n");

    for source in sources {
        println!("• {} ({})", source.id, source.base_url);
        println!(
            "  Rate limit: {} req / {}s, {} workers",
            source.rate_limit.requests, source.rate_limit.interval_secs, source.concurrency
        );
        println!(
            "  Backoff: {}ms ×{} up to {}ms",
            source.retry_backoff.initial_ms,
            source.retry_backoff.multiplier,
            source.retry_backoff.max_ms
        );
        if let Some(path) = &source.alias_table {
            println!("  Aliases: {}", path);
        }
        let mapped = source
            .stats
            .mapped_ids
            .iter()
            .map(|(kind, n)| format!("{} {}", n, kind))
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "  Known: {}",
            if mapped.is_empty() { "nothing yet" } else { mapped.as_str() }
        );
        println!(
            "  Snapshots: {} (last {})",
            source.stats.snapshot_count,
            source.stats.last_fetched_at.as_deref().unwrap_or("never")
        );
        println!();
    }
}
