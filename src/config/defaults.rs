//! Default values for configuration

use super::{BackoffPolicy, RateLimitPolicy, SourceConfig, UrlPatterns};

/// Default number of targets emitted per scheduler batch
pub fn default_batch_size() -> usize {
    8
}

/// Default delay between scheduler ticks (milliseconds)
pub fn default_tick_ms() -> u64 {
    2000
}

/// Default refresh interval for live matches (seconds)
pub fn default_live_refresh_secs() -> u64 {
    60
}

/// Default delay before a completed match gets its finalization re-fetch
pub fn default_finalize_after_secs() -> u64 {
    900
}

/// Default age after which a finalized entity is considered stale (1 day)
pub fn default_stale_after_secs() -> u64 {
    86_400
}

/// Default refresh interval for match listing pages
pub fn default_listing_refresh_secs() -> u64 {
    300
}

/// Default half-life for the age-based priority decay (hours)
pub fn default_decay_half_life_hours() -> f64 {
    24.0
}

/// Default per-attempt fetch timeout in seconds
pub fn default_fetch_timeout() -> u64 {
    30
}

/// Default number of immediate retries for transient fetch errors
pub fn default_fetch_max_retries() -> u32 {
    2
}

/// Default pause between immediate retries (milliseconds)
pub fn default_fetch_retry_delay_ms() -> u64 {
    500
}

/// Default user agent
pub fn default_user_agent() -> String {
    format!("vct-ingest/{} (esports stats archiver)", env!("CARGO_PKG_VERSION"))
}

/// Default wait after navigation for dynamic content (milliseconds)
pub fn default_render_wait_ms() -> u64 {
    1500
}

/// Default: plain HTTP fetching, headless browser opt-in
pub fn default_js_rendering() -> bool {
    false
}

/// Default number of retries before an unresolved record is orphaned
pub fn default_max_unresolved_attempts() -> u32 {
    5
}

/// Default spacing between counted retries of an unresolved record (seconds)
pub fn default_unresolved_retry_interval_secs() -> u64 {
    3600
}

/// Default source priority for the merge policy
pub fn default_source_priority() -> Vec<String> {
    vec!["vlr".to_string()]
}

/// Default concurrent workers per source
pub fn default_source_concurrency() -> usize {
    2
}

pub fn default_rate_limit() -> RateLimitPolicy {
    RateLimitPolicy {
        requests: 1,
        interval_secs: 2,
    }
}

pub fn default_retry_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial_ms: 2_000,
        multiplier: 2.0,
        max_ms: 600_000,
    }
}

/// Default sources: vlr.gg only
pub fn default_sources() -> Vec<SourceConfig> {
    vec![SourceConfig {
        id: "vlr".to_string(),
        base_url: "https://www.vlr.gg".to_string(),
        urls: UrlPatterns {
            match_list: "{base}/matches".to_string(),
            match_page: "{base}/{ref}".to_string(),
            team: "{base}/team/{ref}".to_string(),
            player: "{base}/player/{ref}".to_string(),
        },
        rate_limit: default_rate_limit(),
        retry_backoff: default_retry_backoff(),
        alias_table: None,
        concurrency: default_source_concurrency(),
    }]
}
