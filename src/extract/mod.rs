//! Extraction of candidate records from raw pages
//!
//! Rules are keyed by (source, target kind) and versioned. When a source
//! changes its layout a new rule version is registered next to the old one;
//! the registry tries versions newest first, so pages captured under either
//! layout keep extracting. A page that no version understands surfaces as
//! `SchemaMismatch` rather than as partial data.

mod vlr;

pub use vlr::*;

use crate::error::ExtractError;
use crate::fetch::WaitPolicy;
use crate::models::{CandidateRecord, RawPage, TargetKind};
use scraper::{ElementRef, Selector};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A versioned extraction rule for one page kind of one source
pub trait ExtractionRule: Send + Sync {
    fn source(&self) -> &str;

    fn kind(&self) -> TargetKind;

    fn version(&self) -> u32;

    /// Structural anchor the fetcher should wait for
    fn wait_selector(&self) -> Option<&'static str> {
        None
    }

    /// Parse the page; pure function of its content
    fn extract(&self, page: &RawPage) -> Result<Vec<CandidateRecord>, ExtractError>;

    fn label(&self) -> String {
        format!("{}/{}@{}", self.source(), self.kind(), self.version())
    }
}

/// Outcome of a successful extraction
#[derive(Debug, Clone)]
pub struct Extraction {
    pub rule: String,
    pub records: Vec<CandidateRecord>,
}

/// Rule sets by (source, kind), newest version first
#[derive(Clone, Default)]
pub struct RuleRegistry {
    rules: HashMap<(String, TargetKind), Vec<Arc<dyn ExtractionRule>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in rule set
    pub fn with_builtin_rules() -> Self {
        let mut registry = Self::new();
        register_vlr_rules(&mut registry);
        registry
    }

    pub fn register(&mut self, rule: Arc<dyn ExtractionRule>) {
        let versions = self
            .rules
            .entry((rule.source().to_string(), rule.kind()))
            .or_default();
        versions.push(rule);
        versions.sort_by_key(|r| std::cmp::Reverse(r.version()));
    }

    pub fn rules_for(&self, source: &str, kind: TargetKind) -> &[Arc<dyn ExtractionRule>] {
        self.rules
            .get(&(source.to_string(), kind))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn supports(&self, source: &str, kind: TargetKind) -> bool {
        !self.rules_for(source, kind).is_empty()
    }

    /// Wait policy of the newest rule for a target
    pub fn wait_policy(&self, source: &str, kind: TargetKind) -> WaitPolicy {
        self.rules_for(source, kind)
            .first()
            .and_then(|r| r.wait_selector())
            .map(WaitPolicy::for_selector)
            .unwrap_or_default()
    }

    /// Extract with the newest rule version that understands the page
    pub fn extract(&self, page: &RawPage, kind: TargetKind) -> Result<Extraction, ExtractError> {
        let rules = self.rules_for(&page.source, kind);
        if rules.is_empty() {
            return Err(ExtractError::NoRule {
                source_id: page.source.clone(),
                kind: kind.to_string(),
            });
        }

        let mut first_mismatch = None;
        for rule in rules {
            match rule.extract(page) {
                Ok(records) => {
                    debug!(
                        "{} extracted {} records from {}",
                        rule.label(),
                        records.len(),
                        page.url
                    );
                    return Ok(Extraction {
                        rule: rule.label(),
                        records,
                    });
                }
                Err(e @ ExtractError::SchemaMismatch { .. }) => {
                    debug!("{} did not match {}: {}", rule.label(), page.url, e);
                    first_mismatch.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(first_mismatch.unwrap_or_else(|| ExtractError::NoRule {
            source_id: page.source.clone(),
            kind: kind.to_string(),
        }))
    }
}

// ===== HTML helpers shared by rule sets =====

pub(crate) fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector(format!("{}: {}", css, e)))
}

/// Trimmed text of the first match, empty if none
pub(crate) fn select_text(element: &ElementRef, sel: &Selector) -> String {
    element
        .select(sel)
        .next()
        .map(|e| first_text(&e))
        .unwrap_or_default()
}

/// First non-blank text node, trimmed
pub(crate) fn first_text(element: &ElementRef) -> String {
    element
        .text()
        .map(str::trim)
        .find(|t| !t.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// All text collapsed to single spaces
pub(crate) fn full_text(element: &ElementRef) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Make protocol-relative image URLs absolute
pub(crate) fn normalize_img_url(src: &str) -> String {
    if let Some(rest) = src.strip_prefix("//") {
        format!("https://{}", rest)
    } else {
        src.to_string()
    }
}

/// Numeric id following `prefix` in a path, e.g. `/team/2/sentinels` -> `2`
pub(crate) fn id_after(href: &str, prefix: &str) -> Option<String> {
    let path = href
        .split("://")
        .nth(1)
        .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or(href);
    let rest = path.strip_prefix(prefix)?;
    let id: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

pub(crate) fn parse_int(text: &str) -> Option<i64> {
    let t = text.trim().trim_start_matches('+');
    t.parse::<i64>().ok()
}

pub(crate) fn parse_float(text: &str) -> Option<f64> {
    let t = text.trim().trim_end_matches('%').trim();
    t.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, Provenance};
    use chrono::Utc;

    struct FixedRule {
        version: u32,
        fail: bool,
    }

    impl ExtractionRule for FixedRule {
        fn source(&self) -> &str {
            "test"
        }
        fn kind(&self) -> TargetKind {
            TargetKind::Team
        }
        fn version(&self) -> u32 {
            self.version
        }
        fn extract(&self, page: &RawPage) -> Result<Vec<CandidateRecord>, ExtractError> {
            if self.fail {
                return Err(ExtractError::SchemaMismatch {
                    rule: self.label(),
                    anchor: "div.new-layout".to_string(),
                });
            }
            let prov = Provenance {
                source: page.source.clone(),
                fetched_at: page.fetched_at,
                snapshot_id: None,
            };
            Ok(vec![CandidateRecord::new(
                EntityKind::Team,
                format!("v{}", self.version),
                prov,
            )])
        }
    }

    fn page() -> RawPage {
        RawPage {
            source: "test".to_string(),
            url: "https://example.com/team/1".to_string(),
            html: String::new(),
            fetched_at: Utc::now(),
            snapshot_id: None,
        }
    }

    #[test]
    fn test_newest_matching_version_wins() {
        let mut registry = RuleRegistry::new();
        registry.register(Arc::new(FixedRule { version: 1, fail: false }));
        registry.register(Arc::new(FixedRule { version: 2, fail: true }));

        let extraction = registry.extract(&page(), TargetKind::Team).unwrap();
        assert_eq!(extraction.rule, "test/team@1");
        assert_eq!(extraction.records[0].external_ref, "v1");

        registry.register(Arc::new(FixedRule { version: 3, fail: false }));
        let extraction = registry.extract(&page(), TargetKind::Team).unwrap();
        assert_eq!(extraction.rule, "test/team@3");
    }

    #[test]
    fn test_all_versions_mismatch() {
        let mut registry = RuleRegistry::new();
        registry.register(Arc::new(FixedRule { version: 1, fail: true }));
        let err = registry.extract(&page(), TargetKind::Team).unwrap_err();
        assert!(matches!(err, ExtractError::SchemaMismatch { .. }));

        let err = registry.extract(&page(), TargetKind::Player).unwrap_err();
        assert!(matches!(err, ExtractError::NoRule { .. }));
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(id_after("/team/2/sentinels", "/team/"), Some("2".to_string()));
        assert_eq!(
            id_after("https://www.vlr.gg/player/9/tenz", "/player/"),
            Some("9".to_string())
        );
        assert_eq!(id_after("https://www.vlr.gg/595657/a-vs-b", "/"), Some("595657".to_string()));
        assert_eq!(id_after("/event/1", "/team/"), None);
        assert_eq!(parse_int("+5"), Some(5));
        assert_eq!(parse_float("74%"), Some(74.0));
        assert_eq!(normalize_img_url("//owcdn.net/x.png"), "https://owcdn.net/x.png");
    }
}
