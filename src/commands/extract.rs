//! Extract command implementation
//!
//! Re-runs extraction over a stored snapshot or a local HTML file. Without
//! `--ingest` nothing is written, which makes this the tool for checking a
//! rule against a changed layout.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extract::RuleRegistry;
use crate::fetch::{build_browser, SnapshotWriter};
use crate::models::{CandidateRecord, RawPage, TargetKind};
use crate::pipeline::{PageReport, Pipeline};
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Where the page comes from
#[derive(Debug, Clone)]
pub enum ExtractInput {
    Snapshot(String),
    File {
        path: PathBuf,
        source: String,
        url: String,
    },
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub input: ExtractInput,
    pub kind: TargetKind,
    pub ingest: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractResult {
    pub rule: String,
    pub records: Vec<CandidateRecord>,
    /// Present when the records were ingested
    pub ingested: Option<PageReport>,
}

async fn load_page(config: &Config, store: &Store, input: &ExtractInput) -> Result<RawPage> {
    match input {
        ExtractInput::Snapshot(id) => {
            let snapshot = store
                .get_snapshot(id)
                .await?
                .ok_or_else(|| Error::Other(format!("Snapshot not found: {}", id)))?;
            let html = SnapshotWriter::new(config.paths.snapshot_dir.clone(), store.clone())
                .load(&snapshot)
                .await?;
            let fetched_at = DateTime::parse_from_rfc3339(&snapshot.fetched_at)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| Error::Other(format!("Invalid snapshot timestamp: {}", e)))?;
            Ok(RawPage {
                source: snapshot.source,
                url: snapshot.url,
                html,
                fetched_at,
                snapshot_id: Some(snapshot.id),
            })
        }
        ExtractInput::File { path, source, url } => {
            config.source(source)?;
            let html = tokio::fs::read_to_string(path).await?;
            let fetched_at = tokio::fs::metadata(path)
                .await?
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            Ok(RawPage {
                source: source.clone(),
                url: url.clone(),
                html,
                fetched_at,
                snapshot_id: None,
            })
        }
    }
}

/// Extract records from a page, optionally ingesting them
pub async fn cmd_extract(config: &Config, store: Store, options: ExtractOptions) -> Result<ExtractResult> {
    let page = load_page(config, &store, &options.input).await?;
    info!("Extracting {} as {}", page.url, options.kind);

    let extraction = RuleRegistry::with_builtin_rules().extract(&page, options.kind)?;

    let ingested = if options.ingest {
        let pipeline = Pipeline::new(config.clone(), store, build_browser(&config.fetch)?)?;
        Some(pipeline.process_page(page, options.kind).await?)
    } else {
        None
    };

    Ok(ExtractResult {
        rule: extraction.rule,
        records: extraction.records,
        ingested,
    })
}

/// Print extraction results to console
pub fn print_extract_result(result: &ExtractResult) {
    println!("\n🔎 {} records via {}\n", result.records.len(), result.rule);

    for record in &result.records {
        let label = record
            .field_str("name")
            .or_else(|| record.field_str("map_name"))
            .or_else(|| record.field_str("event_name"))
            .unwrap_or("");
        println!("• {} {} {}", record.kind, record.external_ref, label);
        for (field, target) in &record.refs {
            println!("    {} → {} {}", field, target.kind, target.external_ref);
        }
    }

    if let Some(report) = &result.ingested {
        println!(
            "\nIngested: created {}, updated {}, unchanged {}, failed {}, unresolved {}",
            report.created, report.updated, report.unchanged, report.failed, report.unresolved
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;
    use tempfile::TempDir;

    const PLAYER: &str = include_str!("../extract/fixtures/vlr_player.html");

    async fn setup() -> (TempDir, Config, Store) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        let store = Store::new(&config.paths.db_file).await.unwrap();
        (tmp, config, store)
    }

    #[tokio::test]
    async fn test_extract_file_without_ingest() {
        let (tmp, config, store) = setup().await;
        let path = tmp.path().join("player.html");
        std::fs::write(&path, PLAYER).unwrap();

        let result = cmd_extract(
            &config,
            store.clone(),
            ExtractOptions {
                input: ExtractInput::File {
                    path,
                    source: "vlr".to_string(),
                    url: "https://www.vlr.gg/player/4004/zekken".to_string(),
                },
                kind: TargetKind::Player,
                ingest: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.rule, "vlr/player@1");
        assert_eq!(result.records[0].kind, EntityKind::Player);
        assert!(result.ingested.is_none());
        assert_eq!(store.get_global_stats().await.unwrap().player_count, 0);
    }

    #[tokio::test]
    async fn test_extract_snapshot_with_ingest() {
        let (_tmp, config, store) = setup().await;
        let writer = SnapshotWriter::new(config.paths.snapshot_dir.clone(), store.clone());
        let snapshot = writer
            .persist("vlr", "https://www.vlr.gg/player/4004/zekken", Utc::now(), PLAYER)
            .await
            .unwrap();

        let result = cmd_extract(
            &config,
            store.clone(),
            ExtractOptions {
                input: ExtractInput::Snapshot(snapshot.id.clone()),
                kind: TargetKind::Player,
                ingest: true,
            },
        )
        .await
        .unwrap();

        let report = result.ingested.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(store.get_global_stats().await.unwrap().player_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_snapshot() {
        let (_tmp, config, store) = setup().await;
        let err = cmd_extract(
            &config,
            store,
            ExtractOptions {
                input: ExtractInput::Snapshot("missing".to_string()),
                kind: TargetKind::Match,
                ingest: false,
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
