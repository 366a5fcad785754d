//! vct-ingest CLI entry point

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vct_ingest::{
    commands::{
        cmd_extract, cmd_init, cmd_list_sources, cmd_matches, cmd_once, cmd_run, cmd_stats,
        cmd_status, parse_date, parse_status, print_extract_result, print_matches,
        print_once_results, print_run_stats, print_sources, print_stat_lines, print_status,
        ExtractInput, ExtractOptions,
    },
    config::Config,
    error::{Error, Result},
    models::TargetKind,
    store::{MatchQuery, StatQuery, Store},
};

#[derive(Parser)]
#[command(name = "vct-ingest")]
#[command(version, about = "Scrape and ingest Valorant esports match data", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "VCT_INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create configuration, alias table and database
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Run the pipeline until interrupted
    Run,

    /// Process a fixed number of scheduler batches and exit
    Once {
        /// Number of batches to process
        #[arg(long, default_value = "1")]
        batches: u32,
    },

    /// Re-run extraction over a snapshot or a local HTML file
    Extract {
        /// Page kind (match_list, match, team, player)
        #[arg(long)]
        kind: TargetKind,

        /// Stored snapshot id
        #[arg(long, conflicts_with = "file")]
        snapshot: Option<String>,

        /// Local HTML file
        #[arg(long, requires = "url")]
        file: Option<PathBuf>,

        /// Page URL the file was saved from
        #[arg(long)]
        url: Option<String>,

        /// Source the page belongs to
        #[arg(long, default_value = "vlr")]
        source: String,

        /// Commit the extracted records
        #[arg(long)]
        ingest: bool,
    },

    /// List matches
    Matches {
        /// Earliest scheduled date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        from: Option<String>,

        /// Latest scheduled date, exclusive
        #[arg(long)]
        to: Option<String>,

        /// Team id or name
        #[arg(long)]
        team: Option<String>,

        /// upcoming, live or completed
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// List player stat lines
    Stats {
        /// Player id or name
        #[arg(long)]
        player: Option<String>,

        /// Team id or name
        #[arg(long)]
        team: Option<String>,

        /// Earliest match date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        from: Option<String>,

        /// Latest match date, exclusive
        #[arg(long)]
        to: Option<String>,

        /// Maximum number of results
        #[arg(short, long, default_value = "100")]
        limit: u32,
    },

    /// Show system and pipeline status
    Status,

    /// List configured sources
    Sources,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, json_logs: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);
    if !config_path.exists() {
        return Err(Error::NotInitialized);
    }
    Config::load(&config_path)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    // Init runs before a config exists
    if let Commands::Init { force } = cli.command {
        let base_dir = cli.config.as_deref().map(|p| {
            if p.extension().is_some_and(|e| e == "toml") {
                p.parent().map(PathBuf::from).unwrap_or_else(Config::default_base_dir)
            } else {
                p.to_path_buf()
            }
        });
        let report = cmd_init(base_dir, force).await?;

        println!("✓ vct-ingest initialized successfully");
        println!("  Config: {}", report.config_path.display());
        println!("  Aliases: {}", report.alias_path.display());
        println!("  Database: {}", report.db_path.display());
        println!("\nNext steps:");
        println!("  1. Review rate limits in the config file");
        println!("  2. Try a single batch: vct-ingest once");
        println!("  3. Keep the data fresh: vct-ingest run");
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let store = Store::new(&config.paths.db_file).await?;

    match cli.command {
        Commands::Init { .. } => unreachable!(),

        Commands::Run => {
            let stats = cmd_run(&config, store).await?;
            if cli.json {
                print_json(&stats)?;
            } else {
                print_run_stats(&stats);
            }
        }

        Commands::Once { batches } => {
            let targets = cmd_once(&config, store, batches).await?;
            if cli.json {
                print_json(&targets)?;
            } else {
                print_once_results(&targets);
            }
        }

        Commands::Extract {
            kind,
            snapshot,
            file,
            url,
            source,
            ingest,
        } => {
            let input = match (snapshot, file, url) {
                (Some(id), _, _) => ExtractInput::Snapshot(id),
                (None, Some(path), Some(url)) => ExtractInput::File { path, source, url },
                _ => {
                    return Err(Error::Other(
                        "Pass --snapshot <id> or --file <path> --url <url>".to_string(),
                    ))
                }
            };
            let result = cmd_extract(
                &config,
                store,
                ExtractOptions {
                    input,
                    kind,
                    ingest,
                },
            )
            .await?;
            if cli.json {
                print_json(&result)?;
            } else {
                print_extract_result(&result);
            }
        }

        Commands::Matches {
            from,
            to,
            team,
            status,
            limit,
        } => {
            let query = MatchQuery {
                from: from.as_deref().map(parse_date).transpose()?,
                to: to.as_deref().map(parse_date).transpose()?,
                team,
                status: status.as_deref().map(parse_status).transpose()?,
                limit: Some(limit),
            };
            let matches = cmd_matches(&store, &query).await?;
            if cli.json {
                print_json(&matches)?;
            } else {
                print_matches(&matches);
            }
        }

        Commands::Stats {
            player,
            team,
            from,
            to,
            limit,
        } => {
            let query = StatQuery {
                player,
                team,
                from: from.as_deref().map(parse_date).transpose()?,
                to: to.as_deref().map(parse_date).transpose()?,
                limit: Some(limit),
            };
            let lines = cmd_stats(&store, &query).await?;
            if cli.json {
                print_json(&lines)?;
            } else {
                print_stat_lines(&lines);
            }
        }

        Commands::Status => {
            let status = cmd_status(&config, &store).await?;
            if cli.json {
                print_json(&status)?;
            } else {
                print_status(&status);
            }
        }

        Commands::Sources => {
            let sources = cmd_list_sources(&config, &store).await?;
            if cli.json {
                print_json(&sources)?;
            } else {
                print_sources(&sources);
            }
        }
    }

    Ok(())
}
