//! Init command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::Store;
use std::path::PathBuf;
use tracing::info;

/// Alias table written next to a fresh config
const ALIAS_TEMPLATE: &str = r#"# Alternate names mapped to the canonical display name.
# Matching ignores case.

[teams]
# "GEN" = "Gen.G"

[players]
# "tenz" = "TenZ"
"#;

/// What `init` created
#[derive(Debug, Clone)]
pub struct InitReport {
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    pub alias_path: PathBuf,
}

/// Write a default config, an alias table template, and an empty database
pub async fn cmd_init(base_dir: Option<PathBuf>, force: bool) -> Result<InitReport> {
    let mut config = Config::default();
    config.init_paths(base_dir);

    if config.paths.config_file.exists() && !force {
        return Err(Error::Config(format!(
            "Config already exists at {}. Use --force to overwrite.",
            config.paths.config_file.display()
        )));
    }

    let alias_path = PathBuf::from("aliases.toml");
    for source in &mut config.sources {
        source.alias_table = Some(alias_path.clone());
    }
    let alias_path = config.paths.base_dir.join(alias_path);

    std::fs::create_dir_all(&config.paths.base_dir)?;
    std::fs::create_dir_all(&config.paths.snapshot_dir)?;
    if !alias_path.exists() {
        std::fs::write(&alias_path, ALIAS_TEMPLATE)?;
    }
    config.save()?;

    Store::new(&config.paths.db_file).await?;
    info!("Initialized database at {:?}", config.paths.db_file);

    Ok(InitReport {
        config_path: config.paths.config_file.clone(),
        db_path: config.paths.db_file.clone(),
        alias_path,
    })
}
