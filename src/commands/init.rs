//! Init command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::SqliteStore;
use std::path::PathBuf;
use tracing::info;

/// Write a default config and create the working database
pub async fn cmd_init(base_dir: Option<PathBuf>, force: bool) -> Result<Config> {
    let config = Config::with_base_dir(base_dir);

    if config.paths.config_file.exists() && !force {
        return Err(Error::Config(format!(
            "Config already exists at {}. Use --force to overwrite.",
            config.paths.config_file.display()
        )));
    }

    config.save()?;
    let store = SqliteStore::connect(&config).await?;
    store.init_schema().await?;
    info!(base_dir = %config.paths.base_dir.display(), "Initialized ragweave");
    Ok(config)
}
