//! Status command implementation

use crate::config::Config;
use crate::error::Result;
use crate::store::{SqliteStore, StrategyStats};
use crate::strategy::StrategyKind;
use serde::Serialize;
use tracing::info;

/// Status information
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub db_path: String,
    pub graph_backend: String,
    pub completion_model: String,
    pub embedding_model: String,
    pub strategies: Vec<StrategyStats>,
}

/// Get system status
pub async fn cmd_status(config: &Config) -> Result<StatusInfo> {
    info!("Getting status");

    let store = SqliteStore::connect(config).await?;
    store.init_schema().await?;

    let mut strategies = Vec::new();
    for kind in StrategyKind::all() {
        strategies.push(store.stats(kind.name()).await?);
    }

    Ok(StatusInfo {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        graph_backend: config.store.graph_backend.clone(),
        completion_model: format!("{}:{}", config.completion.kind, config.completion.model),
        embedding_model: format!("{}:{}", config.embedding.kind, config.embedding.model),
        strategies,
    })
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    println!("\n📊 ragweave Status\n");
    println!("Configuration: {}", status.config_path);
    println!("Database: {}", status.db_path);
    println!("Graph backend: {}", status.graph_backend);
    println!("Completion model: {}", status.completion_model);
    println!("Embedding model: {}", status.embedding_model);

    for stats in &status.strategies {
        println!("\n{}:", stats.strategy);
        println!("  Documents: {} ({} failed)", stats.documents, stats.failed_documents);
        println!("  Chunks: {}", stats.chunks);
        println!("  Vectors: {}", stats.vectors);
        println!("  Entities: {}", stats.entities);
        println!("  Relations: {}", stats.relations);
        match &stats.last_run {
            Some(run) => println!(
                "  Last run: {} {} ({} created, {} updated, {} skipped, {} failed)",
                run.started_at, run.status, run.created, run.updated, run.skipped, run.failed
            ),
            None => println!("  Last run: never"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_status_on_fresh_workspace() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load_from(Some(tmp.path().to_path_buf())).unwrap();

        let status = cmd_status(&config).await.unwrap();
        let names: Vec<&str> = status.strategies.iter().map(|s| s.strategy.as_str()).collect();
        assert_eq!(names, ["naive", "graph-hybrid", "temporal-graph"]);
        assert!(status.strategies.iter().all(|s| s.documents == 0 && s.last_run.is_none()));
        assert!(tmp.path().join("ragweave.db").exists());
    }
}
