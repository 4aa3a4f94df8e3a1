//! Ingest command implementation

use super::open_strategy;
use crate::agent::AgentKind;
use crate::config::Config;
use crate::error::Result;
use crate::ingest::{IngestPipeline, IngestReport};
use crate::strategy::StrategyKind;
use crate::walker::{SourceDescriptor, SourceWalker};
use tokio_util::sync::CancellationToken;

/// Options for one ingest invocation
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub agent: AgentKind,
    pub strategy: StrategyKind,
    /// Comma-separated repository URLs, or a record-source selector
    pub sources: String,
    pub show_progress: bool,
}

/// Sources are read according to the agent: repositories for `doc`, records for `inh`
pub fn source_descriptor(config: &Config, agent: AgentKind, sources: &str) -> Result<SourceDescriptor> {
    match agent {
        AgentKind::Doc => SourceDescriptor::repositories(sources, &config.repositories),
        AgentKind::Inheritance => SourceDescriptor::records(sources),
    }
}

/// Ingest the given sources into one strategy
pub async fn cmd_ingest(
    config: &Config,
    options: IngestOptions,
    cancel: CancellationToken,
) -> Result<IngestReport> {
    let descriptor = source_descriptor(config, options.agent, &options.sources)?;
    let strategy = open_strategy(config, options.strategy).await?;
    let walker = SourceWalker::new(config)?;

    IngestPipeline::new(walker, strategy, config.ingest.fan_out, cancel)
        .with_progress(options.show_progress)
        .run(options.agent.code(), &descriptor)
        .await
}

/// Print an ingest report to console
pub fn print_ingest_report(report: &IngestReport) {
    println!("\n📥 Ingestion {} ({})\n", report.status, report.run_id);
    println!("Agent: {}", report.agent);
    println!("Strategy: {}", report.strategy);
    println!("Sources: {}", report.sources);
    println!("\nDocuments:");
    println!("  Created: {}", report.summary.created);
    println!("  Updated: {}", report.summary.updated);
    println!("  Skipped: {}", report.summary.skipped);
    println!("  Failed: {}", report.summary.failed);

    if !report.summary.failures.is_empty() {
        println!("\nFailures:");
        for failure in &report.summary.failures {
            println!("  ✗ {} [{}] {}", failure.origin, failure.kind, failure.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_sources_follow_the_agent() {
        let config = Config::default();
        let docs = source_descriptor(&config, AgentKind::Doc, "https://github.com/acme/docs").unwrap();
        assert!(matches!(docs, SourceDescriptor::Repositories(_)));

        let records = source_descriptor(&config, AgentKind::Inheritance, "persons=p.json").unwrap();
        assert!(matches!(records, SourceDescriptor::Records(_)));

        let err = source_descriptor(&config, AgentKind::Inheritance, "deeds=d.json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
