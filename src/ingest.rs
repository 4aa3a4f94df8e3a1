//! Ingestion runs: walk a source, feed documents to one strategy, record the run

use crate::error::{Error, Result};
use crate::models::{IngestionRun, RunStatus};
use crate::progress::RunProgress;
use crate::strategy::{DocumentFailure, DocumentOutcome, IngestSummary, Strategy};
use crate::walker::{SourceDescriptor, SourceWalker};
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Outcome of one ingestion run
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub run_id: String,
    pub agent: String,
    pub strategy: String,
    pub sources: String,
    pub status: RunStatus,
    #[serde(flatten)]
    pub summary: IngestSummary,
}

fn outcome_label(outcome: &DocumentOutcome) -> &'static str {
    match outcome {
        DocumentOutcome::Created => "created",
        DocumentOutcome::Updated => "updated",
        DocumentOutcome::Skipped => "skipped",
        DocumentOutcome::Failed(_) => "failed",
    }
}

/// Origin named by a per-document walker error
fn failed_origin(err: &Error) -> String {
    match err {
        Error::FetchFailed { origin, .. } | Error::ChunkInvalid { origin, .. } => origin.clone(),
        _ => "unknown".to_string(),
    }
}

/// Drives one strategy over everything a source descriptor yields
pub struct IngestPipeline {
    walker: SourceWalker,
    strategy: Strategy,
    fan_out: usize,
    cancel: CancellationToken,
    show_progress: bool,
}

impl IngestPipeline {
    pub fn new(walker: SourceWalker, strategy: Strategy, fan_out: usize, cancel: CancellationToken) -> Self {
        Self {
            walker,
            strategy,
            fan_out: fan_out.max(1),
            cancel,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Ingest every document the descriptor yields.
    ///
    /// Cancellation stops new documents from starting; documents already in
    /// flight finish. A run-fatal error does the same, then is returned.
    pub async fn run(&self, agent: &str, descriptor: &SourceDescriptor) -> Result<IngestReport> {
        let ledger = &self.strategy.context().ledger;
        let mut run = IngestionRun::new(agent, self.strategy.name(), &descriptor.describe());
        ledger.save_run(&run).await?;
        info!(
            run_id = %run.id,
            agent,
            strategy = %self.strategy.name(),
            sources = %run.sources,
            "Starting ingestion"
        );

        let progress = RunProgress::start(
            &format!("{} {}", self.strategy.name(), descriptor.describe()),
            self.show_progress,
        );
        let stop = self.cancel.child_token();

        let outcomes = self
            .walker
            .list_documents(descriptor)
            .take_until(stop.cancelled())
            .map(|item| async move {
                match item {
                    Ok(doc) => {
                        let outcome = self.strategy.ingest_document(&doc).await?;
                        Ok::<_, Error>((doc.origin, outcome))
                    }
                    Err(e) if e.is_fatal() => Err(e),
                    Err(e) => {
                        let origin = failed_origin(&e);
                        warn!(origin = %origin, error = %e, "Skipping document");
                        let failure = DocumentFailure::new(origin.clone(), &e);
                        Ok((origin, DocumentOutcome::Failed(failure)))
                    }
                }
            })
            .buffer_unordered(self.fan_out);
        let mut outcomes = std::pin::pin!(outcomes);

        let mut summary = IngestSummary::default();
        let mut fatal: Option<Error> = None;
        while let Some(result) = outcomes.next().await {
            match result {
                Ok((origin, outcome)) => {
                    progress.document_done(&origin, outcome_label(&outcome));
                    summary.absorb(outcome);
                }
                Err(e) => {
                    error!(error = %e, "Fatal ingestion error, draining in-flight documents");
                    stop.cancel();
                    fatal.get_or_insert(e);
                }
            }
        }

        let status = if fatal.is_some() {
            RunStatus::Failed
        } else if self.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        progress.finish(&format!(
            "{}: {} created, {} updated, {} skipped, {} failed",
            status, summary.created, summary.updated, summary.skipped, summary.failed
        ));

        run.completed_at = Some(Utc::now().to_rfc3339());
        run.status = status.to_string();
        run.created = summary.created as i64;
        run.updated = summary.updated as i64;
        run.skipped = summary.skipped as i64;
        run.failed = summary.failed as i64;
        run.errors_json = Some(serde_json::to_string(&summary.failures)?);
        if let Err(e) = ledger.save_run(&run).await {
            warn!(run_id = %run.id, error = %e, "Could not record run outcome");
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        info!(
            run_id = %run.id,
            status = %status,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            "Ingestion finished"
        );
        Ok(IngestReport {
            run_id: run.id,
            agent: agent.to_string(),
            strategy: self.strategy.name().to_string(),
            sources: run.sources,
            status,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::provider::fake::FakeBackend;
    use crate::provider::Completion;
    use crate::strategy::testing::context;
    use std::time::Duration;
    use crate::strategy::StrategyKind;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FILES: [&str; 5] = ["a.md", "b.md", "c.md", "d.md", "e.md"];

    fn walker_for(server: &MockServer) -> SourceWalker {
        let mut config = Config::default();
        config.repositories.github_api_url = server.uri();
        config.repositories.github_token_env = String::new();
        config.ingest.fan_out = 2;
        SourceWalker::new(&config).unwrap()
    }

    async fn mount_repo(server: &MockServer, failing: Option<&str>) {
        mount_slow_repo(server, failing, Duration::ZERO).await;
    }

    async fn mount_slow_repo(server: &MockServer, failing: Option<&str>, delay: Duration) {
        Mock::given(method("GET"))
            .and(path("/repos/acme/docs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"default_branch": "main"})))
            .mount(server)
            .await;
        let tree: Vec<serde_json::Value> = FILES
            .iter()
            .map(|p| serde_json::json!({"path": p, "type": "blob"}))
            .collect();
        Mock::given(method("GET"))
            .and(path("/repos/acme/docs/git/trees/main"))
            .and(query_param("recursive", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"tree": tree, "truncated": false})))
            .mount(server)
            .await;
        for file in FILES {
            let response = if Some(file) == failing {
                ResponseTemplate::new(500)
            } else {
                ResponseTemplate::new(200)
                    .set_body_string(format!("# {}\n\nContent of {}.", file, file))
                    .set_delay(delay)
            };
            Mock::given(method("GET"))
                .and(path(format!("/repos/acme/docs/contents/{}", file)))
                .respond_with(response)
                .mount(server)
                .await;
        }
    }

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor::repositories(
            "https://github.com/acme/docs",
            &crate::config::RepositoryConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_one_fetch_failure_among_five() {
        let server = MockServer::start().await;
        mount_repo(&server, Some("c.md")).await;
        let (_tmp, store, ctx) = context(FakeBackend::new()).await;
        let pipeline = IngestPipeline::new(
            walker_for(&server),
            Strategy::new(StrategyKind::Naive, ctx),
            3,
            CancellationToken::new(),
        );

        let report = pipeline.run("doc", &descriptor()).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!((report.summary.created, report.summary.failed), (4, 1));
        assert_eq!(report.summary.failures[0].origin, "github.com/acme/docs/c.md");
        assert_eq!(report.summary.failures[0].kind, "fetch_failed");

        let runs = store.recent_runs(1).await.unwrap();
        assert_eq!(runs[0].status, "completed");
        assert_eq!((runs[0].created, runs[0].failed), (4, 1));
        assert!(runs[0].errors_json.as_deref().unwrap().contains("c.md"));

        // Unchanged rerun: the fetched documents skip, the broken one fails again
        let report = pipeline.run("doc", &descriptor()).await.unwrap();
        assert_eq!((report.summary.created, report.summary.skipped, report.summary.failed), (0, 4, 1));
    }

    #[tokio::test]
    async fn test_enumeration_failure_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/docs"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let (_tmp, store, ctx) = context(FakeBackend::new()).await;
        let pipeline = IngestPipeline::new(
            walker_for(&server),
            Strategy::new(StrategyKind::Naive, ctx),
            2,
            CancellationToken::new(),
        );

        let err = pipeline.run("doc", &descriptor()).await.unwrap_err();
        assert!(matches!(err, Error::EnumerationFailed { .. }));
        assert_eq!(store.recent_runs(1).await.unwrap()[0].status, "failed");
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let server = MockServer::start().await;
        mount_repo(&server, None).await;
        let (_tmp, store, ctx) = context(FakeBackend::new()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline = IngestPipeline::new(
            walker_for(&server),
            Strategy::new(StrategyKind::Naive, ctx),
            2,
            cancel,
        );

        let report = pipeline.run("doc", &descriptor()).await.unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.summary.total(), 0);
        assert_eq!(store.stats("naive").await.unwrap().documents, 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_lets_in_flight_documents_finish() {
        let server = MockServer::start().await;
        mount_slow_repo(&server, None, Duration::from_millis(100)).await;

        // Cancel from inside the first document's extraction
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let fake = FakeBackend::new().with_responder(move |_, _| {
            trigger.cancel();
            Ok(Completion::text("{\"entities\": [], \"relations\": []}"))
        });
        let (_tmp, store, ctx) = context(fake.clone()).await;
        let pipeline = IngestPipeline::new(
            walker_for(&server),
            Strategy::new(StrategyKind::GraphHybrid, ctx),
            2,
            cancel,
        );

        let report = pipeline.run("doc", &descriptor()).await.unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report.summary.created >= 1);
        assert!(report.summary.total() < FILES.len());
        assert_eq!(report.summary.failed, 0);

        // Every document that started also finished and was recorded
        assert_eq!(fake.complete_calls(), report.summary.created);
        let stats = store.stats("graph-hybrid").await.unwrap();
        assert_eq!(stats.documents as usize, report.summary.created);

        let runs = store.recent_runs(1).await.unwrap();
        assert_eq!(runs[0].status, "cancelled");
        assert_eq!(runs[0].created as usize, report.summary.created);
    }
}
