//! Retrieval strategies
//!
//! Three variants share one ingestion contract and one query contract:
//! - Naive: chunk vectors and cosine search
//! - Graph-Hybrid: chunk vectors plus an entity/relation graph walked from
//!   entities named in the question
//! - Temporal-Graph: Graph-Hybrid where every relation carries a validity
//!   interval and queries may ask for the state of the world at an instant
//!
//! The set is closed on purpose; callers match on [`Strategy`] and the
//! compiler checks every variant is handled.

mod extract;
mod graph;
mod naive;
mod records;

pub use graph::GraphStrategy;
pub(crate) use graph::{describe_relation, select_relations};
pub use naive::NaiveStrategy;

use crate::chunk::Chunker;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{
    Chunk, ContextItem, EmbeddingVector, GraphFragment, IngestStatus, IngestionRecord,
    QueryResult, SourceDocument,
};
use crate::provider::ProviderGateway;
use crate::store::{
    GraphStore, IngestionLedger, OriginLocks, OriginState, OriginWriter, Stores, VectorStore,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Strategy selector, chosen once per ingest or query invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Naive,
    GraphHybrid,
    TemporalGraph,
}

impl StrategyKind {
    pub fn all() -> [StrategyKind; 3] {
        [
            StrategyKind::Naive,
            StrategyKind::GraphHybrid,
            StrategyKind::TemporalGraph,
        ]
    }

    /// Short code accepted on the command line
    pub fn code(&self) -> &'static str {
        match self {
            StrategyKind::Naive => "nv",
            StrategyKind::GraphHybrid => "lr",
            StrategyKind::TemporalGraph => "gr",
        }
    }

    /// Name under which the strategy's derived state is stored
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Naive => "naive",
            StrategyKind::GraphHybrid => "graph-hybrid",
            StrategyKind::TemporalGraph => "temporal-graph",
        }
    }

    pub fn uses_graph(&self) -> bool {
        !matches!(self, StrategyKind::Naive)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, StrategyKind::TemporalGraph)
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        StrategyKind::all()
            .into_iter()
            .find(|k| k.code() == s || k.name() == s)
            .ok_or_else(|| {
                Error::Config(format!(
                    "Unknown strategy '{}'; expected nv, lr or gr",
                    s
                ))
            })
    }
}

/// Everything a strategy reads from and writes to
#[derive(Clone)]
pub struct StrategyContext {
    pub gateway: Arc<ProviderGateway>,
    pub vectors: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub ledger: Arc<dyn IngestionLedger>,
    pub writer: Arc<dyn OriginWriter>,
    pub chunker: Chunker,
    pub locks: Arc<OriginLocks>,
    pub max_hops: usize,
    pub min_score: f32,
}

impl StrategyContext {
    pub fn new(config: &Config, gateway: Arc<ProviderGateway>, stores: &Stores) -> Self {
        Self {
            gateway,
            vectors: stores.sqlite.clone(),
            graph: stores.graph.clone(),
            ledger: stores.sqlite.clone(),
            writer: stores.writer.clone(),
            chunker: Chunker::new(&config.chunk),
            locks: Arc::new(OriginLocks::new()),
            max_hops: config.query.max_hops,
            min_score: config.query.min_score,
        }
    }

    /// Split a document and embed every chunk
    async fn chunk_and_embed(&self, doc: &SourceDocument) -> Result<(Vec<Chunk>, Vec<EmbeddingVector>)> {
        let chunks = self.chunker.split(doc)?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let model = self.gateway.embedding_model();
        let vectors = self
            .gateway
            .embed(&texts)
            .await?
            .into_iter()
            .zip(chunks.iter())
            .map(|(vector, chunk)| EmbeddingVector {
                chunk_id: chunk.chunk_id.clone(),
                vector,
                provider_model_id: model.clone(),
            })
            .collect();
        Ok((chunks, vectors))
    }

    /// Nearest stored chunks as context items, above the score floor
    async fn similar_chunks(
        &self,
        strategy: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<ContextItem>> {
        let model = self.gateway.embedding_model();
        let hits = self.vectors.search(strategy, &model, query_vector, k).await?;
        Ok(hits
            .into_iter()
            .filter(|hit| hit.score >= self.min_score)
            .map(|hit| ContextItem {
                provenance: hit.chunk.provenance(),
                text: hit.chunk.text,
                score: hit.score,
                hops: None,
            })
            .collect())
    }
}

/// A question for a strategy
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub question: String,
    /// Upper bound on returned context items
    pub k: usize,
    /// Only honored by the temporal strategy
    pub as_of: Option<DateTime<Utc>>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>, k: usize) -> Self {
        Self {
            question: question.into(),
            k,
            as_of: None,
        }
    }

    pub fn as_of(mut self, instant: DateTime<Utc>) -> Self {
        self.as_of = Some(instant);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.question.trim().is_empty() {
            return Err(Error::Query("question is empty".to_string()));
        }
        if self.k == 0 {
            return Err(Error::Query("k must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Parse an as-of instant: RFC 3339, `YYYY-MM-DD`, `YYYY-MM` or `YYYY`
pub fn parse_as_of(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }

    let padded = match raw.len() {
        4 => format!("{}-01-01", raw),
        7 => format!("{}-01", raw),
        _ => raw.to_string(),
    };
    NaiveDate::parse_from_str(&padded, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| {
            Error::Query(format!(
                "Cannot read '{}' as a time; use RFC 3339, YYYY-MM-DD, YYYY-MM or YYYY",
                raw
            ))
        })
}

/// A document that could not be ingested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentFailure {
    pub origin: String,
    /// Stable error tag, e.g. `fetch_failed`
    pub kind: String,
    pub message: String,
}

impl DocumentFailure {
    pub fn new(origin: impl Into<String>, err: &Error) -> Self {
        Self {
            origin: origin.into(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// What happened to one document
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOutcome {
    Created,
    Updated,
    Skipped,
    Failed(DocumentFailure),
}

/// Per-run counts plus the failures behind `failed`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<DocumentFailure>,
}

impl IngestSummary {
    pub fn absorb(&mut self, outcome: DocumentOutcome) {
        match outcome {
            DocumentOutcome::Created => self.created += 1,
            DocumentOutcome::Updated => self.updated += 1,
            DocumentOutcome::Skipped => self.skipped += 1,
            DocumentOutcome::Failed(failure) => {
                self.failed += 1;
                self.failures.push(failure);
            }
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.skipped + self.failed
    }
}

/// State derived from one document, ready to persist
struct Derived {
    chunks: Vec<Chunk>,
    vectors: Vec<EmbeddingVector>,
    fragment: Option<GraphFragment>,
}

/// The closed set of retrieval strategies
pub enum Strategy {
    Naive(NaiveStrategy),
    GraphHybrid(GraphStrategy),
    TemporalGraph(GraphStrategy),
}

impl Strategy {
    pub fn new(kind: StrategyKind, context: StrategyContext) -> Self {
        match kind {
            StrategyKind::Naive => Strategy::Naive(NaiveStrategy::new(context)),
            StrategyKind::GraphHybrid => Strategy::GraphHybrid(GraphStrategy::new(context, false)),
            StrategyKind::TemporalGraph => {
                Strategy::TemporalGraph(GraphStrategy::new(context, true))
            }
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Naive(_) => StrategyKind::Naive,
            Strategy::GraphHybrid(_) => StrategyKind::GraphHybrid,
            Strategy::TemporalGraph(_) => StrategyKind::TemporalGraph,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn context(&self) -> &StrategyContext {
        match self {
            Strategy::Naive(s) => s.context(),
            Strategy::GraphHybrid(s) | Strategy::TemporalGraph(s) => s.context(),
        }
    }

    async fn derive(&self, doc: &SourceDocument) -> Result<Derived> {
        match self {
            Strategy::Naive(s) => s.derive(doc).await,
            Strategy::GraphHybrid(s) | Strategy::TemporalGraph(s) => s.derive(doc).await,
        }
    }

    /// Graph, vectors and the completed record as one unit
    async fn write(&self, origin: &str, derived: &Derived, record: &IngestionRecord) -> Result<()> {
        let state = OriginState {
            chunks: &derived.chunks,
            vectors: &derived.vectors,
            fragment: derived.fragment.as_ref(),
            record,
        };
        self.context()
            .writer
            .commit_origin(self.name(), origin, &state)
            .await
    }

    async fn persist(&self, origin: &str, derived: &Derived, record: &IngestionRecord) -> Result<()> {
        match self.write(origin, derived, record).await {
            Err(Error::StoreWriteConflict(reason)) => {
                warn!(origin = %origin, strategy = %self.name(), reason = %reason, "Write conflict, retrying once");
                self.write(origin, derived, record).await
            }
            other => other,
        }
    }

    /// Ingest one document under the per-origin lock.
    ///
    /// Per-document failures come back as [`DocumentOutcome::Failed`]; only
    /// run-fatal errors are returned as `Err`.
    pub async fn ingest_document(&self, doc: &SourceDocument) -> Result<DocumentOutcome> {
        let context = self.context();
        let strategy = self.name();
        let model = context.gateway.embedding_model();
        let _guard = context
            .locks
            .acquire(&format!("{}\n{}", strategy, doc.origin))
            .await;

        let previous = context.ledger.lookup(&doc.origin, strategy).await?;
        if previous
            .as_ref()
            .is_some_and(|r| r.covers(&doc.content_hash, &model))
        {
            debug!(origin = %doc.origin, strategy, "Unchanged, skipping");
            return Ok(DocumentOutcome::Skipped);
        }
        let existed = previous.is_some_and(|r| r.status == IngestStatus::Completed);

        let completed = IngestionRecord::completed(&doc.origin, &doc.content_hash, strategy, &model);
        let result = match self.derive(doc).await {
            Ok(derived) => self.persist(&doc.origin, &derived, &completed).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(origin = %doc.origin, strategy, updated = existed, "Ingested document");
                Ok(if existed {
                    DocumentOutcome::Updated
                } else {
                    DocumentOutcome::Created
                })
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(origin = %doc.origin, strategy, error = %e, "Document failed");
                context
                    .ledger
                    .record(&IngestionRecord::failed(
                        &doc.origin,
                        &doc.content_hash,
                        strategy,
                        &model,
                    ))
                    .await?;
                Ok(DocumentOutcome::Failed(DocumentFailure::new(&doc.origin, &e)))
            }
        }
    }

    /// Ingest a batch with up to `fan_out` documents in flight, outside any run.
    ///
    /// A fatal error stops the batch after in-flight documents settle.
    #[cfg(test)]
    pub(crate) async fn ingest(
        &self,
        documents: Vec<SourceDocument>,
        fan_out: usize,
    ) -> Result<IngestSummary> {
        use futures::stream::{self, StreamExt};

        let mut outcomes = stream::iter(documents)
            .map(|doc| async move { self.ingest_document(&doc).await })
            .buffer_unordered(fan_out.max(1));

        let mut summary = IngestSummary::default();
        let mut fatal = None;
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok(outcome) => summary.absorb(outcome),
                Err(e) => {
                    fatal.get_or_insert(e);
                }
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Answer-ready context for a question; never writes to any store
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResult> {
        request.validate()?;
        match self {
            Strategy::Naive(s) => s.query(request).await,
            Strategy::GraphHybrid(s) | Strategy::TemporalGraph(s) => s.query(request).await,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{context, markdown};
    use super::*;
    use crate::provider::fake::FakeBackend;

    fn corpus() -> Vec<SourceDocument> {
        vec![
            markdown("guide/install.md", "# Install\n\nRun the installer and restart the shell."),
            markdown("guide/config.md", "# Configure\n\nEdit config.toml to pick a provider."),
            markdown("guide/query.md", "# Query\n\nAsk a question and read the ranked context."),
        ]
    }

    #[test]
    fn test_strategy_codes() {
        assert_eq!("nv".parse::<StrategyKind>().unwrap(), StrategyKind::Naive);
        assert_eq!("LR".parse::<StrategyKind>().unwrap(), StrategyKind::GraphHybrid);
        assert_eq!("gr".parse::<StrategyKind>().unwrap(), StrategyKind::TemporalGraph);
        assert_eq!(
            "temporal-graph".parse::<StrategyKind>().unwrap(),
            StrategyKind::TemporalGraph
        );
        assert!("xx".parse::<StrategyKind>().is_err());
        assert!(!StrategyKind::Naive.uses_graph());
        assert!(StrategyKind::TemporalGraph.is_temporal());
    }

    #[test]
    fn test_parse_as_of_forms() {
        let day = parse_as_of("2020-03-04").unwrap();
        assert_eq!(day, Utc.with_ymd_and_hms(2020, 3, 4, 0, 0, 0).unwrap());
        assert_eq!(
            parse_as_of("2020-03").unwrap(),
            Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_as_of("2020").unwrap(),
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_as_of("2020-03-04T12:00:00+02:00").unwrap(),
            Utc.with_ymd_and_hms(2020, 3, 4, 10, 0, 0).unwrap()
        );
        assert!(matches!(parse_as_of("last year"), Err(Error::Query(_))));
    }

    #[tokio::test]
    async fn test_second_run_skips_everything() {
        let fake = FakeBackend::new();
        let (_tmp, _store, ctx) = context(fake.clone()).await;
        let strategy = Strategy::new(StrategyKind::Naive, ctx);

        let first = strategy.ingest(corpus(), 2).await.unwrap();
        assert_eq!((first.created, first.updated, first.skipped, first.failed), (3, 0, 0, 0));

        let embeds_after_first = fake.embed_calls();
        let second = strategy.ingest(corpus(), 2).await.unwrap();
        assert_eq!((second.created, second.updated, second.skipped, second.failed), (0, 0, 3, 0));
        assert_eq!(fake.embed_calls(), embeds_after_first);
    }

    #[tokio::test]
    async fn test_changed_document_is_updated_alone() {
        let (_tmp, store, ctx) = context(FakeBackend::new()).await;
        let strategy = Strategy::new(StrategyKind::Naive, ctx);
        strategy.ingest(corpus(), 2).await.unwrap();

        let mut changed = corpus();
        changed[1] = markdown("guide/config.md", "# Configure\n\nSet the provider kind to ollama.");
        let summary = strategy.ingest(changed, 2).await.unwrap();
        assert_eq!((summary.created, summary.updated, summary.skipped), (0, 1, 2));

        let result = strategy
            .query(&QueryRequest::new("Set the provider kind to ollama.", 5))
            .await
            .unwrap();
        assert!(result
            .context_items
            .iter()
            .all(|item| !item.text.contains("Edit config.toml")));
        assert_eq!(store.stats("naive").await.unwrap().chunks, 3);
    }

    #[tokio::test]
    async fn test_identical_text_scores_one() {
        let (_tmp, _store, ctx) = context(FakeBackend::new()).await;
        let strategy = Strategy::new(StrategyKind::Naive, ctx);
        strategy.ingest(corpus(), 1).await.unwrap();

        let chunk_text = "# Query\n\nAsk a question and read the ranked context.";
        let result = strategy
            .query(&QueryRequest::new(chunk_text, 2))
            .await
            .unwrap();
        assert_eq!(result.strategy_name, "naive");
        assert!(result.context_items.len() <= 2);
        assert_eq!(result.context_items[0].text, chunk_text);
        assert!((result.context_items[0].score - 1.0).abs() < 1e-5);
        assert_eq!(result.context_items[0].provenance.origin, "guide/query.md");
        assert_eq!(result.context_items[0].provenance.heading_path, vec!["Query"]);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_isolated_and_retried_later() {
        let fake = FakeBackend::new().failing_on("restart");
        let (_tmp, store, ctx) = context(fake).await;
        let strategy = Strategy::new(StrategyKind::Naive, ctx.clone());

        let summary = strategy.ingest(corpus(), 3).await.unwrap();
        assert_eq!((summary.created, summary.failed), (2, 1));
        assert_eq!(summary.failures[0].origin, "guide/install.md");
        assert_eq!(summary.failures[0].kind, "embedding_failed");
        assert_eq!(store.stats("naive").await.unwrap().failed_documents, 1);

        // A failed record never covers its content, so the next run tries again
        let healthy = StrategyContext {
            gateway: Arc::new(ProviderGateway::fake(FakeBackend::new())),
            ..ctx
        };
        let summary = Strategy::new(StrategyKind::Naive, healthy)
            .ingest(corpus(), 3)
            .await
            .unwrap();
        assert_eq!((summary.created, summary.skipped, summary.failed), (1, 2, 0));
    }

    #[tokio::test]
    async fn test_empty_document_fails_as_chunk_invalid() {
        let (_tmp, _store, ctx) = context(FakeBackend::new()).await;
        let strategy = Strategy::new(StrategyKind::Naive, ctx);
        let outcome = strategy
            .ingest_document(&markdown("blank.md", "   \n"))
            .await
            .unwrap();
        match outcome {
            DocumentOutcome::Failed(failure) => assert_eq!(failure.kind, "chunk_invalid"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_ingestion_of_distinct_and_same_origins() {
        let (_tmp, store, ctx) = context(FakeBackend::new()).await;
        let strategy = Arc::new(Strategy::new(StrategyKind::Naive, ctx));

        let a = markdown("a.md", "# A\n\nAlpha content about installers.");
        let b = markdown("b.md", "# B\n\nBeta content about providers.");
        let (ra, rb) = tokio::join!(strategy.ingest_document(&a), strategy.ingest_document(&b));
        assert_eq!(ra.unwrap(), DocumentOutcome::Created);
        assert_eq!(rb.unwrap(), DocumentOutcome::Created);

        let v1 = markdown("c.md", "# C\n\nFirst version of c.");
        let v2 = markdown("c.md", "# C\n\nSecond version of c, with more words in it.");
        let (r1, r2) = tokio::join!(strategy.ingest_document(&v1), strategy.ingest_document(&v2));
        r1.unwrap();
        r2.unwrap();

        let record = store.lookup("c.md", "naive").await.unwrap().unwrap();
        let winner = if record.content_hash == v1.content_hash { &v1 } else { &v2 };
        let result = strategy
            .query(&QueryRequest::new(winner.raw_content.clone(), 10))
            .await
            .unwrap();
        let c_items: Vec<_> = result
            .context_items
            .iter()
            .filter(|item| item.provenance.origin == "c.md")
            .collect();
        assert_eq!(c_items.len(), 1);
        assert_eq!(c_items[0].text, winner.raw_content);
        assert_eq!(store.stats("naive").await.unwrap().chunks, 3);
    }

    #[tokio::test]
    async fn test_query_rejects_empty_question() {
        let (_tmp, _store, ctx) = context(FakeBackend::new()).await;
        let strategy = Strategy::new(StrategyKind::Naive, ctx);
        let err = strategy.query(&QueryRequest::new("  ", 3)).await.unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }
}
