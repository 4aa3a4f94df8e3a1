//! Store adapters
//!
//! Strategies read through three narrow capability surfaces:
//! - [`VectorStore`]: chunk text plus embedding vectors, cosine search
//! - [`GraphStore`]: entities, relations and mentions, bounded traversal
//! - [`IngestionLedger`]: the idempotency record and run history
//!
//! and write through [`OriginWriter`], which retires what an origin
//! contributed before and writes its new graph, vectors and ledger record as
//! one unit, so readers never see an origin half-retired. The SQLite adapter
//! implements all of them; the Neo4j adapter is an alternative graph backend.

mod locks;
mod neo4j;
mod schema;
mod sqlite;

pub use locks::OriginLocks;
pub use neo4j::Neo4jGraphStore;
pub use schema::SCHEMA_SQL;
pub use sqlite::{SqliteStore, StrategyStats};

use crate::config::Config;
use crate::error::Result;
use crate::models::{
    Chunk, EmbeddingVector, GraphEntity, GraphFragment, GraphRelation, IngestionRecord,
    IngestionRun, Mention,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// A stored chunk with its similarity to a query vector
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Entities reachable from a seed set, with their hop distance
#[derive(Debug, Clone, Default)]
pub struct Traversal {
    pub entities: Vec<(GraphEntity, u32)>,
    pub relations: Vec<GraphRelation>,
}

impl Traversal {
    pub fn hops_of(&self, entity_id: &str) -> Option<u32> {
        self.entities
            .iter()
            .find(|(e, _)| e.entity_id == entity_id)
            .map(|(_, hops)| *hops)
    }

    pub fn entity(&self, entity_id: &str) -> Option<&GraphEntity> {
        self.entities
            .iter()
            .map(|(e, _)| e)
            .find(|e| e.entity_id == entity_id)
    }
}

/// Whole-word occurrence of `needle` in `haystack`; both already normalized
pub(crate) fn contains_phrase(haystack: &str, needle: &str) -> bool {
    if needle.chars().count() < 3 {
        return false;
    }
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// Everything one document contributes to a strategy, with the ledger record covering it
#[derive(Debug, Clone, Copy)]
pub struct OriginState<'a> {
    pub chunks: &'a [Chunk],
    pub vectors: &'a [EmbeddingVector],
    /// `None` for strategies that keep no graph
    pub fragment: Option<&'a GraphFragment>,
    pub record: &'a IngestionRecord,
}

#[async_trait]
pub trait OriginWriter: Send + Sync {
    /// Replace everything `origin` contributed to `strategy` with `state`.
    ///
    /// On error none of `state` is visible and the previous state stands.
    async fn commit_origin(&self, strategy: &str, origin: &str, state: &OriginState<'_>)
        -> Result<()>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// The `k` stored chunks most similar to `query`, best first
    async fn search(
        &self,
        strategy: &str,
        model: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Look up chunks by id, in the order given; unknown ids are skipped
    async fn chunks(&self, strategy: &str, chunk_ids: &[String]) -> Result<Vec<Chunk>>;
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Retire the origin's relations, mentions and entity references, then write `fragment`
    async fn replace_origin(
        &self,
        strategy: &str,
        origin: &str,
        fragment: &GraphFragment,
    ) -> Result<()>;

    /// What `origin` currently contributes, in a form `replace_origin` accepts back
    async fn origin_fragment(&self, strategy: &str, origin: &str) -> Result<GraphFragment>;

    /// Entities whose name appears in `text` as a whole word or phrase
    async fn match_entities(&self, strategy: &str, text: &str) -> Result<Vec<GraphEntity>>;

    /// Breadth-first walk from `seeds`, at most `max_hops` relations deep.
    ///
    /// With `valid_at`, only relations whose validity holds at that instant
    /// are walked or returned; undated relations always hold.
    async fn traverse(
        &self,
        strategy: &str,
        seeds: &[String],
        max_hops: usize,
        valid_at: Option<DateTime<Utc>>,
    ) -> Result<Traversal>;

    /// Entities filtered by label and/or case-insensitive name
    async fn find_entities(
        &self,
        strategy: &str,
        label: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<GraphEntity>>;

    /// Relations touching an entity in either direction
    async fn relations(&self, strategy: &str, entity_id: &str) -> Result<Vec<GraphRelation>>;

    async fn mentions(&self, strategy: &str, entity_ids: &[String]) -> Result<Vec<Mention>>;
}

#[async_trait]
pub trait IngestionLedger: Send + Sync {
    async fn lookup(&self, origin: &str, strategy: &str) -> Result<Option<IngestionRecord>>;

    /// Insert or replace the record for (origin, strategy)
    async fn record(&self, record: &IngestionRecord) -> Result<()>;

    async fn save_run(&self, run: &IngestionRun) -> Result<()>;
}

/// Vectors and ledger in SQLite with the graph in a separate store.
///
/// The graph is replaced first; when the SQLite commit then fails, the
/// origin's previous fragment is written back.
pub struct SplitOriginWriter {
    sqlite: Arc<SqliteStore>,
    graph: Arc<dyn GraphStore>,
}

impl SplitOriginWriter {
    pub fn new(sqlite: Arc<SqliteStore>, graph: Arc<dyn GraphStore>) -> Self {
        Self { sqlite, graph }
    }
}

#[async_trait]
impl OriginWriter for SplitOriginWriter {
    async fn commit_origin(
        &self,
        strategy: &str,
        origin: &str,
        state: &OriginState<'_>,
    ) -> Result<()> {
        let Some(fragment) = state.fragment else {
            return self.sqlite.commit_origin(strategy, origin, state).await;
        };

        let previous = self.graph.origin_fragment(strategy, origin).await?;
        self.graph.replace_origin(strategy, origin, fragment).await?;

        let local = OriginState {
            fragment: None,
            ..*state
        };
        if let Err(e) = self.sqlite.commit_origin(strategy, origin, &local).await {
            warn!(strategy, origin, error = %e, "Local commit failed, restoring previous graph");
            if let Err(restore) = self.graph.replace_origin(strategy, origin, &previous).await {
                warn!(strategy, origin, error = %restore, "Could not restore previous graph");
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Open stores the way the configuration asks for
pub struct Stores {
    pub sqlite: Arc<SqliteStore>,
    pub graph: Arc<dyn GraphStore>,
    pub writer: Arc<dyn OriginWriter>,
}

impl Stores {
    pub async fn open(config: &Config) -> Result<Self> {
        let sqlite = Arc::new(SqliteStore::connect(config).await?);
        sqlite.init_schema().await?;

        let (graph, writer) = if config.store.uses_neo4j() {
            let graph: Arc<dyn GraphStore> = Arc::new(Neo4jGraphStore::new(&config.store)?);
            let writer: Arc<dyn OriginWriter> =
                Arc::new(SplitOriginWriter::new(sqlite.clone(), graph.clone()));
            (graph, writer)
        } else {
            let graph: Arc<dyn GraphStore> = sqlite.clone();
            let writer: Arc<dyn OriginWriter> = sqlite.clone();
            (graph, writer)
        };

        Ok(Self {
            sqlite,
            graph,
            writer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chunk(origin: &str, text: &str) -> Chunk {
        Chunk {
            chunk_id: Chunk::compute_id(origin, "h", 0),
            source_id: "src".to_string(),
            origin: origin.to_string(),
            sequence_index: 0,
            text: text.to_string(),
            token_estimate: 1,
            heading_path: Vec::new(),
            view_url: None,
        }
    }

    fn vector(chunk: &Chunk, values: &[f32]) -> EmbeddingVector {
        EmbeddingVector {
            chunk_id: chunk.chunk_id.clone(),
            vector: values.to_vec(),
            provider_model_id: "fake:m".to_string(),
        }
    }

    fn fragment(origin: &str, person: &str) -> GraphFragment {
        let mut fragment = GraphFragment::default();
        let a = fragment.add_entity(GraphEntity::new("person", "Person", person));
        let b = fragment.add_entity(GraphEntity::new("city", "City", "Salmiya"));
        fragment.add_relation(GraphRelation::new(origin, &a, "RESIDENT_OF", &b, None, None));
        fragment
    }

    #[tokio::test]
    async fn test_split_writer_restores_the_graph_when_sqlite_fails() {
        let server = MockServer::start().await;
        std::env::set_var("RAGWEAVE_TEST_NEO4J_PASSWORD", "secret");
        let results: Vec<Value> = (0..7).map(|_| json!({"columns": [], "data": []})).collect();
        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"results": results, "errors": []})),
            )
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let sqlite = Arc::new(SqliteStore::open(&tmp.path().join("ragweave.db")).await.unwrap());
        sqlite.init_schema().await.unwrap();
        let graph: Arc<dyn GraphStore> = Arc::new(
            Neo4jGraphStore::new(&StoreConfig {
                graph_backend: "neo4j".to_string(),
                neo4j_uri: server.uri(),
                neo4j_user: "neo4j".to_string(),
                neo4j_password_env: "RAGWEAVE_TEST_NEO4J_PASSWORD".to_string(),
                neo4j_database: "neo4j".to_string(),
                timeout_secs: 5,
            })
            .unwrap(),
        );
        let writer = SplitOriginWriter::new(sqlite.clone(), graph);

        let ali = chunk("ali", "Ali lives in Salmiya");
        let vectors = [vector(&ali, &[1.0, 0.0])];
        let graph_ali = fragment("ali", "Ali");
        let record = IngestionRecord::completed("ali", "h", "lr", "fake:m");
        let ok = OriginState {
            chunks: std::slice::from_ref(&ali),
            vectors: &vectors,
            fragment: Some(&graph_ali),
            record: &record,
        };
        writer.commit_origin("lr", "ali", &ok).await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 2);

        // The model's stored dimension is now 2, so a 3-wide vector is refused locally
        let sara = chunk("sara", "Sara lives in Salmiya");
        let vectors = [vector(&sara, &[1.0, 0.0, 0.0])];
        let graph_sara = fragment("sara", "Sara");
        let record = IngestionRecord::completed("sara", "h", "lr", "fake:m");
        let bad = OriginState {
            chunks: std::slice::from_ref(&sara),
            vectors: &vectors,
            fragment: Some(&graph_sara),
            record: &record,
        };
        assert!(writer.commit_origin("lr", "sara", &bad).await.is_err());

        // Read the old fragment, write the new one, write the old one back
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 5);
        let replaced: Value = requests[3].body_json().unwrap();
        assert_eq!(replaced["statements"][4]["parameters"]["entities"].as_array().unwrap().len(), 2);
        let restored: Value = requests[4].body_json().unwrap();
        assert_eq!(restored["statements"][0]["parameters"]["origin"], "sara");
        assert!(restored["statements"][4]["parameters"]["entities"].as_array().unwrap().is_empty());

        assert!(sqlite.lookup("sara", "lr").await.unwrap().is_none());
        assert_eq!(sqlite.stats("lr").await.unwrap().chunks, 1);
    }

    #[test]
    fn test_contains_phrase_respects_word_boundaries() {
        assert!(contains_phrase("who owns villa 12 in salmiya?", "villa 12"));
        assert!(contains_phrase("ali", "ali"));
        assert!(!contains_phrase("alibaba", "ali"));
        assert!(!contains_phrase("kuwaiti law", "kuwait"));
        assert!(!contains_phrase("a b", "a"));
    }
}
