//! SQLite adapter: vector store, graph store and ingestion ledger in one file
//!
//! Writers are serialized through `write_lock`. A document's graph, vectors
//! and ledger record commit in a single transaction. WAL mode lets readers
//! proceed while a write is open and they only ever see committed state.

use super::{
    contains_phrase, GraphStore, IngestionLedger, OriginState, OriginWriter, ScoredChunk,
    Traversal, VectorStore, SCHEMA_SQL,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{
    normalize_name, Chunk, EmbeddingVector, GraphEntity, GraphFragment, GraphRelation,
    IngestionRecord, IngestionRun, Mention, ValidityInterval,
};
use crate::provider::cosine_similarity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::FromRow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Per-strategy totals for the status command
#[derive(Debug, Clone, Serialize)]
pub struct StrategyStats {
    pub strategy: String,
    pub documents: i64,
    pub failed_documents: i64,
    pub chunks: i64,
    pub vectors: i64,
    pub entities: i64,
    pub relations: i64,
    pub last_run: Option<IngestionRun>,
}

#[derive(Debug, FromRow)]
struct ChunkRow {
    chunk_id: String,
    origin: String,
    source_id: String,
    sequence_index: i64,
    chunk_text: String,
    token_estimate: i64,
    heading_path_json: String,
    view_url: Option<String>,
}

impl ChunkRow {
    fn into_chunk(self) -> Chunk {
        Chunk {
            chunk_id: self.chunk_id,
            source_id: self.source_id,
            origin: self.origin,
            sequence_index: self.sequence_index as usize,
            text: self.chunk_text,
            token_estimate: self.token_estimate as usize,
            heading_path: serde_json::from_str(&self.heading_path_json).unwrap_or_default(),
            view_url: self.view_url,
        }
    }
}

#[derive(Debug, FromRow)]
struct VectorRow {
    #[sqlx(flatten)]
    chunk: ChunkRow,
    vector: Vec<u8>,
}

#[derive(Debug, FromRow)]
struct EntityRow {
    entity_id: String,
    label: String,
    name: String,
    properties_json: String,
    origins: Option<String>,
}

impl EntityRow {
    fn into_entity(self) -> GraphEntity {
        let mut origins: Vec<String> = self
            .origins
            .map(|o| o.split('\n').map(str::to_string).collect())
            .unwrap_or_default();
        origins.sort();
        GraphEntity {
            entity_id: self.entity_id,
            label: self.label,
            name: self.name,
            properties: serde_json::from_str(&self.properties_json).unwrap_or_default(),
            origins,
        }
    }
}

#[derive(Debug, FromRow)]
struct RelationRow {
    relation_id: String,
    origin: String,
    source_entity_id: String,
    target_entity_id: String,
    relation_type: String,
    temporal: i64,
    valid_from: Option<String>,
    valid_to: Option<String>,
    properties_json: String,
    chunk_id: Option<String>,
}

impl RelationRow {
    fn into_relation(self) -> Result<GraphRelation> {
        let validity = if self.temporal != 0 {
            Some(ValidityInterval {
                start: self.valid_from.as_deref().map(parse_instant).transpose()?,
                end: self.valid_to.as_deref().map(parse_instant).transpose()?,
            })
        } else {
            None
        };
        Ok(GraphRelation {
            relation_id: self.relation_id,
            source_entity_id: self.source_entity_id,
            target_entity_id: self.target_entity_id,
            relation_type: self.relation_type,
            validity,
            properties: serde_json::from_str(&self.properties_json).unwrap_or_default(),
            origin: self.origin,
            chunk_id: self.chunk_id,
        })
    }
}

#[derive(Debug, FromRow)]
struct RecordRow {
    origin: String,
    strategy: String,
    content_hash: String,
    provider_model_id: String,
    ingested_at: String,
    status: String,
}

#[derive(Debug, FromRow)]
struct SourceRow {
    label: String,
    name: String,
    properties_json: String,
}

pub(crate) fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid stored timestamp '{}': {}", value, e)))
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

const CHUNK_COLUMNS: &str = "c.chunk_id, c.origin, c.source_id, c.sequence_index, c.chunk_text, \
     c.token_estimate, c.heading_path_json, c.view_url";

const ENTITY_SELECT: &str = r#"
    SELECT e.entity_id, e.label, e.name, e.properties_json,
        (SELECT group_concat(s.origin, char(10)) FROM graph_entity_sources s
         WHERE s.strategy = e.strategy AND s.entity_id = e.entity_id) AS origins
    FROM graph_entities e
"#;

const RELATION_COLUMNS: &str = "relation_id, origin, source_entity_id, target_entity_id, \
     relation_type, temporal, valid_from, valid_to, properties_json, chunk_id";

/// Relation `r` holds at the bound instant; binds the instant three times.
/// Timestamps are stored as UTC RFC 3339, so text order is time order.
const VALID_AT_FILTER: &str = "(? IS NULL OR ((r.valid_from IS NULL OR r.valid_from <= ?) \
     AND (r.valid_to IS NULL OR r.valid_to > ?)))";

/// Recompute an entity's folded row from the origins still referencing it
async fn refold_entity(conn: &mut SqliteConnection, strategy: &str, entity_id: &str) -> Result<()> {
    let sources = sqlx::query_as::<_, SourceRow>(
        "SELECT label, name, properties_json FROM graph_entity_sources \
         WHERE strategy = ? AND entity_id = ? ORDER BY origin",
    )
    .bind(strategy)
    .bind(entity_id)
    .fetch_all(&mut *conn)
    .await?;

    if sources.is_empty() {
        sqlx::query("DELETE FROM graph_entities WHERE strategy = ? AND entity_id = ?")
            .bind(strategy)
            .bind(entity_id)
            .execute(&mut *conn)
            .await?;
        return Ok(());
    }

    let label = sources
        .iter()
        .map(|s| s.label.as_str())
        .find(|l| *l != "Entity")
        .unwrap_or("Entity")
        .to_string();
    let name = sources[0].name.clone();
    let mut properties: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for source in &sources {
        let props: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&source.properties_json).unwrap_or_default();
        properties.extend(props);
    }

    sqlx::query(
        r#"
        INSERT INTO graph_entities (strategy, entity_id, label, name, norm_name, properties_json)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(strategy, entity_id) DO UPDATE SET
            label = excluded.label,
            name = excluded.name,
            norm_name = excluded.norm_name,
            properties_json = excluded.properties_json
        "#,
    )
    .bind(strategy)
    .bind(entity_id)
    .bind(&label)
    .bind(&name)
    .bind(normalize_name(&name))
    .bind(serde_json::to_string(&properties)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Check vectors against the chunks they belong to; one dimension per model
fn vector_dimensions<'a>(
    origin: &str,
    chunks: &[Chunk],
    vectors: &'a [EmbeddingVector],
) -> Result<BTreeMap<&'a str, usize>> {
    let keep: HashSet<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
    let mut dimensions: BTreeMap<&str, usize> = BTreeMap::new();
    for vector in vectors {
        if !keep.contains(vector.chunk_id.as_str()) {
            return Err(Error::Other(format!(
                "vector for chunk {} has no chunk in origin {}",
                vector.chunk_id, origin
            )));
        }
        let dim = *dimensions
            .entry(vector.provider_model_id.as_str())
            .or_insert(vector.vector.len());
        if dim != vector.vector.len() || dim == 0 {
            return Err(Error::Other(format!(
                "inconsistent vector lengths for model {}",
                vector.provider_model_id
            )));
        }
    }
    Ok(dimensions)
}

/// Retire the origin's chunks and these models' vectors, then write the new set.
/// Returns how many chunks were retired.
async fn write_vectors(
    conn: &mut SqliteConnection,
    strategy: &str,
    origin: &str,
    chunks: &[Chunk],
    vectors: &[EmbeddingVector],
) -> Result<usize> {
    let dimensions = vector_dimensions(origin, chunks, vectors)?;
    for (model, dim) in &dimensions {
        let stored: Option<i64> =
            sqlx::query_scalar("SELECT dimension FROM vector_dimensions WHERE model = ?")
                .bind(*model)
                .fetch_optional(&mut *conn)
                .await?;
        match stored {
            Some(stored) if stored as usize != *dim => {
                return Err(Error::Other(format!(
                    "model {} produced {}-dimensional vectors but the store holds {}",
                    model, dim, stored
                )));
            }
            Some(_) => {}
            None => {
                sqlx::query("INSERT INTO vector_dimensions (model, dimension) VALUES (?, ?)")
                    .bind(*model)
                    .bind(*dim as i64)
                    .execute(&mut *conn)
                    .await?;
            }
        }
    }

    // Retire chunks that are not part of the new version
    let keep: HashSet<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
    let existing: Vec<String> =
        sqlx::query_scalar("SELECT chunk_id FROM chunks WHERE strategy = ? AND origin = ?")
            .bind(strategy)
            .bind(origin)
            .fetch_all(&mut *conn)
            .await?;
    let mut retired = 0;
    for chunk_id in existing.iter().filter(|id| !keep.contains(id.as_str())) {
        sqlx::query("DELETE FROM embeddings WHERE strategy = ? AND chunk_id = ?")
            .bind(strategy)
            .bind(chunk_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE strategy = ? AND chunk_id = ?")
            .bind(strategy)
            .bind(chunk_id)
            .execute(&mut *conn)
            .await?;
        retired += 1;
    }

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO chunks (strategy, chunk_id, origin, source_id, sequence_index, chunk_text, token_estimate, heading_path_json, view_url)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(strategy)
        .bind(&chunk.chunk_id)
        .bind(origin)
        .bind(&chunk.source_id)
        .bind(chunk.sequence_index as i64)
        .bind(&chunk.text)
        .bind(chunk.token_estimate as i64)
        .bind(serde_json::to_string(&chunk.heading_path)?)
        .bind(&chunk.view_url)
        .execute(&mut *conn)
        .await?;
    }

    // Vectors from other models on the kept chunks survive
    for model in dimensions.keys() {
        sqlx::query(
            "DELETE FROM embeddings WHERE strategy = ? AND model = ? \
             AND chunk_id IN (SELECT chunk_id FROM chunks WHERE strategy = ? AND origin = ?)",
        )
        .bind(strategy)
        .bind(*model)
        .bind(strategy)
        .bind(origin)
        .execute(&mut *conn)
        .await?;
    }

    for vector in vectors {
        sqlx::query(
            "INSERT INTO embeddings (strategy, chunk_id, model, dimension, vector) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(strategy)
        .bind(&vector.chunk_id)
        .bind(&vector.provider_model_id)
        .bind(vector.vector.len() as i64)
        .bind(encode_vector(&vector.vector))
        .execute(&mut *conn)
        .await?;
    }
    Ok(retired)
}

/// Retire the origin's relations, mentions and entity references, then write `fragment`
async fn write_graph(
    conn: &mut SqliteConnection,
    strategy: &str,
    origin: &str,
    fragment: &GraphFragment,
) -> Result<()> {
    let previous: Vec<String> = sqlx::query_scalar(
        "SELECT entity_id FROM graph_entity_sources WHERE strategy = ? AND origin = ?",
    )
    .bind(strategy)
    .bind(origin)
    .fetch_all(&mut *conn)
    .await?;

    for table in ["graph_relations", "graph_mentions", "graph_entity_sources"] {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE strategy = ? AND origin = ?",
            table
        ))
        .bind(strategy)
        .bind(origin)
        .execute(&mut *conn)
        .await?;
    }

    for entity in &fragment.entities {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO graph_entity_sources (strategy, entity_id, origin, label, name, properties_json)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(strategy)
        .bind(&entity.entity_id)
        .bind(origin)
        .bind(&entity.label)
        .bind(&entity.name)
        .bind(serde_json::to_string(&entity.properties)?)
        .execute(&mut *conn)
        .await?;
    }

    for relation in &fragment.relations {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO graph_relations (strategy, {}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            RELATION_COLUMNS
        ))
        .bind(strategy)
        .bind(&relation.relation_id)
        .bind(origin)
        .bind(&relation.source_entity_id)
        .bind(&relation.target_entity_id)
        .bind(&relation.relation_type)
        .bind(relation.validity.is_some() as i64)
        .bind(relation.validity.and_then(|v| v.start).map(|s| s.to_rfc3339()))
        .bind(relation.validity.and_then(|v| v.end).map(|e| e.to_rfc3339()))
        .bind(serde_json::to_string(&relation.properties)?)
        .bind(&relation.chunk_id)
        .execute(&mut *conn)
        .await?;
    }

    for mention in &fragment.mentions {
        sqlx::query(
            "INSERT OR IGNORE INTO graph_mentions (strategy, origin, entity_id, chunk_id) VALUES (?, ?, ?, ?)",
        )
        .bind(strategy)
        .bind(origin)
        .bind(&mention.entity_id)
        .bind(&mention.chunk_id)
        .execute(&mut *conn)
        .await?;
    }

    let touched: BTreeSet<&str> = previous
        .iter()
        .map(String::as_str)
        .chain(fragment.entities.iter().map(|e| e.entity_id.as_str()))
        .collect();
    for entity_id in &touched {
        refold_entity(conn, strategy, entity_id).await?;
    }
    Ok(())
}

async fn write_record(conn: &mut SqliteConnection, record: &IngestionRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ingestion_records (origin, strategy, content_hash, provider_model_id, ingested_at, status)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(origin, strategy) DO UPDATE SET
            content_hash = excluded.content_hash,
            provider_model_id = excluded.provider_model_id,
            ingested_at = excluded.ingested_at,
            status = excluded.status
        "#,
    )
    .bind(&record.origin)
    .bind(&record.strategy_name)
    .bind(&record.content_hash)
    .bind(&record.provider_model_id)
    .bind(&record.ingested_at)
    .bind(record.status.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// SQLite-backed store handle
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Connect to the working database named by the configuration
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::open(&config.paths.db_file).await
    }

    /// Open (creating if needed) a database file
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| Error::StoreUnreachable(format!("{}: {}", db_path.display(), e)))?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Totals for one strategy
    pub async fn stats(&self, strategy: &str) -> Result<StrategyStats> {
        let documents = self
            .count_rows(
                "SELECT COUNT(*) FROM ingestion_records WHERE strategy = ? AND status = 'completed'",
                strategy,
            )
            .await?;
        let failed_documents = self
            .count_rows(
                "SELECT COUNT(*) FROM ingestion_records WHERE strategy = ? AND status = 'failed'",
                strategy,
            )
            .await?;
        let chunks = self
            .count_rows("SELECT COUNT(*) FROM chunks WHERE strategy = ?", strategy)
            .await?;
        let vectors = self
            .count_rows("SELECT COUNT(*) FROM embeddings WHERE strategy = ?", strategy)
            .await?;
        let entities = self
            .count_rows("SELECT COUNT(*) FROM graph_entities WHERE strategy = ?", strategy)
            .await?;
        let relations = self
            .count_rows("SELECT COUNT(*) FROM graph_relations WHERE strategy = ?", strategy)
            .await?;

        let last_run = sqlx::query_as::<_, IngestionRun>(
            "SELECT * FROM ingestion_runs WHERE strategy = ? ORDER BY started_at DESC LIMIT 1",
        )
        .bind(strategy)
        .fetch_optional(&self.pool)
        .await?;

        Ok(StrategyStats {
            strategy: strategy.to_string(),
            documents,
            failed_documents,
            chunks,
            vectors,
            entities,
            relations,
            last_run,
        })
    }

    async fn count_rows(&self, sql: &str, strategy: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(sql)
            .bind(strategy)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Most recent ingestion runs, newest first
    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<IngestionRun>> {
        let runs = sqlx::query_as::<_, IngestionRun>(
            "SELECT * FROM ingestion_runs ORDER BY started_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    async fn entities_by_ids(&self, strategy: &str, ids: &[String]) -> Result<Vec<GraphEntity>> {
        let sql = format!(
            "{} WHERE e.strategy = ? AND e.entity_id IN (SELECT value FROM json_each(?)) ORDER BY e.name",
            ENTITY_SELECT
        );
        let rows = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(strategy)
            .bind(serde_json::to_string(ids)?)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EntityRow::into_entity).collect())
    }
}

#[async_trait]
impl OriginWriter for SqliteStore {
    async fn commit_origin(&self, strategy: &str, origin: &str, state: &OriginState<'_>) -> Result<()> {
        if let Some(fragment) = state.fragment {
            fragment.validate()?;
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        if let Some(fragment) = state.fragment {
            write_graph(&mut tx, strategy, origin, fragment).await?;
        }
        let retired = write_vectors(&mut tx, strategy, origin, state.chunks, state.vectors).await?;
        write_record(&mut tx, state.record).await?;
        tx.commit().await?;

        debug!(
            strategy,
            origin,
            chunks = state.chunks.len(),
            vectors = state.vectors.len(),
            relations = state.fragment.map_or(0, |f| f.relations.len()),
            retired,
            "Committed origin"
        );
        Ok(())
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn search(
        &self,
        strategy: &str,
        model: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let stored: Option<i64> =
            sqlx::query_scalar("SELECT dimension FROM vector_dimensions WHERE model = ?")
                .bind(model)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(dim) = stored {
            if dim as usize != query.len() {
                return Err(Error::Query(format!(
                    "query vector has {} dimensions, store holds {} for {}",
                    query.len(),
                    dim,
                    model
                )));
            }
        }

        let sql = format!(
            "SELECT {}, e.vector FROM embeddings e \
             JOIN chunks c ON c.strategy = e.strategy AND c.chunk_id = e.chunk_id \
             WHERE e.strategy = ? AND e.model = ?",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query_as::<_, VectorRow>(&sql)
            .bind(strategy)
            .bind(model)
            .fetch_all(&self.pool)
            .await?;

        let mut scored: Vec<ScoredChunk> = rows
            .into_iter()
            .map(|row| {
                let score = cosine_similarity(query, &decode_vector(&row.vector));
                ScoredChunk {
                    chunk: row.chunk.into_chunk(),
                    score,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.chunk.sequence_index.cmp(&b.chunk.sequence_index))
                .then_with(|| a.chunk.origin.cmp(&b.chunk.origin))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn chunks(&self, strategy: &str, chunk_ids: &[String]) -> Result<Vec<Chunk>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM chunks c WHERE c.strategy = ? AND c.chunk_id IN (SELECT value FROM json_each(?))",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query_as::<_, ChunkRow>(&sql)
            .bind(strategy)
            .bind(serde_json::to_string(chunk_ids)?)
            .fetch_all(&self.pool)
            .await?;

        let mut by_id: HashMap<String, Chunk> = rows
            .into_iter()
            .map(|row| (row.chunk_id.clone(), row.into_chunk()))
            .collect();
        Ok(chunk_ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn replace_origin(
        &self,
        strategy: &str,
        origin: &str,
        fragment: &GraphFragment,
    ) -> Result<()> {
        fragment.validate()?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        write_graph(&mut tx, strategy, origin, fragment).await?;
        tx.commit().await?;
        debug!(
            strategy,
            origin,
            entities = fragment.entities.len(),
            relations = fragment.relations.len(),
            "Replaced origin graph"
        );
        Ok(())
    }

    async fn origin_fragment(&self, strategy: &str, origin: &str) -> Result<GraphFragment> {
        let entities: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT entity_id, label, name, properties_json FROM graph_entity_sources \
             WHERE strategy = ? AND origin = ? ORDER BY entity_id",
        )
        .bind(strategy)
        .bind(origin)
        .fetch_all(&self.pool)
        .await?;

        let relations = sqlx::query_as::<_, RelationRow>(&format!(
            "SELECT {} FROM graph_relations WHERE strategy = ? AND origin = ? ORDER BY relation_id",
            RELATION_COLUMNS
        ))
        .bind(strategy)
        .bind(origin)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(RelationRow::into_relation)
        .collect::<Result<Vec<_>>>()?;

        let mentions: Vec<(String, String)> = sqlx::query_as(
            "SELECT entity_id, chunk_id FROM graph_mentions WHERE strategy = ? AND origin = ? \
             ORDER BY entity_id, chunk_id",
        )
        .bind(strategy)
        .bind(origin)
        .fetch_all(&self.pool)
        .await?;

        Ok(GraphFragment {
            entities: entities
                .into_iter()
                .map(|(entity_id, label, name, properties_json)| {
                    Ok(GraphEntity {
                        entity_id,
                        label,
                        name,
                        properties: serde_json::from_str(&properties_json)?,
                        origins: Vec::new(),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            relations,
            mentions: mentions
                .into_iter()
                .map(|(entity_id, chunk_id)| Mention { entity_id, chunk_id })
                .collect(),
        })
    }

    async fn match_entities(&self, strategy: &str, text: &str) -> Result<Vec<GraphEntity>> {
        let haystack = normalize_name(text);
        let candidates: Vec<(String, String)> = sqlx::query_as(
            "SELECT entity_id, norm_name FROM graph_entities WHERE strategy = ?",
        )
        .bind(strategy)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<String> = candidates
            .into_iter()
            .filter(|(_, name)| contains_phrase(&haystack, name))
            .map(|(id, _)| id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.entities_by_ids(strategy, &ids).await
    }

    async fn traverse(
        &self,
        strategy: &str,
        seeds: &[String],
        max_hops: usize,
        valid_at: Option<DateTime<Utc>>,
    ) -> Result<Traversal> {
        if seeds.is_empty() {
            return Ok(Traversal::default());
        }
        let valid_at = valid_at.map(|instant| instant.to_rfc3339());

        let reached: Vec<(String, i64)> = sqlx::query_as(&format!(
            r#"
            WITH RECURSIVE walk(entity_id, hops) AS (
                SELECT value, 0 FROM json_each(?)
                UNION
                SELECT CASE WHEN r.source_entity_id = w.entity_id
                            THEN r.target_entity_id ELSE r.source_entity_id END,
                       w.hops + 1
                FROM walk w
                JOIN graph_relations r
                  ON r.strategy = ?
                 AND (r.source_entity_id = w.entity_id OR r.target_entity_id = w.entity_id)
                 AND {}
                WHERE w.hops < ?
            )
            SELECT entity_id, MIN(hops) FROM walk GROUP BY entity_id
            "#,
            VALID_AT_FILTER
        ))
        .bind(serde_json::to_string(seeds)?)
        .bind(strategy)
        .bind(valid_at.as_deref())
        .bind(valid_at.as_deref())
        .bind(valid_at.as_deref())
        .bind(max_hops as i64)
        .fetch_all(&self.pool)
        .await?;

        let hops: HashMap<String, u32> = reached
            .into_iter()
            .map(|(id, h)| (id, h as u32))
            .collect();
        let ids: Vec<String> = hops.keys().cloned().collect();

        let mut entities: Vec<(GraphEntity, u32)> = self
            .entities_by_ids(strategy, &ids)
            .await?
            .into_iter()
            .map(|e| {
                let h = hops.get(&e.entity_id).copied().unwrap_or(0);
                (e, h)
            })
            .collect();
        entities.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.name.cmp(&b.0.name)));

        let ids_json = serde_json::to_string(&ids)?;
        let rows = sqlx::query_as::<_, RelationRow>(&format!(
            "SELECT {} FROM graph_relations r WHERE r.strategy = ? \
             AND r.source_entity_id IN (SELECT value FROM json_each(?)) \
             AND r.target_entity_id IN (SELECT value FROM json_each(?)) \
             AND {} \
             ORDER BY r.relation_type, r.relation_id",
            RELATION_COLUMNS, VALID_AT_FILTER
        ))
        .bind(strategy)
        .bind(&ids_json)
        .bind(&ids_json)
        .bind(valid_at.as_deref())
        .bind(valid_at.as_deref())
        .bind(valid_at.as_deref())
        .fetch_all(&self.pool)
        .await?;
        let relations = rows
            .into_iter()
            .map(RelationRow::into_relation)
            .collect::<Result<Vec<_>>>()?;

        Ok(Traversal {
            entities,
            relations,
        })
    }

    async fn find_entities(
        &self,
        strategy: &str,
        label: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<GraphEntity>> {
        let norm = name.map(normalize_name);
        let sql = format!(
            "{} WHERE e.strategy = ? AND (? IS NULL OR e.label = ?) AND (? IS NULL OR e.norm_name = ?) ORDER BY e.name",
            ENTITY_SELECT
        );
        let rows = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(strategy)
            .bind(label)
            .bind(label)
            .bind(norm.as_deref())
            .bind(norm.as_deref())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EntityRow::into_entity).collect())
    }

    async fn relations(&self, strategy: &str, entity_id: &str) -> Result<Vec<GraphRelation>> {
        let rows = sqlx::query_as::<_, RelationRow>(&format!(
            "SELECT {} FROM graph_relations WHERE strategy = ? \
             AND (source_entity_id = ? OR target_entity_id = ?) \
             ORDER BY relation_type, relation_id",
            RELATION_COLUMNS
        ))
        .bind(strategy)
        .bind(entity_id)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RelationRow::into_relation).collect()
    }

    async fn mentions(&self, strategy: &str, entity_ids: &[String]) -> Result<Vec<Mention>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT DISTINCT entity_id, chunk_id FROM graph_mentions WHERE strategy = ? \
             AND entity_id IN (SELECT value FROM json_each(?)) ORDER BY entity_id, chunk_id",
        )
        .bind(strategy)
        .bind(serde_json::to_string(entity_ids)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(entity_id, chunk_id)| Mention {
                entity_id,
                chunk_id,
            })
            .collect())
    }
}

#[async_trait]
impl IngestionLedger for SqliteStore {
    async fn lookup(&self, origin: &str, strategy: &str) -> Result<Option<IngestionRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT * FROM ingestion_records WHERE origin = ? AND strategy = ?",
        )
        .bind(origin)
        .bind(strategy)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(IngestionRecord {
            status: row.status.parse()?,
            origin: row.origin,
            content_hash: row.content_hash,
            strategy_name: row.strategy,
            provider_model_id: row.provider_model_id,
            ingested_at: row.ingested_at,
        }))
    }

    async fn record(&self, record: &IngestionRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        write_record(&mut conn, record).await
    }

    async fn save_run(&self, run: &IngestionRun) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO ingestion_runs (id, agent, strategy, sources, started_at, completed_at, status, created, updated, skipped, failed, errors_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.agent)
        .bind(&run.strategy)
        .bind(&run.sources)
        .bind(&run.started_at)
        .bind(&run.completed_at)
        .bind(&run.status)
        .bind(run.created)
        .bind(run.updated)
        .bind(run.skipped)
        .bind(run.failed)
        .bind(&run.errors_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
