//! SQLite schema definition

/// SQL schema for the working database
pub const SCHEMA_SQL: &str = r#"
-- Chunks: text units kept per strategy so queries can return them verbatim
CREATE TABLE IF NOT EXISTS chunks (
    strategy TEXT NOT NULL,
    chunk_id TEXT NOT NULL,
    origin TEXT NOT NULL,
    source_id TEXT NOT NULL,
    sequence_index INTEGER NOT NULL,
    chunk_text TEXT NOT NULL,
    token_estimate INTEGER NOT NULL,
    heading_path_json TEXT NOT NULL,
    view_url TEXT,
    PRIMARY KEY (strategy, chunk_id)
);

-- Embeddings: one vector per (chunk, model), little-endian f32 blob
CREATE TABLE IF NOT EXISTS embeddings (
    strategy TEXT NOT NULL,
    chunk_id TEXT NOT NULL,
    model TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    vector BLOB NOT NULL,
    PRIMARY KEY (strategy, chunk_id, model)
);

-- Vector length is fixed per model once the first vector lands
CREATE TABLE IF NOT EXISTS vector_dimensions (
    model TEXT PRIMARY KEY,
    dimension INTEGER NOT NULL
);

-- Graph entities: folded view over every origin that derived them
CREATE TABLE IF NOT EXISTS graph_entities (
    strategy TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    label TEXT NOT NULL,
    name TEXT NOT NULL,
    norm_name TEXT NOT NULL,
    properties_json TEXT NOT NULL,
    PRIMARY KEY (strategy, entity_id)
);

-- Per-origin contributions; an entity lives while any row references it
CREATE TABLE IF NOT EXISTS graph_entity_sources (
    strategy TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    origin TEXT NOT NULL,
    label TEXT NOT NULL,
    name TEXT NOT NULL,
    properties_json TEXT NOT NULL,
    PRIMARY KEY (strategy, entity_id, origin)
);

CREATE TABLE IF NOT EXISTS graph_relations (
    strategy TEXT NOT NULL,
    relation_id TEXT NOT NULL,
    origin TEXT NOT NULL,
    source_entity_id TEXT NOT NULL,
    target_entity_id TEXT NOT NULL,
    relation_type TEXT NOT NULL,
    temporal INTEGER NOT NULL DEFAULT 0,
    valid_from TEXT,
    valid_to TEXT,
    properties_json TEXT NOT NULL,
    chunk_id TEXT,
    PRIMARY KEY (strategy, relation_id)
);

-- Entity to chunk provenance links
CREATE TABLE IF NOT EXISTS graph_mentions (
    strategy TEXT NOT NULL,
    origin TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    chunk_id TEXT NOT NULL,
    PRIMARY KEY (strategy, origin, entity_id, chunk_id)
);

-- Idempotency ledger: last ingested hash per (origin, strategy)
CREATE TABLE IF NOT EXISTS ingestion_records (
    origin TEXT NOT NULL,
    strategy TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    provider_model_id TEXT NOT NULL,
    ingested_at TEXT NOT NULL,
    status TEXT NOT NULL,
    PRIMARY KEY (origin, strategy)
);

-- Ingestion runs: tracking history
CREATE TABLE IF NOT EXISTS ingestion_runs (
    id TEXT PRIMARY KEY,
    agent TEXT NOT NULL,
    strategy TEXT NOT NULL,
    sources TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    created INTEGER DEFAULT 0,
    updated INTEGER DEFAULT 0,
    skipped INTEGER DEFAULT 0,
    failed INTEGER DEFAULT 0,
    errors_json TEXT
);

-- Indexes for common queries
CREATE INDEX IF NOT EXISTS idx_chunks_origin ON chunks(strategy, origin);
CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(strategy, model);
CREATE INDEX IF NOT EXISTS idx_entity_sources_origin ON graph_entity_sources(strategy, origin);
CREATE INDEX IF NOT EXISTS idx_relations_origin ON graph_relations(strategy, origin);
CREATE INDEX IF NOT EXISTS idx_relations_source ON graph_relations(strategy, source_entity_id);
CREATE INDEX IF NOT EXISTS idx_relations_target ON graph_relations(strategy, target_entity_id);
CREATE INDEX IF NOT EXISTS idx_runs_started ON ingestion_runs(started_at);
"#;
