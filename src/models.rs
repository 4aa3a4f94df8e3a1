//! Shared data model for sources, chunks, vectors, graph facts and results

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use uuid::Uuid;

/// Structured record families in the record-backed domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Person,
    Property,
}

impl RecordKind {
    /// Graph label for entities of this kind
    pub fn label(&self) -> &'static str {
        match self {
            RecordKind::Person => "Person",
            RecordKind::Property => "Property",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Person => write!(f, "person"),
            RecordKind::Property => write!(f, "property"),
        }
    }
}

/// What a document's raw content is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentKind {
    Markdown,
    Record {
        kind: RecordKind,
        fields: serde_json::Map<String, serde_json::Value>,
    },
}

/// A fetched document, immutable once produced by the walker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub source_id: String,
    /// Repository + path, or record key. Identity of the document.
    pub origin: String,
    pub title: Option<String>,
    pub raw_content: String,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    /// Provenance display link, never used for fetching
    pub view_url: Option<String>,
    pub kind: ContentKind,
}

/// A bounded span of a document's text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub source_id: String,
    pub origin: String,
    pub sequence_index: usize,
    pub text: String,
    pub token_estimate: usize,
    /// Section titles enclosing this chunk, outermost first
    pub heading_path: Vec<String>,
    pub view_url: Option<String>,
}

impl Chunk {
    /// Stable chunk id for a document version and position
    pub fn compute_id(origin: &str, content_hash: &str, sequence_index: usize) -> String {
        let key = format!("{}\n{}\n{}", origin, content_hash, sequence_index);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
    }

    pub fn provenance(&self) -> Provenance {
        Provenance {
            origin: self.origin.clone(),
            view_url: self.view_url.clone(),
            chunk_id: Some(self.chunk_id.clone()),
            heading_path: self.heading_path.clone(),
            sequence_index: Some(self.sequence_index),
        }
    }
}

/// One vector per (chunk, model)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub provider_model_id: String,
}

/// Half-open validity window `[start, end)`; `None` bounds are open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityInterval {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ValidityInterval {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<Self> {
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(Error::Other(format!(
                    "validity interval starts after it ends ({} > {})",
                    s.to_rfc3339(),
                    e.to_rfc3339()
                )));
            }
        }
        Ok(Self { start, end })
    }

    pub fn starting(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| s <= instant) && self.end.map_or(true, |e| instant < e)
    }

    pub fn is_valid(&self) -> bool {
        match (self.start, self.end) {
            (Some(s), Some(e)) => s <= e,
            _ => true,
        }
    }
}

/// Normalize a display name for identity comparisons
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Deterministic entity id within a namespace (record label, or "entity" for extracted facts)
pub fn entity_id(namespace: &str, name: &str) -> String {
    let key = format!("{}:{}", namespace.to_lowercase(), normalize_name(name));
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

/// A node in the property graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEntity {
    pub entity_id: String,
    pub label: String,
    pub name: String,
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Origins that derived this entity; filled on read
    #[serde(default)]
    pub origins: Vec<String>,
}

impl GraphEntity {
    pub fn new(namespace: &str, label: &str, name: &str) -> Self {
        Self {
            entity_id: entity_id(namespace, name),
            label: label.to_string(),
            name: name.trim().to_string(),
            properties: BTreeMap::new(),
            origins: Vec::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: serde_json::Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }
}

/// A typed edge between two entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelation {
    pub relation_id: String,
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub relation_type: String,
    pub validity: Option<ValidityInterval>,
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Origin that derived this relation
    pub origin: String,
    /// Chunk the relation was extracted from
    pub chunk_id: Option<String>,
}

fn relation_id(
    origin: &str,
    source_entity_id: &str,
    relation_type: &str,
    target_entity_id: &str,
    validity: Option<ValidityInterval>,
    fact: Option<&str>,
) -> String {
    let start = validity
        .and_then(|v| v.start)
        .map(|s| s.to_rfc3339())
        .unwrap_or_default();
    let key = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        origin,
        source_entity_id,
        relation_type,
        target_entity_id,
        start,
        fact.map(normalize_name).unwrap_or_default()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

impl GraphRelation {
    pub fn new(
        origin: &str,
        source_entity_id: &str,
        relation_type: &str,
        target_entity_id: &str,
        validity: Option<ValidityInterval>,
        chunk_id: Option<String>,
    ) -> Self {
        Self {
            relation_id: relation_id(
                origin,
                source_entity_id,
                relation_type,
                target_entity_id,
                validity,
                None,
            ),
            source_entity_id: source_entity_id.to_string(),
            target_entity_id: target_entity_id.to_string(),
            relation_type: relation_type.to_string(),
            validity,
            properties: BTreeMap::new(),
            origin: origin.to_string(),
            chunk_id,
        }
    }

    pub fn with_property(mut self, key: &str, value: serde_json::Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    /// Attach the statement behind the relation; distinct statements over the
    /// same endpoints get distinct ids
    pub fn with_fact(mut self, fact: &str) -> Self {
        self.relation_id = relation_id(
            &self.origin,
            &self.source_entity_id,
            &self.relation_type,
            &self.target_entity_id,
            self.validity,
            Some(fact),
        );
        self.with_property("fact", serde_json::Value::String(fact.to_string()))
    }

    /// Free-text statement of the relation, when the extractor supplied one
    pub fn fact(&self) -> Option<&str> {
        self.properties.get("fact").and_then(|v| v.as_str())
    }
}

/// Entity to chunk provenance link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mention {
    pub entity_id: String,
    pub chunk_id: String,
}

/// Everything one origin contributes to a graph store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphFragment {
    pub entities: Vec<GraphEntity>,
    pub relations: Vec<GraphRelation>,
    pub mentions: Vec<Mention>,
}

impl GraphFragment {
    /// Add an entity, merging properties into an existing one with the same id
    pub fn add_entity(&mut self, entity: GraphEntity) -> String {
        let id = entity.entity_id.clone();
        if let Some(existing) = self.entities.iter_mut().find(|e| e.entity_id == id) {
            if existing.label == "Entity" && entity.label != "Entity" {
                existing.label = entity.label;
            }
            for (key, value) in entity.properties {
                existing.properties.entry(key).or_insert(value);
            }
        } else {
            self.entities.push(entity);
        }
        id
    }

    /// Add a relation unless an identical one is present
    pub fn add_relation(&mut self, relation: GraphRelation) {
        if !self
            .relations
            .iter()
            .any(|r| r.relation_id == relation.relation_id)
        {
            self.relations.push(relation);
        }
    }

    pub fn add_mention(&mut self, entity_id: &str, chunk_id: &str) {
        let mention = Mention {
            entity_id: entity_id.to_string(),
            chunk_id: chunk_id.to_string(),
        };
        if !self.mentions.contains(&mention) {
            self.mentions.push(mention);
        }
    }

    /// Check that every relation endpoint is present and every interval is ordered
    pub fn validate(&self) -> Result<()> {
        let ids: HashSet<&str> = self.entities.iter().map(|e| e.entity_id.as_str()).collect();
        for relation in &self.relations {
            if !ids.contains(relation.source_entity_id.as_str())
                || !ids.contains(relation.target_entity_id.as_str())
            {
                return Err(Error::Other(format!(
                    "relation {} references an entity outside its fragment",
                    relation.relation_id
                )));
            }
            if let Some(validity) = &relation.validity {
                if !validity.is_valid() {
                    return Err(Error::Other(format!(
                        "relation {} has an inverted validity interval",
                        relation.relation_id
                    )));
                }
            }
        }
        for mention in &self.mentions {
            if !ids.contains(mention.entity_id.as_str()) {
                return Err(Error::Other(format!(
                    "mention of unknown entity {}",
                    mention.entity_id
                )));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

/// Ingestion record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestStatus::Completed => write!(f, "completed"),
            IngestStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for IngestStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "completed" => Ok(IngestStatus::Completed),
            "failed" => Ok(IngestStatus::Failed),
            _ => Err(Error::Other(format!("Unknown ingest status: {}", s))),
        }
    }
}

/// Last ingestion of one origin by one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub origin: String,
    pub content_hash: String,
    pub strategy_name: String,
    /// Embedding model the derived vectors were produced with
    pub provider_model_id: String,
    pub ingested_at: String,
    pub status: IngestStatus,
}

impl IngestionRecord {
    pub fn completed(origin: &str, content_hash: &str, strategy_name: &str, model: &str) -> Self {
        Self {
            origin: origin.to_string(),
            content_hash: content_hash.to_string(),
            strategy_name: strategy_name.to_string(),
            provider_model_id: model.to_string(),
            ingested_at: Utc::now().to_rfc3339(),
            status: IngestStatus::Completed,
        }
    }

    /// Attempted but not stored; never covers any content
    pub fn failed(origin: &str, content_hash: &str, strategy_name: &str, model: &str) -> Self {
        Self {
            status: IngestStatus::Failed,
            ..Self::completed(origin, content_hash, strategy_name, model)
        }
    }

    /// True when this record proves the given content is already ingested
    pub fn covers(&self, content_hash: &str, model: &str) -> bool {
        self.status == IngestStatus::Completed
            && self.content_hash == content_hash
            && self.provider_model_id == model
    }
}

/// Ingestion run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// An ingestion run record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: String,
    pub agent: String,
    pub strategy: String,
    pub sources: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
    pub created: i64,
    pub updated: i64,
    pub skipped: i64,
    pub failed: i64,
    pub errors_json: Option<String>,
}

impl IngestionRun {
    pub fn new(agent: &str, strategy: &str, sources: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent: agent.to_string(),
            strategy: strategy.to_string(),
            sources: sources.to_string(),
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
            status: RunStatus::Running.to_string(),
            created: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            errors_json: None,
        }
    }
}

/// Traceable origin of a piece of returned context
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub origin: String,
    pub view_url: Option<String>,
    pub chunk_id: Option<String>,
    pub heading_path: Vec<String>,
    pub sequence_index: Option<usize>,
}

impl Provenance {
    pub fn origin_only(origin: &str) -> Self {
        Self {
            origin: origin.to_string(),
            view_url: None,
            chunk_id: None,
            heading_path: Vec::new(),
            sequence_index: None,
        }
    }
}

/// One ranked piece of context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub text: String,
    pub score: f32,
    pub provenance: Provenance,
    /// Graph distance from an entity named in the question
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hops: Option<u32>,
}

/// Ranked context returned by a strategy query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub context_items: Vec<ContextItem>,
    pub strategy_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_of: Option<DateTime<Utc>>,
}

impl QueryResult {
    /// Distinct provenance entries in rank order
    pub fn provenance(&self) -> Vec<Provenance> {
        let mut seen = HashSet::new();
        self.context_items
            .iter()
            .filter(|item| seen.insert(item.provenance.clone()))
            .map(|item| item.provenance.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(year: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_validity_interval_is_half_open() {
        let interval = ValidityInterval::new(Some(at(2018)), Some(at(2020))).unwrap();
        assert!(interval.contains(at(2018)));
        assert!(interval.contains(at(2019)));
        assert!(!interval.contains(at(2020)));
        assert!(!interval.contains(at(2017)));

        let open = ValidityInterval::starting(at(2020));
        assert!(open.contains(at(2100)));
    }

    #[test]
    fn test_validity_interval_rejects_inverted_bounds() {
        assert!(ValidityInterval::new(Some(at(2021)), Some(at(2020))).is_err());
        assert!(ValidityInterval::new(Some(at(2020)), Some(at(2020))).is_ok());
        assert!(ValidityInterval::new(None, Some(at(2020))).is_ok());
    }

    #[test]
    fn test_entity_id_normalizes_names() {
        assert_eq!(entity_id("person", "Ada  Lovelace"), entity_id("Person", "ada lovelace"));
        assert_ne!(entity_id("city", "Kuwait"), entity_id("country", "Kuwait"));
    }

    #[test]
    fn test_fragment_validation() {
        let mut fragment = GraphFragment::default();
        let a = fragment.add_entity(GraphEntity::new("person", "Person", "Ada"));
        let b = GraphEntity::new("city", "City", "London").entity_id;
        fragment.add_relation(GraphRelation::new("o", &a, "BORN_IN", &b, None, None));
        assert!(fragment.validate().is_err());

        fragment.add_entity(GraphEntity::new("city", "City", "London"));
        assert!(fragment.validate().is_ok());
    }

    #[test]
    fn test_distinct_facts_over_one_edge_are_kept() {
        let mut fragment = GraphFragment::default();
        let ada = fragment.add_entity(GraphEntity::new("entity", "Person", "Ada"));
        let acme = fragment.add_entity(GraphEntity::new("entity", "Company", "Acme"));
        let edge = |fact: &str| {
            GraphRelation::new("acme.md", &ada, "ROLE_AT", &acme, None, None).with_fact(fact)
        };
        fragment.add_relation(edge("Ada was CTO of Acme"));
        fragment.add_relation(edge("Ada is CEO of Acme"));
        // Same statement modulo whitespace and case is one fact
        fragment.add_relation(edge("ada  is CEO of acme"));
        assert_eq!(fragment.relations.len(), 2);
        assert_eq!(fragment.relations[1].fact(), Some("Ada is CEO of Acme"));

        let bare = GraphRelation::new("acme.md", &ada, "ROLE_AT", &acme, None, None);
        assert_ne!(bare.relation_id, fragment.relations[0].relation_id);
    }

    #[test]
    fn test_fragment_merges_duplicate_entities() {
        let mut fragment = GraphFragment::default();
        fragment.add_entity(GraphEntity::new("entity", "Entity", "Rust"));
        fragment.add_entity(
            GraphEntity::new("entity", "Language", "rust")
                .with_property("paradigm", serde_json::json!("systems")),
        );
        assert_eq!(fragment.entities.len(), 1);
        assert_eq!(fragment.entities[0].label, "Language");
        assert_eq!(fragment.entities[0].properties["paradigm"], "systems");
    }

    #[test]
    fn test_record_covers_requires_same_model() {
        let record = IngestionRecord::completed("a.md", "h1", "naive", "m1");
        assert!(record.covers("h1", "m1"));
        assert!(!record.covers("h2", "m1"));
        assert!(!record.covers("h1", "m2"));
    }

    #[test]
    fn test_chunk_id_stable() {
        assert_eq!(Chunk::compute_id("o", "h", 0), Chunk::compute_id("o", "h", 0));
        assert_ne!(Chunk::compute_id("o", "h", 0), Chunk::compute_id("o", "h", 1));
        assert_ne!(Chunk::compute_id("o", "h", 0), Chunk::compute_id("o", "h2", 0));
    }
}
