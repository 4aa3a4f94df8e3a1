//! Graph-Hybrid and Temporal-Graph retrieval
//!
//! Ingestion stores chunk vectors like the naive strategy and adds an entity
//! graph: markdown chunks go through a completion-backed extractor, record
//! documents map onto graph facts directly.
//!
//! Queries merge two candidate sets. Chunk hits come from vector search.
//! Graph candidates come from a bounded walk starting at the entities the
//! question names; relation and entity statements are embedded in one batch
//! and scored against the question. Ranking is score first, hop distance
//! second.

use super::extract::extract_fragment;
use super::records::record_fragment;
use super::{Derived, QueryRequest, StrategyContext, StrategyKind};
use crate::error::Result;
use crate::models::{
    Chunk, ContentKind, ContextItem, GraphEntity, GraphRelation, Provenance, QueryResult,
    SourceDocument,
};
use crate::provider::cosine_similarity;
use crate::store::Traversal;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Graph statements embedded per query
const MAX_GRAPH_CANDIDATES: usize = 64;

pub struct GraphStrategy {
    context: StrategyContext,
    temporal: bool,
}

/// A graph statement waiting for a score
struct Candidate {
    text: String,
    hops: u32,
    origin: String,
    chunk_id: Option<String>,
}

fn format_date(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%d").to_string()
}

pub(crate) fn describe_relation(relation: &GraphRelation, traversal: &Traversal) -> String {
    let name = |id: &str| {
        traversal
            .entity(id)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| id.to_string())
    };
    let mut text = relation.fact().map(str::to_string).unwrap_or_else(|| {
        format!(
            "{} {} {}",
            name(&relation.source_entity_id),
            relation.relation_type,
            name(&relation.target_entity_id)
        )
    });
    match relation.validity.map(|v| (v.start, v.end)) {
        Some((Some(start), Some(end))) => {
            text.push_str(&format!(" (valid {} to {})", format_date(start), format_date(end)))
        }
        Some((Some(start), None)) => text.push_str(&format!(" (valid from {})", format_date(start))),
        Some((None, Some(end))) => text.push_str(&format!(" (valid until {})", format_date(end))),
        _ => {}
    }
    text
}

fn describe_entity(entity: &GraphEntity) -> String {
    let properties: Vec<String> = entity
        .properties
        .iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => format!("{}: {}", key, s),
            other => format!("{}: {}", key, other),
        })
        .collect();
    format!("{} ({}): {}", entity.name, entity.label, properties.join(", "))
}

/// Keep the relations that hold at `as_of`; without it, the latest start per
/// (source, target, type) wins and distinct facts sharing that start all stay
pub(crate) fn select_relations(
    relations: Vec<GraphRelation>,
    as_of: Option<DateTime<Utc>>,
) -> Vec<GraphRelation> {
    if let Some(instant) = as_of {
        return relations
            .into_iter()
            .filter(|r| r.validity.map_or(true, |v| v.contains(instant)))
            .collect();
    }

    let mut latest: HashMap<(String, String, String), Vec<GraphRelation>> = HashMap::new();
    for relation in relations {
        let key = (
            relation.source_entity_id.clone(),
            relation.target_entity_id.clone(),
            relation.relation_type.clone(),
        );
        let start = relation.validity.and_then(|v| v.start);
        let group = latest.entry(key).or_default();
        let current_start = group.first().and_then(|r| r.validity.and_then(|v| v.start));
        if group.is_empty() || start > current_start {
            group.clear();
            group.push(relation);
        } else if start == current_start {
            group.push(relation);
        }
    }
    let mut kept: Vec<GraphRelation> = latest.into_values().flatten().collect();
    kept.sort_by(|a, b| a.relation_id.cmp(&b.relation_id));
    kept
}

impl GraphStrategy {
    pub fn new(context: StrategyContext, temporal: bool) -> Self {
        Self { context, temporal }
    }

    pub fn context(&self) -> &StrategyContext {
        &self.context
    }

    fn name(&self) -> &'static str {
        if self.temporal {
            StrategyKind::TemporalGraph.name()
        } else {
            StrategyKind::GraphHybrid.name()
        }
    }

    pub(super) async fn derive(&self, doc: &SourceDocument) -> Result<Derived> {
        let (chunks, vectors) = self.context.chunk_and_embed(doc).await?;
        let fragment = match &doc.kind {
            ContentKind::Record { kind, fields } => {
                record_fragment(doc, *kind, fields, &chunks, self.temporal)
            }
            ContentKind::Markdown => {
                extract_fragment(&self.context.gateway, doc, &chunks, self.temporal).await?
            }
        };
        fragment.validate()?;
        Ok(Derived {
            chunks,
            vectors,
            fragment: Some(fragment),
        })
    }

    /// Statements reachable from the entities the question names
    async fn graph_candidates(&self, question: &str, as_of: Option<DateTime<Utc>>) -> Result<Vec<Candidate>> {
        let name = self.name();
        let seeds = self.context.graph.match_entities(name, question).await?;
        if seeds.is_empty() {
            return Ok(Vec::new());
        }
        let seed_ids: Vec<String> = seeds.iter().map(|e| e.entity_id.clone()).collect();
        let traversal = self
            .context
            .graph
            .traverse(name, &seed_ids, self.context.max_hops, as_of)
            .await?;

        let relations = if self.temporal {
            select_relations(traversal.relations.clone(), as_of)
        } else {
            traversal.relations.clone()
        };

        let mut candidates: Vec<Candidate> = relations
            .iter()
            .map(|relation| Candidate {
                text: describe_relation(relation, &traversal),
                hops: traversal
                    .hops_of(&relation.source_entity_id)
                    .into_iter()
                    .chain(traversal.hops_of(&relation.target_entity_id))
                    .min()
                    .unwrap_or(0),
                origin: relation.origin.clone(),
                chunk_id: relation.chunk_id.clone(),
            })
            .collect();

        let mentions = self.context.graph.mentions(name, &seed_ids).await?;
        for seed in seeds.iter().filter(|e| !e.properties.is_empty()) {
            candidates.push(Candidate {
                text: describe_entity(seed),
                hops: 0,
                origin: seed.origins.first().cloned().unwrap_or_default(),
                chunk_id: mentions
                    .iter()
                    .find(|m| m.entity_id == seed.entity_id)
                    .map(|m| m.chunk_id.clone()),
            });
        }

        candidates.sort_by(|a, b| a.hops.cmp(&b.hops).then_with(|| a.text.cmp(&b.text)));
        candidates.dedup_by(|a, b| a.text == b.text);
        candidates.truncate(MAX_GRAPH_CANDIDATES);
        Ok(candidates)
    }

    /// Score candidates against the question and attach chunk provenance
    async fn score_candidates(
        &self,
        candidates: Vec<Candidate>,
        query_vector: &[f32],
    ) -> Result<Vec<ContextItem>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let vectors = self.context.gateway.embed(&texts).await?;

        let chunk_ids: Vec<String> = candidates
            .iter()
            .filter_map(|c| c.chunk_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let chunks: HashMap<String, Chunk> = self
            .context
            .vectors
            .chunks(self.name(), &chunk_ids)
            .await?
            .into_iter()
            .map(|c| (c.chunk_id.clone(), c))
            .collect();

        Ok(candidates
            .into_iter()
            .zip(vectors)
            .map(|(candidate, vector)| ContextItem {
                provenance: candidate
                    .chunk_id
                    .as_ref()
                    .and_then(|id| chunks.get(id))
                    .map(Chunk::provenance)
                    .unwrap_or_else(|| Provenance::origin_only(&candidate.origin)),
                score: cosine_similarity(query_vector, &vector),
                text: candidate.text,
                hops: Some(candidate.hops),
            })
            .collect())
    }

    pub(super) async fn query(&self, request: &QueryRequest) -> Result<QueryResult> {
        let name = self.name();
        let as_of = if self.temporal { request.as_of } else { None };

        let query_vector = self.context.gateway.embed_one(&request.question).await?;
        let mut items = self
            .context
            .similar_chunks(name, &query_vector, request.k)
            .await?;

        let candidates = self.graph_candidates(&request.question, as_of).await?;
        let graph_items = self.score_candidates(candidates, &query_vector).await?;
        debug!(
            strategy = name,
            chunk_items = items.len(),
            graph_items = graph_items.len(),
            "Graph query candidates"
        );
        items.extend(
            graph_items
                .into_iter()
                .filter(|item| item.score >= self.context.min_score),
        );

        items.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.hops.unwrap_or(0).cmp(&b.hops.unwrap_or(0)))
        });
        let mut seen = HashSet::new();
        items.retain(|item| seen.insert(item.text.clone()));
        items.truncate(request.k);

        Ok(QueryResult {
            context_items: items,
            strategy_name: name.to_string(),
            as_of,
        })
    }
}
