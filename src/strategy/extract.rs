//! Entity and relation extraction from markdown chunks

use super::parse_as_of;
use crate::error::{Error, ProviderError, Result};
use crate::models::{
    Chunk, GraphEntity, GraphFragment, GraphRelation, SourceDocument, ValidityInterval,
};
use crate::provider::{Message, ProviderGateway};
use chrono::{DateTime, TimeZone, Utc};
use futures::future::try_join_all;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::debug;

const EPISODE_CHAR_LIMIT: usize = 6000;
const TITLE_CHAR_LIMIT: usize = 50;
const TRUNCATION_MARKER: &str = "... [TRUNCATED]";

/// Namespace for entity ids of extracted facts
const ENTITY_NAMESPACE: &str = "entity";

const EXTRACTION_PROMPT: &str = r#"You extract a knowledge graph from documentation.
Reply with JSON only, no prose, in exactly this shape:
{"entities": [{"name": "...", "label": "...", "properties": {"key": "scalar value"}}],
 "relations": [{"source": "entity name", "target": "entity name", "type": "RELATION_TYPE",
                "fact": "one sentence stating the relation", "valid_from": "YYYY-MM-DD or null", "valid_to": "YYYY-MM-DD or null"}]}
Use short, specific labels such as Component, Service, Person or Concept.
Only state facts the text supports. Set valid_from/valid_to only when the text gives a time."#;

#[derive(Debug, Deserialize)]
struct ExtractionReply {
    #[serde(default)]
    entities: Vec<ExtractedEntity>,
    #[serde(default)]
    relations: Vec<ExtractedRelation>,
}

#[derive(Debug, Deserialize)]
struct ExtractedEntity {
    name: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ExtractedRelation {
    source: String,
    target: String,
    #[serde(rename = "type", alias = "relation_type")]
    relation_type: String,
    #[serde(default)]
    fact: Option<String>,
    #[serde(default)]
    valid_from: Option<String>,
    #[serde(default)]
    valid_to: Option<String>,
}

/// Text sent for one chunk: a title tag plus the bounded chunk body
pub(super) fn episode_body(title: Option<&str>, text: &str) -> String {
    let title: String = title
        .unwrap_or("untitled")
        .chars()
        .take(TITLE_CHAR_LIMIT)
        .collect();
    format!("[Doc: {}]\n{}", title, truncate_episode(text))
}

fn truncate_episode(text: &str) -> String {
    if text.chars().count() <= EPISODE_CHAR_LIMIT {
        return text.to_string();
    }
    let cut: String = text.chars().take(EPISODE_CHAR_LIMIT).collect();
    let sentence_end = cut
        .char_indices()
        .filter(|&(i, c)| {
            matches!(c, '.' | '!' | '?')
                && cut[i + c.len_utf8()..]
                    .chars()
                    .next()
                    .map_or(true, char::is_whitespace)
        })
        .map(|(i, c)| i + c.len_utf8())
        .last();

    match sentence_end {
        Some(end) if cut[..end].chars().count() * 10 >= EPISODE_CHAR_LIMIT * 7 => cut[..end].to_string(),
        _ => format!("{}{}", cut, TRUNCATION_MARKER),
    }
}

/// Upper snake case; anything else becomes an underscore
fn normalize_relation_type(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_uppercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_matches('_').to_string();
    if out.is_empty() {
        "RELATED_TO".to_string()
    } else {
        out
    }
}

fn year_start(year: &str) -> Option<DateTime<Utc>> {
    let year: i32 = year.parse().ok()?;
    Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single()
}

fn temporal_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?i)\b(?:from|between)\s+(\d{4})\s+(?:to|until|till|and)\s+(\d{4})\b")
                .expect("valid range pattern"),
            Regex::new(r"(?i)\bsince\s+(\d{4})\b").expect("valid since pattern"),
            Regex::new(r"(?i)\b(?:until|till)\s+(\d{4})\b").expect("valid until pattern"),
        ]
    })
}

/// Bounds stated in a sentence, e.g. "from 2018 to 2020" or "since 2019"
fn phrase_bounds(fact: &str) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let [range, since, until] = temporal_patterns();
    if let Some(caps) = range.captures(fact) {
        return (year_start(&caps[1]), year_start(&caps[2]));
    }
    let start = since.captures(fact).and_then(|c| year_start(&c[1]));
    let end = until.captures(fact).and_then(|c| year_start(&c[1]));
    (start, end)
}

/// Explicit bounds first, then phrasing; with neither, valid from the fetch time
fn infer_validity(relation: &ExtractedRelation, fetched_at: DateTime<Utc>) -> ValidityInterval {
    let explicit = |raw: &Option<String>| {
        raw.as_deref()
            .filter(|s| !s.trim().is_empty() && !s.eq_ignore_ascii_case("null"))
            .and_then(|s| parse_as_of(s).ok())
    };
    let (phrase_start, phrase_end) = relation
        .fact
        .as_deref()
        .map(phrase_bounds)
        .unwrap_or((None, None));

    let start = explicit(&relation.valid_from).or(phrase_start);
    let end = explicit(&relation.valid_to).or(phrase_end);
    let start = match (start, end) {
        (None, None) => Some(fetched_at),
        (start, _) => start,
    };

    ValidityInterval::new(start, end).unwrap_or(ValidityInterval { start, end: None })
}

/// Accept a bare JSON object or one wrapped in prose or code fences
fn parse_reply(text: &str) -> std::result::Result<ExtractionReply, String> {
    let start = text.find('{').ok_or("no JSON object in reply")?;
    let end = text.rfind('}').ok_or("no JSON object in reply")?;
    if end < start {
        return Err("no JSON object in reply".to_string());
    }
    serde_json::from_str(&text[start..=end]).map_err(|e| e.to_string())
}

fn scalar_properties(properties: Map<String, Value>) -> Vec<(String, Value)> {
    properties
        .into_iter()
        .filter(|(_, v)| matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_)))
        .collect()
}

/// Fold one chunk's reply into the document fragment
fn apply_reply(
    fragment: &mut GraphFragment,
    reply: ExtractionReply,
    doc: &SourceDocument,
    chunk: &Chunk,
    temporal: bool,
) {
    for extracted in reply.entities {
        if extracted.name.trim().is_empty() {
            continue;
        }
        let label = extracted
            .label
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or("Entity");
        let mut entity = GraphEntity::new(ENTITY_NAMESPACE, label, &extracted.name);
        for (key, value) in scalar_properties(extracted.properties) {
            entity = entity.with_property(&key, value);
        }
        let id = fragment.add_entity(entity);
        fragment.add_mention(&id, &chunk.chunk_id);
    }

    for extracted in reply.relations {
        if extracted.source.trim().is_empty() || extracted.target.trim().is_empty() {
            continue;
        }
        // Unknown endpoints become stubs so the relation stays anchored
        let source = fragment.add_entity(GraphEntity::new(ENTITY_NAMESPACE, "Entity", &extracted.source));
        let target = fragment.add_entity(GraphEntity::new(ENTITY_NAMESPACE, "Entity", &extracted.target));
        fragment.add_mention(&source, &chunk.chunk_id);
        fragment.add_mention(&target, &chunk.chunk_id);

        let validity = temporal.then(|| infer_validity(&extracted, doc.fetched_at));
        let mut relation = GraphRelation::new(
            &doc.origin,
            &source,
            &normalize_relation_type(&extracted.relation_type),
            &target,
            validity,
            Some(chunk.chunk_id.clone()),
        );
        if let Some(fact) = extracted.fact.filter(|f| !f.trim().is_empty()) {
            relation = relation.with_fact(fact.trim());
        }
        fragment.add_relation(relation);
    }
}

async fn extract_chunk(
    gateway: &ProviderGateway,
    doc: &SourceDocument,
    chunk: &Chunk,
) -> Result<ExtractionReply> {
    let messages = [
        Message::system(EXTRACTION_PROMPT),
        Message::user(episode_body(doc.title.as_deref(), &chunk.text)),
    ];
    let completion = gateway.complete(&messages, &[]).await?;
    parse_reply(&completion.text).map_err(|reason| {
        Error::Completion(ProviderError::InvalidRequest(format!(
            "unreadable extraction reply for {} chunk {}: {}",
            doc.origin, chunk.sequence_index, reason
        )))
    })
}

/// Ask the completion backend for each chunk's entities and relations
pub(super) async fn extract_fragment(
    gateway: &ProviderGateway,
    doc: &SourceDocument,
    chunks: &[Chunk],
    temporal: bool,
) -> Result<GraphFragment> {
    let replies = try_join_all(chunks.iter().map(|chunk| extract_chunk(gateway, doc, chunk))).await?;

    let mut fragment = GraphFragment::default();
    for (reply, chunk) in replies.into_iter().zip(chunks) {
        apply_reply(&mut fragment, reply, doc, chunk, temporal);
    }
    debug!(
        origin = %doc.origin,
        entities = fragment.entities.len(),
        relations = fragment.relations.len(),
        "Extracted graph fragment"
    );
    Ok(fragment)
}
