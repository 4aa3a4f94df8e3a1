//! Deterministic graph facts for person and property records

use crate::models::{
    Chunk, GraphEntity, GraphFragment, GraphRelation, RecordKind, SourceDocument, ValidityInterval,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Fields that become relations rather than entity properties
const LINK_FIELDS: &[&str] = &[
    "name",
    "children",
    "spouses",
    "owner",
    "city",
    "country",
    "residence_city",
    "residence_country",
    "birth_city",
    "birth_country",
    "death_city",
    "death_country",
];

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];

fn text_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn list_field(fields: &Map<String, Value>, key: &str) -> Vec<String> {
    match fields.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn month_number(raw: &str) -> Option<u32> {
    if let Ok(n) = raw.parse::<u32>() {
        return (1..=12).contains(&n).then_some(n);
    }
    let raw = raw.to_lowercase();
    if raw.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| m.starts_with(&raw))
        .map(|i| i as u32 + 1)
}

/// `{prefix}_year`, `{prefix}_month`, `{prefix}_day` as an instant; month and day default to 1
fn record_date(fields: &Map<String, Value>, prefix: &str) -> Option<DateTime<Utc>> {
    let year: i32 = text_field(fields, &format!("{}_year", prefix))?.parse().ok()?;
    let month = text_field(fields, &format!("{}_month", prefix))
        .and_then(|m| month_number(&m))
        .unwrap_or(1);
    let day = text_field(fields, &format!("{}_day", prefix))
        .and_then(|d| d.parse::<u32>().ok())
        .unwrap_or(1);
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .or_else(|| Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single())
}

struct FragmentBuilder<'a> {
    fragment: GraphFragment,
    origin: &'a str,
    chunk_id: Option<String>,
}

impl<'a> FragmentBuilder<'a> {
    fn entity(&mut self, namespace: &str, label: &str, name: &str) -> String {
        self.fragment.add_entity(GraphEntity::new(namespace, label, name))
    }

    fn relate(&mut self, source: &str, relation_type: &str, target: &str, validity: Option<ValidityInterval>) {
        self.fragment.add_relation(GraphRelation::new(
            self.origin,
            source,
            relation_type,
            target,
            validity,
            self.chunk_id.clone(),
        ));
    }

    fn city_and_country(&mut self, city: Option<&str>, country: Option<&str>) -> (Option<String>, Option<String>) {
        let city_id = city.map(|c| self.entity("city", "City", c));
        let country_id = country.map(|c| self.entity("country", "Country", c));
        if let (Some(city_id), Some(country_id)) = (&city_id, &country_id) {
            self.relate(country_id, "HAS_CITY", city_id, None);
            self.relate(city_id, "HAS_COUNTRY", country_id, None);
        }
        (city_id, country_id)
    }
}

fn with_scalar_properties(mut entity: GraphEntity, fields: &Map<String, Value>) -> GraphEntity {
    for (key, value) in fields {
        if LINK_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
            entity = entity.with_property(key, value.clone());
        }
    }
    entity
}

fn person_facts(builder: &mut FragmentBuilder<'_>, name: &str, fields: &Map<String, Value>, temporal: bool) {
    let person = builder
        .fragment
        .add_entity(with_scalar_properties(GraphEntity::new("person", "Person", name), fields));

    let born = record_date(fields, "birth");
    let died = record_date(fields, "death");

    let places = [
        ("residence", "RESIDENT_OF", temporal.then(|| ValidityInterval { start: None, end: died })),
        ("birth", "BORN_IN", temporal.then(|| ValidityInterval { start: born, end: None })),
        ("death", "DIED_IN", temporal.then(|| ValidityInterval { start: died, end: None })),
    ];
    for (prefix, relation_type, validity) in places {
        let city = text_field(fields, &format!("{}_city", prefix));
        let country = text_field(fields, &format!("{}_country", prefix));
        let validity = validity.filter(|v| v.start.is_some() || v.end.is_some());
        let (city_id, country_id) = builder.city_and_country(city.as_deref(), country.as_deref());
        for place in [city_id, country_id].into_iter().flatten() {
            builder.relate(&person, relation_type, &place, validity);
        }
    }

    for child in list_field(fields, "children") {
        let child = builder.entity("person", "Person", &child);
        builder.relate(&person, "PARENT_OF", &child, None);
    }
    for spouse in list_field(fields, "spouses") {
        let spouse = builder.entity("person", "Person", &spouse);
        builder.relate(&person, "SPOUSE_OF", &spouse, None);
    }
}

fn property_facts(builder: &mut FragmentBuilder<'_>, name: &str, fields: &Map<String, Value>) {
    let property = builder
        .fragment
        .add_entity(with_scalar_properties(GraphEntity::new("property", "Property", name), fields));

    if let Some(owner) = text_field(fields, "owner") {
        let owner = builder.entity("person", "Person", &owner);
        builder.relate(&property, "OWNED_BY", &owner, None);
        builder.relate(&owner, "OWNS", &property, None);
    }

    let city = text_field(fields, "city");
    let country = text_field(fields, "country");
    let (city_id, country_id) = builder.city_and_country(city.as_deref(), country.as_deref());
    for place in [city_id, country_id].into_iter().flatten() {
        builder.relate(&property, "LOCATED_IN", &place, None);
        builder.relate(&place, "HAS_PROPERTY", &property, None);
    }
}

/// Map one record document onto graph facts, linking every entity to the record's chunks
pub(super) fn record_fragment(
    doc: &SourceDocument,
    kind: RecordKind,
    fields: &Map<String, Value>,
    chunks: &[Chunk],
    temporal: bool,
) -> GraphFragment {
    let name = text_field(fields, "name")
        .or_else(|| doc.title.clone())
        .unwrap_or_else(|| doc.origin.clone());
    let mut builder = FragmentBuilder {
        fragment: GraphFragment::default(),
        origin: &doc.origin,
        chunk_id: chunks.first().map(|c| c.chunk_id.clone()),
    };

    match kind {
        RecordKind::Person => person_facts(&mut builder, &name, fields, temporal),
        RecordKind::Property => property_facts(&mut builder, &name, fields),
    }

    let mut fragment = builder.fragment;
    let ids: Vec<String> = fragment.entities.iter().map(|e| e.entity_id.clone()).collect();
    for chunk in chunks {
        for id in &ids {
            fragment.add_mention(id, &chunk.chunk_id);
        }
    }
    fragment
}
