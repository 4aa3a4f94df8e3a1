//! Record-backed sources: person and property records from JSON files or SQLite

use crate::chunk::compute_text_hash;
use crate::error::{EnumerationKind, Error, Result};
use crate::models::{ContentKind, RecordKind, SourceDocument};
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Column, Row};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where records come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSource {
    /// JSON arrays of person and property records
    Files {
        persons: Option<PathBuf>,
        properties: Option<PathBuf>,
    },
    /// A database with `persons` and `properties` tables
    Sqlite(PathBuf),
}

impl RecordSource {
    /// Parse `persons=<file>,properties=<file>`, `sqlite://<path>`, or a directory
    /// holding `persons.json` and `properties.json`
    pub fn parse(selector: &str) -> Result<Self> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Err(Error::Config("Empty record source selector".to_string()));
        }

        if let Some(path) = selector.strip_prefix("sqlite://") {
            return Ok(RecordSource::Sqlite(PathBuf::from(path)));
        }

        if selector.contains('=') {
            let mut persons = None;
            let mut properties = None;
            for part in selector.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                match part.split_once('=') {
                    Some(("persons", path)) => persons = Some(PathBuf::from(path.trim())),
                    Some(("properties", path)) => properties = Some(PathBuf::from(path.trim())),
                    _ => {
                        return Err(Error::Config(format!(
                            "Unrecognized record source part '{}'; expected persons=<file> or properties=<file>",
                            part
                        )))
                    }
                }
            }
            return Ok(RecordSource::Files { persons, properties });
        }

        let dir = PathBuf::from(selector);
        Ok(RecordSource::Files {
            persons: Some(dir.join("persons.json")),
            properties: Some(dir.join("properties.json")),
        })
    }
}

impl std::fmt::Display for RecordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordSource::Files { persons, properties } => {
                let mut parts = Vec::new();
                if let Some(p) = persons {
                    parts.push(format!("persons={}", p.display()));
                }
                if let Some(p) = properties {
                    parts.push(format!("properties={}", p.display()));
                }
                write!(f, "{}", parts.join(","))
            }
            RecordSource::Sqlite(path) => write!(f, "sqlite://{}", path.display()),
        }
    }
}

/// True for values that stand for "no data"
fn is_absent(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim();
            s.is_empty() || s.eq_ignore_ascii_case("n/a")
        }
        Value::Array(items) => items.iter().all(is_absent),
        _ => false,
    }
}

/// Drop absent values and absent list members
pub fn normalize_fields(raw: Map<String, Value>) -> Map<String, Value> {
    raw.into_iter()
        .filter_map(|(key, value)| {
            let value = match value {
                Value::Array(items) => {
                    Value::Array(items.into_iter().filter(|v| !is_absent(v)).collect())
                }
                Value::String(s) => Value::String(s.trim().to_string()),
                other => other,
            };
            (!is_absent(&value)).then_some((key, value))
        })
        .collect()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(render_value).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

/// Stable `key: value` serialization, keys in sorted order
pub fn render_record(kind: RecordKind, name: &str, fields: &Map<String, Value>) -> String {
    let mut lines = vec![format!("{}: {}", kind, name)];
    let mut keys: Vec<&String> = fields.keys().filter(|k| k.as_str() != "name").collect();
    keys.sort();
    for key in keys {
        lines.push(format!("{}: {}", key, render_value(&fields[key])));
    }
    lines.join("\n")
}

/// Build a document from one record; a record without a name cannot be addressed
pub fn record_document(kind: RecordKind, raw: Map<String, Value>, position: usize) -> Result<SourceDocument> {
    let fields = normalize_fields(raw);
    let name = match fields.get("name").and_then(Value::as_str) {
        Some(name) => name.to_string(),
        None => {
            return Err(Error::FetchFailed {
                origin: format!("records/{}/#{}", kind, position),
                reason: "record has no name".to_string(),
            })
        }
    };

    let origin = format!("records/{}/{}", kind, name);
    let content = render_record(kind, &name, &fields);
    Ok(SourceDocument {
        source_id: Uuid::new_v5(&Uuid::NAMESPACE_URL, origin.as_bytes()).to_string(),
        title: Some(name),
        content_hash: compute_text_hash(&content),
        raw_content: content,
        fetched_at: Utc::now(),
        view_url: None,
        kind: ContentKind::Record { kind, fields },
        origin,
    })
}

/// Loads the bounded record set behind a [`RecordSource`]
pub struct RecordsReader {
    source: RecordSource,
    max_records: usize,
}

impl RecordsReader {
    pub fn new(source: RecordSource, max_records: usize) -> Self {
        Self {
            source,
            max_records,
        }
    }

    /// Read every record. The outer error means the source itself is unusable.
    pub async fn read_all(&self) -> Result<Vec<Result<SourceDocument>>> {
        let mut batches: Vec<(RecordKind, Vec<Map<String, Value>>)> = Vec::new();
        match &self.source {
            RecordSource::Files { persons, properties } => {
                if persons.is_none() && properties.is_none() {
                    return Err(Error::Config("Record source names no files".to_string()));
                }
                if let Some(path) = persons {
                    batches.push((RecordKind::Person, read_json_records(path)?));
                }
                if let Some(path) = properties {
                    batches.push((RecordKind::Property, read_json_records(path)?));
                }
            }
            RecordSource::Sqlite(path) => {
                let pool = open_read_only(path).await?;
                for (kind, table) in [(RecordKind::Person, "persons"), (RecordKind::Property, "properties")] {
                    batches.push((kind, read_table(&pool, path, table, self.max_records).await?));
                }
                pool.close().await;
            }
        }

        let mut documents = Vec::new();
        for (kind, records) in batches {
            let total = records.len();
            if total > self.max_records {
                warn!(kind = %kind, total, limit = self.max_records, "Truncating record set");
            }
            info!(kind = %kind, records = total.min(self.max_records), "Loaded records");
            documents.extend(
                records
                    .into_iter()
                    .take(self.max_records)
                    .enumerate()
                    .map(|(i, record)| record_document(kind, record, i)),
            );
        }
        Ok(documents)
    }
}

fn enumeration_error(location: &Path, kind: EnumerationKind, reason: String) -> Error {
    Error::EnumerationFailed {
        location: location.display().to_string(),
        kind,
        reason,
    }
}

fn read_json_records(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        let kind = if e.kind() == std::io::ErrorKind::NotFound {
            EnumerationKind::NotFound
        } else {
            EnumerationKind::Other
        };
        enumeration_error(path, kind, e.to_string())
    })?;

    let parsed: Vec<Value> = serde_json::from_str(&content).map_err(|e| {
        enumeration_error(path, EnumerationKind::Other, format!("expected a JSON array of records: {}", e))
    })?;
    debug!(path = %path.display(), records = parsed.len(), "Parsed record file");

    Ok(parsed
        .into_iter()
        .map(|v| match v {
            Value::Object(map) => map,
            // Non-object entries fail later as nameless records
            _ => Map::new(),
        })
        .collect())
}

async fn open_read_only(path: &Path) -> Result<SqlitePool> {
    if !path.exists() {
        return Err(enumeration_error(
            path,
            EnumerationKind::NotFound,
            "database file does not exist".to_string(),
        ));
    }
    let options = SqliteConnectOptions::new().filename(path).read_only(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| enumeration_error(path, EnumerationKind::Other, e.to_string()))
}

/// Column value as JSON: text (JSON arrays decoded), integer, real, or null
fn column_value(row: &sqlx::sqlite::SqliteRow, index: usize) -> Value {
    if let Ok(Some(text)) = row.try_get::<Option<String>, _>(index) {
        if text.trim_start().starts_with('[') {
            if let Ok(array @ Value::Array(_)) = serde_json::from_str::<Value>(&text) {
                return array;
            }
        }
        return Value::String(text);
    }
    if let Ok(Some(int)) = row.try_get::<Option<i64>, _>(index) {
        return Value::from(int);
    }
    if let Ok(Some(real)) = row.try_get::<Option<f64>, _>(index) {
        return Value::from(real);
    }
    Value::Null
}

async fn read_table(
    pool: &SqlitePool,
    path: &Path,
    table: &str,
    limit: usize,
) -> Result<Vec<Map<String, Value>>> {
    // Table names come from a fixed list, never from input
    let sql = format!("SELECT * FROM {} ORDER BY rowid LIMIT ?", table);
    let rows = sqlx::query(&sql)
        .bind(limit as i64 + 1)
        .fetch_all(pool)
        .await
        .map_err(|e| enumeration_error(path, EnumerationKind::Other, format!("{}: {}", table, e)))?;

    Ok(rows
        .iter()
        .map(|row| {
            row.columns()
                .iter()
                .enumerate()
                .map(|(i, column)| (column.name().to_string(), column_value(row, i)))
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn person(name: &str) -> Value {
        serde_json::json!({
            "name": name,
            "residence_city": "Lyon",
            "residence_country": "France",
            "profession": "n/a",
            "birth_year": "1950",
            "children": ["Ana", "n/a"],
            "spouses": []
        })
    }

    #[test]
    fn test_parse_selectors() {
        assert_eq!(
            RecordSource::parse("sqlite:///tmp/records.db").unwrap(),
            RecordSource::Sqlite(PathBuf::from("/tmp/records.db"))
        );
        assert_eq!(
            RecordSource::parse("persons=p.json, properties=q.json").unwrap(),
            RecordSource::Files {
                persons: Some(PathBuf::from("p.json")),
                properties: Some(PathBuf::from("q.json")),
            }
        );
        assert!(RecordSource::parse("owners=o.json").is_err());
        assert!(RecordSource::parse("  ").is_err());
    }

    #[test]
    fn test_absent_values_are_dropped() {
        let doc = match person("Maria Lopez") {
            Value::Object(map) => record_document(RecordKind::Person, map, 0).unwrap(),
            _ => unreachable!(),
        };
        assert_eq!(doc.origin, "records/person/Maria Lopez");
        assert!(!doc.raw_content.contains("n/a"));
        assert!(!doc.raw_content.contains("spouses"));
        assert!(doc.raw_content.starts_with("person: Maria Lopez\n"));
        assert!(doc.raw_content.contains("children: Ana"));
        match &doc.kind {
            ContentKind::Record { fields, .. } => assert!(!fields.contains_key("profession")),
            _ => panic!("expected record content"),
        }
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let a = match person("Ana") {
            Value::Object(map) => record_document(RecordKind::Person, map, 0).unwrap(),
            _ => unreachable!(),
        };
        let b = match person("Ana") {
            Value::Object(map) => record_document(RecordKind::Person, map, 3).unwrap(),
            _ => unreachable!(),
        };
        assert_eq!(a.raw_content, b.raw_content);
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.source_id, b.source_id);
    }

    #[tokio::test]
    async fn test_json_files_with_nameless_record() {
        let dir = TempDir::new().unwrap();
        let persons = dir.path().join("persons.json");
        std::fs::write(
            &persons,
            serde_json::to_string(&vec![person("Ana"), serde_json::json!({"name": "n/a"})]).unwrap(),
        )
        .unwrap();

        let reader = RecordsReader::new(
            RecordSource::Files {
                persons: Some(persons),
                properties: None,
            },
            100,
        );
        let docs = reader.read_all().await.unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs[0].is_ok());
        assert!(matches!(docs[1], Err(Error::FetchFailed { .. })));
    }

    #[tokio::test]
    async fn test_missing_file_is_enumeration_failure() {
        let dir = TempDir::new().unwrap();
        let reader = RecordsReader::new(RecordSource::parse(dir.path().to_str().unwrap()).unwrap(), 100);
        let err = reader.read_all().await.unwrap_err();
        assert!(matches!(
            err,
            Error::EnumerationFailed {
                kind: EnumerationKind::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_sqlite_tables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.db");
        let options = SqliteConnectOptions::new().filename(&path).create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.unwrap();
        sqlx::query("CREATE TABLE persons (name TEXT, birth_year INTEGER, children TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE properties (name TEXT, area REAL, owner TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO persons VALUES ('Ana', 1950, '[\"Luis\"]')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO properties VALUES ('Casa Azul', 120.5, 'Ana')")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let reader = RecordsReader::new(RecordSource::Sqlite(path), 10);
        let docs: Vec<SourceDocument> = reader
            .read_all()
            .await
            .unwrap()
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].origin, "records/person/Ana");
        assert!(docs[0].raw_content.contains("birth_year: 1950"));
        assert!(docs[0].raw_content.contains("children: Luis"));
        assert_eq!(docs[1].origin, "records/property/Casa Azul");
        assert!(docs[1].raw_content.contains("area: 120.5"));
    }
}
