//! Neo4j graph store over the HTTP transactional Cypher endpoint
//!
//! Every call is a single `POST {uri}/db/{database}/tx/commit`, so a
//! multi-statement request commits or rolls back as one transaction.
//! Entity labels and relation types are data here, stored as properties on
//! `:Entity` nodes and `:REL` relationships, since Cypher cannot bind them
//! as parameters.

use super::{contains_phrase, GraphStore, Traversal};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::models::{normalize_name, GraphEntity, GraphFragment, GraphRelation, Mention, ValidityInterval};
use crate::store::sqlite::parse_instant;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Serialize)]
struct Statement {
    statement: String,
    parameters: Value,
}

impl Statement {
    fn new(statement: impl Into<String>, parameters: Value) -> Self {
        Self {
            statement: statement.into(),
            parameters,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<Neo4jError>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    data: Vec<RowData>,
}

#[derive(Debug, Deserialize)]
struct RowData {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Neo4jError {
    code: String,
    message: String,
}

impl Neo4jError {
    fn into_error(self) -> Error {
        let detail = format!("{}: {}", self.code, self.message);
        if self.code.contains("DeadlockDetected")
            || self.code.contains("LockClient")
            || self.code.starts_with("Neo.TransientError")
        {
            Error::StoreWriteConflict(detail)
        } else if self.code.contains("Security") {
            Error::StoreUnreachable(detail)
        } else {
            Error::Other(format!("Neo4j {}", detail))
        }
    }
}

/// Map bolt/neo4j URIs to the HTTP port and append the commit path
fn tx_endpoint(uri: &str, database: &str) -> Result<Url> {
    let mut url = Url::parse(uri)?;
    if matches!(url.scheme(), "bolt" | "neo4j" | "bolt+s" | "neo4j+s") {
        let secure = url.scheme().ends_with("+s");
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("Neo4j URI has no host: {}", uri)))?
            .to_string();
        url = Url::parse(&format!(
            "{}://{}:{}",
            if secure { "https" } else { "http" },
            host,
            if secure { 7473 } else { 7474 }
        ))?;
    }
    url.path_segments_mut()
        .map_err(|_| Error::Config(format!("Neo4j URI cannot be a base: {}", uri)))?
        .pop_if_empty()
        .extend(["db", database, "tx", "commit"]);
    Ok(url)
}

fn str_at(row: &[Value], index: usize) -> String {
    row.get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn opt_str_at(row: &[Value], index: usize) -> Option<String> {
    row.get(index).and_then(Value::as_str).map(str::to_string)
}

fn json_at<T: serde::de::DeserializeOwned + Default>(row: &[Value], index: usize) -> T {
    row.get(index)
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

const ENTITY_RETURN: &str = "e.entity_id, e.label, e.name, e.properties, e.origins";

fn entity_from_row(row: &[Value]) -> GraphEntity {
    let mut origins: Vec<String> = row
        .get(4)
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    origins.sort();
    GraphEntity {
        entity_id: str_at(row, 0),
        label: str_at(row, 1),
        name: str_at(row, 2),
        properties: json_at(row, 3),
        origins,
    }
}

/// Relation `r` holds at `$valid_at`; stored bounds are UTC RFC 3339 strings
const VALID_AT_PREDICATE: &str = "($valid_at IS NULL OR ((r.valid_from IS NULL OR r.valid_from <= $valid_at) \
     AND (r.valid_to IS NULL OR r.valid_to > $valid_at)))";

const RELATION_RETURN: &str = "r.relation_id, r.origin, a.entity_id, b.entity_id, r.type, \
     r.temporal, r.valid_from, r.valid_to, r.properties, r.chunk_id";

fn relation_from_row(row: &[Value]) -> Result<GraphRelation> {
    let temporal = row.get(5).and_then(Value::as_bool).unwrap_or(false);
    let validity = if temporal {
        Some(ValidityInterval {
            start: opt_str_at(row, 6).as_deref().map(parse_instant).transpose()?,
            end: opt_str_at(row, 7).as_deref().map(parse_instant).transpose()?,
        })
    } else {
        None
    };
    Ok(GraphRelation {
        relation_id: str_at(row, 0),
        origin: str_at(row, 1),
        source_entity_id: str_at(row, 2),
        target_entity_id: str_at(row, 3),
        relation_type: str_at(row, 4),
        validity,
        properties: json_at(row, 8),
        chunk_id: opt_str_at(row, 9),
    })
}

/// Graph store backed by a Neo4j server
pub struct Neo4jGraphStore {
    client: Client,
    endpoint: Url,
    user: String,
    password: Option<String>,
}

impl Neo4jGraphStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let endpoint = tx_endpoint(&config.neo4j_uri, &config.neo4j_database)?;
        let client = Client::builder()
            .user_agent(concat!("ragweave/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let password = config.neo4j_password();
        if password.is_none() {
            warn!(
                "No Neo4j password in {}, connecting without one",
                config.neo4j_password_env
            );
        }

        Ok(Self {
            client,
            endpoint,
            user: config.neo4j_user.clone(),
            password,
        })
    }

    async fn run(&self, statements: Vec<Statement>) -> Result<Vec<StatementResult>> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .basic_auth(&self.user, self.password.as_deref())
            .json(&json!({ "statements": statements }))
            .send()
            .await
            .map_err(|e| Error::StoreUnreachable(format!("Neo4j at {}: {}", self.endpoint, e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::StoreUnreachable(format!(
                "Neo4j rejected credentials for user '{}'",
                self.user
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::StoreUnreachable(format!("Neo4j HTTP {}: {}", status, body)));
        }

        let body: TxResponse = response
            .json()
            .await
            .map_err(|e| Error::StoreUnreachable(format!("unreadable Neo4j response: {}", e)))?;
        if let Some(error) = body.errors.into_iter().next() {
            return Err(error.into_error());
        }
        Ok(body.results)
    }

    /// Rows of the first statement's result
    async fn rows(&self, statement: Statement) -> Result<Vec<Vec<Value>>> {
        let results = self.run(vec![statement]).await?;
        Ok(results
            .into_iter()
            .next()
            .map(|r| r.data.into_iter().map(|d| d.row).collect())
            .unwrap_or_default())
    }

    async fn relation_rows(&self, statement: Statement) -> Result<Vec<GraphRelation>> {
        self.rows(statement)
            .await?
            .iter()
            .map(|row| relation_from_row(row))
            .collect()
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn replace_origin(
        &self,
        strategy: &str,
        origin: &str,
        fragment: &GraphFragment,
    ) -> Result<()> {
        fragment.validate()?;

        let entities: Vec<Value> = fragment
            .entities
            .iter()
            .map(|e| {
                Ok(json!({
                    "entity_id": e.entity_id,
                    "label": e.label,
                    "name": e.name,
                    "norm_name": normalize_name(&e.name),
                    "properties": serde_json::to_string(&e.properties)?,
                }))
            })
            .collect::<Result<_>>()?;
        let relations: Vec<Value> = fragment
            .relations
            .iter()
            .map(|r| {
                Ok(json!({
                    "relation_id": r.relation_id,
                    "source": r.source_entity_id,
                    "target": r.target_entity_id,
                    "type": r.relation_type,
                    "temporal": r.validity.is_some(),
                    "valid_from": r.validity.and_then(|v| v.start).map(|s| s.to_rfc3339()),
                    "valid_to": r.validity.and_then(|v| v.end).map(|e| e.to_rfc3339()),
                    "properties": serde_json::to_string(&r.properties)?,
                    "chunk_id": r.chunk_id,
                }))
            })
            .collect::<Result<_>>()?;
        let mentions: Vec<Value> = fragment
            .mentions
            .iter()
            .map(|m| json!({ "entity_id": m.entity_id, "chunk_id": m.chunk_id }))
            .collect();

        let scope = json!({ "strategy": strategy, "origin": origin });
        let statements = vec![
            Statement::new(
                "MATCH (:Entity {strategy: $strategy})-[r:REL {origin: $origin}]->() DELETE r",
                scope.clone(),
            ),
            Statement::new(
                "MATCH (c:ChunkRef {strategy: $strategy, origin: $origin}) DETACH DELETE c",
                scope.clone(),
            ),
            Statement::new(
                "MATCH (e:Entity {strategy: $strategy}) WHERE $origin IN e.origins \
                 SET e.origins = [o IN e.origins WHERE o <> $origin]",
                scope.clone(),
            ),
            Statement::new(
                "MATCH (e:Entity {strategy: $strategy}) WHERE size(e.origins) = 0 DETACH DELETE e",
                scope.clone(),
            ),
            Statement::new(
                "UNWIND $entities AS ent \
                 MERGE (e:Entity {strategy: $strategy, entity_id: ent.entity_id}) \
                 SET e.name = ent.name, e.norm_name = ent.norm_name, e.properties = ent.properties, \
                     e.label = CASE WHEN ent.label = 'Entity' AND e.label IS NOT NULL THEN e.label ELSE ent.label END, \
                     e.origins = coalesce(e.origins, []) + $origin",
                json!({ "strategy": strategy, "origin": origin, "entities": entities }),
            ),
            Statement::new(
                "UNWIND $relations AS rel \
                 MATCH (a:Entity {strategy: $strategy, entity_id: rel.source}) \
                 MATCH (b:Entity {strategy: $strategy, entity_id: rel.target}) \
                 CREATE (a)-[:REL {strategy: $strategy, origin: $origin, relation_id: rel.relation_id, \
                     type: rel.type, temporal: rel.temporal, valid_from: rel.valid_from, \
                     valid_to: rel.valid_to, properties: rel.properties, chunk_id: rel.chunk_id}]->(b)",
                json!({ "strategy": strategy, "origin": origin, "relations": relations }),
            ),
            Statement::new(
                "UNWIND $mentions AS m \
                 MATCH (e:Entity {strategy: $strategy, entity_id: m.entity_id}) \
                 CREATE (e)-[:MENTIONED_IN]->(:ChunkRef {strategy: $strategy, origin: $origin, chunk_id: m.chunk_id})",
                json!({ "strategy": strategy, "origin": origin, "mentions": mentions }),
            ),
        ];

        self.run(statements).await?;
        debug!(
            strategy,
            origin,
            entities = fragment.entities.len(),
            relations = fragment.relations.len(),
            "Replaced origin graph in Neo4j"
        );
        Ok(())
    }

    async fn origin_fragment(&self, strategy: &str, origin: &str) -> Result<GraphFragment> {
        let scope = json!({ "strategy": strategy, "origin": origin });
        let mut results = self
            .run(vec![
                Statement::new(
                    format!(
                        "MATCH (e:Entity {{strategy: $strategy}}) WHERE $origin IN e.origins \
                         RETURN {} ORDER BY e.entity_id",
                        ENTITY_RETURN
                    ),
                    scope.clone(),
                ),
                Statement::new(
                    format!(
                        "MATCH (a:Entity {{strategy: $strategy}})-[r:REL {{origin: $origin}}]->(b:Entity {{strategy: $strategy}}) \
                         RETURN {} ORDER BY r.relation_id",
                        RELATION_RETURN
                    ),
                    scope.clone(),
                ),
                Statement::new(
                    "MATCH (e:Entity {strategy: $strategy})-[:MENTIONED_IN]->(c:ChunkRef {strategy: $strategy, origin: $origin}) \
                     RETURN e.entity_id, c.chunk_id ORDER BY e.entity_id, c.chunk_id",
                    scope,
                ),
            ])
            .await?
            .into_iter()
            .map(|result| result.data.into_iter().map(|d| d.row).collect::<Vec<_>>());

        let entities = results.next().unwrap_or_default();
        let relations = results.next().unwrap_or_default();
        let mentions = results.next().unwrap_or_default();
        Ok(GraphFragment {
            entities: entities
                .iter()
                .map(|row| GraphEntity {
                    origins: Vec::new(),
                    ..entity_from_row(row)
                })
                .collect(),
            relations: relations
                .iter()
                .map(|row| relation_from_row(row))
                .collect::<Result<_>>()?,
            mentions: mentions
                .iter()
                .map(|row| Mention {
                    entity_id: str_at(row, 0),
                    chunk_id: str_at(row, 1),
                })
                .collect(),
        })
    }

    async fn match_entities(&self, strategy: &str, text: &str) -> Result<Vec<GraphEntity>> {
        let haystack = normalize_name(text);
        let rows = self
            .rows(Statement::new(
                format!(
                    "MATCH (e:Entity {{strategy: $strategy}}) RETURN {}, e.norm_name ORDER BY e.name",
                    ENTITY_RETURN
                ),
                json!({ "strategy": strategy }),
            ))
            .await?;
        Ok(rows
            .iter()
            .filter(|row| contains_phrase(&haystack, &str_at(row, 5)))
            .map(|row| entity_from_row(row))
            .collect())
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

        // Variable-length bounds cannot be parameters
        let rows = self
            .rows(Statement::new(
                format!(
                    "MATCH (s:Entity {{strategy: $strategy}}) WHERE s.entity_id IN $seeds \
                     MATCH p = (s)-[:REL*0..{}]-(e:Entity {{strategy: $strategy}}) \
                     WHERE all(r IN relationships(p) WHERE {}) \
                     RETURN {}, min(length(p)) AS hops ORDER BY hops, e.name",
                    max_hops, VALID_AT_PREDICATE, ENTITY_RETURN
                ),
                json!({ "strategy": strategy, "seeds": seeds, "valid_at": valid_at }),
            ))
            .await?;

        let entities: Vec<(GraphEntity, u32)> = rows
            .iter()
            .map(|row| {
                let hops = row.get(5).and_then(Value::as_u64).unwrap_or(0) as u32;
                (entity_from_row(row), hops)
            })
            .collect();
        let ids: Vec<&str> = entities.iter().map(|(e, _)| e.entity_id.as_str()).collect();

        let relations = self
            .relation_rows(Statement::new(
                format!(
                    "MATCH (a:Entity {{strategy: $strategy}})-[r:REL]->(b:Entity {{strategy: $strategy}}) \
                     WHERE a.entity_id IN $ids AND b.entity_id IN $ids AND {} \
                     RETURN {} ORDER BY r.type, r.relation_id",
                    VALID_AT_PREDICATE, RELATION_RETURN
                ),
                json!({ "strategy": strategy, "ids": ids, "valid_at": valid_at }),
            ))
            .await?;

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
        let rows = self
            .rows(Statement::new(
                format!(
                    "MATCH (e:Entity {{strategy: $strategy}}) \
                     WHERE ($label IS NULL OR e.label = $label) AND ($name IS NULL OR e.norm_name = $name) \
                     RETURN {} ORDER BY e.name",
                    ENTITY_RETURN
                ),
                json!({
                    "strategy": strategy,
                    "label": label,
                    "name": name.map(normalize_name),
                }),
            ))
            .await?;
        Ok(rows.iter().map(|row| entity_from_row(row)).collect())
    }

    async fn relations(&self, strategy: &str, entity_id: &str) -> Result<Vec<GraphRelation>> {
        self.relation_rows(Statement::new(
            format!(
                "MATCH (a:Entity {{strategy: $strategy}})-[r:REL]->(b:Entity {{strategy: $strategy}}) \
                 WHERE a.entity_id = $id OR b.entity_id = $id \
                 RETURN {} ORDER BY r.type, r.relation_id",
                RELATION_RETURN
            ),
            json!({ "strategy": strategy, "id": entity_id }),
        ))
        .await
    }

    async fn mentions(&self, strategy: &str, entity_ids: &[String]) -> Result<Vec<Mention>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .rows(Statement::new(
                "MATCH (e:Entity {strategy: $strategy})-[:MENTIONED_IN]->(c:ChunkRef) \
                 WHERE e.entity_id IN $ids \
                 RETURN DISTINCT e.entity_id, c.chunk_id ORDER BY e.entity_id, c.chunk_id",
                json!({ "strategy": strategy, "ids": entity_ids }),
            ))
            .await?;
        Ok(rows
            .iter()
            .map(|row| Mention {
                entity_id: str_at(row, 0),
                chunk_id: str_at(row, 1),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(uri: &str) -> StoreConfig {
        StoreConfig {
            graph_backend: "neo4j".to_string(),
            neo4j_uri: uri.to_string(),
            neo4j_user: "neo4j".to_string(),
            neo4j_password_env: "RAGWEAVE_TEST_NEO4J_PASSWORD".to_string(),
            neo4j_database: "neo4j".to_string(),
            timeout_secs: 5,
        }
    }

    fn empty_results(n: usize) -> Value {
        let results: Vec<Value> = (0..n).map(|_| json!({"columns": [], "data": []})).collect();
        json!({ "results": results, "errors": [] })
    }

    #[test]
    fn test_bolt_uri_maps_to_http_endpoint() {
        let url = tx_endpoint("bolt://graph.local:7687", "neo4j").unwrap();
        assert_eq!(url.as_str(), "http://graph.local:7474/db/neo4j/tx/commit");
        let url = tx_endpoint("http://localhost:7474/", "people").unwrap();
        assert_eq!(url.as_str(), "http://localhost:7474/db/people/tx/commit");
    }

    #[tokio::test]
    async fn test_replace_origin_is_one_transaction() {
        let server = MockServer::start().await;
        std::env::set_var("RAGWEAVE_TEST_NEO4J_PASSWORD", "secret");
        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .and(header("authorization", "Basic bmVvNGo6c2VjcmV0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_results(7)))
            .expect(1)
            .mount(&server)
            .await;

        let store = Neo4jGraphStore::new(&config_for(&server.uri())).unwrap();
        let mut fragment = GraphFragment::default();
        let a = fragment.add_entity(GraphEntity::new("person", "Person", "Ali"));
        let b = fragment.add_entity(GraphEntity::new("city", "City", "Hawalli"));
        fragment.add_relation(GraphRelation::new("records/person/Ali", &a, "RESIDENT_OF", &b, None, None));
        store
            .replace_origin("lr", "records/person/Ali", &fragment)
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: Value = requests[0].body_json().unwrap();
        let statements = body["statements"].as_array().unwrap();
        assert_eq!(statements.len(), 7);
        assert_eq!(statements[4]["parameters"]["entities"].as_array().unwrap().len(), 2);
        assert_eq!(statements[5]["parameters"]["relations"][0]["type"], "RESIDENT_OF");
    }

    #[tokio::test]
    async fn test_deadlock_maps_to_write_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [],
                "errors": [{
                    "code": "Neo.TransientError.Transaction.DeadlockDetected",
                    "message": "deadlock"
                }]
            })))
            .mount(&server)
            .await;

        let store = Neo4jGraphStore::new(&config_for(&server.uri())).unwrap();
        let err = store
            .replace_origin("lr", "o", &GraphFragment::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreWriteConflict(_)));
    }

    #[tokio::test]
    async fn test_unreachable_and_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let store = Neo4jGraphStore::new(&config_for(&server.uri())).unwrap();
        let err = store.find_entities("lr", None, None).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnreachable(_)));

        let gone = {
            let server = MockServer::start().await;
            server.uri()
        };
        let store = Neo4jGraphStore::new(&config_for(&gone)).unwrap();
        let err = store.find_entities("lr", None, None).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_traverse_parses_rows() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("min(length(p))"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"columns": [], "data": [
                    {"row": ["e1", "Person", "Ali", "{\"gender\":\"male\"}", ["records/person/Ali"], 0]},
                    {"row": ["e2", "City", "Hawalli", "{}", ["records/person/Ali"], 1]}
                ]}],
                "errors": []
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("b.entity_id IN $ids"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"columns": [], "data": [
                    {"row": ["r1", "records/person/Ali", "e1", "e2", "RESIDENT_OF", true,
                             "2019-01-01T00:00:00+00:00", null, "{}", null]}
                ]}],
                "errors": []
            })))
            .mount(&server)
            .await;

        let store = Neo4jGraphStore::new(&config_for(&server.uri())).unwrap();
        let traversal = store.traverse("gr", &["e1".to_string()], 2, None).await.unwrap();
        assert_eq!(traversal.entities.len(), 2);
        assert_eq!(traversal.hops_of("e2"), Some(1));
        assert_eq!(traversal.entity("e1").unwrap().properties["gender"], "male");

        let relation = &traversal.relations[0];
        assert_eq!(relation.relation_type, "RESIDENT_OF");
        let validity = relation.validity.unwrap();
        assert!(validity.start.is_some());
        assert!(validity.end.is_none());

        let instant = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        store.traverse("gr", &["e1".to_string()], 2, Some(instant)).await.unwrap();
        let requests = server.received_requests().await.unwrap();
        let walk: Value = requests[2].body_json().unwrap();
        let statement = &walk["statements"][0];
        assert!(statement["statement"].as_str().unwrap().contains("all(r IN relationships(p)"));
        assert_eq!(statement["parameters"]["valid_at"], instant.to_rfc3339());
    }
}
