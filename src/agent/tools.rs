//! Structured lookups over the record graph, offered to the completion backend as tools

use crate::error::{Error, Result};
use crate::models::{GraphEntity, GraphRelation, Provenance};
use crate::provider::ToolSpec;
use crate::store::{GraphStore, Traversal};
use crate::strategy::{describe_relation, select_relations, QueryRequest, Strategy};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::debug;

const PERSON: &str = "Person";
const PROPERTY: &str = "Property";
const CITY: &str = "City";
const COUNTRY: &str = "Country";

const DEFAULT_CONTEXT_K: usize = 5;

/// What a tool hands back to the model, plus where it came from
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub content: String,
    pub provenance: Vec<Provenance>,
}

fn spec(name: &str, description: &str, arguments: &[(&str, &str)]) -> ToolSpec {
    let properties: Map<String, Value> = arguments
        .iter()
        .map(|(arg, about)| (arg.to_string(), json!({"type": "string", "description": about})))
        .collect();
    let required: Vec<&str> = arguments.iter().map(|(arg, _)| *arg).collect();
    ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        parameters: json!({
            "type": "object",
            "properties": properties,
            "required": required
        }),
    }
}

/// Tool definitions for the inheritance agent
pub fn tool_specs() -> Vec<ToolSpec> {
    const PERSON_ARG: (&str, &str) = ("name", "Exact person name");
    const PROPERTY_ARG: (&str, &str) = ("name", "Exact property name");

    let mut specs = vec![
        spec("retrieve_persons", "List every person in the knowledge graph.", &[]),
        spec("retrieve_properties", "List every property in the knowledge graph.", &[]),
        spec("retrieve_countries", "List every country in the knowledge graph.", &[]),
        spec("retrieve_cities", "List every city in the knowledge graph.", &[]),
        spec(
            "retrieve_properties_in_country",
            "List the properties located in a country.",
            &[("country", "Exact country name")],
        ),
        spec(
            "retrieve_properties_in_city",
            "List the properties located in a city.",
            &[("city", "Exact city name")],
        ),
        spec("retrieve_person_details", "Attributes recorded for a person.", &[PERSON_ARG]),
        spec(
            "retrieve_person_relationships",
            "Every relation touching a person: family, residence, birth, death and ownership.",
            &[PERSON_ARG],
        ),
        spec("retrieve_person_spouses", "Spouses of a person.", &[PERSON_ARG]),
        spec("retrieve_person_children", "Children of a person.", &[PERSON_ARG]),
        spec("retrieve_person_grand_children", "Grandchildren of a person.", &[PERSON_ARG]),
        spec(
            "retrieve_person_inheritors",
            "Descendants of a person across generations, each with its generation number.",
            &[PERSON_ARG],
        ),
        spec("retrieve_property_details", "Attributes recorded for a property.", &[PROPERTY_ARG]),
        spec(
            "retrieve_property_relationships",
            "Every relation touching a property: owners and location.",
            &[PROPERTY_ARG],
        ),
        spec(
            "retrieve_by_property_n_country",
            "Relations of a property, provided it is located in the given country.",
            &[PROPERTY_ARG, ("country", "Exact country name")],
        ),
        spec(
            "retrieve_by_country",
            "Every relation touching a country.",
            &[("country", "Exact country name")],
        ),
        spec("retrieve_by_city", "Every relation touching a city.", &[("city", "Exact city name")]),
    ];

    let mut context = spec(
        "retrieve_context",
        "Free-text search over the indexed records; returns ranked passages.",
        &[("query", "What to search for")],
    );
    context.parameters["properties"]["k"] = json!({
        "type": "integer",
        "description": "Maximum number of passages (default: 5)",
        "minimum": 1
    });
    specs.push(context);
    specs
}

fn text_arg(arguments: &Map<String, Value>, key: &str) -> Result<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Query(format!("missing argument '{}'", key)))
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::Query("tool arguments must be a JSON object".to_string())),
        Err(e) => Err(Error::Query(format!("tool arguments are not valid JSON: {}", e))),
    }
}

fn push_unique(provenance: &mut Vec<Provenance>, item: Provenance) {
    if !provenance.contains(&item) {
        provenance.push(item);
    }
}

fn entity_provenance(entities: &[&GraphEntity]) -> Vec<Provenance> {
    let mut provenance = Vec::new();
    for origin in entities.iter().flat_map(|e| e.origins.iter()) {
        push_unique(&mut provenance, Provenance::origin_only(origin));
    }
    provenance
}

fn relation_provenance(relations: &[GraphRelation]) -> Vec<Provenance> {
    let mut provenance = Vec::new();
    for relation in relations {
        push_unique(
            &mut provenance,
            Provenance {
                chunk_id: relation.chunk_id.clone(),
                ..Provenance::origin_only(&relation.origin)
            },
        );
    }
    provenance
}

fn names_output(entities: &[&GraphEntity]) -> Result<ToolOutput> {
    let names: Vec<&str> = entities.iter().map(|e| e.name.as_str()).collect();
    Ok(ToolOutput {
        content: serde_json::to_string(&names)?,
        provenance: entity_provenance(entities),
    })
}

/// One entity and the relations touching it
struct Neighbourhood {
    entity: GraphEntity,
    traversal: Traversal,
}

impl Neighbourhood {
    /// Entities linked by `relation_type`; `outgoing` picks the direction, `None` accepts both
    fn linked(&self, relation_type: &str, outgoing: Option<bool>) -> Vec<&GraphEntity> {
        let id = &self.entity.entity_id;
        let mut seen = HashSet::new();
        self.traversal
            .relations
            .iter()
            .filter(|r| r.relation_type == relation_type)
            .filter_map(|r| match outgoing {
                Some(true) if &r.source_entity_id == id => Some(&r.target_entity_id),
                Some(false) if &r.target_entity_id == id => Some(&r.source_entity_id),
                None if &r.source_entity_id == id => Some(&r.target_entity_id),
                None if &r.target_entity_id == id => Some(&r.source_entity_id),
                _ => None,
            })
            .filter(|other| seen.insert(other.to_string()))
            .filter_map(|other| self.traversal.entity(other))
            .collect()
    }

    fn facts(&self) -> ToolOutput {
        let lines: Vec<String> = self
            .traversal
            .relations
            .iter()
            .map(|r| describe_relation(r, &self.traversal))
            .collect();
        ToolOutput {
            content: if lines.is_empty() {
                format!("No relations recorded for {}.", self.entity.name)
            } else {
                lines.join("\n")
            },
            provenance: relation_provenance(&self.traversal.relations),
        }
    }
}

/// Lookups against the graph state of one strategy
pub struct RecordTools<'a> {
    strategy: &'a Strategy,
    max_depth: usize,
    as_of: Option<DateTime<Utc>>,
    default_k: usize,
}

impl<'a> RecordTools<'a> {
    pub fn new(strategy: &'a Strategy, max_depth: usize) -> Self {
        Self {
            strategy,
            max_depth: max_depth.max(1),
            as_of: None,
            default_k: DEFAULT_CONTEXT_K,
        }
    }

    /// Limit temporal relations to those holding at `as_of`
    pub fn as_of(mut self, as_of: Option<DateTime<Utc>>) -> Self {
        self.as_of = as_of;
        self
    }

    fn graph(&self) -> &dyn GraphStore {
        self.strategy.context().graph.as_ref()
    }

    /// Run one tool call; unknown tools and bad arguments are errors
    pub async fn call(&self, name: &str, arguments: &str) -> Result<ToolOutput> {
        let args = parse_arguments(arguments)?;
        debug!(tool = name, arguments, "Running tool");
        match name {
            "retrieve_persons" => self.list(PERSON).await,
            "retrieve_properties" => self.list(PROPERTY).await,
            "retrieve_countries" => self.list(COUNTRY).await,
            "retrieve_cities" => self.list(CITY).await,
            "retrieve_properties_in_country" => {
                self.linked(COUNTRY, &text_arg(&args, "country")?, "HAS_PROPERTY", Some(true)).await
            }
            "retrieve_properties_in_city" => {
                self.linked(CITY, &text_arg(&args, "city")?, "HAS_PROPERTY", Some(true)).await
            }
            "retrieve_person_details" => self.details(PERSON, &text_arg(&args, "name")?).await,
            "retrieve_person_relationships" => {
                Ok(self.neighbourhood(PERSON, &text_arg(&args, "name")?).await?.facts())
            }
            "retrieve_person_spouses" => {
                self.linked(PERSON, &text_arg(&args, "name")?, "SPOUSE_OF", None).await
            }
            "retrieve_person_children" => {
                self.linked(PERSON, &text_arg(&args, "name")?, "PARENT_OF", Some(true)).await
            }
            "retrieve_person_grand_children" => {
                self.grand_children(&text_arg(&args, "name")?).await
            }
            "retrieve_person_inheritors" => self.inheritors(&text_arg(&args, "name")?).await,
            "retrieve_property_details" => self.details(PROPERTY, &text_arg(&args, "name")?).await,
            "retrieve_property_relationships" => {
                Ok(self.neighbourhood(PROPERTY, &text_arg(&args, "name")?).await?.facts())
            }
            "retrieve_by_property_n_country" => {
                self.property_in_country(&text_arg(&args, "name")?, &text_arg(&args, "country")?)
                    .await
            }
            "retrieve_by_country" => {
                Ok(self.neighbourhood(COUNTRY, &text_arg(&args, "country")?).await?.facts())
            }
            "retrieve_by_city" => {
                Ok(self.neighbourhood(CITY, &text_arg(&args, "city")?).await?.facts())
            }
            "retrieve_context" => {
                let k = args
                    .get("k")
                    .and_then(Value::as_u64)
                    .map(|k| k as usize)
                    .unwrap_or(self.default_k);
                self.context(&text_arg(&args, "query")?, k).await
            }
            other => Err(Error::Query(format!("unknown tool '{}'", other))),
        }
    }

    async fn list(&self, label: &str) -> Result<ToolOutput> {
        let entities = self.graph().find_entities(self.strategy.name(), Some(label), None).await?;
        names_output(&entities.iter().collect::<Vec<_>>())
    }

    async fn entity(&self, label: &str, name: &str) -> Result<GraphEntity> {
        self.graph()
            .find_entities(self.strategy.name(), Some(label), Some(name))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Query(format!("no {} named '{}'", label.to_lowercase(), name)))
    }

    async fn around(&self, entity: GraphEntity) -> Result<Neighbourhood> {
        let mut traversal = self
            .graph()
            .traverse(
                self.strategy.name(),
                std::slice::from_ref(&entity.entity_id),
                1,
                self.as_of.filter(|_| self.strategy.kind().is_temporal()),
            )
            .await?;
        let id = entity.entity_id.as_str();
        traversal
            .relations
            .retain(|r| r.source_entity_id == id || r.target_entity_id == id);
        if self.strategy.kind().is_temporal() {
            traversal.relations = select_relations(std::mem::take(&mut traversal.relations), self.as_of);
        }
        Ok(Neighbourhood { entity, traversal })
    }

    async fn neighbourhood(&self, label: &str, name: &str) -> Result<Neighbourhood> {
        let entity = self.entity(label, name).await?;
        self.around(entity).await
    }

    async fn details(&self, label: &str, name: &str) -> Result<ToolOutput> {
        let entity = self.entity(label, name).await?;
        let content = serde_json::to_string(&json!({
            "name": entity.name,
            "label": entity.label,
            "properties": entity.properties,
        }))?;
        Ok(ToolOutput {
            content,
            provenance: entity_provenance(&[&entity]),
        })
    }

    async fn linked(
        &self,
        label: &str,
        name: &str,
        relation_type: &str,
        outgoing: Option<bool>,
    ) -> Result<ToolOutput> {
        let hood = self.neighbourhood(label, name).await?;
        names_output(&hood.linked(relation_type, outgoing))
    }

    /// Descendants by generation, breadth first, at most `max_depth` generations down
    async fn descendants(&self, name: &str) -> Result<Vec<(GraphEntity, usize)>> {
        let root = self.entity(PERSON, name).await?;
        let mut seen: HashSet<String> = HashSet::from([root.entity_id.clone()]);
        let mut frontier = vec![root];
        let mut found = Vec::new();

        for generation in 1..=self.max_depth {
            let mut next = Vec::new();
            for parent in frontier {
                let hood = self.around(parent).await?;
                for child in hood.linked("PARENT_OF", Some(true)) {
                    if seen.insert(child.entity_id.clone()) {
                        next.push(child.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            found.extend(next.iter().cloned().map(|child| (child, generation)));
            frontier = next;
        }
        Ok(found)
    }

    async fn grand_children(&self, name: &str) -> Result<ToolOutput> {
        let descendants = self.descendants(name).await?;
        let grand: Vec<&GraphEntity> = descendants
            .iter()
            .filter(|(_, generation)| *generation == 2)
            .map(|(entity, _)| entity)
            .collect();
        names_output(&grand)
    }

    async fn inheritors(&self, name: &str) -> Result<ToolOutput> {
        let descendants = self.descendants(name).await?;
        let listed: Vec<Value> = descendants
            .iter()
            .map(|(entity, generation)| json!({"name": entity.name, "generation": generation}))
            .collect();
        let entities: Vec<&GraphEntity> = descendants.iter().map(|(e, _)| e).collect();
        Ok(ToolOutput {
            content: serde_json::to_string(&listed)?,
            provenance: entity_provenance(&entities),
        })
    }

    async fn property_in_country(&self, property: &str, country: &str) -> Result<ToolOutput> {
        let country = self.entity(COUNTRY, country).await?;
        let hood = self.neighbourhood(PROPERTY, property).await?;
        let located = hood
            .linked("LOCATED_IN", Some(true))
            .iter()
            .any(|place| place.entity_id == country.entity_id);
        if !located {
            return Err(Error::Query(format!(
                "property '{}' is not located in {}",
                hood.entity.name, country.name
            )));
        }
        Ok(hood.facts())
    }

    async fn context(&self, query: &str, k: usize) -> Result<ToolOutput> {
        let mut request = QueryRequest::new(query, k.max(1));
        request.as_of = self.as_of;
        let result = self.strategy.query(&request).await?;
        let content = if result.context_items.is_empty() {
            "No matching passages.".to_string()
        } else {
            result
                .context_items
                .iter()
                .enumerate()
                .map(|(i, item)| format!("[{}] {}", i + 1, item.text.trim()))
                .collect::<Vec<_>>()
                .join("\n")
        };
        Ok(ToolOutput {
            content,
            provenance: result.provenance(),
        })
    }
}
