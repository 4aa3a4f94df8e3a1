//! Prompt text for the two agents

use crate::models::ContextItem;
use chrono::{DateTime, Utc};

pub const DOC_SYSTEM_PROMPT: &str = "\
You answer questions about software documentation.
Base every answer on the numbered context passages you are given and cite them as [n].
If the passages do not contain the answer, say that the indexed documentation does not cover it, \
then give your best general answer and mark it as such.";

pub const INHERITANCE_RETRIEVAL_PROMPT: &str = "\
You answer questions about an inheritance knowledge base of persons, their spouses and children, \
the properties they own, and the cities and countries involved.
Use only the numbered context passages you are given and cite them as [n].
Say so plainly when the passages do not settle the question.";

pub const INHERITANCE_TOOLS_PROMPT: &str = "\
You answer questions about an inheritance knowledge base held in a graph.

Nodes: Person, Property, City, Country.
Relations: PARENT_OF, SPOUSE_OF, RESIDENT_OF, BORN_IN, DIED_IN, OWNS, OWNED_BY, LOCATED_IN, \
HAS_PROPERTY, HAS_CITY, HAS_COUNTRY.

Look facts up with the tools before answering; do not rely on memory.
Names must match a node exactly, so list persons or properties first when unsure of spelling.
Use retrieve_person_inheritors for questions about heirs across generations.
Use retrieve_context for free-text questions the structured tools cannot express.
Name the persons and properties each statement is about, and say which facts came from which tool.
If a tool reports an error, correct the arguments or explain what could not be found.";

/// Sent before the last completion once the tool rounds are used up
pub const FINAL_ROUND_PROMPT: &str =
    "Tool budget exhausted. Answer now from the tool results above.";

fn source_label(item: &ContextItem) -> String {
    let mut label = item.provenance.origin.clone();
    if !item.provenance.heading_path.is_empty() {
        label.push_str(" > ");
        label.push_str(&item.provenance.heading_path.join(" > "));
    }
    label
}

/// Question plus numbered context passages
pub fn context_prompt(question: &str, items: &[ContextItem], as_of: Option<DateTime<Utc>>) -> String {
    let mut prompt = String::from("Context:\n");
    if items.is_empty() {
        prompt.push_str("(no matching passages were found)\n");
    }
    for (i, item) in items.iter().enumerate() {
        prompt.push_str(&format!("[{}] ({})\n{}\n\n", i + 1, source_label(item), item.text.trim()));
    }
    if let Some(instant) = as_of {
        prompt.push_str(&format!("Answer as of {}.\n", instant.format("%Y-%m-%d")));
    }
    prompt.push_str(&format!("Question: {}", question));
    prompt
}

pub fn tools_question(question: &str, as_of: Option<DateTime<Utc>>) -> String {
    match as_of {
        Some(instant) => format!(
            "{}\n\n(Answer as of {}; tool results are already limited to that date.)",
            question,
            instant.format("%Y-%m-%d")
        ),
        None => question.to_string(),
    }
}
