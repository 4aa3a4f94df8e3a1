//! Query command implementation

use super::open_strategy;
use crate::agent::{AgentKind, Answer, Orchestrator};
use crate::config::Config;
use crate::error::Result;
use crate::strategy::{parse_as_of, QueryRequest, StrategyKind};
use tracing::info;

/// Query options
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub agent: AgentKind,
    pub strategy: StrategyKind,
    /// Context items to retrieve (default: query.default_k)
    pub k: Option<usize>,
    /// RFC 3339, `YYYY-MM-DD`, `YYYY-MM` or `YYYY`
    pub as_of: Option<String>,
}

/// Build the strategy request; a malformed as-of time is rejected before any backend call
pub fn query_request(config: &Config, question: &str, options: &QueryOptions) -> Result<QueryRequest> {
    let request = QueryRequest::new(question, options.k.unwrap_or(config.query.default_k));
    match options.as_of.as_deref() {
        Some(raw) => Ok(request.as_of(parse_as_of(raw)?)),
        None => Ok(request),
    }
}

/// Answer a question through the agent's orchestrator
pub async fn cmd_query(config: &Config, question: &str, options: QueryOptions) -> Result<Answer> {
    let request = query_request(config, question, &options)?;
    info!(agent = %options.agent, strategy = %options.strategy, k = request.k, "Querying");

    let strategy = open_strategy(config, options.strategy).await?;
    let orchestrator = Orchestrator::new(options.agent, strategy, &config.agent)?;
    orchestrator.answer(&request).await
}

/// Print an answer and its sources to console
pub fn print_answer(question: &str, answer: &Answer) {
    println!("\n🔍 Question: {}\n", question);
    println!("{}\n", answer.text.trim());

    let mut footer = format!("Strategy: {} ({} mode", answer.strategy_name, answer.mode);
    if answer.tool_calls > 0 {
        footer.push_str(&format!(", {} tool calls", answer.tool_calls));
    }
    footer.push(')');
    if let Some(as_of) = answer.as_of {
        footer.push_str(&format!(", as of {}", as_of.format("%Y-%m-%d")));
    }
    println!("{}", footer);

    if answer.provenance.is_empty() {
        return;
    }
    println!("\nSources:");
    for (i, source) in answer.provenance.iter().enumerate() {
        let location = source.view_url.as_deref().unwrap_or(&source.origin);
        if source.heading_path.is_empty() {
            println!("  {}. {}", i + 1, location);
        } else {
            println!("  {}. {} ({})", i + 1, location, source.heading_path.join(" > "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn options(k: Option<usize>, as_of: Option<&str>) -> QueryOptions {
        QueryOptions {
            agent: AgentKind::Doc,
            strategy: StrategyKind::TemporalGraph,
            k,
            as_of: as_of.map(str::to_string),
        }
    }

    #[test]
    fn test_query_request_defaults_and_as_of() {
        let config = Config::default();
        let request = query_request(&config, "Who runs Acme?", &options(None, None)).unwrap();
        assert_eq!(request.k, config.query.default_k);
        assert!(request.as_of.is_none());

        let request = query_request(&config, "Who runs Acme?", &options(Some(3), Some("2020"))).unwrap();
        assert_eq!(request.k, 3);
        assert_eq!(request.as_of.unwrap().to_rfc3339(), "2020-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_bad_as_of_is_a_query_error() {
        let err = query_request(&Config::default(), "q", &options(None, Some("last spring"))).unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }
}
