//! Agent orchestration: turn a question into an answer through one strategy
//!
//! Two answer modes:
//! - retrieval: query the strategy up front, fold the ranked context into the
//!   prompt, complete once
//! - tools: offer the record graph lookups as callable tools and let the
//!   completion backend drive a bounded number of lookup rounds

mod prompts;
mod tools;

pub use tools::{tool_specs, RecordTools, ToolOutput};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::models::Provenance;
use crate::provider::{Message, ToolCall};
use crate::strategy::{QueryRequest, Strategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The agent personas the command surface knows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Documentation agent over repository markdown
    Doc,
    /// Inheritance agent over person and property records
    #[serde(rename = "inh")]
    Inheritance,
}

impl AgentKind {
    pub fn code(&self) -> &'static str {
        match self {
            AgentKind::Doc => "doc",
            AgentKind::Inheritance => "inh",
        }
    }

    pub fn answer_mode(&self, config: &AgentConfig) -> AnswerMode {
        match self {
            AgentKind::Doc => config.doc_mode,
            AgentKind::Inheritance => config.inheritance_mode,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for AgentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "doc" => Ok(AgentKind::Doc),
            "inh" | "inheritance" => Ok(AgentKind::Inheritance),
            other => Err(Error::Config(format!(
                "Unknown agent '{}'; expected doc or inh",
                other
            ))),
        }
    }
}

/// How context reaches the completion backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerMode {
    Retrieval,
    Tools,
}

impl std::fmt::Display for AnswerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnswerMode::Retrieval => write!(f, "retrieval"),
            AnswerMode::Tools => write!(f, "tools"),
        }
    }
}

/// A completed answer with the sources it drew on
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub provenance: Vec<Provenance>,
    pub strategy_name: String,
    pub mode: AnswerMode,
    /// Tool invocations made while answering; zero in retrieval mode
    pub tool_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_of: Option<DateTime<Utc>>,
}

fn merge_provenance(into: &mut Vec<Provenance>, from: Vec<Provenance>) {
    for item in from {
        if !into.contains(&item) {
            into.push(item);
        }
    }
}

/// Answers questions for one agent over one strategy
pub struct Orchestrator {
    agent: AgentKind,
    mode: AnswerMode,
    strategy: Strategy,
    max_tool_rounds: usize,
    tool_timeout: Duration,
    max_inheritor_depth: usize,
}

impl Orchestrator {
    /// Tools mode needs graph state, so it is refused for the naive strategy
    pub fn new(agent: AgentKind, strategy: Strategy, config: &AgentConfig) -> Result<Self> {
        let mode = agent.answer_mode(config);
        if mode == AnswerMode::Tools && !strategy.kind().uses_graph() {
            return Err(Error::Config(format!(
                "Agent '{}' answers with tools, which needs a graph strategy; '{}' keeps no graph",
                agent,
                strategy.name()
            )));
        }
        Ok(Self {
            agent,
            mode,
            strategy,
            max_tool_rounds: config.max_tool_rounds,
            tool_timeout: Duration::from_secs(config.tool_timeout_secs.max(1)),
            max_inheritor_depth: config.max_inheritor_depth,
        })
    }

    pub fn mode(&self) -> AnswerMode {
        self.mode
    }

    pub async fn answer(&self, request: &QueryRequest) -> Result<Answer> {
        info!(
            agent = %self.agent,
            strategy = %self.strategy.name(),
            mode = %self.mode,
            "Answering question"
        );
        match self.mode {
            AnswerMode::Retrieval => self.answer_from_context(request).await,
            AnswerMode::Tools => self.answer_with_tools(request).await,
        }
    }

    fn system_prompt(&self) -> &'static str {
        match (self.agent, self.mode) {
            (AgentKind::Doc, _) => prompts::DOC_SYSTEM_PROMPT,
            (AgentKind::Inheritance, AnswerMode::Retrieval) => prompts::INHERITANCE_RETRIEVAL_PROMPT,
            (AgentKind::Inheritance, AnswerMode::Tools) => prompts::INHERITANCE_TOOLS_PROMPT,
        }
    }

    fn finish(&self, text: String, provenance: Vec<Provenance>, tool_calls: usize, request: &QueryRequest) -> Answer {
        Answer {
            text,
            provenance,
            strategy_name: self.strategy.name().to_string(),
            mode: self.mode,
            tool_calls,
            as_of: request.as_of.filter(|_| self.strategy.kind().is_temporal()),
        }
    }

    async fn answer_from_context(&self, request: &QueryRequest) -> Result<Answer> {
        let result = self.strategy.query(request).await?;
        debug!(items = result.context_items.len(), "Retrieved context");

        let messages = [
            Message::system(self.system_prompt()),
            Message::user(prompts::context_prompt(
                &request.question,
                &result.context_items,
                result.as_of,
            )),
        ];
        let completion = self.strategy.context().gateway.complete(&messages, &[]).await?;
        Ok(self.finish(completion.text, result.provenance(), 0, request))
    }

    /// Run one tool call under the timeout
    ///
    /// Bad arguments and unknown names go back to the model as the tool's reply.
    /// Provider and store failures, and timeouts, fail the whole answer.
    async fn run_tool(&self, tools: &RecordTools<'_>, call: &ToolCall) -> Result<ToolOutput> {
        match tokio::time::timeout(self.tool_timeout, tools.call(&call.name, &call.arguments)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(Error::Query(reason))) => {
                debug!(tool = %call.name, %reason, "Tool call rejected");
                Ok(ToolOutput {
                    content: format!("error: {}", reason),
                    provenance: Vec::new(),
                })
            }
            Ok(Err(e)) => {
                warn!(tool = %call.name, error = %e, "Tool call failed");
                Err(e)
            }
            Err(_) => {
                warn!(tool = %call.name, timeout_secs = self.tool_timeout.as_secs(), "Tool call timed out");
                Err(Error::Query(format!(
                    "tool '{}' timed out after {}s",
                    call.name,
                    self.tool_timeout.as_secs()
                )))
            }
        }
    }

    async fn answer_with_tools(&self, request: &QueryRequest) -> Result<Answer> {
        if request.question.trim().is_empty() {
            return Err(Error::Query("question is empty".to_string()));
        }
        let gateway = &self.strategy.context().gateway;
        let tools = RecordTools::new(&self.strategy, self.max_inheritor_depth).as_of(request.as_of);
        let specs = tool_specs();

        let mut messages = vec![
            Message::system(self.system_prompt()),
            Message::user(prompts::tools_question(&request.question, request.as_of)),
        ];
        let mut provenance = Vec::new();
        let mut calls_made = 0;

        for round in 0..self.max_tool_rounds {
            let completion = gateway.complete(&messages, &specs).await?;
            if completion.tool_calls.is_empty() {
                return Ok(self.finish(completion.text, provenance, calls_made, request));
            }
            debug!(round, calls = completion.tool_calls.len(), "Completion requested tools");

            messages.push(Message::assistant_with_tools(
                completion.text,
                completion.tool_calls.clone(),
            ));
            for call in &completion.tool_calls {
                let output = self.run_tool(&tools, call).await?;
                calls_made += 1;
                merge_provenance(&mut provenance, output.provenance);
                messages.push(Message::tool_result(&call.id, output.content));
            }
        }

        info!(rounds = self.max_tool_rounds, "Tool rounds exhausted, asking for a final answer");
        messages.push(Message::user(prompts::FINAL_ROUND_PROMPT));
        let completion = gateway.complete(&messages, &[]).await?;
        Ok(self.finish(completion.text, provenance, calls_made, request))
    }
}
