//! Plain vector similarity over chunk embeddings

use super::{Derived, QueryRequest, StrategyContext, StrategyKind};
use crate::error::Result;
use crate::models::{QueryResult, SourceDocument};
use tracing::debug;

pub struct NaiveStrategy {
    context: StrategyContext,
}

impl NaiveStrategy {
    pub fn new(context: StrategyContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &StrategyContext {
        &self.context
    }

    pub(super) async fn derive(&self, doc: &SourceDocument) -> Result<Derived> {
        let (chunks, vectors) = self.context.chunk_and_embed(doc).await?;
        Ok(Derived {
            chunks,
            vectors,
            fragment: None,
        })
    }

    pub(super) async fn query(&self, request: &QueryRequest) -> Result<QueryResult> {
        let name = StrategyKind::Naive.name();
        if request.as_of.is_some() {
            debug!(strategy = name, "Ignoring as-of time for a non-temporal strategy");
        }

        let query_vector = self.context.gateway.embed_one(&request.question).await?;
        let context_items = self
            .context
            .similar_chunks(name, &query_vector, request.k)
            .await?;
        debug!(strategy = name, items = context_items.len(), "Naive query");

        Ok(QueryResult {
            context_items,
            strategy_name: name.to_string(),
            as_of: None,
        })
    }
}
