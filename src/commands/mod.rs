//! CLI commands implementation

pub mod ingest;
pub mod init;
pub mod query;
pub mod status;

pub use ingest::*;
pub use init::*;
pub use query::*;
pub use status::*;

use crate::config::Config;
use crate::error::Result;
use crate::provider::ProviderGateway;
use crate::store::Stores;
use crate::strategy::{Strategy, StrategyContext, StrategyKind};
use std::sync::Arc;

/// Open the stores and model backends behind one strategy
pub async fn open_strategy(config: &Config, kind: StrategyKind) -> Result<Strategy> {
    let stores = Stores::open(config).await?;
    let gateway = Arc::new(ProviderGateway::new(config)?);
    let context = StrategyContext::new(config, gateway, &stores);
    Ok(Strategy::new(kind, context))
}
