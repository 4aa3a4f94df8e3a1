//! ragweave - multi-strategy retrieval-augmented generation
//!
//! This crate provides:
//! - Ingestion of repository markdown and person/property records through one pipeline
//! - Three interchangeable retrieval strategies: naive vector, hybrid graph+vector,
//!   and temporal knowledge graph
//! - A provider gateway over OpenAI-compatible, Anthropic and Ollama backends
//! - Agent orchestration that answers from retrieved context or through graph lookup tools

pub mod agent;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod error;
pub mod ingest;
pub mod models;
pub mod progress;
pub mod provider;
pub mod store;
pub mod strategy;
pub mod walker;

pub use config::Config;
pub use error::{Error, Result};
