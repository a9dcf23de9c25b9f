#![warn(missing_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]

//! `kb-sync` maintains a per-user knowledge base of course materials: it schedules
//! freshness-based refreshes against two authenticated upstream sources, fans out
//! concurrent scrape workers while serializing login against a flaky IdP, and hands newly
//! downloaded files to a chunk/embed ingestion pipeline that upserts vector records.
//!
//! The top-level entry point is [`orchestrator::Orchestrator::update`].

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod freshness;
pub mod ingest;
pub mod metadata;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod upstream;

pub use crate::{
    error::{Error, Result},
    orchestrator::Orchestrator,
};

/// A boxed, `Send` future, used for trait methods returning async work across dynamic
/// dispatch boundaries (authenticators, document standardizers, vector store backends).
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
