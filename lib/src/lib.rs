//! `graphmirror` keeps a local mirror of resources discovered through a SPARQL
//! endpoint and publishes it to a remote triple store.
//!
//! A run pages through a discovery query into a durable [`queue::WorkQueue`],
//! fetches queued IRIs in bounded batches into a content-addressed
//! [`filestore::ContentStore`], tracks the live set in a [`registry::Registry`]
//! and, once every queue is drained, removes stale files and publishes the
//! mirror. State lives in SQLite, so a killed run resumes where it stopped.
//! [`orchestrator::Pipeline`] ties the pieces together.

pub mod batch;
pub mod change;
pub mod config;
pub mod consts;
pub mod datastore;
pub mod discover;
pub mod errors;
pub mod fetch;
pub mod filestore;
pub mod migrations;
pub mod options;
pub mod orchestrator;
pub mod progress;
pub mod publish;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod runs;
pub mod sparql;
pub mod util;
pub mod workflow;

pub use config::PipelineConfig;
pub use datastore::Datastore;
pub use orchestrator::{Pipeline, RunSummary, Status};
pub use progress::{CollectingSink, EventSink, LogSink, PipelineEvent};
