//! Configuration of a mirroring pipeline, loaded from a JSON file.
//!
//! Durations are written in milliseconds (`*_ms` keys). Relative paths are
//! resolved against the directory of the configuration file.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{BufReader, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::batch::BatchOptions;
use crate::change::ChangeChecker;
use crate::consts::{DEFAULT_MAX_RETRY_COUNT, DEFAULT_REQUEST_TIMEOUT};
use crate::discover::Discoverer;
use crate::errors::ConfigError;
use crate::fetch::QueryFetcher;
use crate::options::{FetchMode, RequestMethod};
use crate::publish::PublishConfig;
use crate::retry::RetryPolicy;
use crate::sparql::QueryTemplate;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// SQLite file holding the queue, the registry and the run log.
    pub database: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default)]
    pub method: RequestMethod,
    #[serde(
        rename = "timeout_ms",
        with = "crate::util::duration_ms",
        default = "default_request_timeout"
    )]
    pub timeout: Duration,
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// How often a queued item may be put back after a failed fetch.
    pub max_retry_count: u32,
    /// Attempts and backoff for single page and resource requests.
    pub backoff: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            backoff: RetryPolicy::default(),
        }
    }
}

/// One independent sub-pipeline: its own discovery query and resource directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TopicConfig {
    pub name: String,
    pub resource_dir: PathBuf,
    /// SELECT query binding `?this`, with `?_limit` and `?_offset` placeholders.
    pub iterate_query: PathBuf,
    pub fetch: FetchMode,
    #[serde(default)]
    pub discover: crate::discover::DiscoverOptions,
    #[serde(default)]
    pub batch: BatchOptions,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChangeCheckConfig {
    /// SELECT query binding `?identifier` and `?isChanged`, with a
    /// `?_currentIdentifier` placeholder.
    pub query_file: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_max_batches_per_run")]
    pub max_batches_per_run: u32,
    pub topics: Vec<TopicConfig>,
    #[serde(default)]
    pub change_check: Option<ChangeCheckConfig>,
    #[serde(default)]
    pub publish: Option<PublishConfig>,
}

fn default_max_batches_per_run() -> u32 {
    1
}

fn config_error(message: impl Into<String>) -> anyhow::Error {
    anyhow!(ConfigError::new(message))
}

/// Lexically normalizes `path` so `a/./b` and `a/c/../b` compare equal.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Each topic sweeps its whole resource directory, so directories must not
/// be shared or nested.
fn check_resource_dirs(topics: &[TopicConfig]) -> Result<()> {
    let dirs: Vec<PathBuf> = topics.iter().map(|t| normalize(&t.resource_dir)).collect();
    for (i, a) in dirs.iter().enumerate() {
        for (j, b) in dirs.iter().enumerate().skip(i + 1) {
            if a.starts_with(b) || b.starts_with(a) {
                return Err(config_error(format!(
                    "topics {:?} and {:?} overlap: resource_dir {} and {} must be separate directories",
                    topics[i].name,
                    topics[j].name,
                    topics[i].resource_dir.display(),
                    topics[j].resource_dir.display()
                )));
            }
        }
    }
    Ok(())
}

impl PipelineConfig {
    pub fn save_to_file(&self, file: &Path) -> Result<()> {
        let config_str = serde_json::to_string_pretty(&self)?;
        let mut file = std::fs::File::create(file)?;
        file.write_all(config_str.as_bytes())?;
        Ok(())
    }

    /// Reads and validates a configuration file.
    pub fn from_file(file: &Path) -> Result<Self> {
        let reader = BufReader::new(
            std::fs::File::open(file)
                .with_context(|| format!("Failed to open config file {}", file.display()))?,
        );
        let mut config: PipelineConfig = serde_json::from_reader(reader)
            .map_err(|e| config_error(format!("{}: {e}", file.display())))?;
        if let Some(base) = file.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    /// Makes every relative path absolute with respect to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.store.database);
        for topic in &mut self.topics {
            resolve(&mut topic.resource_dir);
            resolve(&mut topic.iterate_query);
            if let FetchMode::Query { query_file } = &mut topic.fetch {
                resolve(query_file);
            }
        }
        if let Some(check) = &mut self.change_check {
            resolve(&mut check.query_file);
        }
        if let Some(publish) = &mut self.publish {
            if let Some(dir) = &mut publish.temp_dir {
                resolve(dir);
            }
        }
    }

    /// Checks values and query templates before any network or database I/O.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.endpoint.url)
            .map_err(|e| config_error(format!("invalid endpoint URL {:?}: {e}", self.endpoint.url)))?;
        if self.topics.is_empty() {
            return Err(config_error("at least one topic is required"));
        }
        if self.max_batches_per_run == 0 {
            return Err(config_error("max_batches_per_run must be at least 1"));
        }
        let mut names = HashSet::new();
        for topic in &self.topics {
            if topic.name.is_empty() {
                return Err(config_error("topic names must not be empty"));
            }
            if !names.insert(topic.name.as_str()) {
                return Err(config_error(format!("duplicate topic {:?}", topic.name)));
            }
            if topic.discover.page_size == 0 {
                return Err(config_error(format!("topic {:?}: page_size must be at least 1", topic.name)));
            }
            if topic.discover.max_consecutive_failures == 0 {
                return Err(config_error(format!(
                    "topic {:?}: max_consecutive_failures must be at least 1",
                    topic.name
                )));
            }
            if topic.batch.batch_size == 0 {
                return Err(config_error(format!("topic {:?}: batch_size must be at least 1", topic.name)));
            }
            if topic.batch.concurrency == 0 {
                return Err(config_error(format!("topic {:?}: concurrency must be at least 1", topic.name)));
            }
            QueryTemplate::from_file(&topic.iterate_query, Discoverer::REQUIRED)?;
            if let FetchMode::Query { query_file } = &topic.fetch {
                QueryTemplate::from_file(query_file, QueryFetcher::REQUIRED)?;
            }
        }
        check_resource_dirs(&self.topics)?;
        if let Some(check) = &self.change_check {
            QueryTemplate::from_file(&check.query_file, ChangeChecker::REQUIRED)?;
        }
        if let Some(publish) = &self.publish {
            Url::parse(&publish.graph_store_url).map_err(|e| {
                config_error(format!("invalid graph store URL {:?}: {e}", publish.graph_store_url))
            })?;
        }
        Ok(())
    }

    pub fn topic(&self, name: &str) -> Option<&TopicConfig> {
        self.topics.iter().find(|t| t.name == name)
    }

    /// Prints the configuration in a readable form for command line output.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  Database: {}", self.store.database.display());
        println!("  Endpoint: {} ({:?})", self.endpoint.url, self.endpoint.method);
        println!("  Max retry count: {}", self.retry.max_retry_count);
        println!("  Topics:");
        for topic in &self.topics {
            println!(
                "    - {} -> {} (page size {}, batch size {}, concurrency {})",
                topic.name,
                topic.resource_dir.display(),
                topic.discover.page_size,
                topic.batch.batch_size,
                topic.batch.concurrency
            );
        }
        if let Some(check) = &self.change_check {
            println!("  Change check: {}", check.query_file.display());
        }
        if let Some(publish) = &self.publish {
            println!("  Publish: graph {} at {}", publish.graph, publish.graph_store_url);
        }
    }
}
