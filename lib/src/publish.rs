//! Publishing the mirror to a remote triple store.
//!
//! [`GraphStorePublisher`] gathers every `*.nt` and `*.ttl` file below the
//! resource directories into one N-Triples upload, replaces the target graph
//! with it through the SPARQL 1.1 Graph Store protocol, and then asks the
//! query service to resynchronise.

use anyhow::{anyhow, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use log::{info, warn};
use oxigraph::io::RdfFormat;
use reqwest::blocking::{Body, Client};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;
use walkdir::WalkDir;

use crate::consts::N_TRIPLES;
use crate::errors::{ConfigError, PublishConflictError};
use crate::util::{graph_to_ntriples, parse_graph};

pub trait Publisher: Send + Sync {
    fn publish(&self, dirs: &[PathBuf]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Graph Store protocol endpoint, e.g. `https://store.example.org/rdf-graph-store`.
    pub graph_store_url: String,
    /// Name of the graph that is replaced on every publish.
    pub graph: String,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub token: Option<String>,
    /// Called with `POST` after the upload so the query service picks up the new data.
    #[serde(default)]
    pub restart_url: Option<String>,
    #[serde(default = "default_publish_timeout_ms")]
    pub timeout_ms: u64,
    /// Directory for the temporary upload file; the system default when unset.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

fn default_publish_timeout_ms() -> u64 {
    10 * 60 * 1000
}

/// Matches the RDF files that make up the mirror.
pub fn rdf_file_globs() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    builder.add(Glob::new("**/*.nt")?);
    builder.add(Glob::new("**/*.ttl")?);
    Ok(builder.build()?)
}

/// Every RDF file below `dir`, sorted for reproducible uploads.
pub fn collect_rdf_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let globs = rdf_file_globs()?;
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in WalkDir::new(dir) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        if globs.is_match(rel) {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Writes all `files` into `out` as one N-Triples document.
fn concatenate_ntriples(files: &[PathBuf], out: &mut File) -> Result<()> {
    for file in files {
        let bytes = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
        let bytes = if file.extension().and_then(|e| e.to_str()) == Some("ttl") {
            let graph = parse_graph(&bytes, RdfFormat::Turtle, None)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            graph_to_ntriples(&graph)?
        } else {
            bytes
        };
        if bytes.is_empty() {
            continue;
        }
        out.write_all(&bytes)?;
        if !bytes.ends_with(b"\n") {
            out.write_all(b"\n")?;
        }
    }
    out.flush()?;
    Ok(())
}

fn conflict_or_error(target: &str, status: StatusCode, body: String) -> anyhow::Error {
    if status == StatusCode::CONFLICT || status == StatusCode::LOCKED {
        anyhow!(PublishConflictError {
            target: target.to_string(),
            status: status.as_u16(),
            message: body,
        })
    } else {
        anyhow!("{target} returned HTTP {status}: {body}")
    }
}

pub struct GraphStorePublisher {
    client: Client,
    config: PublishConfig,
}

impl GraphStorePublisher {
    pub fn new(config: PublishConfig) -> Result<Self> {
        Url::parse(&config.graph_store_url).map_err(|e| {
            anyhow!(ConfigError::new(format!(
                "invalid graph store URL {:?}: {e}",
                config.graph_store_url
            )))
        })?;
        if let Some(restart) = &config.restart_url {
            Url::parse(restart).map_err(|e| {
                anyhow!(ConfigError::new(format!(
                    "invalid restart URL {restart:?}: {e}"
                )))
            })?;
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    fn upload(&self, mut file: File, size: u64) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        info!(
            "Uploading {} to graph \"{}\"",
            pretty_bytes::converter::convert(size as f64),
            self.config.graph
        );
        let mut request = self
            .client
            .put(&self.config.graph_store_url)
            .query(&[("graph", self.config.graph.as_str())])
            .header(CONTENT_TYPE, N_TRIPLES)
            .body(Body::sized(file, size));
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let resp = request.send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(conflict_or_error(&self.config.graph_store_url, status, body));
        }
        Ok(())
    }

    fn restart(&self, url: &str) -> Result<()> {
        info!("Restarting query service at {url}");
        let mut request = self.client.post(url);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let resp = request.send()?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().unwrap_or_default();
        if body.contains("not out of sync") {
            info!("Query service is already in sync");
            return Ok(());
        }
        Err(conflict_or_error(url, status, body))
    }
}

impl Publisher for GraphStorePublisher {
    fn publish(&self, dirs: &[PathBuf]) -> Result<()> {
        let mut files = Vec::new();
        for dir in dirs {
            files.extend(collect_rdf_files(dir)?);
        }
        if files.is_empty() {
            warn!("No files found to publish in {:?}", dirs);
            return Ok(());
        }

        let mut tmp = match &self.config.temp_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                tempfile::NamedTempFile::new_in(dir)?
            }
            None => tempfile::NamedTempFile::new()?,
        };
        info!(
            "Creating \"{}\" from {} files",
            tmp.path().display(),
            files.len()
        );
        concatenate_ntriples(&files, tmp.as_file_mut())?;
        let size = tmp.as_file().metadata()?.len();
        if size == 0 {
            warn!("Cannot publish graph \"{}\": all files are empty", self.config.graph);
            return Ok(());
        }

        self.upload(tmp.reopen()?, size)?;
        if let Some(url) = &self.config.restart_url {
            self.restart(url)?;
        }
        info!("Published graph \"{}\"", self.config.graph);
        Ok(())
    }
}
