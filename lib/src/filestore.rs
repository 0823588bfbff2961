//! Content-addressed storage of fetched resources.
//!
//! Every IRI maps to `{root}/{c1}/{c2}/{hash}.nt`, where `hash` is the
//! lowercase hex of the first 128 bits of the blake3 digest of the IRI,
//! `c1` is its last character and `c2` its second-to-last. The layout is
//! read by external tools and must stay stable.

use anyhow::{anyhow, Context, Result};
use log::debug;
use oxigraph::model::Graph as OxigraphGraph;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::consts::CONTENT_EXTENSION;
use crate::errors::StorageError;
use crate::util::graph_to_ntriples;

const HASH_BYTES: usize = 16;

/// Stable 32-character hex identifier of `iri`.
pub fn hash_iri(iri: &str) -> String {
    let digest = blake3::hash(iri.as_bytes());
    digest.as_bytes()[..HASH_BYTES]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn storage_error(path: &Path, cause: std::io::Error) -> anyhow::Error {
    anyhow!(StorageError {
        path: path.display().to_string(),
        cause,
    })
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn hash(&self, iri: &str) -> String {
        hash_iri(iri)
    }

    pub fn path_for(&self, iri: &str) -> PathBuf {
        let hash = hash_iri(iri);
        let mut chars = hash.chars().rev();
        // hex digests are never shorter than two characters
        let last = chars.next().unwrap_or('0');
        let second_last = chars.next().unwrap_or('0');
        self.dir
            .join(last.to_string())
            .join(second_last.to_string())
            .join(format!("{hash}.{CONTENT_EXTENSION}"))
    }

    /// Writes `content` for `iri`, replacing any previous file atomically.
    /// Empty content deletes the file instead.
    pub fn save(&self, iri: &str, content: &[u8]) -> Result<()> {
        let path = self.path_for(iri);
        if content.is_empty() {
            debug!("Empty content for {iri}; removing {}", path.display());
            return self.delete_path(&path);
        }
        let parent = path.parent().unwrap_or(&self.dir);
        fs::create_dir_all(parent).map_err(|e| storage_error(parent, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| storage_error(parent, e))?;
        tmp.write_all(content).map_err(|e| storage_error(&path, e))?;
        tmp.as_file().sync_all().map_err(|e| storage_error(&path, e))?;
        tmp.persist(&path).map_err(|e| storage_error(&path, e.error))?;
        debug!("Stored {iri} at {}", path.display());
        Ok(())
    }

    /// Serializes `graph` as N-Triples and saves it for `iri`.
    pub fn save_graph(&self, iri: &str, graph: &OxigraphGraph) -> Result<()> {
        let content = graph_to_ntriples(graph)
            .with_context(|| format!("Failed to serialize graph of {iri}"))?;
        self.save(iri, &content)
    }

    /// Deletes the file of `iri`; a missing file is not an error.
    pub fn delete_by_iri(&self, iri: &str) -> Result<()> {
        self.delete_path(&self.path_for(iri))
    }

    fn delete_path(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(path, e)),
        }
    }

    /// Hashes of all stored files, in directory order.
    pub fn hashes(&self) -> Result<Vec<String>> {
        Ok(self
            .content_files()?
            .into_iter()
            .filter_map(|path| hash_of(&path))
            .collect())
    }

    /// Deletes every stored file for which `predicate(hash)` is true and
    /// returns the number deleted.
    pub fn delete_if_matches<F>(&self, mut predicate: F) -> Result<usize>
    where
        F: FnMut(&str) -> bool,
    {
        let mut deleted = 0;
        for path in self.content_files()? {
            let Some(hash) = hash_of(&path) else {
                continue;
            };
            if predicate(&hash) {
                self.delete_path(&path)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn content_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.dir).follow_links(false) {
            let entry = entry.with_context(|| format!("Failed to walk {}", self.dir.display()))?;
            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(CONTENT_EXTENSION)
            {
                files.push(path.to_path_buf());
            }
        }
        Ok(files)
    }
}

fn hash_of(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.to_string())
}
