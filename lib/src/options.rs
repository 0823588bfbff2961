//! Shared option types that replace boolean and stringly-typed parameters in the Rust API.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// HTTP method used to send SPARQL queries.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Get,
    #[default]
    Post,
}

/// Credentials attached to dereference requests.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Credentials {
    /// HTTP basic authentication; the only supported scheme for now.
    BasicAuth { username: String, password: String },
}

/// Extra request headers, kept ordered so logs and config dumps are stable.
pub type Headers = BTreeMap<String, String>;

/// How the resource behind a queued IRI is retrieved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FetchMode {
    /// Dereference the IRI over HTTP with content negotiation.
    Dereference {
        #[serde(default)]
        credentials: Option<Credentials>,
        #[serde(default)]
        headers: Headers,
    },
    /// Run a CONSTRUCT query with the IRI substituted for `?_iri`.
    Query { query_file: std::path::PathBuf },
}
