//! SPARQL endpoint access and query templates.
//!
//! Templates use placeholder variables such as `?_limit` that are replaced
//! textually before a query is sent. A template is checked for its required
//! placeholders when it is loaded, so a broken template is reported before
//! any request goes out.

use anyhow::{anyhow, Context, Result};
use log::debug;
use oxigraph::io::RdfFormat;
use oxigraph::model::Graph as OxigraphGraph;
use regex::{NoExpand, Regex};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::consts::{N_TRIPLES, SPARQL_RESULTS_JSON, TURTLE};
use crate::errors::ConfigError;
use crate::options::RequestMethod;
use crate::util::parse_graph;

/// A query with placeholder variables.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTemplate {
    text: String,
    source: Option<PathBuf>,
}

fn placeholder_regex(placeholder: &str) -> Result<Regex> {
    Regex::new(&format!(r"{}\b", regex::escape(placeholder)))
        .with_context(|| format!("Invalid placeholder {placeholder}"))
}

impl QueryTemplate {
    /// Wraps `text`, failing with a [`ConfigError`] if any of `required` is
    /// missing. Required entries may be placeholders or result variables.
    pub fn new(text: impl Into<String>, required: &[&str]) -> Result<Self> {
        Self::build(text.into(), None, required)
    }

    pub fn from_file(path: &Path, required: &[&str]) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            anyhow!(ConfigError::new(format!(
                "cannot read query file {}: {e}",
                path.display()
            )))
        })?;
        Self::build(text, Some(path.to_path_buf()), required)
    }

    fn build(text: String, source: Option<PathBuf>, required: &[&str]) -> Result<Self> {
        let mut missing = Vec::new();
        for token in required {
            if !placeholder_regex(token)?.is_match(&text) {
                missing.push(*token);
            }
        }
        if !missing.is_empty() {
            let origin = source
                .as_ref()
                .map(|p| format!(" in {}", p.display()))
                .unwrap_or_default();
            return Err(anyhow!(ConfigError::new(format!(
                "query is missing {}{origin}",
                missing.join(", ")
            ))));
        }
        Ok(Self { text, source })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Replaces every occurrence of each placeholder with its value.
    pub fn render(&self, substitutions: &[(&str, &str)]) -> Result<String> {
        let mut query = self.text.clone();
        for (placeholder, value) in substitutions {
            let re = placeholder_regex(placeholder)?;
            query = re.replace_all(&query, NoExpand(value)).into_owned();
        }
        Ok(query)
    }
}

/// One RDF term in a SPARQL JSON result binding.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BindingTerm {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(rename = "xml:lang", default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub datatype: Option<String>,
}

pub type Binding = HashMap<String, BindingTerm>;

#[derive(Debug, Deserialize)]
struct SelectResponse {
    results: SelectResults,
}

#[derive(Debug, Deserialize)]
struct SelectResults {
    #[serde(default)]
    bindings: Vec<Binding>,
}

/// Parses an `application/sparql-results+json` document.
pub fn parse_select_results(body: &[u8]) -> Result<Vec<Binding>> {
    let response: SelectResponse =
        serde_json::from_slice(body).context("Malformed SPARQL JSON results")?;
    Ok(response.results.bindings)
}

/// Blocking client for one SPARQL endpoint.
#[derive(Debug, Clone)]
pub struct SparqlClient {
    client: Client,
    endpoint: Url,
    method: RequestMethod,
}

impl SparqlClient {
    pub fn new(endpoint: &str, method: RequestMethod, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            anyhow!(ConfigError::new(format!(
                "invalid endpoint URL {endpoint:?}: {e}"
            )))
        })?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            method,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    fn request(&self, query: &str, accept: &str) -> RequestBuilder {
        let builder = match self.method {
            RequestMethod::Get => self
                .client
                .get(self.endpoint.clone())
                .query(&[("query", query)]),
            RequestMethod::Post => self
                .client
                .post(self.endpoint.clone())
                .form(&[("query", query)]),
        };
        builder.header(ACCEPT, accept)
    }

    fn send(&self, query: &str, accept: &str) -> Result<(Vec<u8>, Option<String>)> {
        debug!("Querying {}", self.endpoint);
        let resp = self.request(query, accept).send()?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());
        let bytes = resp.bytes()?.to_vec();
        if !status.is_success() {
            let snippet: String = String::from_utf8_lossy(&bytes).chars().take(200).collect();
            return Err(anyhow!(
                "SPARQL endpoint {} returned HTTP {}: {}",
                self.endpoint,
                status,
                snippet
            ));
        }
        Ok((bytes, content_type))
    }

    /// Runs a SELECT query and returns its bindings.
    pub fn select(&self, query: &str) -> Result<Vec<Binding>> {
        let (body, _) = self.send(query, SPARQL_RESULTS_JSON)?;
        parse_select_results(&body)
    }

    /// Runs a CONSTRUCT or DESCRIBE query and returns the resulting graph.
    pub fn construct(&self, query: &str) -> Result<OxigraphGraph> {
        let accept = format!("{N_TRIPLES}, {TURTLE}; q=0.9");
        let (body, content_type) = self.send(query, &accept)?;
        let format = content_type
            .as_deref()
            .and_then(|ct| RdfFormat::from_media_type(ct.trim()))
            .unwrap_or(RdfFormat::NTriples);
        parse_graph(&body, format, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{LIMIT_PLACEHOLDER, OFFSET_PLACEHOLDER};
    use crate::errors::ConfigError;

    #[test]
    fn missing_placeholders_are_config_errors() {
        let err = QueryTemplate::new(
            "SELECT ?this WHERE { ?this a ?type } LIMIT ?_limit",
            &[LIMIT_PLACEHOLDER, OFFSET_PLACEHOLDER],
        )
        .unwrap_err();
        let config = err.downcast_ref::<ConfigError>().unwrap();
        assert!(config.message.contains("?_offset"));
        assert!(!config.message.contains("?_limit"));
    }

    #[test]
    fn placeholder_must_match_whole_name() {
        assert!(QueryTemplate::new("SELECT * WHERE {} LIMIT ?_limitless", &["?_limit"]).is_err());
    }

    #[test]
    fn render_replaces_every_occurrence() {
        let template = QueryTemplate::new(
            "CONSTRUCT { ?_iri ?p ?o } WHERE { ?_iri ?p ?o . FILTER(?_iri != ?_iris) }",
            &["?_iri"],
        )
        .unwrap();
        let query = template
            .render(&[("?_iri", "<http://example.org/$1>")])
            .unwrap();
        assert_eq!(
            query,
            "CONSTRUCT { <http://example.org/$1> ?p ?o } WHERE { <http://example.org/$1> ?p ?o . FILTER(<http://example.org/$1> != ?_iris) }"
        );
    }

    #[test]
    fn parses_sparql_json_results() {
        let body = br#"{
            "head": {"vars": ["this", "label"]},
            "results": {"bindings": [
                {"this": {"type": "uri", "value": "http://example.org/a"},
                 "label": {"type": "literal", "value": "A", "xml:lang": "en"}},
                {"this": {"type": "uri", "value": "http://example.org/b"}}
            ]}
        }"#;
        let bindings = parse_select_results(body).unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0]["this"].value, "http://example.org/a");
        assert_eq!(bindings[0]["label"].lang.as_deref(), Some("en"));
        assert!(!bindings[1].contains_key("label"));
    }

    #[test]
    fn invalid_endpoint_is_a_config_error() {
        let err = SparqlClient::new("not a url", RequestMethod::Post, Duration::from_secs(1))
            .unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }
}
