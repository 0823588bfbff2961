//! Retrieval of the resource behind a queued IRI.
//!
//! [`Dereferencer`] requests the IRI itself over HTTP, negotiating an RDF
//! serialization and falling back to the URL extension and then to content
//! sniffing when the server does not label its response. [`QueryFetcher`]
//! asks the SPARQL endpoint for the resource with a CONSTRUCT template.
//! Both retry failed attempts and report each one as a warning event.

use anyhow::{anyhow, Context, Result};
use oxigraph::io::RdfFormat;
use oxigraph::model::{Graph as OxigraphGraph, NamedNode};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::consts::IRI_PLACEHOLDER;
use crate::errors::{ConfigError, FetchFailedError};
use crate::options::{Credentials, Headers};
use crate::progress::{EventSink, PipelineEvent};
use crate::retry::RetryPolicy;
use crate::sparql::{QueryTemplate, SparqlClient};
use crate::util::parse_graph;

/// Retrieves the RDF description of one IRI.
pub trait Fetch: Send + Sync {
    fn fetch(&self, iri: &str) -> Result<OxigraphGraph>;
}

const DEFAULT_ACCEPT: &[&str] = &[
    "text/turtle",
    "application/n-triples",
    "application/rdf+xml",
    "application/ld+json",
    "application/n-quads",
    "application/trig",
    "text/n3",
];

/// Attempts to identify an RDF serialization from the supplied media type.
fn detect_format(ct: &str) -> Option<RdfFormat> {
    RdfFormat::from_media_type(ct.trim())
}

/// Builds a weighted `Accept` header string honoring the provided priority order.
fn build_accept(accept_order: &[&str]) -> String {
    if accept_order.is_empty() {
        return "*/*".to_string();
    }
    let mut parts = Vec::new();
    let mut q = 1.0f32;
    for t in accept_order {
        parts.push(format!("{t}; q={q:.2}"));
        q = (q - 0.1f32).max(0.1f32);
    }
    parts.push("*/*; q=0.05".to_string());
    parts.join(", ")
}

/// Attempts to infer an RDF format from the URL path extension.
fn detect_format_from_url(url: &str) -> Option<RdfFormat> {
    let trimmed = url.split('#').next().unwrap_or(url);
    let path = trimmed.split('?').next().unwrap_or(trimmed);
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(RdfFormat::from_extension)
}

/// Last-resort guess at the serialization by peeking at the payload.
fn sniff_format(bytes: &[u8]) -> Option<RdfFormat> {
    let sample_len = bytes.len().min(4096);
    let sample = String::from_utf8_lossy(&bytes[..sample_len]);
    let trimmed = sample.trim_start();

    if trimmed.starts_with('{') && sample.contains("\"@context\"") {
        return detect_format("application/ld+json");
    }
    if trimmed.starts_with('<')
        && (sample.contains("<rdf:RDF") || sample.contains("xmlns:rdf"))
    {
        return detect_format("application/rdf+xml");
    }
    if sample.contains("@prefix") || sample.contains("@base") || sample.contains("PREFIX ") {
        return detect_format("text/turtle");
    }
    if trimmed.starts_with('<') || trimmed.starts_with("_:") {
        return detect_format("application/n-triples");
    }
    None
}

/// Returns `true` when the response appears to be HTML instead of RDF.
fn looks_like_html(content_type: Option<&str>, bytes: &[u8]) -> bool {
    if let Some(ct) = content_type {
        let lc = ct.to_ascii_lowercase();
        if lc.contains("text/html") || lc.contains("application/xhtml") {
            return true;
        }
    }
    let prefix_len = bytes.len().min(512);
    if let Ok(snippet) = std::str::from_utf8(&bytes[..prefix_len]) {
        let lower = snippet.to_ascii_lowercase();
        return lower.contains("<html") || lower.contains("<!doctype html");
    }
    false
}

/// Picks the format from the media type, then the URL, then the payload.
fn resolve_format(content_type: Option<&str>, final_url: &str, bytes: &[u8]) -> Option<RdfFormat> {
    content_type
        .and_then(|ct| detect_format(ct.split(';').next().unwrap_or(ct)))
        .or_else(|| detect_format_from_url(final_url))
        .or_else(|| sniff_format(bytes))
}

fn build_headers(headers: &Headers) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| anyhow!(ConfigError::new(format!("invalid header name {name:?}: {e}"))))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| anyhow!(ConfigError::new(format!("invalid value for header {name}: {e}"))))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn fetch_with_retry<F>(
    retry: &RetryPolicy,
    events: &dyn EventSink,
    iri: &str,
    mut attempt: F,
) -> Result<OxigraphGraph>
where
    F: FnMut() -> Result<OxigraphGraph>,
{
    retry
        .run(
            |_| attempt(),
            |n, _, err| {
                events.emit(PipelineEvent::Warning {
                    message: format!(
                        "Failed to fetch \"{iri}\" (attempt {n}): {err:#}"
                    ),
                })
            },
        )
        .map_err(|cause| {
            anyhow!(FetchFailedError {
                iri: iri.to_string(),
                cause,
            })
        })
}

/// Fetches resources by dereferencing their IRI.
pub struct Dereferencer {
    client: Client,
    accept: String,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
}

impl Dereferencer {
    pub fn new(
        credentials: Option<Credentials>,
        headers: &Headers,
        timeout: Duration,
        retry: RetryPolicy,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(build_headers(headers)?)
            .build()?;
        Ok(Self {
            client,
            accept: build_accept(DEFAULT_ACCEPT),
            credentials,
            retry,
            events,
        })
    }

    fn try_fetch(&self, iri: &str) -> Result<OxigraphGraph> {
        let mut request = self.client.get(iri).header(ACCEPT, &self.accept);
        if let Some(Credentials::BasicAuth { username, password }) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }
        let resp = request.send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("HTTP {} for {}", status, iri));
        }
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());
        let bytes = resp.bytes()?.to_vec();
        if looks_like_html(content_type.as_deref(), &bytes) {
            return Err(anyhow!("{iri} returned HTML instead of RDF"));
        }
        let format = resolve_format(content_type.as_deref(), &final_url, &bytes)
            .ok_or_else(|| anyhow!("Cannot determine the RDF format of {iri}"))?;
        parse_graph(&bytes, format, Some(&final_url))
    }
}

impl Fetch for Dereferencer {
    fn fetch(&self, iri: &str) -> Result<OxigraphGraph> {
        fetch_with_retry(&self.retry, self.events.as_ref(), iri, || {
            self.try_fetch(iri)
        })
    }
}

/// Fetches resources with a CONSTRUCT query in which `?_iri` stands for the resource.
pub struct QueryFetcher {
    client: SparqlClient,
    template: QueryTemplate,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
}

impl QueryFetcher {
    /// Placeholders a resource query must contain.
    pub const REQUIRED: &'static [&'static str] = &[IRI_PLACEHOLDER];

    pub fn new(
        client: SparqlClient,
        template: QueryTemplate,
        retry: RetryPolicy,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            client,
            template,
            retry,
            events,
        }
    }
}

impl Fetch for QueryFetcher {
    fn fetch(&self, iri: &str) -> Result<OxigraphGraph> {
        // rejects IRIs that would break out of the `<...>` term
        let node = NamedNode::new(iri).with_context(|| format!("Invalid IRI {iri:?}"))?;
        let term = node.to_string();
        let query = self.template.render(&[(IRI_PLACEHOLDER, term.as_str())])?;
        fetch_with_retry(&self.retry, self.events.as_ref(), iri, || {
            self.client.construct(&query)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_header_is_weighted() {
        let accept = build_accept(&["text/turtle", "application/n-triples"]);
        assert_eq!(
            accept,
            "text/turtle; q=1.00, application/n-triples; q=0.90, */*; q=0.05"
        );
        assert_eq!(build_accept(&[]), "*/*");
    }

    #[test]
    fn format_resolution_order() {
        assert_eq!(
            resolve_format(Some("text/turtle; charset=utf-8"), "http://x/a.rdf", b""),
            Some(RdfFormat::Turtle)
        );
        assert_eq!(
            resolve_format(Some("application/octet-stream"), "http://x/a.nt", b""),
            Some(RdfFormat::NTriples)
        );
        assert_eq!(
            resolve_format(None, "http://x/a", b"@prefix ex: <http://example.org/> ."),
            Some(RdfFormat::Turtle)
        );
        assert_eq!(resolve_format(None, "http://x/a", b"hello"), None);
    }

    #[test]
    fn sniffing_survives_a_split_multibyte_character() {
        let mut payload = b"@prefix ex: <http://example.org/> .\n".to_vec();
        let padding = 4095 - payload.len();
        payload.extend(std::iter::repeat(b'#').take(padding));
        payload.extend("\u{e9} more\n".as_bytes());
        assert!(std::str::from_utf8(&payload[..4096]).is_err());
        assert_eq!(sniff_format(&payload), Some(RdfFormat::Turtle));
    }

    #[test]
    fn html_is_detected() {
        assert!(looks_like_html(Some("text/html; charset=utf-8"), b""));
        assert!(looks_like_html(None, b"<!DOCTYPE html><html></html>"));
        assert!(!looks_like_html(Some("text/turtle"), b"<a> <b> <c> ."));
    }

    #[test]
    fn invalid_headers_are_config_errors() {
        let mut headers = Headers::new();
        headers.insert("bad header".to_string(), "x".to_string());
        let err = build_headers(&headers).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }
}
