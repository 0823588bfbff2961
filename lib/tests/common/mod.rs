#![allow(dead_code)]

// A small SPARQL endpoint on a random local port. Every request is recorded and
// answered by the handler passed to `MockEndpoint::start`.

use anyhow::Result;
use graphmirror::fetch::Fetch;
use graphmirror::publish::Publisher;
use graphmirror::util::parse_graph;
use oxigraph::io::RdfFormat;
use oxigraph::model::Graph;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tiny_http::{Header, Response, Server};

#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub url: String,
    /// Decoded `query` parameter, from the URL or the form body.
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub accept: Option<String>,
    pub received_at: Instant,
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl MockResponse {
    pub fn ok(content_type: &str, body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: content_type.to_string(),
            body: body.into(),
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain".to_string(),
            body: body.to_string(),
        }
    }
}

type Handler = dyn Fn(&MockRequest) -> MockResponse + Send + Sync;

pub struct MockEndpoint {
    pub url: String,
    server: Arc<Server>,
    requests: Arc<Mutex<Vec<MockRequest>>>,
    handle: Option<JoinHandle<()>>,
}

fn query_param(encoded: &[u8]) -> Option<String> {
    url::form_urlencoded::parse(encoded)
        .find(|(key, _)| key == "query")
        .map(|(_, value)| value.into_owned())
}

/// Routes library logs through the test harness; `RUST_LOG=debug` shows them.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

impl MockEndpoint {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&MockRequest) -> MockResponse + Send + Sync + 'static,
    {
        init_logging();
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let port = server.server_addr().to_ip().unwrap().port();
        let url = format!("http://127.0.0.1:{port}/sparql");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let handle = {
            let server = server.clone();
            let requests = requests.clone();
            thread::spawn(move || {
                for mut request in server.incoming_requests() {
                    let received_at = Instant::now();
                    let mut body = Vec::new();
                    let _ = request.as_reader().read_to_end(&mut body);
                    let url = request.url().to_string();
                    let query = match url.split_once('?') {
                        Some((_, params)) => query_param(params.as_bytes()),
                        None => query_param(&body),
                    };
                    let header_value = |name: &'static str| {
                        request
                            .headers()
                            .iter()
                            .find(|h| h.field.equiv(name))
                            .map(|h| h.value.to_string())
                    };
                    let mock = MockRequest {
                        method: request.method().to_string(),
                        url,
                        query,
                        authorization: header_value("Authorization"),
                        accept: header_value("Accept"),
                        received_at,
                    };
                    let reply = handler(&mock);
                    requests.lock().unwrap().push(mock);
                    let header =
                        Header::from_bytes(&b"Content-Type"[..], reply.content_type.as_bytes())
                            .unwrap();
                    let response = Response::from_string(reply.body)
                        .with_status_code(reply.status)
                        .with_header(header);
                    let _ = request.respond(response);
                }
            })
        };

        Self {
            url,
            server,
            requests,
            handle: Some(handle),
        }
    }

    /// Base URL without the `/sparql` path, for dereferenceable IRIs.
    pub fn base(&self) -> String {
        self.url.trim_end_matches("/sparql").to_string()
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn select_response(iris: &[String]) -> MockResponse {
    let bindings: Vec<serde_json::Value> = iris
        .iter()
        .map(|iri| serde_json::json!({ "this": { "type": "uri", "value": iri } }))
        .collect();
    let body = serde_json::json!({
        "head": { "vars": ["this"] },
        "results": { "bindings": bindings },
    });
    MockResponse::ok("application/sparql-results+json", body.to_string())
}

pub fn ntriples_for(iri: &str) -> String {
    format!("<{iri}> <http://example.org/label> \"{iri}\" .\n")
}

pub fn offset_of(query: &str) -> Option<usize> {
    let re = Regex::new(r"OFFSET\s+(\d+)").unwrap();
    re.captures(query).map(|c| c[1].parse().unwrap())
}

pub fn limit_of(query: &str) -> Option<usize> {
    let re = Regex::new(r"LIMIT\s+(\d+)").unwrap();
    re.captures(query).map(|c| c[1].parse().unwrap())
}

/// IRI substituted into a CONSTRUCT query rendered from `RESOURCE_QUERY`.
pub fn subject_of(query: &str) -> Option<String> {
    let re = Regex::new(r"<([^>]+)>").unwrap();
    re.captures(query).map(|c| c[1].to_string())
}

pub const ITERATE_QUERY: &str =
    "SELECT ?this WHERE { ?this a <http://example.org/Thing> } ORDER BY ?this LIMIT ?_limit OFFSET ?_offset";

pub const RESOURCE_QUERY: &str = "CONSTRUCT { ?_iri ?p ?o } WHERE { ?_iri ?p ?o }";

/// Serves `iris` as paged SELECT results and answers CONSTRUCT queries with one
/// triple about the requested IRI. IRIs in `failing` always get HTTP 500.
pub fn dataset_handler(
    iris: Arc<Mutex<Vec<String>>>,
    failing: HashSet<String>,
) -> impl Fn(&MockRequest) -> MockResponse + Send + Sync + 'static {
    move |request| {
        let Some(query) = request.query.as_deref() else {
            return MockResponse::status(400, "missing query");
        };
        if query.starts_with("CONSTRUCT") {
            let Some(iri) = subject_of(query) else {
                return MockResponse::status(400, "no subject");
            };
            if failing.contains(&iri) {
                return MockResponse::status(500, "resource unavailable");
            }
            return MockResponse::ok("application/n-triples", ntriples_for(&iri));
        }
        let iris = iris.lock().unwrap();
        let offset = offset_of(query).unwrap_or(0);
        let limit = limit_of(query).unwrap_or(iris.len());
        let page: Vec<String> = iris.iter().skip(offset).take(limit).cloned().collect();
        select_response(&page)
    }
}

/// Answers from a fixed map and records every fetched IRI.
#[derive(Default)]
pub struct StubFetcher {
    pub resources: HashMap<String, String>,
    pub calls: Mutex<Vec<String>>,
}

impl StubFetcher {
    pub fn new(iris: &[&str]) -> Self {
        Self {
            resources: iris.iter().map(|i| (i.to_string(), ntriples_for(i))).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Fetch for StubFetcher {
    fn fetch(&self, iri: &str) -> Result<Graph> {
        self.calls.lock().unwrap().push(iri.to_string());
        match self.resources.get(iri) {
            Some(nt) => parse_graph(nt.as_bytes(), RdfFormat::NTriples, None),
            None => Err(anyhow::anyhow!("no resource for {iri}")),
        }
    }
}

/// Remembers the directories of every publish; optionally answers like a busy store.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    pub calls: Arc<Mutex<Vec<Vec<PathBuf>>>>,
    pub busy: bool,
}

impl RecordingPublisher {
    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, dirs: &[PathBuf]) -> Result<()> {
        self.calls.lock().unwrap().push(dirs.to_vec());
        if self.busy {
            return Err(anyhow::anyhow!(graphmirror::errors::PublishConflictError {
                target: "http://store.example.org".to_string(),
                status: 409,
                message: "another upload is running".to_string(),
            }));
        }
        Ok(())
    }
}
