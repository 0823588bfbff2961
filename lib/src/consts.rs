//! Placeholder tokens, media types and defaults shared across the pipeline.

use std::time::Duration;

// placeholders in query templates (Basil notation)
pub const LIMIT_PLACEHOLDER: &str = "?_limit";
pub const OFFSET_PLACEHOLDER: &str = "?_offset";
pub const IRI_PLACEHOLDER: &str = "?_iri";
pub const CURRENT_IDENTIFIER_PLACEHOLDER: &str = "?_currentIdentifier";

// result variables
pub const THIS_VARIABLE: &str = "this";
pub const IDENTIFIER_VARIABLE: &str = "identifier";
pub const IS_CHANGED_VARIABLE: &str = "isChanged";

// media types
pub const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";
pub const N_TRIPLES: &str = "application/n-triples";
pub const TURTLE: &str = "text/turtle";

/// Extension of every file in the content store.
pub const CONTENT_EXTENSION: &str = "nt";

/// Number of retries after the first attempt for page and resource fetches.
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;
pub const DEFAULT_PAGE_SIZE: u64 = 10_000;
pub const DEFAULT_BATCH_SIZE: usize = 1_000;
pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_MAX_CONSECUTIVE_PAGE_FAILURES: u32 = 5;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WAIT_BETWEEN_PAGES: Duration = Duration::from_millis(500);
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variable that overrides `RUST_LOG` for the command line tool.
pub const LOG_ENV_VAR: &str = "GRAPHMIRROR_LOG";
