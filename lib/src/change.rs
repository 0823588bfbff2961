//! Asks the endpoint whether the source dataset changed since the last run.

use anyhow::Result;
use log::info;
use std::sync::Arc;

use crate::consts::{CURRENT_IDENTIFIER_PLACEHOLDER, IDENTIFIER_VARIABLE, IS_CHANGED_VARIABLE};
use crate::progress::{EventSink, PipelineEvent};
use crate::retry::RetryPolicy;
use crate::sparql::{QueryTemplate, SparqlClient};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeResponse {
    /// Version reported by the endpoint, e.g. a revision id or a modification date.
    pub identifier: Option<String>,
    pub is_changed: bool,
}

pub struct ChangeChecker {
    client: SparqlClient,
    template: QueryTemplate,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
}

impl ChangeChecker {
    pub const REQUIRED: &'static [&'static str] = &[
        CURRENT_IDENTIFIER_PLACEHOLDER,
        "?identifier",
        "?isChanged",
    ];

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

    /// Runs the change query with `current_identifier` substituted (empty when
    /// unknown). The last result row wins; `?isChanged` is true when it is a
    /// non-zero integer or the literal `true`.
    pub fn check(&self, current_identifier: Option<&str>) -> Result<ChangeResponse> {
        let query = self.template.render(&[(
            CURRENT_IDENTIFIER_PLACEHOLDER,
            current_identifier.unwrap_or(""),
        )])?;
        let bindings = self.retry.run(
            |_| self.client.select(&query),
            |attempt, _, err| {
                self.events.emit(PipelineEvent::Warning {
                    message: format!(
                        "Failed to fetch results from SPARQL endpoint (attempt {attempt}): {err:#}"
                    ),
                })
            },
        )?;

        let mut response = ChangeResponse {
            identifier: None,
            is_changed: false,
        };
        for binding in bindings {
            if let Some(term) = binding.get(IDENTIFIER_VARIABLE) {
                response.identifier = Some(term.value.clone());
            }
            if let Some(term) = binding.get(IS_CHANGED_VARIABLE) {
                response.is_changed = parse_flag(&term.value);
            }
        }
        info!(
            "Dataset {} changed (identifier: {})",
            if response.is_changed { "is" } else { "is not" },
            response.identifier.as_deref().unwrap_or("none")
        );
        Ok(response)
    }
}

fn parse_flag(value: &str) -> bool {
    match value.trim() {
        "true" => true,
        "false" => false,
        other => other.parse::<i64>().map(|n| n != 0).unwrap_or(false),
    }
}
