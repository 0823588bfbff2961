//! Paginated collection of IRIs from the endpoint into the work queue.

use anyhow::{anyhow, Result};
use crossbeam_channel::bounded;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::consts::{
    DEFAULT_MAX_CONSECUTIVE_PAGE_FAILURES, DEFAULT_PAGE_SIZE, DEFAULT_WAIT_BETWEEN_PAGES,
    LIMIT_PLACEHOLDER, OFFSET_PLACEHOLDER, THIS_VARIABLE,
};
use crate::progress::{EventSink, PipelineEvent};
use crate::queue::WorkQueue;
use crate::retry::RetryPolicy;
use crate::sparql::{QueryTemplate, SparqlClient};

const PUSH_LANE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverOptions {
    pub page_size: u64,
    #[serde(rename = "wait_between_pages_ms", with = "crate::util::duration_ms")]
    pub wait_between_pages: Duration,
    /// Stop the pass after this many pages in a row failed.
    pub max_consecutive_failures: u32,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            wait_between_pages: DEFAULT_WAIT_BETWEEN_PAGES,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_PAGE_FAILURES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    /// Non-empty pages collected.
    pub pages: u64,
    pub collected: u64,
    pub failed_pages: u64,
    pub push_failures: u64,
}

pub struct Discoverer {
    client: SparqlClient,
    template: QueryTemplate,
    options: DiscoverOptions,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
}

impl Discoverer {
    /// Placeholders an iterate query must contain.
    pub const REQUIRED: &'static [&'static str] = &[LIMIT_PLACEHOLDER, OFFSET_PLACEHOLDER];

    pub fn new(
        client: SparqlClient,
        template: QueryTemplate,
        options: DiscoverOptions,
        retry: RetryPolicy,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            client,
            template,
            options,
            retry,
            events,
        }
    }

    fn collect_page(&self, offset: u64) -> Result<Vec<String>> {
        let limit = self.options.page_size.to_string();
        let offset_value = offset.to_string();
        let query = self.template.render(&[
            (LIMIT_PLACEHOLDER, limit.as_str()),
            (OFFSET_PLACEHOLDER, offset_value.as_str()),
        ])?;
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
        Ok(bindings
            .into_iter()
            .filter_map(|mut binding| match binding.remove(THIS_VARIABLE) {
                Some(term) => Some(term.value),
                None => {
                    debug!("Skipping result row without ?{THIS_VARIABLE}");
                    None
                }
            })
            .collect())
    }

    /// Pages through the iterate query and pushes every IRI onto `queue`
    /// under `topic`. Stops at the first empty page.
    ///
    /// Pages that still fail after retries are reported and skipped; push
    /// failures are reported and counted. Neither aborts the pass.
    pub fn run(&self, queue: &WorkQueue, topic: Option<&str>) -> Result<DiscoveryReport> {
        let (tx, rx) = bounded::<String>(PUSH_LANE_CAPACITY);
        let events = self.events.as_ref();

        thread::scope(|scope| {
            // single writer so queue inserts keep discovery order
            let lane = scope.spawn(move || {
                let mut failures = 0u64;
                for iri in rx {
                    if let Err(err) = queue.push(&iri, topic) {
                        failures += 1;
                        events.emit(PipelineEvent::PushFailed {
                            iri,
                            message: format!("{err:#}"),
                        });
                    }
                }
                failures
            });

            let mut report = DiscoveryReport::default();
            let page_size = self.options.page_size;
            let mut offset = 0u64;
            let mut consecutive_failures = 0u32;
            loop {
                if offset > 0 && !self.options.wait_between_pages.is_zero() {
                    thread::sleep(self.options.wait_between_pages);
                }
                match self.collect_page(offset) {
                    Ok(iris) if iris.is_empty() => break,
                    Ok(iris) => {
                        consecutive_failures = 0;
                        let count = iris.len() as u64;
                        report.pages += 1;
                        report.collected += count;
                        for iri in iris {
                            if tx.send(iri).is_err() {
                                break;
                            }
                        }
                        events.emit(PipelineEvent::PageCollected {
                            count,
                            page_size,
                            offset,
                        });
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        report.failed_pages += 1;
                        events.emit(PipelineEvent::PageFailed {
                            offset,
                            page_size,
                            message: format!("{err:#}"),
                        });
                        if consecutive_failures >= self.options.max_consecutive_failures {
                            warn!(
                                "Stopping discovery after {consecutive_failures} consecutive failed pages"
                            );
                            break;
                        }
                    }
                }
                offset += page_size;
            }
            drop(tx);

            report.push_failures = lane
                .join()
                .map_err(|_| anyhow!("Discovery push lane panicked"))?;
            Ok(report)
        })
    }
}
