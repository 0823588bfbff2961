//! Drains one batch of the work queue through a bounded pool of workers.
//!
//! A batch is a snapshot of the oldest `batch_size` queue items. Each item is
//! handed to exactly one worker, which fetches it, stores it, removes it from
//! the queue and records it in the registry. Failed items go back on the
//! queue through [`WorkQueue::retry`] until their retry budget is used up.

use anyhow::Result;
use crossbeam_channel::{bounded, unbounded};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::consts::{DEFAULT_BATCH_SIZE, DEFAULT_CONCURRENCY};
use crate::errors::{is_retry_exhausted, is_storage_error};
use crate::fetch::Fetch;
use crate::filestore::ContentStore;
use crate::progress::{EventSink, PipelineEvent};
use crate::queue::{QueueItem, WorkQueue};
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    #[serde(rename = "wait_between_requests_ms", with = "crate::util::duration_ms")]
    pub wait_between_requests: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            wait_between_requests: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub iri: String,
    pub message: String,
    pub dropped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub stored: usize,
    pub retried: usize,
    pub dropped: usize,
    pub failures: Vec<ItemFailure>,
}

enum Outcome {
    Stored,
    Retried(ItemFailure),
    Dropped(ItemFailure),
    /// A local condition that stops the batch.
    Fatal(anyhow::Error),
}

pub struct BatchProcessor {
    fetcher: Arc<dyn Fetch>,
    store: ContentStore,
    options: BatchOptions,
    events: Arc<dyn EventSink>,
}

impl BatchProcessor {
    pub fn new(
        fetcher: Arc<dyn Fetch>,
        store: ContentStore,
        options: BatchOptions,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            fetcher,
            store,
            options,
            events,
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Processes up to `batch_size` items of `topic`. Item failures are
    /// contained; queue, registry and content-store errors stop the batch and
    /// are returned once every worker has finished its current item.
    pub fn run(
        &self,
        queue: &WorkQueue,
        registry: Option<&Registry>,
        topic: Option<&str>,
    ) -> Result<BatchReport> {
        let items = queue.get_all(topic, Some(self.options.batch_size))?;
        let total = items.len();
        let mut report = BatchReport {
            total,
            ..Default::default()
        };
        if total == 0 {
            return Ok(report);
        }
        let workers = self.options.concurrency.max(1).min(total);
        info!(
            "Processing {} queued IRIs{} with {} worker(s)",
            total,
            topic.map(|t| format!(" of topic \"{t}\"")).unwrap_or_default(),
            workers
        );

        let (work_tx, work_rx) = bounded::<QueueItem>(workers);
        let (result_tx, result_rx) = unbounded::<Outcome>();
        let abort = AtomicBool::new(false);
        let mut fatal: Option<anyhow::Error> = None;

        thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                let abort = &abort;
                scope.spawn(move || {
                    for item in work_rx {
                        if abort.load(Ordering::SeqCst) {
                            continue;
                        }
                        let outcome = self.process(queue, registry, topic, &item);
                        if matches!(outcome, Outcome::Fatal(_)) {
                            abort.store(true, Ordering::SeqCst);
                        }
                        let _ = result_tx.send(outcome);
                        if !self.options.wait_between_requests.is_zero() {
                            thread::sleep(self.options.wait_between_requests);
                        }
                    }
                });
            }
            drop(work_rx);
            drop(result_tx);

            for item in items {
                if abort.load(Ordering::SeqCst) || work_tx.send(item).is_err() {
                    break;
                }
            }
            drop(work_tx);

            for outcome in result_rx {
                match outcome {
                    Outcome::Stored => {
                        report.stored += 1;
                        self.events.emit(PipelineEvent::ResourceStored {
                            total,
                            processed: report.stored,
                        });
                    }
                    Outcome::Retried(failure) => {
                        report.retried += 1;
                        report.failures.push(failure);
                    }
                    Outcome::Dropped(failure) => {
                        report.dropped += 1;
                        report.failures.push(failure);
                    }
                    Outcome::Fatal(err) => {
                        if fatal.is_none() {
                            fatal = Some(err);
                        }
                    }
                }
            }
        });

        if let Some(err) = fatal {
            return Err(err);
        }
        debug!(
            "Batch done: {} stored, {} retried, {} dropped",
            report.stored, report.retried, report.dropped
        );
        Ok(report)
    }

    fn process(
        &self,
        queue: &WorkQueue,
        registry: Option<&Registry>,
        topic: Option<&str>,
        item: &QueueItem,
    ) -> Outcome {
        let stored = self
            .fetcher
            .fetch(&item.iri)
            .and_then(|graph| self.store.save_graph(&item.iri, &graph));
        if let Err(err) = stored {
            let outcome = self.give_back(queue, item, &err);
            // the item is back on the queue, but a local write failure stops the batch
            if is_storage_error(&err) && !matches!(outcome, Outcome::Fatal(_)) {
                return Outcome::Fatal(err);
            }
            return outcome;
        }
        if let Err(err) = queue.remove(item.id) {
            return Outcome::Fatal(err);
        }
        if let Some(registry) = registry {
            if let Err(err) = registry.save(&item.iri, topic) {
                return Outcome::Fatal(err);
            }
        }
        Outcome::Stored
    }

    /// Puts a failed item back on the queue, or drops it when its retry
    /// budget is spent.
    fn give_back(&self, queue: &WorkQueue, item: &QueueItem, err: &anyhow::Error) -> Outcome {
        let message = format!("{err:#}");
        match queue.retry(item) {
            Ok(retried) => {
                self.events.emit(PipelineEvent::ItemRetried {
                    iri: item.iri.clone(),
                    retry_count: retried.retry_count,
                    message: message.clone(),
                });
                Outcome::Retried(ItemFailure {
                    iri: item.iri.clone(),
                    message,
                    dropped: false,
                })
            }
            Err(retry_err) if is_retry_exhausted(&retry_err) => {
                self.events.emit(PipelineEvent::ItemDropped {
                    iri: item.iri.clone(),
                    message: format!("{retry_err}; last error: {message}"),
                });
                Outcome::Dropped(ItemFailure {
                    iri: item.iri.clone(),
                    message,
                    dropped: true,
                })
            }
            Err(retry_err) => Outcome::Fatal(retry_err),
        }
    }
}
