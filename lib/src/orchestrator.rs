//! Runs the state machine in [`crate::workflow`] against real components.

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use log::{error, info};
use serde::Serialize;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::batch::{BatchProcessor, BatchReport};
use crate::change::ChangeChecker;
use crate::config::PipelineConfig;
use crate::datastore::Datastore;
use crate::discover::{Discoverer, DiscoveryReport};
use crate::errors::is_publish_conflict;
use crate::fetch::{Dereferencer, Fetch, QueryFetcher};
use crate::filestore::ContentStore;
use crate::options::FetchMode;
use crate::progress::{pretty_duration, EventSink};
use crate::publish::{GraphStorePublisher, Publisher};
use crate::queue::WorkQueue;
use crate::registry::Registry;
use crate::runs::{RunItem, RunLog};
use crate::sparql::{QueryTemplate, SparqlClient};
use crate::workflow::{next, Event, Plan, RunState, State};

/// Exclusive advisory lock held for the duration of a run.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Lock file used for the database at `database`: `<database>.lock`.
    pub fn path_for(database: &Path) -> PathBuf {
        let mut name = OsString::from(database.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn acquire(database: &Path) -> Result<Self> {
        let path = Self::path_for(database);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        if let Err(e) = file.try_lock_exclusive() {
            return Err(anyhow!(
                "Another run holds the lock on {}: {}",
                path.display(),
                e
            ));
        }
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// One sub-pipeline: discovery into the queue and batches out of it.
pub struct Topic {
    pub name: String,
    pub discoverer: Discoverer,
    pub processor: BatchProcessor,
}

impl Topic {
    pub fn store(&self) -> &ContentStore {
        self.processor.store()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub states: Vec<State>,
    pub discovered: u64,
    pub stored: usize,
    pub retried: usize,
    pub dropped: usize,
    pub obsolete_removed: usize,
    pub files_swept: usize,
    pub published: bool,
    pub publish_rejected: bool,
    #[serde(skip)]
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicStatus {
    pub name: String,
    pub queued: usize,
    pub registered: usize,
    pub stored_files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub schema_version: u32,
    pub last_run: Option<RunItem>,
    pub topics: Vec<TopicStatus>,
}

pub struct Pipeline {
    store: Arc<Datastore>,
    queue: WorkQueue,
    registry: Registry,
    runs: RunLog,
    topics: Vec<Topic>,
    change_checker: Option<ChangeChecker>,
    publisher: Option<Box<dyn Publisher>>,
    max_batches_per_run: u32,
}

impl Pipeline {
    pub fn new(store: Arc<Datastore>, max_retry_count: u32) -> Self {
        Self {
            queue: WorkQueue::with_max_retry_count(store.clone(), max_retry_count),
            registry: Registry::new(store.clone()),
            runs: RunLog::new(store.clone()),
            store,
            topics: Vec::new(),
            change_checker: None,
            publisher: None,
            max_batches_per_run: 1,
        }
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topics.push(topic);
        self
    }

    pub fn with_change_checker(mut self, checker: ChangeChecker) -> Self {
        self.change_checker = Some(checker);
        self
    }

    pub fn with_publisher(mut self, publisher: Box<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_max_batches_per_run(mut self, max: u32) -> Self {
        self.max_batches_per_run = max.max(1);
        self
    }

    /// Builds every component described by `config`. Templates are loaded and
    /// checked before the database is opened.
    pub fn from_config(config: &PipelineConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        let endpoint = &config.endpoint;
        let client = SparqlClient::new(&endpoint.url, endpoint.method, endpoint.timeout)?;
        let backoff = config.retry.backoff;

        let mut topics = Vec::new();
        for topic in &config.topics {
            let template = QueryTemplate::from_file(&topic.iterate_query, Discoverer::REQUIRED)?;
            let fetcher: Arc<dyn Fetch> = match &topic.fetch {
                FetchMode::Dereference {
                    credentials,
                    headers,
                } => Arc::new(Dereferencer::new(
                    credentials.clone(),
                    headers,
                    endpoint.timeout,
                    backoff,
                    events.clone(),
                )?),
                FetchMode::Query { query_file } => Arc::new(QueryFetcher::new(
                    client.clone(),
                    QueryTemplate::from_file(query_file, QueryFetcher::REQUIRED)?,
                    backoff,
                    events.clone(),
                )),
            };
            topics.push(Topic {
                name: topic.name.clone(),
                discoverer: Discoverer::new(
                    client.clone(),
                    template,
                    topic.discover,
                    backoff,
                    events.clone(),
                ),
                processor: BatchProcessor::new(
                    fetcher,
                    ContentStore::new(&topic.resource_dir),
                    topic.batch,
                    events.clone(),
                ),
            });
        }
        let change_checker = match &config.change_check {
            Some(check) => Some(ChangeChecker::new(
                client.clone(),
                QueryTemplate::from_file(&check.query_file, ChangeChecker::REQUIRED)?,
                backoff,
                events.clone(),
            )),
            None => None,
        };
        let publisher: Option<Box<dyn Publisher>> = match &config.publish {
            Some(publish) => Some(Box::new(GraphStorePublisher::new(publish.clone())?)),
            None => None,
        };

        let store = Datastore::open(&config.store.database)?;
        let mut pipeline =
            Self::new(store, config.retry.max_retry_count).with_max_batches_per_run(config.max_batches_per_run);
        pipeline.topics = topics;
        pipeline.change_checker = change_checker;
        pipeline.publisher = publisher;
        Ok(pipeline)
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn runs(&self) -> &RunLog {
        &self.runs
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    fn topic_index(&self, name: &str) -> Result<usize> {
        self.topics
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| anyhow!("Unknown topic {name:?}"))
    }

    fn plan(&self) -> Plan {
        Plan {
            topics: self.topics.len(),
            change_check: self.change_checker.is_some(),
            publish: self.publisher.is_some(),
            max_batches_per_run: self.max_batches_per_run,
        }
    }

    fn lock(&self) -> Result<Option<RunLock>> {
        self.store.path().map(RunLock::acquire).transpose()
    }

    /// Runs the state machine from `CheckQueue` until `Done`.
    pub fn run(&self) -> Result<RunSummary> {
        if self.topics.is_empty() {
            return Err(anyhow!("Pipeline has no topics"));
        }
        let _lock = self.lock()?;
        let start = Instant::now();
        let plan = self.plan();
        let mut run = RunState::new(plan.topics);
        let mut summary = RunSummary::default();
        let mut state = State::CheckQueue { topic: 0 };
        summary.states.push(state);

        while state != State::Done {
            let event = self
                .execute(&state, &run, &mut summary, start)
                .with_context(|| format!("Run failed in state {state}"))?;
            run.record(&state, &event);
            if matches!(state, State::Discover { topic: 0 })
                || matches!(event, Event::ChangeChecked { changed: true })
            {
                run.cycle_started = true;
            }
            state = next(&plan, &run, &state, &event)?;
            summary.states.push(state);
        }
        summary.duration = start.elapsed();
        Ok(summary)
    }

    fn execute(
        &self,
        state: &State,
        run: &RunState,
        summary: &mut RunSummary,
        start: Instant,
    ) -> Result<Event> {
        match *state {
            State::CheckQueue { topic } => {
                let size = self.queue.size(Some(&self.topics[topic].name))?;
                Ok(Event::QueueChecked { size })
            }
            State::Evaluate => Ok(Event::Evaluated),
            State::CheckChanged => {
                let changed = self.check_changed()?;
                Ok(Event::ChangeChecked { changed })
            }
            State::Discover { topic } => {
                if topic == 0 && !run.cycle_started {
                    self.runs.save(None)?;
                }
                let report = self.discover_topic(topic)?;
                summary.discovered += report.collected;
                let queue_size = self.queue.size(Some(&self.topics[topic].name))?;
                Ok(Event::Discovered { queue_size })
            }
            State::RemoveObsolete { topic } => {
                let removed = self.remove_obsolete(topic)?;
                summary.obsolete_removed += removed;
                Ok(Event::ObsoleteRemoved { removed })
            }
            State::ProcessBatch { topic } => {
                let report = self.process_topic(topic)?;
                summary.stored += report.stored;
                summary.retried += report.retried;
                summary.dropped += report.dropped;
                Ok(Event::BatchProcessed {
                    stored: report.stored,
                })
            }
            State::Sweep { topic } => {
                let deleted = self.sweep(topic)?;
                summary.files_swept += deleted;
                Ok(Event::Swept { deleted })
            }
            State::Publish => match self.publish_if_drained() {
                Ok(true) => {
                    summary.published = true;
                    Ok(Event::Published)
                }
                Ok(false) => Ok(Event::PublishSkipped),
                Err(err) if is_publish_conflict(&err) => {
                    error!("{err:#}");
                    summary.publish_rejected = true;
                    Ok(Event::PublishSkipped)
                }
                Err(err) => Err(err),
            },
            State::Finalize => {
                info!("Done in {}", pretty_duration(start.elapsed()));
                Ok(Event::Finalized)
            }
            State::Done => Err(anyhow!("No effect for terminal state")),
        }
    }

    /// A dataset without a previous run always counts as changed. A changed
    /// dataset starts a new cycle, recorded with the reported identifier.
    fn check_changed(&self) -> Result<bool> {
        let Some(checker) = &self.change_checker else {
            return Ok(true);
        };
        let last = self.runs.last()?;
        let current = last.as_ref().and_then(|run| run.identifier.as_deref());
        let response = checker.check(current)?;
        let changed = last.is_none() || response.is_changed;
        if last.is_none() {
            info!("No previous run found; starting a new cycle");
        }
        if changed {
            self.runs.save(response.identifier.as_deref())?;
        }
        Ok(changed)
    }

    fn discover_topic(&self, topic: usize) -> Result<DiscoveryReport> {
        let t = &self.topics[topic];
        info!("Discovering IRIs for topic \"{}\"", t.name);
        let report = t.discoverer.run(&self.queue, Some(&t.name))?;
        info!(
            "Discovered {} IRIs for topic \"{}\" ({} failed pages)",
            report.collected, t.name, report.failed_pages
        );
        Ok(report)
    }

    /// Drops registry rows (and their files) that the fresh discovery pass did
    /// not return. Only reachable right after a discovery that filled the queue.
    fn remove_obsolete(&self, topic: usize) -> Result<usize> {
        let t = &self.topics[topic];
        let removed = self.registry.remove_obsolete(Some(&t.name))?;
        for item in &removed {
            t.store().delete_by_iri(&item.iri)?;
        }
        info!(
            "Removed {} obsolete resources from topic \"{}\"",
            removed.len(),
            t.name
        );
        Ok(removed.len())
    }

    fn process_topic(&self, topic: usize) -> Result<BatchReport> {
        let t = &self.topics[topic];
        t.processor
            .run(&self.queue, Some(&self.registry), Some(&t.name))
    }

    /// Deletes stored files whose IRI is no longer registered for the topic.
    fn sweep(&self, topic: usize) -> Result<usize> {
        let t = &self.topics[topic];
        let live: HashSet<String> = self
            .registry
            .get_all(Some(&t.name))?
            .iter()
            .map(|item| t.store().hash(&item.iri))
            .collect();
        let deleted = t.store().delete_if_matches(|hash| !live.contains(hash))?;
        info!("Deleted {} stale files of topic \"{}\"", deleted, t.name);
        Ok(deleted)
    }

    /// Publishes only when every topic queue is empty. Returns whether a
    /// publish happened.
    fn publish_if_drained(&self) -> Result<bool> {
        let Some(publisher) = &self.publisher else {
            return Ok(false);
        };
        if !self.queue.is_empty(None)? {
            info!("Not publishing: queue is not empty");
            return Ok(false);
        }
        let dirs: Vec<PathBuf> = self
            .topics
            .iter()
            .map(|t| t.store().dir().to_path_buf())
            .collect();
        publisher.publish(&dirs)?;
        Ok(true)
    }

    /// One discovery pass for `topic`, outside of the state machine.
    pub fn discover(&self, topic: &str) -> Result<DiscoveryReport> {
        let _lock = self.lock()?;
        self.discover_topic(self.topic_index(topic)?)
    }

    /// One batch for `topic`, outside of the state machine.
    pub fn process(&self, topic: &str) -> Result<BatchReport> {
        let _lock = self.lock()?;
        self.process_topic(self.topic_index(topic)?)
    }

    /// Publishes the mirror if all queues are empty; fails otherwise.
    pub fn publish(&self) -> Result<()> {
        let _lock = self.lock()?;
        if self.publisher.is_none() {
            return Err(anyhow!("No publish target configured"));
        }
        if !self.publish_if_drained()? {
            return Err(anyhow!(
                "Refusing to publish: {} items still queued",
                self.queue.size(None)?
            ));
        }
        Ok(())
    }

    pub fn status(&self) -> Result<Status> {
        let mut topics = Vec::new();
        for t in &self.topics {
            topics.push(TopicStatus {
                name: t.name.clone(),
                queued: self.queue.size(Some(&t.name))?,
                registered: self.registry.size(Some(&t.name))?,
                stored_files: t.store().hashes()?.len(),
            });
        }
        Ok(Status {
            schema_version: self.store.schema_version()?,
            last_run: self.runs.last()?,
            topics,
        })
    }
}
