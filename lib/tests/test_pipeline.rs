mod common;

use anyhow::Result;
use common::{dataset_handler, MockEndpoint, MockResponse, RecordingPublisher, StubFetcher, ITERATE_QUERY};
use graphmirror::batch::{BatchOptions, BatchProcessor};
use graphmirror::change::ChangeChecker;
use graphmirror::config::PipelineConfig;
use graphmirror::datastore::Datastore;
use graphmirror::discover::{DiscoverOptions, Discoverer};
use graphmirror::fetch::Fetch;
use graphmirror::filestore::ContentStore;
use graphmirror::options::RequestMethod;
use graphmirror::orchestrator::{Pipeline, RunLock, Topic};
use graphmirror::progress::CollectingSink;
use graphmirror::retry::RetryPolicy;
use graphmirror::sparql::{QueryTemplate, SparqlClient};
use graphmirror::workflow::State;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const X: &str = "http://example.org/x";
const Y: &str = "http://example.org/y";

fn topic(
    name: &str,
    endpoint: &MockEndpoint,
    fetcher: Arc<dyn Fetch>,
    resource_dir: &Path,
    batch_size: usize,
) -> Result<Topic> {
    let events = Arc::new(CollectingSink::new());
    let client = SparqlClient::new(&endpoint.url, RequestMethod::Post, Duration::from_secs(5))?;
    let discoverer = Discoverer::new(
        client,
        QueryTemplate::new(ITERATE_QUERY, Discoverer::REQUIRED)?,
        DiscoverOptions {
            page_size: 100,
            wait_between_pages: Duration::ZERO,
            max_consecutive_failures: 1,
        },
        RetryPolicy::immediate(0),
        events.clone(),
    );
    let processor = BatchProcessor::new(
        fetcher,
        ContentStore::new(resource_dir),
        BatchOptions {
            batch_size,
            concurrency: 1,
            wait_between_requests: Duration::ZERO,
        },
        events,
    );
    Ok(Topic {
        name: name.to_string(),
        discoverer,
        processor,
    })
}

fn queued(pipeline: &Pipeline) -> Result<Vec<String>> {
    Ok(pipeline
        .queue()
        .get_all(None, None)?
        .into_iter()
        .map(|item| item.iri)
        .collect())
}

#[test]
fn test_two_invocations_mirror_and_publish() -> Result<()> {
    let dir = TempDir::new()?;
    let db = dir.path().join("state.sqlite");
    let resources = dir.path().join("resources");
    let dataset = Arc::new(Mutex::new(vec![X.to_string(), Y.to_string()]));
    let endpoint = MockEndpoint::start(dataset_handler(dataset.clone(), HashSet::new()));
    let fetcher = Arc::new(StubFetcher::new(&[X, Y]));
    let publisher = RecordingPublisher::default();

    let build = || -> Result<Pipeline> {
        Ok(Pipeline::new(Datastore::open(&db)?, 3)
            .with_topic(topic("things", &endpoint, fetcher.clone(), &resources, 1)?)
            .with_publisher(Box::new(publisher.clone())))
    };

    // first invocation: discover both, store X
    let pipeline = build()?;
    let summary = pipeline.run()?;
    assert_eq!(summary.discovered, 2);
    assert_eq!(summary.stored, 1);
    assert!(!summary.published);
    assert!(summary.states.contains(&State::Discover { topic: 0 }));
    assert!(summary.states.contains(&State::RemoveObsolete { topic: 0 }));
    assert_eq!(summary.states.last(), Some(&State::Done));
    assert_eq!(queued(&pipeline)?, vec![Y]);
    let store = pipeline.topics()[0].store();
    assert!(store.path_for(X).exists());
    assert!(!store.path_for(Y).exists());
    assert!(pipeline.runs().last()?.is_some());
    drop(pipeline);

    // second invocation: store Y, sweep, publish
    let pipeline = build()?;
    let summary = pipeline.run()?;
    assert_eq!(summary.discovered, 0);
    assert_eq!(summary.stored, 1);
    assert!(summary.published);
    assert!(summary.states.contains(&State::Sweep { topic: 0 }));
    assert!(!summary.states.contains(&State::Discover { topic: 0 }));
    assert!(pipeline.queue().is_empty(None)?);
    assert_eq!(pipeline.registry().size(Some("things"))?, 2);
    assert!(pipeline.topics()[0].store().path_for(Y).exists());
    assert_eq!(publisher.count(), 1);
    assert_eq!(publisher.calls.lock().unwrap()[0], vec![resources.clone()]);
    assert_eq!(fetcher.calls(), vec![X, Y]);
    drop(pipeline);

    // third invocation: Y left the dataset, so a new cycle removes it and the
    // single remaining item drains the queue within the same run
    dataset.lock().unwrap().retain(|iri| iri != Y);
    let pipeline = build()?;
    let summary = pipeline.run()?;
    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.obsolete_removed, 1);
    assert_eq!(summary.stored, 1);
    assert!(summary.published);
    assert_eq!(publisher.count(), 2);
    let registered: Vec<String> = pipeline
        .registry()
        .get_all(None)?
        .into_iter()
        .map(|r| r.iri)
        .collect();
    assert_eq!(registered, vec![X]);
    assert!(!pipeline.topics()[0].store().path_for(Y).exists());
    assert_eq!(pipeline.topics()[0].store().hashes()?.len(), 1);
    Ok(())
}

#[test]
fn test_restart_resumes_unfetched_items() -> Result<()> {
    let dir = TempDir::new()?;
    let db = dir.path().join("state.sqlite");
    let resources = dir.path().join("resources");
    let iris = ["http://example.org/1", "http://example.org/2", "http://example.org/3"];
    let endpoint = MockEndpoint::start(dataset_handler(
        Arc::new(Mutex::new(iris.iter().map(|i| i.to_string()).collect())),
        HashSet::new(),
    ));

    // the first process stores one item and dies before the rest of the batch
    {
        let fetcher = Arc::new(StubFetcher::new(&iris));
        let pipeline = Pipeline::new(Datastore::open(&db)?, 3)
            .with_topic(topic("things", &endpoint, fetcher.clone(), &resources, 1)?);
        pipeline.discover("things")?;
        pipeline.process("things")?;
        assert_eq!(fetcher.calls(), vec![iris[0]]);
        assert_eq!(pipeline.queue().size(None)?, 2);
    }

    let fetcher = Arc::new(StubFetcher::new(&iris));
    let pipeline = Pipeline::new(Datastore::open(&db)?, 3)
        .with_topic(topic("things", &endpoint, fetcher.clone(), &resources, 10)?);
    let summary = pipeline.run()?;
    assert_eq!(summary.discovered, 0);
    assert_eq!(summary.stored, 2);
    assert_eq!(fetcher.calls(), vec![iris[1], iris[2]]);
    assert!(pipeline.queue().is_empty(None)?);
    for iri in iris {
        assert!(pipeline.topics()[0].store().path_for(iri).exists());
    }
    Ok(())
}

#[test]
fn test_second_run_fails_while_locked() -> Result<()> {
    let dir = TempDir::new()?;
    let db = dir.path().join("state.sqlite");
    let endpoint = MockEndpoint::start(dataset_handler(Arc::new(Mutex::new(Vec::new())), HashSet::new()));
    let pipeline = Pipeline::new(Datastore::open(&db)?, 3).with_topic(topic(
        "things",
        &endpoint,
        Arc::new(StubFetcher::default()),
        &dir.path().join("resources"),
        1,
    )?);

    let lock = RunLock::acquire(&db)?;
    assert_eq!(lock.path(), RunLock::path_for(&db));
    let err = pipeline.run().unwrap_err();
    assert!(err.to_string().contains("lock"));
    assert!(endpoint.requests().is_empty());

    drop(lock);
    let summary = pipeline.run()?;
    assert_eq!(summary.discovered, 0);
    Ok(())
}

#[test]
fn test_multiple_topics_are_handled_in_order() -> Result<()> {
    let dir = TempDir::new()?;
    let endpoint = MockEndpoint::start(dataset_handler(
        Arc::new(Mutex::new(vec![X.to_string()])),
        HashSet::new(),
    ));
    let fetcher = Arc::new(StubFetcher::new(&[X]));
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    let publisher = RecordingPublisher::default();
    let pipeline = Pipeline::new(Datastore::open_in_memory()?, 3)
        .with_topic(topic("first", &endpoint, fetcher.clone(), &first, 10)?)
        .with_topic(topic("second", &endpoint, fetcher.clone(), &second, 10)?)
        .with_publisher(Box::new(publisher.clone()))
        .with_max_batches_per_run(5);

    let summary = pipeline.run()?;
    let expected = vec![
        State::CheckQueue { topic: 0 },
        State::CheckQueue { topic: 1 },
        State::Evaluate,
        State::Discover { topic: 0 },
        State::RemoveObsolete { topic: 0 },
        State::CheckQueue { topic: 0 },
        State::Evaluate,
        State::ProcessBatch { topic: 0 },
        State::CheckQueue { topic: 0 },
        State::Evaluate,
        State::Sweep { topic: 0 },
        State::CheckQueue { topic: 1 },
        State::Evaluate,
        State::Discover { topic: 1 },
        State::RemoveObsolete { topic: 1 },
        State::CheckQueue { topic: 1 },
        State::Evaluate,
        State::ProcessBatch { topic: 1 },
        State::CheckQueue { topic: 1 },
        State::Evaluate,
        State::Sweep { topic: 1 },
        State::Publish,
        State::Finalize,
        State::Done,
    ];
    assert_eq!(summary.states, expected);
    assert_eq!(pipeline.registry().size(Some("first"))?, 1);
    assert_eq!(pipeline.registry().size(Some("second"))?, 1);
    assert_eq!(publisher.calls.lock().unwrap()[0], vec![first, second]);

    let status = pipeline.status()?;
    assert_eq!(status.topics.len(), 2);
    assert!(status.topics.iter().all(|t| t.queued == 0 && t.registered == 1 && t.stored_files == 1));
    Ok(())
}

#[test]
fn test_unchanged_dataset_skips_discovery() -> Result<()> {
    let dir = TempDir::new()?;
    let changed = Arc::new(Mutex::new(false));
    let inner = dataset_handler(Arc::new(Mutex::new(vec![X.to_string()])), HashSet::new());
    let flag = changed.clone();
    let endpoint = MockEndpoint::start(move |request| {
        let query = request.query.clone().unwrap_or_default();
        if query.contains("?isChanged") {
            let body = serde_json::json!({
                "head": { "vars": ["identifier", "isChanged"] },
                "results": { "bindings": [{
                    "identifier": { "type": "literal", "value": "rev-1" },
                    "isChanged": {
                        "type": "literal",
                        "value": flag.lock().unwrap().to_string(),
                        "datatype": "http://www.w3.org/2001/XMLSchema#boolean",
                    },
                }]},
            });
            return MockResponse::ok("application/sparql-results+json", body.to_string());
        }
        inner(request)
    });
    let client = SparqlClient::new(&endpoint.url, RequestMethod::Post, Duration::from_secs(5))?;
    let checker = ChangeChecker::new(
        client,
        QueryTemplate::new(
            "SELECT ?identifier ?isChanged WHERE { BIND(\"?_currentIdentifier\" AS ?current) }",
            ChangeChecker::REQUIRED,
        )?,
        RetryPolicy::immediate(0),
        Arc::new(CollectingSink::new()),
    );
    let pipeline = Pipeline::new(Datastore::open_in_memory()?, 3)
        .with_topic(topic(
            "things",
            &endpoint,
            Arc::new(StubFetcher::new(&[X])),
            &dir.path().join("resources"),
            10,
        )?)
        .with_change_checker(checker)
        .with_max_batches_per_run(5);

    // no previous run: counts as changed
    let summary = pipeline.run()?;
    assert!(summary.states.contains(&State::CheckChanged));
    assert_eq!(summary.discovered, 1);
    assert_eq!(
        pipeline.runs().last()?.and_then(|r| r.identifier),
        Some("rev-1".to_string())
    );

    // drained and unchanged: nothing to do
    let summary = pipeline.run()?;
    assert_eq!(
        summary.states,
        vec![
            State::CheckQueue { topic: 0 },
            State::Evaluate,
            State::CheckChanged,
            State::Finalize,
            State::Done,
        ]
    );

    *changed.lock().unwrap() = true;
    let summary = pipeline.run()?;
    assert_eq!(summary.discovered, 1);
    let last_check = endpoint
        .requests()
        .into_iter()
        .filter_map(|r| r.query)
        .filter(|q| q.contains("?isChanged"))
        .last()
        .unwrap();
    assert!(last_check.contains("\"rev-1\""));
    Ok(())
}

#[test]
fn test_busy_publish_target_ends_run_normally() -> Result<()> {
    let dir = TempDir::new()?;
    let endpoint = MockEndpoint::start(dataset_handler(
        Arc::new(Mutex::new(vec![X.to_string()])),
        HashSet::new(),
    ));
    let publisher = RecordingPublisher {
        busy: true,
        ..Default::default()
    };
    let pipeline = Pipeline::new(Datastore::open_in_memory()?, 3)
        .with_topic(topic(
            "things",
            &endpoint,
            Arc::new(StubFetcher::new(&[X])),
            &dir.path().join("resources"),
            10,
        )?)
        .with_publisher(Box::new(publisher.clone()))
        .with_max_batches_per_run(2);

    let summary = pipeline.run()?;
    assert_eq!(publisher.count(), 1);
    assert!(!summary.published);
    assert!(summary.publish_rejected);
    assert_eq!(summary.states.last(), Some(&State::Done));
    Ok(())
}

#[test]
fn test_manual_publish_requires_empty_queue() -> Result<()> {
    let dir = TempDir::new()?;
    let endpoint = MockEndpoint::start(dataset_handler(
        Arc::new(Mutex::new(vec![X.to_string(), Y.to_string()])),
        HashSet::new(),
    ));
    let publisher = RecordingPublisher::default();
    let pipeline = Pipeline::new(Datastore::open_in_memory()?, 3)
        .with_topic(topic(
            "things",
            &endpoint,
            Arc::new(StubFetcher::new(&[X, Y])),
            &dir.path().join("resources"),
            1,
        )?)
        .with_publisher(Box::new(publisher.clone()));

    pipeline.discover("things")?;
    let err = pipeline.publish().unwrap_err();
    assert!(err.to_string().contains("2 items still queued"));
    assert_eq!(publisher.count(), 0);

    pipeline.process("things")?;
    pipeline.process("things")?;
    pipeline.publish()?;
    assert_eq!(publisher.count(), 1);
    assert!(pipeline.discover("missing").is_err());
    Ok(())
}

#[test]
fn test_pipeline_from_config_file() -> Result<()> {
    let dir = TempDir::new()?;
    let endpoint = MockEndpoint::start(dataset_handler(
        Arc::new(Mutex::new(vec![X.to_string(), Y.to_string()])),
        HashSet::new(),
    ));
    std::fs::write(dir.path().join("iterate.rq"), ITERATE_QUERY)?;
    std::fs::write(dir.path().join("resource.rq"), common::RESOURCE_QUERY)?;
    let config_path = dir.path().join("graphmirror.json");
    std::fs::write(
        &config_path,
        serde_json::json!({
            "store": { "database": "state/graphmirror.sqlite" },
            "endpoint": { "url": endpoint.url, "timeout_ms": 5000 },
            "retry": { "max_retry_count": 2, "backoff": { "retries": 0 } },
            "max_batches_per_run": 10,
            "topics": [{
                "name": "things",
                "resource_dir": "resources",
                "iterate_query": "iterate.rq",
                "fetch": { "type": "query", "query_file": "resource.rq" },
                "discover": { "page_size": 1, "wait_between_pages_ms": 0 },
                "batch": { "batch_size": 1 },
            }],
        })
        .to_string(),
    )?;

    let config = PipelineConfig::from_file(&config_path)?;
    let pipeline = Pipeline::from_config(&config, Arc::new(CollectingSink::new()))?;
    let summary = pipeline.run()?;
    assert_eq!(summary.discovered, 2);
    assert_eq!(summary.stored, 2);
    assert!(dir.path().join("state/graphmirror.sqlite").exists());
    let store = ContentStore::new(dir.path().join("resources"));
    assert!(store.path_for(X).exists());
    assert!(store.path_for(Y).exists());
    Ok(())
}

#[test]
fn test_topics_keep_their_files_across_sweeps() -> Result<()> {
    let dir = TempDir::new()?;
    let endpoint = MockEndpoint::start(|request| {
        let query = request.query.as_deref().unwrap_or_default();
        if query.starts_with("CONSTRUCT") {
            let iri = common::subject_of(query).unwrap_or_default();
            return MockResponse::ok("application/n-triples", common::ntriples_for(&iri));
        }
        if common::offset_of(query).unwrap_or(0) > 0 {
            return common::select_response(&[]);
        }
        if query.contains("Place") {
            common::select_response(&[Y.to_string()])
        } else {
            common::select_response(&[X.to_string()])
        }
    });
    std::fs::write(dir.path().join("things.rq"), ITERATE_QUERY)?;
    std::fs::write(
        dir.path().join("places.rq"),
        ITERATE_QUERY.replace("Thing", "Place"),
    )?;
    std::fs::write(dir.path().join("resource.rq"), common::RESOURCE_QUERY)?;
    let write_config = |things_dir: &str, places_dir: &str| -> Result<PipelineConfig> {
        let path = dir.path().join("graphmirror.json");
        let topic = |name: &str, resource_dir: &str, query: &str| {
            serde_json::json!({
                "name": name,
                "resource_dir": resource_dir,
                "iterate_query": query,
                "fetch": { "type": "query", "query_file": "resource.rq" },
                "discover": { "wait_between_pages_ms": 0 },
            })
        };
        std::fs::write(
            &path,
            serde_json::json!({
                "store": { "database": "state.sqlite" },
                "endpoint": { "url": endpoint.url },
                "retry": { "backoff": { "retries": 0 } },
                "max_batches_per_run": 5,
                "topics": [
                    topic("things", things_dir, "things.rq"),
                    topic("places", places_dir, "places.rq"),
                ],
            })
            .to_string(),
        )?;
        PipelineConfig::from_file(&path)
    };

    let err = write_config("resources", "resources").unwrap_err();
    assert!(err.downcast_ref::<graphmirror::errors::ConfigError>().is_some());

    let config = write_config("resources/things", "resources/places")?;
    let things = ContentStore::new(dir.path().join("resources/things"));
    let places = ContentStore::new(dir.path().join("resources/places"));
    for _ in 0..2 {
        let pipeline = Pipeline::from_config(&config, Arc::new(CollectingSink::new()))?;
        let summary = pipeline.run()?;
        assert!(summary.states.contains(&State::Sweep { topic: 1 }));
        assert!(things.path_for(X).exists());
        assert!(places.path_for(Y).exists());
        assert_eq!(pipeline.registry().size(Some("things"))?, 1);
        assert_eq!(pipeline.registry().size(Some("places"))?, 1);
    }
    Ok(())
}
