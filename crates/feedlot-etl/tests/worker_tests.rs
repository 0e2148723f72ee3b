//! Poller and worker pool driving files through the store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::*;
use feedlot_etl::catalog::PipelineType;
use feedlot_etl::state::FileState;
use feedlot_etl::worker::{JobKind, Poller, WorkerPool};

fn drain(pool: &WorkerPool, expected: usize) -> Vec<feedlot_etl::worker::JobResult> {
    let mut results = Vec::new();
    while results.len() < expected {
        match pool.recv_result_timeout(Duration::from_secs(30)) {
            Some(result) => results.push(result),
            None => panic!("timed out after {} of {} results", results.len(), expected),
        }
    }
    results
}

#[test]
fn test_poller_feeds_uploads_to_workers() {
    let config = ConfigBuilder::new().workers(2).build();
    let harness = TestHarness::with_config(config);
    let csv = distribution_csv();
    let ids: Vec<String> = (0..3)
        .map(|_| harness.upload(PipelineType::Distribution, &csv))
        .collect();

    let pool = WorkerPool::new(Arc::clone(&harness.pipeline), 2).unwrap();
    let poller = Poller::new(harness.controller().clone(), 10);

    assert_eq!(poller.tick(&pool).unwrap(), 3);
    let results = drain(&pool, 3);
    pool.shutdown();
    pool.wait();

    for result in &results {
        assert_eq!(result.kind, JobKind::Ingest);
        assert_eq!(result.final_state(), Some(FileState::Loaded), "{:?}", result.outcome);
    }
    for id in &ids {
        assert_eq!(harness.state(id), FileState::Loaded);
    }
    // Identical rows collapse onto the same facts.
    assert_eq!(harness.facts(ORG_A).len(), 3);
}

#[test]
fn test_poller_queues_load_for_approved_files() {
    let config = ConfigBuilder::new().require_approval(true).build();
    let harness = TestHarness::with_config(config);
    let file_id = harness.upload(PipelineType::Distribution, &distribution_csv());

    let pool = WorkerPool::new(Arc::clone(&harness.pipeline), 1).unwrap();
    let poller = Poller::new(harness.controller().clone(), 10);

    poller.tick(&pool).unwrap();
    let parked = drain(&pool, 1);
    assert_eq!(parked[0].final_state(), Some(FileState::AwaitingApproval));

    // Nothing to do while the file waits for a reviewer.
    assert!(poller.poll(Utc::now()).unwrap().is_empty());

    let file = harness.controller().get_file(&file_id).unwrap();
    harness
        .controller()
        .approve(&file_id, "reviewer", file.version)
        .unwrap();

    let jobs = poller.poll(Utc::now()).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::Load);

    poller.tick(&pool).unwrap();
    let loaded = drain(&pool, 1);
    pool.shutdown();
    pool.wait();

    assert_eq!(loaded[0].kind, JobKind::Load);
    assert_eq!(harness.state(&file_id), FileState::Loaded);
}

#[test]
fn test_stale_lease_is_reclaimed_and_retried() {
    let config = ConfigBuilder::new()
        .raw("lifecycle", "stale_processing_timeout_secs", serde_json::json!(60))
        .build();
    let harness = TestHarness::with_config(config);
    let file_id = harness.upload(PipelineType::Distribution, &distribution_csv());

    // A worker claimed the file and vanished.
    let controller = harness.controller();
    controller.acquire_lease(&file_id, "crashed-worker").unwrap();
    controller
        .transition(
            &file_id,
            feedlot_etl::state::Transition::new(FileState::Parsing, 1, "crashed-worker"),
        )
        .unwrap();

    let poller = Poller::new(controller.clone(), 10);
    assert!(poller.poll(Utc::now()).unwrap().is_empty());

    // Past the lease and the first retry delay.
    let later = Utc::now() + chrono::Duration::minutes(5);
    let jobs = poller.poll(later).unwrap();

    let file = controller.get_file(&file_id).unwrap();
    assert_eq!(file.current_state, FileState::Failed);
    assert!(file.locked_by.is_none());
    assert!(!file.dead_lettered);

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::Ingest);
    assert_eq!(jobs[0].file_id, file_id);
}
