//! End-to-end pipeline tests over real collaborators
//!
//! Archives are real ZIP files in a temporary export directory, uploads go to
//! a wiremock server, and embedding uses the no-op embedder.
//!
//! # Running the tests
//!
//! ```bash
//! cargo test --test pipeline_e2e
//! ```

mod common;

use common::{
    Pipeline, accept_uploads, assert_unit_state, files_under, reject_uploads, write_album,
};
use media_relay::{Error, Event, FailureRef, FileState, RetryScope, Stage, UnitId, UnitState};
use std::collections::HashSet;

#[tokio::test]
async fn test_exports_end_up_in_the_library_and_disk_is_freed() {
    let pipeline = Pipeline::new(|_| {}).await;
    accept_uploads(&pipeline.server).await;
    write_album(&pipeline.exports, "takeout-001", "Paris", 3);
    write_album(&pipeline.exports, "takeout-002", "Home", 2);

    let summary = pipeline.orchestrator.run().await.unwrap();

    assert_eq!(summary.units_discovered, 2);
    assert_eq!(summary.units_reclaimed, 2);
    assert_eq!(summary.outstanding_failures, 0);
    assert_eq!(summary.counts(Stage::Publish).succeeded, 5);
    assert_eq!(pipeline.upload_count().await, 5);
    assert_unit_state(&pipeline.orchestrator, "takeout-001", UnitState::Reclaimed).await;
    assert_unit_state(&pipeline.orchestrator, "takeout-002", UnitState::Reclaimed).await;
    assert_eq!(files_under(&pipeline.config.storage.work_dir), 0);

    // Sidecars are recorded but never uploaded
    let sidecar = pipeline
        .orchestrator
        .db
        .get_file(&UnitId::new("takeout-001"), "Paris/IMG_000.jpg.json")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sidecar.state, FileState::Skipped);

    let photo = pipeline
        .orchestrator
        .db
        .get_file(&UnitId::new("takeout-001"), "Paris/IMG_000.jpg")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(photo.state, FileState::Published);
    assert_eq!(photo.asset_id.as_deref(), Some("asset"));
    assert_eq!(
        photo
            .descriptor
            .as_ref()
            .and_then(|d| d.tags.get("geoData.latitude"))
            .map(String::as_str),
        Some("48.85")
    );

    let snapshot = pipeline.orchestrator.db.export_snapshot().await.unwrap();
    assert_eq!(snapshot.units.len(), 2);
    assert!(snapshot.to_json_pretty().unwrap().contains("takeout-002"));
}

#[tokio::test]
async fn test_budget_keeps_one_export_resident_at_a_time() {
    let temp = tempfile::TempDir::new().unwrap();
    let sizes: Vec<u64> = ["a", "b", "c"]
        .iter()
        .map(|id| {
            std::fs::metadata(write_album(temp.path(), id, "Album", 4))
                .unwrap()
                .len()
        })
        .collect();
    let largest = sizes.iter().copied().max().unwrap();

    let pipeline = Pipeline::new(|c| {
        // Reservation is twice the archive: one fits, two never do
        c.disk_budget.ceiling_bytes = Some(largest * 3);
        c.disk_budget.margin_ratio = 0.0;
        c.disk_budget.margin_floor_bytes = 0;
        c.workers.max_concurrent_units = 3;
    })
    .await;
    for id in ["a", "b", "c"] {
        std::fs::copy(
            temp.path().join(format!("{id}.zip")),
            pipeline.exports.join(format!("{id}.zip")),
        )
        .unwrap();
    }
    accept_uploads(&pipeline.server).await;
    let mut events = pipeline.orchestrator.subscribe();

    let summary = pipeline.orchestrator.run().await.unwrap();
    assert_eq!(summary.units_reclaimed, 3);

    let mut resident: HashSet<UnitId> = HashSet::new();
    let mut most_resident = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            Event::FetchAuthorized { unit_id, .. } => {
                resident.insert(unit_id);
            }
            Event::UnitReclaimed { unit_id, .. } => {
                resident.remove(&unit_id);
            }
            _ => {}
        }
        most_resident = most_resident.max(resident.len());
    }
    assert_eq!(most_resident, 1);
}

#[tokio::test]
async fn test_refused_uploads_are_retried_by_stage() {
    let pipeline = Pipeline::new(|_| {}).await;
    reject_uploads(&pipeline.server, 403).await;
    write_album(&pipeline.exports, "takeout-001", "Paris", 2);

    let summary = pipeline.orchestrator.run().await.unwrap();
    assert_eq!(summary.counts(Stage::Publish).failed, 2);
    assert_eq!(summary.outstanding_failures, 2);
    assert_eq!(summary.units_stalled, 1);
    assert_unit_state(&pipeline.orchestrator, "takeout-001", UnitState::Published).await;

    let failures = pipeline
        .orchestrator
        .ledger()
        .list_failures(Some(Stage::Publish))
        .await
        .unwrap();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| matches!(f.target, FailureRef::File(_))));
    assert!(failures[0].message.contains("403"));

    pipeline.server.reset().await;
    accept_uploads(&pipeline.server).await;

    let retried = pipeline
        .orchestrator
        .retry(RetryScope::Stage(Stage::Publish))
        .await
        .unwrap();
    assert_eq!(retried.counts(Stage::Publish).succeeded, 2);
    assert_eq!(retried.outstanding_failures, 0);
    assert_eq!(pipeline.upload_count().await, 2);

    let finished = pipeline.orchestrator.run().await.unwrap();
    assert_eq!(finished.units_reclaimed, 1);
    assert_eq!(pipeline.upload_count().await, 2);
}

#[tokio::test]
async fn test_failures_survive_a_restart() {
    let pipeline = Pipeline::new(|_| {}).await;
    reject_uploads(&pipeline.server, 503).await;
    write_album(&pipeline.exports, "takeout-001", "Paris", 1);

    let summary = pipeline.orchestrator.run().await.unwrap();
    assert_eq!(summary.outstanding_failures, 1);
    // Transient errors are retried in place before being recorded
    assert_eq!(pipeline.upload_count().await, 2);

    let restarted = pipeline.reopen().await;
    let status = restarted.status().await.unwrap();
    assert_eq!(status.failures, 1);
    assert_eq!(status.files.get(&FileState::FailedPublish), Some(&1));
    assert_eq!(
        status.disk_budget.residents,
        vec![UnitId::new("takeout-001")]
    );

    pipeline.server.reset().await;
    accept_uploads(&pipeline.server).await;
    restarted.retry(RetryScope::All).await.unwrap();
    let summary = restarted.run().await.unwrap();

    assert_eq!(summary.units_reclaimed, 1);
    assert_eq!(pipeline.upload_count().await, 1);
    assert_unit_state(&restarted, "takeout-001", UnitState::Reclaimed).await;
}

#[tokio::test]
async fn test_shutdown_is_clean_and_final() {
    let pipeline = Pipeline::new(|_| {}).await;
    accept_uploads(&pipeline.server).await;
    write_album(&pipeline.exports, "takeout-001", "Paris", 1);
    pipeline.orchestrator.run().await.unwrap();

    pipeline.orchestrator.shutdown().await.unwrap();

    assert!(matches!(
        pipeline.orchestrator.run().await,
        Err(Error::ShuttingDown)
    ));
    assert!(!pipeline.orchestrator.db.was_unclean_shutdown().await.unwrap());
    let budget = pipeline
        .orchestrator
        .db
        .load_disk_budget()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(budget.resident_bytes, 0);
}
