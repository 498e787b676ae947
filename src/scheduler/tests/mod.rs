use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

use super::Scheduler;
use crate::config::Config;
use crate::db::{Database, NewContext, NewRecord};
use crate::downloader::test_helpers::{FAKE_EXTENSION, FakeProvider, test_config, wait_for};
use crate::error::Error;
use crate::progress::{Final, Progress};
use crate::provider::ProviderRegistry;
use crate::stages::plan::load_only;
use crate::types::{Event, StageKind, Status, TrackId};

struct Harness {
    scheduler: Scheduler,
    db: Arc<Database>,
    events: broadcast::Sender<Event>,
    _dir: TempDir,
}

async fn harness_with(provider: Arc<FakeProvider>, tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let db = Arc::new(
        Database::new(&config.persistence.database_path)
            .await
            .unwrap(),
    );
    let registry = ProviderRegistry::new().with(FAKE_EXTENSION, provider);
    let (events, _) = broadcast::channel(1000);
    let scheduler = Scheduler::new(
        Arc::clone(&db),
        Arc::new(registry),
        Arc::new(config),
        events.clone(),
    );
    Harness {
        scheduler,
        db,
        events,
        _dir: dir,
    }
}

async fn harness(provider: Arc<FakeProvider>) -> Harness {
    harness_with(provider, |_| {}).await
}

fn slow_provider() -> FakeProvider {
    FakeProvider {
        part_size: 400,
        chunk_delay: Duration::from_millis(5),
        ..Default::default()
    }
}

impl Harness {
    async fn insert(&self, id: &str, context_id: Option<&str>) -> TrackId {
        self.db
            .insert_record(&NewRecord {
                track_id: TrackId::from(id),
                extension_id: FAKE_EXTENSION.to_string(),
                context_id: context_id.map(str::to_string),
                track_data: None,
                sort_order: 0,
            })
            .await
            .unwrap();
        TrackId::from(id)
    }

    async fn start(&self, id: &str) -> TrackId {
        let track_id = self.insert(id, None).await;
        self.scheduler
            .enqueue(track_id.clone(), FAKE_EXTENSION, load_only())
            .unwrap();
        track_id
    }

    async fn status(&self, id: &TrackId) -> Option<Status> {
        self.db.get_record(id).await.unwrap().map(|r| r.status)
    }

    async fn wait_status(&self, id: &TrackId, status: Status) -> bool {
        wait_for(|| async { self.status(id).await == Some(status) }).await
    }

    async fn wait_untracked(&self, id: &TrackId) -> bool {
        wait_for(|| async { !self.scheduler.is_tracked(id) }).await
    }
}

#[tokio::test]
async fn test_track_runs_every_stage_in_order() {
    let provider = Arc::new(FakeProvider::default());
    let h = harness(provider.clone()).await;
    let id = h.start("t1").await;

    assert!(h.wait_status(&id, Status::Completed).await);
    assert!(h.wait_untracked(&id).await);

    let record = h.db.get_record(&id).await.unwrap().unwrap();
    let final_file = record.final_file.unwrap();
    let mut expected = provider.part_bytes(0);
    expected.extend(provider.part_bytes(1));
    expected.extend_from_slice(b"[tagged]");
    assert_eq!(tokio::fs::read(&final_file).await.unwrap(), expected);

    let mut calls = provider.calls();
    // The two downloads run concurrently, in either order
    calls[3..5].sort();
    assert_eq!(
        calls,
        vec![
            "load t1",
            "stream t1",
            "sources t1",
            "download t1#0 from 0",
            "download t1#1 from 0",
            "merge t1",
            "tag t1",
            "save t1",
        ]
    );
}

#[tokio::test]
async fn test_enqueue_rejects_tracked_track() {
    let h = harness(Arc::new(slow_provider())).await;
    let id = h.start("t1").await;

    let err = h
        .scheduler
        .enqueue(id.clone(), FAKE_EXTENSION, load_only())
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyQueued(ref t) if *t == id));

    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_enqueue_rejects_unknown_provider() {
    let h = harness(Arc::new(FakeProvider::default())).await;
    let id = h.insert("t1", None).await;

    let err = h
        .scheduler
        .enqueue(id.clone(), "missing", load_only())
        .unwrap_err();
    assert!(matches!(err, Error::ProviderNotFound(ref ext) if ext == "missing"));
    assert!(!h.scheduler.is_tracked(&id));
}

#[tokio::test]
async fn test_download_groups_respect_provider_cap() {
    let provider = Arc::new(FakeProvider {
        sources: vec![0],
        concurrency: 2,
        part_size: 40,
        chunk_delay: Duration::from_millis(5),
        ..Default::default()
    });
    let h = harness(provider.clone()).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(h.start(&format!("t{i}")).await);
    }
    for id in &ids {
        assert!(h.wait_status(id, Status::Completed).await);
    }
    assert_eq!(provider.max_active.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failure_stops_only_its_own_track() {
    let provider = Arc::new(FakeProvider {
        sources: vec![0, 1],
        concurrency: 4,
        ..Default::default()
    });
    provider.fail_source(1);
    let h = harness(provider.clone()).await;

    let failing = h.start("a").await;
    assert!(h.wait_status(&failing, Status::Failed).await);
    assert!(h.wait_untracked(&failing).await);

    let record = h.db.get_record(&failing).await.unwrap().unwrap();
    let error = record.last_error.as_ref().unwrap();
    assert_eq!(error.stage, StageKind::Download);
    // Sibling download ran to completion
    assert!(record.partial_file(0).is_some());
    assert!(!provider.calls().iter().any(|c| c.starts_with("merge")));
}

#[tokio::test]
async fn test_pause_and_resume_forward_to_live_stages() {
    let h = harness(Arc::new(slow_provider())).await;
    let id = h.start("t1").await;

    assert!(
        wait_for(|| async {
            h.db
                .get_record(&id)
                .await
                .unwrap()
                .is_some_and(|r| r.progress_bytes >= 40)
        })
        .await
    );
    assert!(h.scheduler.pause(&id));
    assert!(h.wait_status(&id, Status::Paused).await);
    // Both download stages observe the switch; let the second one settle
    tokio::time::sleep(Duration::from_millis(50)).await;

    let paused_at = h.db.get_record(&id).await.unwrap().unwrap().progress_bytes;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let still = h.db.get_record(&id).await.unwrap().unwrap();
    assert_eq!(still.status, Status::Paused);
    assert_eq!(still.progress_bytes, paused_at);

    assert!(h.scheduler.resume(&id));
    assert!(h.wait_status(&id, Status::Completed).await);
}

#[tokio::test]
async fn test_pause_of_untracked_track_is_refused() {
    let h = harness(Arc::new(FakeProvider::default())).await;
    let id = h.insert("t1", None).await;
    assert!(!h.scheduler.pause(&id));
    assert!(!h.scheduler.resume(&id));
}

#[tokio::test]
async fn test_remove_cancels_and_deletes() {
    let h = harness(Arc::new(slow_provider())).await;
    let id = h.start("t1").await;
    let mut events = h.events.subscribe();

    assert!(
        wait_for(|| async { h.status(&id).await == Some(Status::Progressing) }).await
    );
    assert!(h.scheduler.remove(&id).await.unwrap());

    assert!(!h.scheduler.is_tracked(&id));
    assert!(h.db.get_record(&id).await.unwrap().is_none());
    assert!(
        !h.scheduler
            .running_stages()
            .iter()
            .any(|key| key.track_id == id)
    );

    let mut removed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::Removed { .. }) {
            removed += 1;
        }
    }
    assert_eq!(removed, 1);

    // Second remove finds nothing
    assert!(!h.scheduler.remove(&id).await.unwrap());
}

#[tokio::test]
async fn test_remove_all_clears_every_job() {
    let h = harness(Arc::new(slow_provider())).await;
    h.start("t1").await;
    h.start("t2").await;

    assert_eq!(h.scheduler.remove_all().await.unwrap(), 2);
    assert!(h.scheduler.tracked().is_empty());
    assert!(h.db.list_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_shutdown_keeps_records_and_scan_resumes_them() {
    let provider = Arc::new(slow_provider());
    let h = harness(provider.clone()).await;
    let id = h.start("t1").await;

    assert!(
        wait_for(|| async { h.status(&id).await == Some(Status::Progressing) }).await
    );
    h.scheduler.shutdown().await;
    assert!(h.scheduler.tracked().is_empty());
    let record = h.db.get_record(&id).await.unwrap().unwrap();
    assert!(!record.status.is_final());

    // A fresh scheduler over the same store picks the record up again
    let restarted = Scheduler::new(
        Arc::clone(&h.db),
        Arc::clone(&h.scheduler.providers),
        Arc::clone(&h.scheduler.config),
        h.events.clone(),
    );
    let report = restarted.resume_scan().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert!(h.wait_status(&id, Status::Completed).await);

    // Metadata and stream were not requested twice
    let loads = provider
        .calls()
        .iter()
        .filter(|c| c.starts_with("load"))
        .count();
    assert_eq!(loads, 1);
}

#[tokio::test]
async fn test_resume_scan_skips_paused_and_tracked_records() {
    let h = harness(Arc::new(slow_provider())).await;
    let paused = h.insert("paused", None).await;
    h.db.apply_status(&paused, Status::Paused).await.unwrap();
    let running = h.start("running").await;

    let report = h.scheduler.resume_scan().await.unwrap();
    assert_eq!(report.resumed, 0);
    assert!(!h.scheduler.is_tracked(&paused));
    assert!(h.scheduler.is_tracked(&running));

    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_resume_scan_completes_pending_context() {
    let provider = Arc::new(FakeProvider::default());
    let h = harness(provider.clone()).await;
    h.db.insert_context(&NewContext {
        context_id: "album".to_string(),
        extension_id: FAKE_EXTENSION.to_string(),
        context_data: None,
    })
    .await
    .unwrap();
    let id = h.insert("t1", Some("album")).await;
    h.db.commit_stage_output(
        &id,
        &crate::db::StageOutput::Saved(std::path::PathBuf::from("t1.bin")),
    )
    .await
    .unwrap();

    let report = h.scheduler.resume_scan().await.unwrap();
    assert_eq!(report.contexts_completed, 1);
    assert_eq!(
        provider
            .calls()
            .iter()
            .filter(|c| c.starts_with("context"))
            .count(),
        1
    );
    assert_eq!(h.scheduler.resume_scan().await.unwrap().contexts_completed, 0);
}

#[tokio::test]
async fn test_progress_stream_carries_running_stages() {
    let h = harness(Arc::new(slow_provider())).await;
    let mut stream = h.scheduler.progress_stream();
    let id = h.start("t1").await;

    let mut saw_download_progress = false;
    let mut saw_save_final = false;
    while !(saw_download_progress && saw_save_final) {
        let (key, value) = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key.track_id, id);
        match (key.stage, value) {
            (StageKind::Download, Progress::InProgress { downloaded, .. }) if downloaded > 0 => {
                saw_download_progress = true;
            }
            (StageKind::Save, Progress::Final(Final::Completed { .. })) => saw_save_final = true,
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_prune_removes_completed_record() {
    let h = harness_with(Arc::new(FakeProvider::default()), |config| {
        config.persistence.prune_completed = true;
    })
    .await;
    let id = h.start("t1").await;

    assert!(h.wait_untracked(&id).await);
    assert!(
        wait_for(|| async { h.db.get_record(&id).await.unwrap().is_none() }).await
    );
}
