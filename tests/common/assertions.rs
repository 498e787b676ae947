//! Waiting helpers for pipeline tests

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use track_dl::{DownloadRecord, Event, Status, TrackDownloader, TrackId};

/// How long any single wait may take before the test fails
pub const WAIT: Duration = Duration::from_secs(10);

/// Poll `check` every 10ms until it holds or [`WAIT`] elapses
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Fetch a record, if it exists
pub async fn record(downloader: &TrackDownloader, id: &str) -> Option<DownloadRecord> {
    downloader
        .db
        .get_record(&TrackId::new(id))
        .await
        .expect("store should be readable")
}

/// Wait until the record of `id` reaches `status`
pub async fn wait_for_status(downloader: &TrackDownloader, id: &str, status: Status) -> bool {
    eventually(|| async { record(downloader, id).await.is_some_and(|r| r.status == status) }).await
}

/// Wait until `id` has persisted at least `bytes` of progress
pub async fn wait_for_progress(downloader: &TrackDownloader, id: &str, bytes: u64) -> bool {
    eventually(|| async {
        record(downloader, id)
            .await
            .is_some_and(|r| r.progress_bytes >= bytes)
    })
    .await
}

/// Receive events until `stop` matches one, returning everything received
///
/// Panics when [`WAIT`] elapses or the channel closes first.
pub async fn collect_events_until(
    events: &mut broadcast::Receiver<Event>,
    stop: impl Fn(&Event) -> bool,
) -> Vec<Event> {
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = stop(&event);
                    seen.push(event);
                    if done {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    panic!("event receiver lagged by {skipped}");
                }
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event");
    seen
}

/// Whether `event` reports that `id` was saved
pub fn is_completed(event: &Event, id: &str) -> bool {
    matches!(event, Event::Completed { track_id, .. } if track_id.as_str() == id)
}

/// Whether `event` reports that `id` failed
pub fn is_failed(event: &Event, id: &str) -> bool {
    matches!(event, Event::Failed { track_id, .. } if track_id.as_str() == id)
}
