use super::*;
use crate::downloader::test_helpers::{
    FAKE_EXTENSION, FakeProvider, create_test_downloader, create_test_downloader_with, wait_for,
};
use crate::types::{ContextRequest, Status, TrackRequest};
use std::time::Duration;


fn track(id: &str) -> TrackRequest {
    TrackRequest {
        track_id: TrackId::from(id),
        extension_id: FAKE_EXTENSION.to_string(),
        track_data: None,
        sort_order: 0,
    }
}

fn slow_provider() -> FakeProvider {
    FakeProvider {
        part_size: 400,
        chunk_delay: Duration::from_millis(5),
        ..Default::default()
    }
}

async fn status_of(downloader: &TrackDownloader, id: &TrackId) -> Option<Status> {
    downloader
        .db
        .get_record(id)
        .await
        .unwrap()
        .map(|record| record.status)
}

async fn wait_status(downloader: &TrackDownloader, id: &TrackId, status: Status) -> bool {
    wait_for(|| async { status_of(downloader, id).await == Some(status) }).await
}
