
use crate::db::*;
use crate::types::TrackId;
use tempfile::NamedTempFile;

/// Open a fresh database; the temp file must outlive the handle
async fn open_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

fn new_record(track_id: &str) -> NewRecord {
    NewRecord {
        track_id: TrackId::from(track_id),
        extension_id: "test-ext".to_string(),
        context_id: None,
        track_data: None,
        sort_order: 0,
    }
}

fn context_record(track_id: &str, context_id: &str, sort_order: i64) -> NewRecord {
    NewRecord {
        context_id: Some(context_id.to_string()),
        sort_order,
        ..new_record(track_id)
    }
}
