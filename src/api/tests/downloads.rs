use super::*;

#[tokio::test]
async fn test_add_download_runs_to_completion() {
    let (downloader, _temp_dir) = create_test_downloader().await;

    let response = app(&downloader)
        .oneshot(json_request(
            "POST",
            "/downloads",
            serde_json::json!({ "track_id": "t1", "extension_id": FAKE_EXTENSION }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["track_id"], "t1");

    let id = TrackId::from("t1");
    assert!(
        wait_for(|| async {
            downloader
                .get(&id)
                .await
                .is_ok_and(|r| r.status == Status::Completed)
        })
        .await
    );

    let response = app(&downloader)
        .oneshot(empty_request("GET", "/downloads/t1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let record = body_json(response).await;
    assert_eq!(record["status"], "completed");
    assert!(record["final_file"].is_string());

    let response = app(&downloader)
        .oneshot(empty_request("GET", "/downloads"))
        .await
        .unwrap();
    let records = body_json(response).await;
    assert_eq!(records.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_add_download_unknown_provider() {
    let (downloader, _temp_dir) = create_test_downloader().await;

    let response = app(&downloader)
        .oneshot(json_request(
            "POST",
            "/downloads",
            serde_json::json!({ "track_id": "t1", "extension_id": "missing" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "provider_not_found");
    assert_eq!(body["error"]["details"]["extension_id"], "missing");
}

#[tokio::test]
async fn test_get_missing_download() {
    let (downloader, _temp_dir) = create_test_downloader().await;

    let response = app(&downloader)
        .oneshot(empty_request("GET", "/downloads/missing"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_pause_resume_and_cancel() {
    let provider = Arc::new(FakeProvider {
        part_size: 400,
        chunk_delay: Duration::from_millis(5),
        ..Default::default()
    });
    let (downloader, _temp_dir) = create_test_downloader_with(provider).await;
    downloader
        .download(crate::types::TrackRequest {
            track_id: TrackId::from("t1"),
            extension_id: FAKE_EXTENSION.to_string(),
            track_data: None,
            sort_order: 0,
        })
        .await
        .unwrap();
    let id = TrackId::from("t1");

    let response = app(&downloader)
        .oneshot(empty_request("POST", "/downloads/t1/pause"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(
        wait_for(|| async {
            downloader
                .get(&id)
                .await
                .is_ok_and(|r| r.status == Status::Paused)
        })
        .await
    );

    let response = app(&downloader)
        .oneshot(empty_request("POST", "/downloads/t1/resume"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app(&downloader)
        .oneshot(empty_request("DELETE", "/downloads/t1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(downloader.db.get_record(&id).await.unwrap().is_none());

    let response = app(&downloader)
        .oneshot(empty_request("DELETE", "/downloads/t1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_retry_requires_failed_track() {
    let (downloader, _temp_dir) = create_test_downloader().await;
    downloader
        .download(crate::types::TrackRequest {
            track_id: TrackId::from("t1"),
            extension_id: FAKE_EXTENSION.to_string(),
            track_data: None,
            sort_order: 0,
        })
        .await
        .unwrap();
    let id = TrackId::from("t1");
    assert!(
        wait_for(|| async {
            downloader
                .get(&id)
                .await
                .is_ok_and(|r| r.status == Status::Completed)
        })
        .await
    );

    let response = app(&downloader)
        .oneshot(empty_request("POST", "/downloads/t1/retry"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "invalid_state");
    assert_eq!(body["error"]["details"]["operation"], "retry");
}

#[tokio::test]
async fn test_add_context_and_list_it() {
    let (downloader, _temp_dir) = create_test_downloader().await;

    let response = app(&downloader)
        .oneshot(json_request(
            "POST",
            "/contexts",
            serde_json::json!({
                "context_id": "album",
                "extension_id": FAKE_EXTENSION,
                "tracks": [
                    { "track_id": "a", "extension_id": FAKE_EXTENSION },
                    { "track_id": "b", "extension_id": FAKE_EXTENSION },
                ],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let submission = body_json(response).await;
    assert_eq!(submission["queued"], serde_json::json!(["a", "b"]));

    let response = app(&downloader)
        .oneshot(empty_request("GET", "/contexts/album"))
        .await
        .unwrap();
    let records = body_json(response).await;
    let ids: Vec<&str> = records
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["track_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn test_cancel_all_downloads() {
    let provider = Arc::new(FakeProvider {
        part_size: 400,
        chunk_delay: Duration::from_millis(5),
        ..Default::default()
    });
    let (downloader, _temp_dir) = create_test_downloader_with(provider).await;
    for id in ["a", "b"] {
        downloader
            .download(crate::types::TrackRequest {
                track_id: TrackId::from(id),
                extension_id: FAKE_EXTENSION.to_string(),
                track_data: None,
                sort_order: 0,
            })
            .await
            .unwrap();
    }

    let response = app(&downloader)
        .oneshot(empty_request("DELETE", "/downloads"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["cancelled"], 2);
    assert!(downloader.list().await.unwrap().is_empty());
}
