use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use grabserver::{
    engine::{
        DownloadRequest, DownloadedMedia, EngineError, EngineProgress, MediaInfo, RawProgress,
        ThumbnailCandidate,
    },
    progress::Subscriber,
    router, AppState, InMemoryArtifactStore, MediaEngine, ProgressEvent,
};
use tokio::sync::mpsc;
use tower::ServiceExt;

struct FakeEngine;

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn extract_metadata(&self, url: &str) -> Result<MediaInfo, EngineError> {
        if url.contains("broken") {
            return Err(EngineError::Failed {
                status: "exit status: 1".into(),
                stderr: "ERROR: secret internal detail".into(),
            });
        }
        Ok(MediaInfo {
            id: Some("vid123".into()),
            title: Some("Fake Title".into()),
            thumbnail: None,
            thumbnails: Some(vec![
                ThumbnailCandidate {
                    url: Some("//cdn.example.com/small.jpg".into()),
                    width: Some(120.0),
                    height: Some(90.0),
                },
                ThumbnailCandidate {
                    url: Some("//cdn.example.com/large.jpg".into()),
                    width: Some(1280.0),
                    height: Some(720.0),
                },
            ]),
        })
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        progress: mpsc::UnboundedSender<EngineProgress>,
    ) -> Result<DownloadedMedia, EngineError> {
        if request.url.contains("broken") {
            return Err(EngineError::Failed {
                status: "exit status: 1".into(),
                stderr: "ERROR: Video unavailable".into(),
            });
        }

        let _ = progress.send(EngineProgress::Downloading(RawProgress {
            percent: Some("100.0%".into()),
            downloaded_bytes: Some(11.0),
            total_bytes: Some(11.0),
            ..Default::default()
        }));
        let _ = progress.send(EngineProgress::Finished);

        let path = PathBuf::from(
            request
                .output_template
                .replace("%(title)s", "Fake Title")
                .replace("%(ext)s", request.format.extension()),
        );
        std::fs::write(&path, b"media bytes").unwrap();
        Ok(DownloadedMedia {
            id: Some("vid123".into()),
            title: Some("Fake Title (HD)".into()),
            path,
        })
    }
}

struct TestApp {
    dir: tempfile::TempDir,
    app: Router,
    subscriber: Subscriber,
}

fn test_app(channel: &str) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(
        dir.path(),
        Arc::new(FakeEngine),
        Arc::new(InMemoryArtifactStore::new()),
    );
    let mut subscriber = state.hub.connect();
    subscriber.subscribe(channel).unwrap();
    TestApp {
        dir,
        app: router(state),
        subscriber,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn form_post(uri: &str, body: &str) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

async fn next_terminal_event(subscriber: &mut Subscriber) -> ProgressEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match subscriber.recv().await {
                Some(event @ (ProgressEvent::Ready { .. } | ProgressEvent::Error { .. })) => {
                    return event
                }
                Some(_) => continue,
                None => panic!("subscriber closed"),
            }
        }
    })
    .await
    .expect("job did not finish in time")
}

#[tokio::test]
async fn health_reports_service() {
    let t = test_app("room");
    let (status, _, body) = send(&t.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "grabserver");
}

#[tokio::test]
async fn get_info_returns_title_and_largest_thumbnail() {
    let t = test_app("room");
    let (status, _, body) = send(
        &t.app,
        json_post("/get_info", serde_json::json!({"url": "https://example.com/watch"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "title": "Fake Title",
            "thumbnail": "https://cdn.example.com/large.jpg",
        })
    );
}

#[tokio::test]
async fn get_info_rejects_blank_url() {
    let t = test_app("room");
    let (status, _, body) =
        send(&t.app, json_post("/get_info", serde_json::json!({"url": "   "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "No URL provided");
}

#[tokio::test]
async fn get_info_hides_engine_details() {
    let t = test_app("room");
    let (status, _, body) = send(
        &t.app,
        json_post("/get_info", serde_json::json!({"url": "https://broken.example"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("Could not fetch video info"));
    assert!(!text.contains("secret"));
}

#[tokio::test]
async fn start_download_validates_parameters() {
    let t = test_app("room");
    for body in [
        "url=&option=1&progress_id=room",
        "url=https%3A%2F%2Fexample.com&option=9&progress_id=room",
        "url=https%3A%2F%2Fexample.com&option=1",
    ] {
        let (status, _, _) = send(&t.app, form_post("/start_download", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    }
}

#[tokio::test]
async fn full_flow_serves_file_once_and_deletes_it() {
    let mut t = test_app("room-42");

    let (status, _, body) = send(
        &t.app,
        form_post(
            "/start_download",
            "url=https%3A%2F%2Fexample.com%2Fwatch&option=2&progress_id=room-42",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&body).unwrap(),
        serde_json::json!({"started": true})
    );

    let ProgressEvent::Ready {
        download_url,
        filename,
    } = next_terminal_event(&mut t.subscriber).await
    else {
        panic!("expected ready event");
    };
    assert_eq!(filename, "Fake-Title-HD.mp3");

    let (status, headers, body) = send(&t.app, get(&download_url)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"media bytes");
    assert_eq!(headers[header::CONTENT_TYPE], "audio/mpeg");
    let disposition = headers[header::CONTENT_DISPOSITION].to_str().unwrap();
    assert!(disposition.starts_with("attachment;"));
    assert!(disposition.contains("Fake-Title-HD.mp3"));

    assert_eq!(std::fs::read_dir(t.dir.path()).unwrap().count(), 0);

    let (status, _, _) = send(&t.app, get(&download_url)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn abandoned_download_still_deletes_file() {
    let mut t = test_app("room-9");

    let (status, _, _) = send(
        &t.app,
        form_post(
            "/start_download",
            "url=https%3A%2F%2Fexample.com%2Fwatch&option=1&progress_id=room-9",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let ProgressEvent::Ready { download_url, .. } = next_terminal_event(&mut t.subscriber).await
    else {
        panic!("expected ready event");
    };
    assert_eq!(std::fs::read_dir(t.dir.path()).unwrap().count(), 1);

    // Client goes away right after the headers: the body is never polled.
    let response = t.app.clone().oneshot(get(&download_url)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(std::fs::read_dir(t.dir.path()).unwrap().count(), 1);
    drop(response);

    assert_eq!(std::fs::read_dir(t.dir.path()).unwrap().count(), 0);

    let (status, _, _) = send(&t.app, get(&download_url)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_job_reports_error_event() {
    let mut t = test_app("room-7");

    let (status, _, _) = send(
        &t.app,
        form_post(
            "/start_download",
            "url=https%3A%2F%2Fbroken.example&option=1&progress_id=room-7",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        next_terminal_event(&mut t.subscriber).await,
        ProgressEvent::Error {
            message: "Video unavailable or removed.".into()
        }
    );
}

#[tokio::test]
async fn unknown_token_is_not_found() {
    let t = test_app("room");
    let (status, _, _) = send(&t.app, get("/download/deadbeef")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
