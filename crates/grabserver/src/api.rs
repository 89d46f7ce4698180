//! HTTP surface: metadata lookup, job submission, one-time downloads.

use std::{path::PathBuf, sync::Arc};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    artifacts::{self, ArtifactStore},
    engine::{MediaEngine, MediaFormat},
    error::Error,
    job::{JobRequest, JobRunner},
    metadata::{self, MediaSummary},
    progress::ProgressHub,
    ws,
};

/// Everything outside RFC 5987 `attr-char` gets escaped.
const RFC5987_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

#[derive(Clone)]
pub struct AppState {
    pub download_dir: PathBuf,
    pub ytdlp: bool,
    pub ffmpeg: bool,
    pub cors_allow_any: bool,
    pub engine: Arc<dyn MediaEngine>,
    pub hub: ProgressHub,
    pub store: Arc<dyn ArtifactStore>,
    pub runner: JobRunner,
}

impl AppState {
    pub fn new(
        download_dir: impl Into<PathBuf>,
        engine: Arc<dyn MediaEngine>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let download_dir = download_dir.into();
        let hub = ProgressHub::new();
        let runner = JobRunner::new(engine.clone(), hub.clone(), store.clone(), &download_dir);
        Self {
            download_dir,
            ytdlp: false,
            ffmpeg: false,
            cors_allow_any: false,
            engine,
            hub,
            store,
            runner,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors_allow_any = state.cors_allow_any;

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/get_info", post(get_info))
        .route("/start_download", post(start_download))
        .route("/download/{token}", get(download))
        .route("/ws", get(ws::progress_socket))
        .with_state(state);

    if cors_allow_any {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    router.layer(TraceLayer::new_for_http())
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(value: Error) -> Self {
        match value {
            Error::InvalidInput(msg) => Self::BadRequest(msg),
            Error::ArtifactNotFound(msg) => Self::NotFound(msg.to_string()),
            err @ (Error::MetadataUnavailable | Error::JobFailure(_)) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "ok": false, "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    service: &'static str,
    download_dir: String,
    ytdlp: bool,
    ffmpeg: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: "grabserver",
        download_dir: state.download_dir.display().to_string(),
        ytdlp: state.ytdlp,
        ffmpeg: state.ffmpeg,
    })
}

#[derive(Deserialize)]
struct InfoRequest {
    url: Option<String>,
}

async fn get_info(
    State(state): State<AppState>,
    Json(req): Json<InfoRequest>,
) -> ApiResult<Json<MediaSummary>> {
    let url = req.url.unwrap_or_default();
    let summary = metadata::resolve(state.engine.as_ref(), &url).await?;
    Ok(Json(summary))
}

#[derive(Deserialize)]
struct StartDownloadForm {
    url: Option<String>,
    option: Option<String>,
    progress_id: Option<String>,
}

#[derive(Serialize)]
struct StartedResponse {
    started: bool,
}

async fn start_download(
    State(state): State<AppState>,
    Form(form): Form<StartDownloadForm>,
) -> ApiResult<Json<StartedResponse>> {
    let request = JobRequest::parse(
        form.url.as_deref().unwrap_or_default(),
        form.option.as_deref().unwrap_or_default(),
        form.progress_id.as_deref().unwrap_or_default(),
    )?;

    // Fire and forget: the job reports through its progress channel.
    drop(state.runner.submit(request));
    Ok(Json(StartedResponse { started: true }))
}

async fn download(State(state): State<AppState>, Path(token): Path<String>) -> ApiResult<Response> {
    let consumed = artifacts::consume(state.store.as_ref(), &token).await?;
    let disposition = content_disposition(&consumed.download_name);
    let content_type = content_type_for(&consumed.download_name);

    // The cleanup guard rides inside the body stream, so the file goes away
    // once the body is finished or dropped by a disconnecting client.
    let cleanup = consumed.cleanup;
    let stream = ReaderStream::new(consumed.file).map(move |chunk| {
        let _guard = &cleanup;
        chunk
    });

    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(consumed.len));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

fn content_type_for(name: &str) -> &'static str {
    name.rsplit_once('.')
        .and_then(|(_, ext)| MediaFormat::from_option(ext))
        .map_or("application/octet-stream", MediaFormat::content_type)
}

/// Attachment header with an ASCII fallback plus the RFC 5987 UTF-8 form.
fn content_disposition(name: &str) -> String {
    let ascii: String = name
        .chars()
        .map(|c| if c.is_ascii_graphic() && c != '"' && c != '\\' { c } else { '_' })
        .collect();
    let encoded = utf8_percent_encode(name, RFC5987_ESCAPE);
    format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_has_ascii_fallback_and_utf8_name() {
        assert_eq!(
            content_disposition("Song-Live.mp3"),
            "attachment; filename=\"Song-Live.mp3\"; filename*=UTF-8''Song-Live.mp3"
        );
        assert_eq!(
            content_disposition("Café.mp4"),
            "attachment; filename=\"Caf_.mp4\"; filename*=UTF-8''Caf%C3%A9.mp4"
        );
        assert_eq!(
            content_disposition("two words+more.mp3"),
            "attachment; filename=\"two_words+more.mp3\"; filename*=UTF-8''two%20words+more.mp3"
        );
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type_for("a.mp4"), "video/mp4");
        assert_eq!(content_type_for("a.mp3"), "audio/mpeg");
        assert_eq!(content_type_for("a"), "application/octet-stream");
    }

    #[test]
    fn domain_errors_map_to_statuses() {
        let status = |e: Error| ApiError::from(e).into_response().status();
        assert_eq!(status(Error::invalid_input("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status(Error::MetadataUnavailable), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status(Error::ArtifactNotFound("File not found")), StatusCode::NOT_FOUND);
    }
}
