//! Seam to the external extraction/transcoding engine.

mod ytdlp;

pub use ytdlp::YtDlpEngine;

use std::{ffi::OsStr, path::PathBuf, process::Command};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Output container requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    /// H.264 + AAC in MP4.
    Video,
    /// MP3.
    Audio,
}

impl MediaFormat {
    /// Accepts the form values the page sends ("1"/"2") as well as names.
    pub fn from_option(option: &str) -> Option<Self> {
        match option.trim().to_ascii_lowercase().as_str() {
            "1" | "video" | "mp4" => Some(Self::Video),
            "2" | "audio" | "mp3" => Some(Self::Audio),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Audio => "mp3",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Video => "video/mp4",
            Self::Audio => "audio/mpeg",
        }
    }
}

/// Metadata as reported by the engine; only the fields we read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub thumbnails: Option<Vec<ThumbnailCandidate>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThumbnailCandidate {
    pub url: Option<String>,
    pub width: Option<f64>,
    pub height: Option<f64>,
}

/// Raw progress fields as the engine emits them. Text fields may carry
/// terminal escapes; byte counts may be fractional estimates.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawProgress {
    #[serde(rename = "_percent_str")]
    pub percent: Option<String>,
    #[serde(rename = "_speed_str")]
    pub speed: Option<String>,
    #[serde(rename = "_eta_str")]
    pub eta: Option<String>,
    pub downloaded_bytes: Option<f64>,
    pub total_bytes: Option<f64>,
    pub total_bytes_estimate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineProgress {
    Downloading(RawProgress),
    /// One stream finished downloading; post-processing may still follow.
    Finished,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub format: MediaFormat,
    pub output_template: String,
}

/// What the engine reports once download and conversion return.
#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub id: Option<String>,
    pub title: Option<String>,
    pub path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to launch {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("unexpected engine output: {0}")]
    Output(String),
}

impl EngineError {
    /// Client-safe summary of the failure. The raw text stays in the logs.
    pub fn user_message(&self) -> &'static str {
        let Self::Failed { stderr, .. } = self else {
            return "Download failed";
        };
        let lower = stderr.to_lowercase();

        if lower.contains("http error 429") {
            "Too many requests to the source site. Try again later."
        } else if lower.contains("private video") {
            "This video is private."
        } else if lower.contains("sign in to confirm") || lower.contains("login required") {
            "This video requires login."
        } else if lower.contains("http error 403") || lower.contains("forbidden") {
            "Access denied by the source site."
        } else if lower.contains("ffmpeg") && lower.contains("not found") {
            "Conversion tool is not available on the server."
        } else if lower.contains("unsupported url") {
            "Unsupported URL."
        } else if lower.contains("video unavailable") || lower.contains("not available") {
            "Video unavailable or removed."
        } else if lower.contains("timed out") {
            "Connection to the source site timed out."
        } else {
            "Download failed"
        }
    }
}

/// The external engine as the job runner and metadata resolver see it.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Look up title/thumbnail without downloading anything.
    async fn extract_metadata(&self, url: &str) -> Result<MediaInfo, EngineError>;

    /// Download and convert in one go, reporting progress on `progress`.
    /// The sender is dropped when the call returns.
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: mpsc::UnboundedSender<EngineProgress>,
    ) -> Result<DownloadedMedia, EngineError>;
}

/// True if `bin` runs and exits cleanly with `arg`.
pub fn probe_binary(bin: impl AsRef<OsStr>, arg: &str) -> bool {
    let output = Command::new(bin).arg(arg).output();

    match output {
        Ok(out) => out.status.success(),
        Err(_) => false,
    }
}
