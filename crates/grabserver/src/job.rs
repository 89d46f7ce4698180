//! Background download+convert jobs.
//!
//! Each submission runs on its own task with its own error boundary: the
//! request that started it has already returned, so every outcome is
//! reported through the job's progress channel.

use std::{
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use futures::FutureExt;
use regex::Regex;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    artifacts::{self, Artifact, ArtifactStore},
    engine::{DownloadRequest, EngineProgress, MediaEngine, MediaFormat, RawProgress},
    error::{Error, Result},
    naming,
    progress::{ProgressEvent, ProgressHub, Publisher},
};

const EMPTY_OUTPUT_MESSAGE: &str = "The downloaded file is empty";
const GENERIC_FAILURE_MESSAGE: &str = "Download failed";

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid ANSI regex"));

/// A validated submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub url: String,
    pub format: MediaFormat,
    pub channel_id: String,
}

impl JobRequest {
    pub fn parse(url: &str, option: &str, channel_id: &str) -> Result<Self> {
        let url = url.trim();
        let channel_id = channel_id.trim();
        let format = MediaFormat::from_option(option);

        match format {
            Some(format) if !url.is_empty() && !channel_id.is_empty() => Ok(Self {
                url: url.to_string(),
                format,
                channel_id: channel_id.to_string(),
            }),
            _ => Err(Error::invalid_input("Missing or invalid parameters")),
        }
    }
}

/// Starts jobs. Cheap to clone; all clones share the same engine, hub,
/// store and working directory.
#[derive(Clone)]
pub struct JobRunner {
    engine: Arc<dyn MediaEngine>,
    hub: ProgressHub,
    store: Arc<dyn ArtifactStore>,
    download_dir: PathBuf,
}

impl JobRunner {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        hub: ProgressHub,
        store: Arc<dyn ArtifactStore>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            hub,
            store,
            download_dir: download_dir.into(),
        }
    }

    /// Spawn the job and return immediately. There is no cancellation; the
    /// handle is only useful to callers that want to wait for completion.
    pub fn submit(&self, request: JobRequest) -> JoinHandle<()> {
        let job = Job {
            publisher: self.hub.publisher(request.channel_id.clone()),
            runner: self.clone(),
            tag: naming::disambiguator(),
            request,
        };
        tracing::info!(
            url = %job.request.url,
            format = ?job.request.format,
            channel = %job.request.channel_id,
            tag = %job.tag,
            "job submitted"
        );
        tokio::spawn(job.run())
    }
}

struct Job {
    runner: JobRunner,
    request: JobRequest,
    publisher: Publisher,
    tag: String,
}

impl Job {
    async fn run(self) {
        let outcome = AssertUnwindSafe(self.execute())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                tracing::error!(tag = %self.tag, "job panicked");
                Err(Error::job_failure(GENERIC_FAILURE_MESSAGE))
            });

        match outcome {
            Ok(ready) => {
                tracing::info!(tag = %self.tag, "job ready");
                self.publisher.publish(ready);
            }
            Err(err) => {
                let removed = remove_job_files(&self.runner.download_dir, &self.tag).await;
                tracing::warn!(tag = %self.tag, removed, "job failed: {err}");
                self.publisher.publish(ProgressEvent::Error {
                    message: err.to_string(),
                });
            }
        }
    }

    async fn execute(&self) -> Result<ProgressEvent> {
        let format = self.request.format;
        let download = DownloadRequest {
            url: self.request.url.clone(),
            format,
            output_template: naming::output_template(&self.runner.download_dir, &self.tag),
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<EngineProgress>();
        let publisher = self.publisher.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                publisher.publish(normalize(progress));
            }
        });

        let outcome = self.runner.engine.download(&download, tx).await;
        // Drain everything the engine reported before announcing the result.
        if let Err(e) = forwarder.await {
            tracing::warn!(tag = %self.tag, "progress forwarder stopped: {e}");
        }

        let media = outcome.map_err(|e| {
            tracing::error!(tag = %self.tag, "engine failed for {}: {e}", self.request.url);
            Error::job_failure(e.user_message())
        })?;

        tracing::debug!(tag = %self.tag, id = ?media.id, title = ?media.title, "engine returned");

        let path = naming::final_path(&media.path, format);
        if !is_non_empty_file(&path).await {
            return Err(Error::job_failure(EMPTY_OUTPUT_MESSAGE));
        }

        let download_name = naming::download_name(media.title.as_deref(), format);
        let token = artifacts::generate_token();
        self.runner
            .store
            .register(
                token.clone(),
                Artifact {
                    path,
                    download_name: download_name.clone(),
                },
            )
            .await;
        tracing::debug!(tag = %self.tag, "registered {download_name} for {}", self.request.url);

        Ok(ProgressEvent::Ready {
            download_url: format!("/download/{token}"),
            filename: download_name,
        })
    }
}

async fn is_non_empty_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|m| m.is_file() && m.len() > 0)
}

/// Delete whatever a failed job left in the working directory. Returns the
/// number of files removed; individual failures are logged.
async fn remove_job_files(dir: &Path, tag: &str) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("cannot scan {} for leftovers: {e}", dir.display());
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if !naming::belongs_to_job(&name.to_string_lossy(), tag) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("cleanup failed for {}: {e}", entry.path().display()),
        }
    }
    removed
}

/// Terminal escapes and other control characters, gone.
fn clean_text(text: Option<String>) -> String {
    let text = text.unwrap_or_default();
    ANSI_ESCAPE
        .replace_all(&text, "")
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

fn normalize(progress: EngineProgress) -> ProgressEvent {
    match progress {
        EngineProgress::Downloading(RawProgress {
            percent,
            speed,
            eta,
            downloaded_bytes,
            total_bytes,
            total_bytes_estimate,
        }) => ProgressEvent::Downloading {
            percent: clean_text(percent),
            speed: clean_text(speed),
            eta: clean_text(eta),
            downloaded_bytes: downloaded_bytes.map(|b| b as u64),
            total_bytes: total_bytes.or(total_bytes_estimate).map(|b| b as u64),
        },
        EngineProgress::Finished => ProgressEvent::Finished,
    }
}
