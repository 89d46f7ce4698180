//! `yt-dlp` driven as a child process.

use std::{
    collections::VecDeque,
    path::PathBuf,
    process::Stdio,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
};

use super::{
    DownloadRequest, DownloadedMedia, EngineError, EngineProgress, MediaEngine, MediaFormat,
    MediaInfo, RawProgress,
};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

const PROGRESS_MARKER: &str = "[grab-progress]";
const FINAL_MARKER: &str = "[grab-final]";
const STDERR_TAIL_LINES: usize = 200;

#[derive(Debug, Clone)]
pub struct YtDlpEngine {
    bin: PathBuf,
    ffmpeg_location: Option<PathBuf>,
}

impl YtDlpEngine {
    pub fn new(bin: impl Into<PathBuf>, ffmpeg_location: Option<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            ffmpeg_location,
        }
    }

    /// Flags shared by every invocation: one stable web client identity,
    /// IPv4 only, a fixed browser user agent and no colored output.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "--force-ipv4".to_string(),
            "--color".to_string(),
            "never".to_string(),
            "--extractor-args".to_string(),
            "youtube:player_client=web".to_string(),
            "--user-agent".to_string(),
            USER_AGENT.to_string(),
        ];
        if let Some(ffmpeg) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg.to_string_lossy().into_owned());
        }
        args
    }

    fn metadata_args(&self, url: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(
            ["--dump-single-json", "--skip-download", "--no-warnings"].map(String::from),
        );
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    fn download_args(&self, request: &DownloadRequest) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(
            [
                "--force-overwrites",
                "--no-playlist",
                "--newline",
                "--progress",
                "--progress-template",
            ]
            .map(String::from),
        );
        args.push(format!("download:{PROGRESS_MARKER} %(progress)j"));
        args.push("--print".to_string());
        args.push(format!("after_move:{FINAL_MARKER} %(.{{id,title,filepath}})j"));
        args.push("-o".to_string());
        args.push(request.output_template.clone());

        match request.format {
            MediaFormat::Video => args.extend(
                [
                    "-f",
                    "bestvideo+bestaudio",
                    "--merge-output-format",
                    "mp4",
                    "--recode-video",
                    "mp4",
                    "--postprocessor-args",
                    "VideoConvertor:-c:v libx264 -c:a aac -b:a 192k -movflags +faststart -pix_fmt yuv420p",
                ]
                .map(String::from),
            ),
            MediaFormat::Audio => args.extend(
                [
                    "-f",
                    "bestaudio/best",
                    "-x",
                    "--audio-format",
                    "mp3",
                    "--audio-quality",
                    "192K",
                ]
                .map(String::from),
            ),
        }

        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> EngineError {
        EngineError::Spawn {
            bin: self.bin.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl MediaEngine for YtDlpEngine {
    async fn extract_metadata(&self, url: &str) -> Result<MediaInfo, EngineError> {
        let output = self
            .command(&self.metadata_args(url))
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(EngineError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::Output(format!("invalid metadata JSON: {e}")))
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        progress: mpsc::UnboundedSender<EngineProgress>,
    ) -> Result<DownloadedMedia, EngineError> {
        let mut child = self
            .command(&self.download_args(request))
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Output("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Output("stderr not captured".to_string()))?;

        // yt-dlp may route progress to either stream depending on version and
        // flags, so both are scanned for markers.
        let stdout_reader = tokio::spawn(scan_output(stdout, progress.clone(), false));
        let stderr_reader = tokio::spawn(scan_output(stderr, progress, true));

        let status = child.wait().await.map_err(|e| self.spawn_error(e))?;
        let from_stdout = stdout_reader.await.unwrap_or_default();
        let from_stderr = stderr_reader.await.unwrap_or_default();

        if !status.success() {
            return Err(EngineError::Failed {
                status: status.to_string(),
                stderr: from_stderr.tail.into_iter().collect::<Vec<_>>().join("\n"),
            });
        }

        let record = from_stdout
            .final_record
            .or(from_stderr.final_record)
            .ok_or_else(|| EngineError::Output("no final file reported".to_string()))?;
        let path = record
            .filepath
            .ok_or_else(|| EngineError::Output("final record without filepath".to_string()))?;

        Ok(DownloadedMedia {
            id: record.id,
            title: record.title,
            path: PathBuf::from(path),
        })
    }
}

#[derive(Debug, Default, Deserialize, PartialEq)]
struct FinalRecord {
    id: Option<String>,
    title: Option<String>,
    filepath: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProgressLine {
    status: String,
    #[serde(flatten)]
    raw: RawProgress,
}

#[derive(Debug, PartialEq)]
enum OutputLine {
    Progress(EngineProgress),
    Final(FinalRecord),
    Other,
}

fn parse_line(line: &str) -> OutputLine {
    let line = line.trim();

    if let Some(json) = line.strip_prefix(PROGRESS_MARKER) {
        return match serde_json::from_str::<ProgressLine>(json.trim()) {
            Ok(p) if p.status == "downloading" => {
                OutputLine::Progress(EngineProgress::Downloading(p.raw))
            }
            Ok(p) if p.status == "finished" => OutputLine::Progress(EngineProgress::Finished),
            Ok(_) => OutputLine::Other,
            Err(e) => {
                tracing::debug!("unparsable progress line: {e}");
                OutputLine::Other
            }
        };
    }

    if let Some(json) = line.strip_prefix(FINAL_MARKER) {
        return match serde_json::from_str::<FinalRecord>(json.trim()) {
            Ok(record) => OutputLine::Final(record),
            Err(e) => {
                tracing::debug!("unparsable final record: {e}");
                OutputLine::Other
            }
        };
    }

    OutputLine::Other
}

#[derive(Debug, Default)]
struct ScanResult {
    final_record: Option<FinalRecord>,
    tail: VecDeque<String>,
}

async fn scan_output<R>(
    stream: R,
    progress: mpsc::UnboundedSender<EngineProgress>,
    keep_tail: bool,
) -> ScanResult
where
    R: AsyncRead + Unpin,
{
    let mut result = ScanResult::default();
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    // Byte lines, decoded lossily: titles and paths are not guaranteed UTF-8,
    // and the pipe has to be drained to the end either way.
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("stopped reading yt-dlp output: {e}");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();

        match parse_line(&line) {
            OutputLine::Progress(event) => {
                // Receiver gone means nobody is forwarding anymore; keep draining.
                let _ = progress.send(event);
            }
            OutputLine::Final(record) => result.final_record = Some(record),
            OutputLine::Other => {
                tracing::debug!("yt-dlp: {line}");
                if keep_tail {
                    result.tail.push_back(line);
                    if result.tail.len() > STDERR_TAIL_LINES {
                        result.tail.pop_front();
                    }
                }
            }
        }
    }

    result
}
