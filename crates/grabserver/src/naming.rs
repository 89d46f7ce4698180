//! Names and paths for job output files.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::engine::MediaFormat;

/// Used when a title sanitizes down to nothing.
pub const FALLBACK_NAME: &str = "download";

/// Upper bound for the stem of a download name, in characters.
pub const MAX_NAME_CHARS: usize = 120;

const DISAMBIGUATOR_LEN: usize = 6;

/// Turn an arbitrary title into a short, filesystem-safe stem.
///
/// Alphanumerics (any script), spaces and hyphens survive; everything else
/// becomes a space. Whitespace runs collapse into a single hyphen and the
/// result never starts or ends with one.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect();

    let joined = cleaned.split_whitespace().collect::<Vec<_>>().join("-");
    let truncated: String = joined
        .trim_matches('-')
        .chars()
        .take(MAX_NAME_CHARS)
        .collect();
    let trimmed = truncated.trim_end_matches('-');

    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Short random tag embedded in output names so concurrent jobs with the
/// same title never write to the same file.
pub fn disambiguator() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(DISAMBIGUATOR_LEN);
    id
}

/// Engine output template for one job inside the working directory.
pub fn output_template(dir: &Path, disambiguator: &str) -> String {
    dir.join(format!("%(title)s-{disambiguator}.%(ext)s"))
        .to_string_lossy()
        .into_owned()
}

/// Whether `file_name` was produced from a template carrying `disambiguator`.
pub fn belongs_to_job(file_name: &str, disambiguator: &str) -> bool {
    file_name.contains(&format!("-{disambiguator}."))
}

/// Final artifact path: whatever the engine named the file, the container
/// is the one the client asked for.
pub fn final_path(reported: &Path, format: MediaFormat) -> PathBuf {
    reported.with_extension(format.extension())
}

/// Friendly name offered to the browser's save dialog.
pub fn download_name(title: Option<&str>, format: MediaFormat) -> String {
    let stem = sanitize_filename(title.unwrap_or(FALLBACK_NAME));
    format!("{stem}.{}", format.extension())
}
