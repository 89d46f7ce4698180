//! Pre-download lookup of title and thumbnail.

use serde::Serialize;

use crate::{
    engine::{MediaEngine, MediaInfo},
    error::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaSummary {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
}

/// Ask the engine for metadata only. Engine failures are logged here and
/// reported as [`Error::MetadataUnavailable`].
pub async fn resolve(engine: &dyn MediaEngine, url: &str) -> Result<MediaSummary> {
    let url = url.trim();
    if url.is_empty() {
        return Err(Error::invalid_input("No URL provided"));
    }

    let info = engine.extract_metadata(url).await.map_err(|e| {
        tracing::error!("metadata lookup failed for {url}: {e}");
        Error::MetadataUnavailable
    })?;

    let thumbnail = pick_thumbnail(&info);
    tracing::debug!(title = ?info.title, thumbnail = ?thumbnail, "resolved metadata");

    Ok(MediaSummary {
        title: info.title,
        thumbnail,
    })
}

/// Direct field, then the largest candidate by area (first one wins a tie),
/// then the conventional thumbnail for a known video id.
pub fn pick_thumbnail(info: &MediaInfo) -> Option<String> {
    if let Some(direct) = info.thumbnail.as_deref().filter(|t| !t.is_empty()) {
        return Some(normalize_url(direct));
    }

    let mut best: Option<(f64, &str)> = None;
    for candidate in info.thumbnails.iter().flatten() {
        let Some(url) = candidate.url.as_deref().filter(|u| !u.is_empty()) else {
            continue;
        };
        let area = candidate.width.unwrap_or(0.0) * candidate.height.unwrap_or(0.0);
        match best {
            Some((best_area, _)) if area <= best_area => {}
            _ => best = Some((area, url)),
        }
    }
    if let Some((_, url)) = best {
        return Some(normalize_url(url));
    }

    info.id
        .as_deref()
        .filter(|id| !id.is_empty())
        .map(|id| format!("https://img.youtube.com/vi/{id}/hqdefault.jpg"))
}

/// Scheme-relative URLs get an explicit `https:`.
pub fn normalize_url(url: &str) -> String {
    match url.strip_prefix("//") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    }
}
