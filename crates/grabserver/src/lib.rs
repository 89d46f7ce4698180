//! Media grab service: resolve a URL, convert it in the background with
//! live progress, and hand the result out once through a one-time token.

pub mod api;
pub mod artifacts;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod metadata;
pub mod naming;
pub mod progress;
pub mod ws;

pub use api::{router, AppState};
pub use artifacts::{Artifact, ArtifactStore, InMemoryArtifactStore};
pub use config::Config;
pub use engine::{MediaEngine, MediaFormat};
pub use error::{Error, Result};
pub use job::{JobRequest, JobRunner};
pub use progress::{ProgressEvent, ProgressHub, Publisher};
