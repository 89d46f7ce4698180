/// Failure kinds surfaced by the service.
///
/// Display strings are what the client sees, so they never carry raw
/// engine output.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Could not fetch video info")]
    MetadataUnavailable,

    #[error("{0}")]
    JobFailure(String),

    #[error("{0}")]
    ArtifactNotFound(&'static str),
}

impl Error {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn job_failure(message: impl Into<String>) -> Self {
        Self::JobFailure(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
