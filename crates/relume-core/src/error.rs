use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure modes of a build. Every variant carries a message fit to show the
/// user as-is; the driver maps any of them to a nonzero exit status. Nothing
/// is recovered silently and partially written files are left on disk for the
/// caller to deal with.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("image set: {0}")]
    ImageSet(String),
    #[error("could not create a base")]
    Solver,
    #[error("sampling does not fit in the {budget_mb} MB budget")]
    OutOfMemory { budget_mb: u32 },
    #[error("output: {0}")]
    Output(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
}

impl From<image::ImageError> for Error {
    fn from(source: image::ImageError) -> Self {
        match source {
            image::ImageError::IoError(io) => Self::Output(io),
            other => Self::ImageSet(other.to_string()),
        }
    }
}

impl From<jpeg_encoder::EncodingError> for Error {
    fn from(source: jpeg_encoder::EncodingError) -> Self {
        match source {
            jpeg_encoder::EncodingError::IoError(io) => Self::Output(io),
            other => Self::ImageSet(other.to_string()),
        }
    }
}
