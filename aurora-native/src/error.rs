//! Backend error types.

use thiserror::Error;

/// Any error raised between manifest text and executable image.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The manifest failed to parse.
    #[error("manifest error: {0}")]
    Manifest(#[from] aurora_asm::ManifestError),
    /// An instruction cannot be encoded for the target.
    #[error("encoding error: {0}")]
    Encoding(String),
    /// A label or import did not resolve.
    #[error("link error: {0}")]
    Link(String),
    /// Output I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BuildError {
    pub(crate) fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    pub(crate) fn link(message: impl Into<String>) -> Self {
        Self::Link(message.into())
    }
}
