//! Error kinds surfaced by the image store and the layer lifecycle.
//!
//! Every failure is terminal for the current build step; nothing in this crate
//! retries. Callers that need to branch on the failure class use
//! [`Error::kind`].

use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Corrupt,
    ModeMismatch,
    Io,
    LockContention,
}

#[derive(Debug, Error)]
pub enum Error {
    /// No ref/index entry, or a referenced blob is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed JSON or an unexpected schema.
    #[error("corrupt image: {0}")]
    Corrupt(String),

    /// A layer operation was attempted on a non-layered build.
    #[error("build mode mismatch: {0}")]
    ModeMismatch(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("image directory {0} is locked by another build step")]
    LockContention(String),

    /// Descriptor or digest construction rejected by oci-spec.
    #[error("invalid OCI data: {0}")]
    Spec(#[from] oci_spec::OciSpecError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Corrupt(_) | Error::Spec(_) => ErrorKind::Corrupt,
            Error::ModeMismatch(_) => ErrorKind::ModeMismatch,
            Error::Io { .. } => ErrorKind::Io,
            Error::LockContention(_) => ErrorKind::LockContention,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Wraps an IO error raised while touching `path`. A missing file becomes
    /// [`Error::NotFound`] so blob lookups report the right kind.
    pub(crate) fn at_path(action: &str, path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Error::NotFound(format!("{} {}", action, path.display()))
        } else {
            Error::io(format!("failed to {} {}", action, path.display()), source)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attaches a lazily built context string to IO results, in the manner of
/// `anyhow::Context`.
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::result::Result<T, io::Error> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Error::io(f(), e))
    }
}
