//! Error types for the streaming pipeline.

use std::sync::{Arc, OnceLock};

use thiserror::Error;

/// An error raised while configuring or driving a [`ZarrStream`](crate::ZarrStream).
///
/// The first error encountered on a stream latches: subsequent
/// [`append`](crate::ZarrStream::append) calls consume nothing and
/// [`finalize`](crate::ZarrStream::finalize) surfaces the latched error.
#[derive(Debug, Clone, Error)]
pub enum ZarrError {
    /// Settings failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A sink write or flush failed, a directory could not be created, or an
    /// S3 operation failed.
    #[error("i/o error: {0}")]
    IOError(String),
    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    InternalError(String),
    /// Custom metadata was written twice without the overwrite flag.
    #[error("custom metadata already written, pass overwrite to replace it")]
    WillNotOverwrite,
    /// A writer reported fewer bytes written than the frame size.
    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes actually written.
        written: usize,
        /// Bytes expected.
        expected: usize,
    },
}

impl From<std::io::Error> for ZarrError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(err.to_string())
    }
}

/// The stream-wide error cell.
///
/// A single write-once slot shared between the orchestrator, the writers, and
/// the thread pool's error sink. Only the first error is retained.
#[derive(Debug, Clone, Default)]
pub(crate) struct ErrorLatch {
    cell: Arc<OnceLock<ZarrError>>,
}

impl ErrorLatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Latch an error. A no-op if an error is already held.
    pub(crate) fn set(&self, err: ZarrError) {
        let _ = self.cell.set(err);
    }

    pub(crate) fn get(&self) -> Option<ZarrError> {
        self.cell.get().cloned()
    }

    pub(crate) fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_retains_first_error() {
        let latch = ErrorLatch::new();
        assert!(!latch.is_set());

        latch.set(ZarrError::IOError("disk full".to_string()));
        latch.set(ZarrError::WillNotOverwrite);

        match latch.get() {
            Some(ZarrError::IOError(msg)) => assert_eq!(msg, "disk full"),
            other => panic!("expected the first error, got {other:?}"),
        }
    }

    #[test]
    fn io_error_conversion() {
        let err: ZarrError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, ZarrError::IOError(_)));
    }
}
