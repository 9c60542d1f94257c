//! Offset-addressed byte sinks over files and S3 objects.

use std::sync::Arc;

use itertools::Itertools;

use crate::error::ZarrError;
use crate::sink::s3::S3ConnectionPool;

pub mod file;
pub mod s3;

pub use file::FileSink;
pub use s3::S3Sink;

/// A writable destination for one store object.
///
/// Implementations accept positioned writes; S3-backed sinks additionally
/// require offsets to advance monotonically (the callers in this crate only
/// ever append).
pub trait Sink: Send {
    /// Write `data` at `offset`.
    ///
    /// # Errors
    /// Returns [`ZarrError::IOError`] if the write fails.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), ZarrError>;

    /// Make all written bytes durable (file) or upload the object (S3).
    ///
    /// # Errors
    /// Returns [`ZarrError::IOError`] if the flush fails.
    fn flush(&mut self) -> Result<(), ZarrError>;
}

/// Flush and release a sink.
///
/// # Errors
/// Returns the error of the final flush.
pub fn finalize_sink(mut sink: Box<dyn Sink>) -> Result<(), ZarrError> {
    sink.flush()
}

/// Enumerate object paths under `base` for a lattice with `parts[d]` parts
/// along each dimension, in row-major order (last dimension fastest).
pub(crate) fn construct_data_paths(base: &str, parts: &[u64]) -> Vec<String> {
    parts
        .iter()
        .map(|&n| 0..n)
        .multi_cartesian_product()
        .map(|coords| format!("{base}/{}", coords.iter().join("/")))
        .collect()
}

/// Create a sink for a data or metadata object, dispatching on whether the
/// stream targets S3.
pub(crate) fn make_sink(
    path: &str,
    bucket: Option<&str>,
    pool: Option<&Arc<S3ConnectionPool>>,
) -> Result<Box<dyn Sink>, ZarrError> {
    match (bucket, pool) {
        (Some(bucket), Some(pool)) => {
            Ok(Box::new(s3::make_s3_sink(bucket, path, Arc::clone(pool))?))
        }
        _ => Ok(Box::new(FileSink::create(path)?)),
    }
}
