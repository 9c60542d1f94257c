//! Zarr V2 flush: one object per chunk.

use std::sync::Arc;

use crate::error::ZarrError;
use crate::sink::s3::S3ConnectionPool;
use crate::sink::{construct_data_paths, finalize_sink, make_sink};
use crate::thread_pool::{ThreadPool, WaitGroup};

use super::ArrayWriterConfig;

/// Submit one compress-and-write job per chunk of the completed row.
///
/// Each job takes ownership of its chunk buffer, compresses it if configured,
/// and writes it to a fresh sink at
/// `<store>/<lod>/<append_chunk_index>/<chunk coordinates...>`.
pub(super) fn flush_chunk_row(
    config: &ArrayWriterConfig,
    pool: &Arc<ThreadPool>,
    s3_pool: Option<&Arc<S3ConnectionPool>>,
    append_chunk_index: u64,
    buffers: Vec<Vec<u8>>,
    barrier: &WaitGroup,
) -> Result<(), ZarrError> {
    let base = format!(
        "{}/{}/{append_chunk_index}",
        config.store_path, config.level_of_detail
    );
    let paths = construct_data_paths(&base, &config.dimensions.chunk_parts());
    debug_assert_eq!(paths.len(), buffers.len());

    let typesize = config.dimensions.data_type().size();
    for (path, buffer) in paths.into_iter().zip(buffers) {
        let compression = config.compression.clone();
        let bucket = config.bucket_name.clone();
        let s3_pool = s3_pool.cloned();
        let guard = barrier.guard();

        pool.submit(move || {
            let _guard = guard;
            let data = match &compression {
                Some(settings) => crate::compression::compress(&buffer, settings, typesize)
                    .map_err(|err| err.to_string())?,
                None => buffer,
            };
            let mut sink =
                make_sink(&path, bucket.as_deref(), s3_pool.as_ref()).map_err(|err| {
                    format!("failed to create sink for chunk '{path}': {err}")
                })?;
            sink.write(0, &data).map_err(|err| err.to_string())?;
            finalize_sink(sink).map_err(|err| err.to_string())
        })?;
    }
    Ok(())
}
