//! Zarr V3 flush: chunks grouped into shard objects with trailing indices.
//!
//! A shard object lives for `shard_size_chunks` append chunk rows. Each flush
//! appends the row's compressed chunks to the open shard sinks and records
//! their `(offset, size)` pairs by in-shard position; when the last row of the
//! shard (or finalization) arrives, the little-endian index is appended and
//! the sink finalized. Chunk slots never written carry the `u64::MAX`
//! sentinel pair.

use std::sync::{Arc, Mutex};

use crate::error::ZarrError;
use crate::sink::s3::S3ConnectionPool;
use crate::sink::{construct_data_paths, finalize_sink, make_sink, Sink};
use crate::thread_pool::{ThreadPool, WaitGroup};

use super::ArrayWriterConfig;

/// The sentinel index entry for a chunk absent from its shard.
const MISSING_CHUNK: (u64, u64) = (u64::MAX, u64::MAX);

pub(super) struct ShardState {
    sink: Option<Box<dyn Sink>>,
    table: Vec<(u64, u64)>,
    bytes_written: u64,
}

impl ShardState {
    fn new(sink: Box<dyn Sink>, chunk_capacity: usize) -> Self {
        Self {
            sink: Some(sink),
            table: vec![MISSING_CHUNK; chunk_capacity],
            bytes_written: 0,
        }
    }

    /// Append this row's chunks, then the index if the shard is complete.
    fn write_chunks(
        &mut self,
        mut chunks: Vec<(usize, Vec<u8>)>,
        compression: Option<&crate::compression::CompressionSettings>,
        typesize: usize,
        close: bool,
    ) -> Result<(), String> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| "write to a closed shard".to_string())?;

        chunks.sort_unstable_by_key(|(position, _)| *position);
        for (position, buffer) in chunks {
            let data = match compression {
                Some(settings) => crate::compression::compress(&buffer, settings, typesize)
                    .map_err(|err| err.to_string())?,
                None => buffer,
            };
            sink.write(self.bytes_written, &data)
                .map_err(|err| err.to_string())?;
            self.table[position] = (self.bytes_written, data.len() as u64);
            self.bytes_written += data.len() as u64;
        }

        if close {
            self.close()?;
        }
        Ok(())
    }

    /// Append the trailing index and finalize the sink.
    fn close(&mut self) -> Result<(), String> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| "close of a closed shard".to_string())?;

        let mut index = Vec::with_capacity(self.table.len() * 16);
        for (offset, size) in &self.table {
            index.extend_from_slice(&offset.to_le_bytes());
            index.extend_from_slice(&size.to_le_bytes());
        }
        sink.write(self.bytes_written, &index)
            .map_err(|err| err.to_string())?;
        self.bytes_written += index.len() as u64;

        let sink = self.sink.take().unwrap();
        finalize_sink(sink).map_err(|err| err.to_string())
    }
}

pub(crate) struct V3Writer {
    shards: Vec<Arc<Mutex<ShardState>>>,
    append_shard_index: u64,
}

impl V3Writer {
    pub(super) fn new() -> Self {
        Self {
            shards: Vec::new(),
            append_shard_index: 0,
        }
    }

    /// Submit one job per shard covering the completed chunk row.
    ///
    /// Returns whether this row closed the shard row, in which case the host
    /// must call [`complete_shard_row`](Self::complete_shard_row) after the
    /// flush barrier.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn flush_chunk_row(
        &mut self,
        config: &ArrayWriterConfig,
        pool: &Arc<ThreadPool>,
        s3_pool: Option<&Arc<S3ConnectionPool>>,
        append_chunk_index: u64,
        buffers: Vec<Vec<u8>>,
        finalizing: bool,
        barrier: &WaitGroup,
    ) -> Result<bool, ZarrError> {
        let dims = &config.dimensions;
        if self.shards.is_empty() {
            self.open_shard_row(config, s3_pool)?;
        }

        let row_in_shard = append_chunk_index % dims.append_dim().shard_size_chunks;
        let close = finalizing || row_in_shard + 1 == dims.append_dim().shard_size_chunks;

        let mut per_shard: Vec<Vec<(usize, Vec<u8>)>> = vec![Vec::new(); self.shards.len()];
        for (chunk_index, buffer) in buffers.into_iter().enumerate() {
            per_shard[dims.shard_for_chunk(chunk_index)]
                .push((dims.shard_internal_index(chunk_index, row_in_shard), buffer));
        }

        let typesize = dims.data_type().size();
        for (shard, chunks) in self.shards.iter().zip(per_shard) {
            let shard = Arc::clone(shard);
            let compression = config.compression.clone();
            let guard = barrier.guard();
            pool.submit(move || {
                let _guard = guard;
                shard
                    .lock()
                    .unwrap()
                    .write_chunks(chunks, compression.as_ref(), typesize, close)
            })?;
        }
        Ok(close)
    }

    /// Create the sinks and index tables of a fresh shard row.
    fn open_shard_row(
        &mut self,
        config: &ArrayWriterConfig,
        s3_pool: Option<&Arc<S3ConnectionPool>>,
    ) -> Result<(), ZarrError> {
        let dims = &config.dimensions;
        let base = format!(
            "{}/c/{}/{}",
            config.store_path, config.level_of_detail, self.append_shard_index
        );
        let chunk_capacity = dims.chunks_per_shard() as usize;
        self.shards = construct_data_paths(&base, &dims.shard_parts())
            .iter()
            .map(|path| {
                let sink = make_sink(path, config.bucket_name.as_deref(), s3_pool)?;
                Ok(Arc::new(Mutex::new(ShardState::new(sink, chunk_capacity))))
            })
            .collect::<Result<_, ZarrError>>()?;
        Ok(())
    }

    /// Drop the closed shard row and advance the shard counter.
    pub(super) fn complete_shard_row(&mut self) {
        self.shards.clear();
        self.append_shard_index += 1;
    }

    /// Close shards left open by a finalize that had no partial row to flush.
    pub(super) fn close_open_shards(&mut self, pool: &Arc<ThreadPool>) -> Result<(), ZarrError> {
        if self.shards.is_empty() {
            return Ok(());
        }
        let barrier = WaitGroup::new();
        for shard in &self.shards {
            let shard = Arc::clone(shard);
            let guard = barrier.guard();
            pool.submit(move || {
                let _guard = guard;
                shard.lock().unwrap().close()
            })?;
        }
        barrier.wait();
        self.complete_shard_row();
        Ok(())
    }
}
