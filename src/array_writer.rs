//! Per-level array writers.
//!
//! One [`ArrayWriter`] exists per pyramid level. The host owns the chunk
//! buffers of the current append chunk row, tiles incoming frames into them,
//! and flushes a completed row through the worker pool behind a barrier. The
//! V2/V3 difference is confined to the flush step: V2 writes one object per
//! chunk, V3 appends chunks into shard objects and assembles their indices.

use std::sync::Arc;

use crate::compression::{CompressionSettings, BLOSC_MAX_OVERHEAD};
use crate::dimension::ArrayDimensions;
use crate::error::{ErrorLatch, ZarrError};
use crate::metadata;
use crate::sink::s3::S3ConnectionPool;
use crate::sink::{finalize_sink, make_sink};
use crate::stream::ZarrVersion;
use crate::thread_pool::{ThreadPool, WaitGroup};

pub(crate) mod v2;
pub(crate) mod v3;

/// The configuration of one pyramid level's writer.
#[derive(Debug, Clone)]
pub(crate) struct ArrayWriterConfig {
    pub dimensions: ArrayDimensions,
    pub level_of_detail: usize,
    pub store_path: String,
    pub bucket_name: Option<String>,
    pub compression: Option<CompressionSettings>,
}

impl ArrayWriterConfig {
    /// The configuration of the next pyramid level, or [`None`] when a halved
    /// dimension would drop below its chunk size.
    ///
    /// Spatial extents halve (rounding up), as does a bounded append extent;
    /// interior dimensions are untouched and an unbounded append dimension
    /// never halts the pyramid.
    pub(crate) fn downsampled(&self) -> Option<Self> {
        let ndims = self.dimensions.ndims();
        let halves = |index: usize, extent: u64| (index == 0 && extent > 0) || index >= ndims - 2;

        let mut dims = Vec::with_capacity(ndims);
        for (i, dim) in self.dimensions.iter().enumerate() {
            let mut dim = dim.clone();
            if halves(i, dim.array_size_px) {
                let halved = dim.array_size_px.div_ceil(2);
                if halved < dim.chunk_size_px {
                    return None;
                }
                dim.array_size_px = halved;
            }
            dims.push(dim);
        }

        Some(Self {
            dimensions: ArrayDimensions::new(dims, self.dimensions.data_type()),
            level_of_detail: self.level_of_detail + 1,
            store_path: self.store_path.clone(),
            bucket_name: self.bucket_name.clone(),
            compression: self.compression.clone(),
        })
    }
}

enum LayoutWriter {
    V2,
    V3(v3::V3Writer),
}

/// A writer for one array of the store.
pub(crate) struct ArrayWriter {
    config: ArrayWriterConfig,
    pool: Arc<ThreadPool>,
    s3_pool: Option<Arc<S3ConnectionPool>>,
    errors: ErrorLatch,
    chunk_buffers: Vec<Vec<u8>>,
    frames_in_row: u64,
    append_chunk_index: u64,
    frames_written: u64,
    layout: LayoutWriter,
}

impl ArrayWriter {
    pub(crate) fn new(
        config: ArrayWriterConfig,
        version: ZarrVersion,
        pool: Arc<ThreadPool>,
        s3_pool: Option<Arc<S3ConnectionPool>>,
        errors: ErrorLatch,
    ) -> Self {
        let layout = match version {
            ZarrVersion::V2 => LayoutWriter::V2,
            ZarrVersion::V3 => LayoutWriter::V3(v3::V3Writer::new()),
        };
        Self {
            config,
            pool,
            s3_pool,
            errors,
            chunk_buffers: Vec::new(),
            frames_in_row: 0,
            append_chunk_index: 0,
            frames_written: 0,
            layout,
        }
    }

    pub(crate) fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Write one frame, returning the number of bytes written.
    ///
    /// Returns 0 without side effects once an error has latched, which the
    /// orchestrator surfaces as a fatal stream error.
    pub(crate) fn write_frame(&mut self, frame: &[u8]) -> usize {
        if self.errors.is_set() {
            return 0;
        }
        if frame.len() != self.config.dimensions.bytes_per_frame() {
            self.errors.set(ZarrError::InternalError(format!(
                "frame of {} bytes routed to a writer expecting {}",
                frame.len(),
                self.config.dimensions.bytes_per_frame()
            )));
            return 0;
        }

        if self.chunk_buffers.is_empty() {
            self.make_buffers();
        }
        let written = tile_frame_into_chunks(
            &self.config.dimensions,
            self.frames_written,
            frame,
            &mut self.chunk_buffers,
        );
        self.frames_written += 1;
        self.frames_in_row += 1;

        if self.frames_in_row == self.config.dimensions.frames_per_chunk_row() {
            if let Err(err) = self.flush_row(false) {
                self.errors.set(err);
            }
        }
        written
    }

    /// Flush any partial row, close open shards, and write array metadata.
    ///
    /// Best-effort: every step is attempted, the first error is returned.
    pub(crate) fn finalize(&mut self) -> Result<(), ZarrError> {
        let mut first_error = None;

        if self.frames_in_row > 0 {
            if let Err(err) = self.flush_row(true) {
                first_error.get_or_insert(err);
            }
        } else if let LayoutWriter::V3(v3) = &mut self.layout {
            // a previous row left shards open mid-shard
            if let Err(err) = v3.close_open_shards(&self.pool) {
                first_error.get_or_insert(err);
            }
        }

        if let Err(err) = self.write_array_metadata() {
            first_error.get_or_insert(err);
        }

        log::info!(
            "finalized level {} after {} frames",
            self.config.level_of_detail,
            self.frames_written
        );
        first_error.map_or(Ok(()), Err)
    }

    fn make_buffers(&mut self) {
        let bytes_per_chunk = self.config.dimensions.bytes_per_chunk();
        let capacity = bytes_per_chunk
            + if self.config.compression.is_some() {
                BLOSC_MAX_OVERHEAD
            } else {
                0
            };
        self.chunk_buffers = (0..self.config.dimensions.chunks_per_frame())
            .map(|_| {
                let mut buffer = Vec::with_capacity(capacity);
                buffer.resize(bytes_per_chunk, 0);
                buffer
            })
            .collect();
    }

    /// Dispatch compress-and-write jobs for the current row, wait for all of
    /// them, and roll over to the next row.
    fn flush_row(&mut self, finalizing: bool) -> Result<(), ZarrError> {
        let buffers = std::mem::take(&mut self.chunk_buffers);
        let barrier = WaitGroup::new();

        let shard_row_closed = match &mut self.layout {
            LayoutWriter::V2 => {
                v2::flush_chunk_row(
                    &self.config,
                    &self.pool,
                    self.s3_pool.as_ref(),
                    self.append_chunk_index,
                    buffers,
                    &barrier,
                )?;
                false
            }
            LayoutWriter::V3(v3) => v3.flush_chunk_row(
                &self.config,
                &self.pool,
                self.s3_pool.as_ref(),
                self.append_chunk_index,
                buffers,
                finalizing,
                &barrier,
            )?,
        };
        barrier.wait();

        self.append_chunk_index += 1;
        self.frames_in_row = 0;
        if let LayoutWriter::V3(v3) = &mut self.layout {
            if shard_row_closed {
                v3.complete_shard_row();
            }
        }

        self.errors.get().map_or(Ok(()), Err)
    }

    fn write_array_metadata(&mut self) -> Result<(), ZarrError> {
        let dims = &self.config.dimensions;
        let mut shape: Vec<u64> = dims.iter().map(|d| d.array_size_px).collect();
        if shape[0] == 0 {
            shape[0] = self
                .frames_written
                .div_ceil(dims.frames_per_append_step().max(1));
        }

        let (path, document) = match &self.layout {
            LayoutWriter::V2 => (
                format!(
                    "{}/{}/.zarray",
                    self.config.store_path, self.config.level_of_detail
                ),
                serde_json::to_value(metadata::array_metadata_v2(
                    dims,
                    shape,
                    self.config.compression.as_ref(),
                )),
            ),
            LayoutWriter::V3(_) => (
                format!(
                    "{}/{}/zarr.json",
                    self.config.store_path, self.config.level_of_detail
                ),
                serde_json::to_value(metadata::array_metadata_v3(
                    dims,
                    shape,
                    self.config.compression.as_ref(),
                )),
            ),
        };
        let text = document
            .and_then(|value| serde_json::to_string_pretty(&value))
            .map_err(|err| ZarrError::InternalError(format!("bad array metadata: {err}")))?;

        let mut sink = make_sink(
            &path,
            self.config.bucket_name.as_deref(),
            self.s3_pool.as_ref(),
        )?;
        sink.write(0, text.as_bytes())?;
        finalize_sink(sink)
    }
}

/// Copy a frame row by row into the chunk buffers it intersects.
///
/// Pure: identical inputs produce identical copies. Ragged spatial edges are
/// left untouched, so chunk padding keeps the zero fill value.
fn tile_frame_into_chunks(
    dims: &ArrayDimensions,
    frame_index: u64,
    frame: &[u8],
    buffers: &mut [Vec<u8>],
) -> usize {
    let esize = dims.data_type().size();
    let width = dims.width_dim().array_size_px as usize;
    let height = dims.height_dim().array_size_px as usize;
    let chunk_w = dims.width_dim().chunk_size_px as usize;
    let chunk_h = dims.height_dim().chunk_size_px as usize;
    let x_chunks = dims.width_dim().chunks_along() as usize;
    let y_chunks = dims.height_dim().chunks_along() as usize;

    let (buffer_base, origin) = dims.frame_chunk_origin(frame_index);

    for tile_y in 0..y_chunks {
        let y0 = tile_y * chunk_h;
        let tile_height = chunk_h.min(height - y0);
        for tile_x in 0..x_chunks {
            let x0 = tile_x * chunk_w;
            let tile_width = chunk_w.min(width - x0);
            let buffer = &mut buffers[buffer_base + tile_y * x_chunks + tile_x];
            for row in 0..tile_height {
                let src = ((y0 + row) * width + x0) * esize;
                let dst = (origin + row * chunk_w) * esize;
                buffer[dst..dst + tile_width * esize]
                    .copy_from_slice(&frame[src..src + tile_width * esize]);
            }
        }
    }
    frame.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_type::DataType;
    use crate::dimension::{Dimension, DimensionKind};

    fn config(extents: [u64; 3], chunks: [u64; 3]) -> ArrayWriterConfig {
        ArrayWriterConfig {
            dimensions: ArrayDimensions::new(
                vec![
                    Dimension::new("t", DimensionKind::Time, extents[0], chunks[0], 1),
                    Dimension::new("y", DimensionKind::Space, extents[1], chunks[1], 1),
                    Dimension::new("x", DimensionKind::Space, extents[2], chunks[2], 1),
                ],
                DataType::UInt8,
            ),
            level_of_detail: 0,
            store_path: "store".to_string(),
            bucket_name: None,
            compression: None,
        }
    }

    #[test]
    fn pyramid_halts_at_chunk_size() {
        // 128 -> 64 -> 32, then 16 < 32 halts
        let level0 = config([0, 128, 128], [8, 32, 32]);
        let level1 = level0.downsampled().unwrap();
        assert_eq!(level1.dimensions.height_dim().array_size_px, 64);
        assert_eq!(level1.level_of_detail, 1);
        let level2 = level1.downsampled().unwrap();
        assert_eq!(level2.dimensions.height_dim().array_size_px, 32);
        assert!(level2.downsampled().is_none());
    }

    #[test]
    fn bounded_append_extent_halves() {
        let level0 = config([8, 128, 128], [2, 32, 32]);
        let level1 = level0.downsampled().unwrap();
        assert_eq!(level1.dimensions.append_dim().array_size_px, 4);
        // halving 4 to 2 equals the chunk size, still allowed
        let level2 = level1.downsampled().unwrap();
        assert_eq!(level2.dimensions.append_dim().array_size_px, 2);
        assert!(level2.downsampled().is_none());
    }

    #[test]
    fn odd_extents_round_up() {
        let level0 = config([0, 96, 66], [1, 32, 32]);
        let level1 = level0.downsampled().unwrap();
        assert_eq!(level1.dimensions.height_dim().array_size_px, 48);
        assert_eq!(level1.dimensions.width_dim().array_size_px, 33);
    }

    #[test]
    fn tiling_fills_whole_chunks() {
        let cfg = config([0, 4, 6], [2, 2, 3]);
        let dims = &cfg.dimensions;
        let mut buffers: Vec<Vec<u8>> = (0..dims.chunks_per_frame())
            .map(|_| vec![0; dims.bytes_per_chunk()])
            .collect();

        let frame: Vec<u8> = (0..24).collect();
        tile_frame_into_chunks(dims, 0, &frame, &mut buffers);

        // chunk (0, 0): rows 0-1, cols 0-2, first append slice
        assert_eq!(&buffers[0][..6], &[0, 1, 2, 6, 7, 8]);
        // chunk (0, 1): rows 0-1, cols 3-5
        assert_eq!(&buffers[1][..6], &[3, 4, 5, 9, 10, 11]);
        // chunk (1, 0): rows 2-3, cols 0-2
        assert_eq!(&buffers[2][..6], &[12, 13, 14, 18, 19, 20]);

        // second frame lands in the second append slice of each chunk
        let frame2: Vec<u8> = (100..124).collect();
        tile_frame_into_chunks(dims, 1, &frame2, &mut buffers);
        assert_eq!(&buffers[0][6..12], &[100, 101, 102, 106, 107, 108]);
        // the first slice is untouched
        assert_eq!(&buffers[0][..6], &[0, 1, 2, 6, 7, 8]);
    }

    #[test]
    fn tiling_pads_ragged_edges_with_zeros() {
        // 5 px wide with 3 px chunks: the last x chunk is 2 px of data
        let cfg = config([0, 2, 5], [1, 2, 3]);
        let dims = &cfg.dimensions;
        let mut buffers: Vec<Vec<u8>> = (0..dims.chunks_per_frame())
            .map(|_| vec![0; dims.bytes_per_chunk()])
            .collect();

        let frame: Vec<u8> = (1..=10).collect();
        tile_frame_into_chunks(dims, 0, &frame, &mut buffers);

        assert_eq!(buffers[0], vec![1, 2, 3, 6, 7, 8]);
        // ragged chunk keeps the fill value in its third column
        assert_eq!(buffers[1], vec![4, 5, 0, 9, 10, 0]);
    }
}
