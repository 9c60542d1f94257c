//! The stream orchestrator.
//!
//! A [`ZarrStream`] owns the frame reassembly buffer, the per-level array
//! writers, the worker pool, and the metadata sinks. `append` folds arbitrary
//! byte-length inputs into whole frames, routes each frame to the
//! full-resolution writer, and drives the multiscale cascade.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::array_writer::{ArrayWriter, ArrayWriterConfig};
use crate::compression::CompressionSettings;
use crate::data_type::DataType;
use crate::dimension::{ArrayDimensions, Dimension, DimensionKind};
use crate::downsample::kernels_for;
use crate::error::{ErrorLatch, ZarrError};
use crate::metadata;
use crate::sink::s3::{S3ConnectionPool, S3Settings};
use crate::sink::{finalize_sink, make_sink, Sink};
use crate::thread_pool::ThreadPool;

/// The key custom metadata is written under.
const CUSTOM_METADATA_KEY: &str = "acquire.json";

/// The revision of the store format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZarrVersion {
    /// Zarr V2.
    V2,
    /// Zarr V3.
    V3,
}

/// Configuration of a [`ZarrStream`].
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// The store format revision.
    pub version: ZarrVersion,
    /// The root of the store: a directory path, or a key prefix for S3.
    pub store_path: String,
    /// S3 settings; [`None`] streams to the local filesystem.
    pub s3: Option<S3Settings>,
    /// Blosc compression applied to every chunk; [`None`] stores raw bytes.
    pub compression: Option<CompressionSettings>,
    /// The element type of every frame.
    pub data_type: DataType,
    /// The array dimensions, append axis first, `y` and `x` last.
    pub dimensions: Vec<Dimension>,
    /// Whether to maintain a multiscale pyramid.
    pub multiscale: bool,
    /// Worker thread count; 0 means hardware parallelism.
    pub max_threads: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            version: ZarrVersion::V3,
            store_path: String::new(),
            s3: None,
            compression: None,
            data_type: DataType::UInt8,
            dimensions: Vec::new(),
            multiscale: false,
            max_threads: 0,
        }
    }
}

/// A streaming writer for a chunked, optionally sharded, optionally
/// multiscale Zarr store.
///
/// ```no_run
/// use zarr_stream::{
///     DataType, Dimension, DimensionKind, StreamSettings, ZarrStream, ZarrVersion,
/// };
///
/// let mut stream = ZarrStream::new(StreamSettings {
///     version: ZarrVersion::V2,
///     store_path: "acquisition.zarr".to_string(),
///     data_type: DataType::UInt16,
///     dimensions: vec![
///         Dimension::new("t", DimensionKind::Time, 0, 32, 1),
///         Dimension::new("y", DimensionKind::Space, 1080, 270, 1),
///         Dimension::new("x", DimensionKind::Space, 1920, 480, 1),
///     ],
///     ..StreamSettings::default()
/// })?;
///
/// let frame = vec![0u8; 1920 * 1080 * 2];
/// assert_eq!(stream.append(&frame), frame.len());
/// stream.finalize()?;
/// # Ok::<(), zarr_stream::ZarrError>(())
/// ```
pub struct ZarrStream {
    version: ZarrVersion,
    store_path: String,
    bucket_name: Option<String>,
    dimensions: ArrayDimensions,
    frame_buffer: Vec<u8>,
    frame_buffer_offset: usize,
    pool: Arc<ThreadPool>,
    s3_pool: Option<Arc<S3ConnectionPool>>,
    writers: Vec<ArrayWriter>,
    metadata_sinks: HashMap<String, Box<dyn Sink>>,
    scaled_frames: Vec<Option<Vec<u8>>>,
    errors: ErrorLatch,
    finalized: bool,
}

impl ZarrStream {
    /// Create a stream writing to the local filesystem.
    ///
    /// Any existing directory at `store_path` is removed first.
    ///
    /// # Errors
    /// Returns [`ZarrError::InvalidArgument`] if the settings fail validation
    /// or name an S3 target, and [`ZarrError::IOError`] if the store cannot
    /// be created.
    pub fn new(settings: StreamSettings) -> Result<Self, ZarrError> {
        if settings.s3.is_some() {
            return Err(ZarrError::InvalidArgument(
                "streaming to S3 requires a connection pool, use with_connection_pool".to_string(),
            ));
        }
        Self::build(settings, None)
    }

    /// Create a stream writing to an S3-compatible store through `pool`.
    ///
    /// # Errors
    /// Returns [`ZarrError::InvalidArgument`] if the settings fail validation
    /// or do not name an S3 target, and [`ZarrError::IOError`] if the bucket
    /// is unreachable.
    pub fn with_connection_pool(
        settings: StreamSettings,
        pool: Arc<S3ConnectionPool>,
    ) -> Result<Self, ZarrError> {
        if settings.s3.is_none() {
            return Err(ZarrError::InvalidArgument(
                "with_connection_pool requires S3 settings".to_string(),
            ));
        }
        Self::build(settings, Some(pool))
    }

    fn build(
        mut settings: StreamSettings,
        s3_pool: Option<Arc<S3ConnectionPool>>,
    ) -> Result<Self, ZarrError> {
        validate_settings(&settings)?;

        settings.store_path = settings.store_path.trim().to_string();
        if settings.s3.is_none() {
            if let Some(stripped) = settings.store_path.strip_prefix("file://") {
                settings.store_path = stripped.to_string();
            }
        }
        let bucket_name = settings.s3.as_ref().map(|s3| s3.bucket_name.clone());

        let dimensions =
            ArrayDimensions::new(settings.dimensions.clone(), settings.data_type);

        let errors = ErrorLatch::new();
        let pool = Arc::new(ThreadPool::new(settings.max_threads as usize, {
            let errors = errors.clone();
            move |msg| errors.set(ZarrError::IOError(msg))
        }));

        let mut stream = Self {
            version: settings.version,
            store_path: settings.store_path,
            bucket_name,
            frame_buffer: vec![0; dimensions.bytes_per_frame()],
            dimensions,
            frame_buffer_offset: 0,
            pool,
            s3_pool,
            writers: Vec::new(),
            metadata_sinks: HashMap::new(),
            scaled_frames: Vec::new(),
            errors,
            finalized: false,
        };

        stream.create_store()?;
        stream.create_writers(settings.multiscale, settings.compression);
        stream.scaled_frames = vec![None; stream.writers.len()];
        stream.write_base_metadata()?;
        stream.write_group_metadata()?;
        Ok(stream)
    }

    /// Append bytes to the stream, returning the number of bytes consumed.
    ///
    /// Inputs need not align to frame boundaries. Fewer bytes than requested
    /// are consumed only on fatal internal error; after such an error every
    /// call returns 0 without side effects, and
    /// [`finalize`](Self::finalize) surfaces the latched error.
    pub fn append(&mut self, data: &[u8]) -> usize {
        if self.finalized || self.errors.is_set() || data.is_empty() {
            return 0;
        }

        let bytes_of_frame = self.frame_buffer.len();
        let mut consumed = 0;

        while consumed < data.len() {
            let remaining = data.len() - consumed;

            if self.frame_buffer_offset > 0 {
                // add to, and maybe finish, a partial frame
                let to_copy = (bytes_of_frame - self.frame_buffer_offset).min(remaining);
                self.frame_buffer[self.frame_buffer_offset..self.frame_buffer_offset + to_copy]
                    .copy_from_slice(&data[consumed..consumed + to_copy]);
                self.frame_buffer_offset += to_copy;
                consumed += to_copy;

                if self.frame_buffer_offset == bytes_of_frame {
                    let frame = std::mem::take(&mut self.frame_buffer);
                    let written = self.write_frame(&frame);
                    self.frame_buffer = frame;
                    self.frame_buffer_offset = 0;
                    if written < bytes_of_frame {
                        break;
                    }
                }
            } else if remaining < bytes_of_frame {
                // begin a partial frame
                self.frame_buffer[..remaining].copy_from_slice(&data[consumed..]);
                self.frame_buffer_offset = remaining;
                consumed += remaining;
            } else {
                // at least one whole frame available, no copy needed
                let written = self.write_frame(&data[consumed..consumed + bytes_of_frame]);
                if written < bytes_of_frame {
                    break;
                }
                consumed += bytes_of_frame;
            }
        }
        consumed
    }

    /// Write acquisition-specific JSON metadata to `acquire.json` in the
    /// store root.
    ///
    /// # Errors
    /// Returns [`ZarrError::InvalidArgument`] if `metadata` is not valid
    /// JSON, [`ZarrError::WillNotOverwrite`] if custom metadata exists and
    /// `overwrite` is unset, and [`ZarrError::IOError`] if the write fails.
    pub fn write_custom_metadata(
        &mut self,
        metadata: &str,
        overwrite: bool,
    ) -> Result<(), ZarrError> {
        let document: Value = serde_json::from_str(metadata).map_err(|err| {
            ZarrError::InvalidArgument(format!("invalid custom metadata JSON: {err}"))
        })?;

        if self.metadata_sinks.contains_key(CUSTOM_METADATA_KEY) && !overwrite {
            return Err(ZarrError::WillNotOverwrite);
        }
        self.write_metadata_document(CUSTOM_METADATA_KEY, &document)
    }

    /// Flush everything and tear the stream down.
    ///
    /// Best-effort: leftover scaled frames are written, partial chunk rows
    /// flushed, open shards closed, metadata rewritten, and the worker pool
    /// drained, even when an earlier step failed. The first error observed
    /// over the stream's lifetime is returned.
    ///
    /// # Errors
    /// Returns the latched stream error, if any.
    pub fn finalize(mut self) -> Result<(), ZarrError> {
        self.finalize_inner()
    }

    fn finalize_inner(&mut self) -> Result<(), ZarrError> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        let mut step_error = None;

        self.flush_scaled_frames();

        if let Err(err) = self.write_group_metadata() {
            step_error.get_or_insert(err);
        }
        for (name, sink) in self.metadata_sinks.drain() {
            if let Err(err) = finalize_sink(sink) {
                log::error!("failed to finalize metadata sink '{name}': {err}");
                step_error.get_or_insert(err);
            }
        }
        for writer in &mut self.writers {
            if let Err(err) = writer.finalize() {
                step_error.get_or_insert(err);
            }
        }

        // flush before shutting down the pool
        self.writers.clear();
        if let Some(pool) = Arc::get_mut(&mut self.pool) {
            pool.await_stop();
        }

        match self.errors.get().or(step_error) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Route one whole frame to the full-resolution writer and drive the
    /// multiscale cascade. Returns the bytes written (0 or the frame size).
    fn write_frame(&mut self, frame: &[u8]) -> usize {
        if let Some(capacity) = self.dimensions.append_capacity_frames() {
            if self.writers[0].frames_written() >= capacity {
                self.errors.set(ZarrError::InvalidArgument(format!(
                    "append dimension is full after {capacity} frames"
                )));
                return 0;
            }
        }

        let written = self.writers[0].write_frame(frame);
        if written != frame.len() {
            self.errors.set(ZarrError::ShortWrite {
                written,
                expected: frame.len(),
            });
            return written;
        }

        self.write_multiscale_frames(frame);
        written
    }

    /// Cascade a full-resolution frame down the pyramid.
    ///
    /// At each level the downsampled frame either parks in the level's slot
    /// or pairs with the parked frame; the pair's average goes to the level's
    /// writer and the downsampled frame (not the average) feeds the next
    /// level.
    fn write_multiscale_frames(&mut self, frame: &[u8]) {
        if self.writers.len() < 2 {
            return;
        }
        let (scale, average) = kernels_for(self.dimensions.data_type());
        let mut width = self.dimensions.width_dim().array_size_px as usize;
        let mut height = self.dimensions.height_dim().array_size_px as usize;

        let mut down = scale(frame, &mut width, &mut height);
        for level in 1..self.writers.len() {
            match self.scaled_frames[level].take() {
                None => {
                    self.scaled_frames[level] = Some(down);
                    return;
                }
                Some(parked) => {
                    let mut averaged = down.clone();
                    average(&mut averaged, &parked);
                    let written = self.writers[level].write_frame(&averaged);
                    if written != averaged.len() {
                        self.errors.set(ZarrError::ShortWrite {
                            written,
                            expected: averaged.len(),
                        });
                        return;
                    }
                    if level + 1 < self.writers.len() {
                        down = scale(&down, &mut width, &mut height);
                    }
                }
            }
        }
    }

    /// Write out frames still parked in the cascade so every level ends up
    /// with the ceiling of half its parent's frame count.
    fn flush_scaled_frames(&mut self) {
        if self.writers.len() < 2 {
            return;
        }
        let (scale, _) = kernels_for(self.dimensions.data_type());

        let mut width = self.dimensions.width_dim().array_size_px as usize;
        let mut height = self.dimensions.height_dim().array_size_px as usize;
        for level in 1..self.writers.len() {
            width = width.div_ceil(2);
            height = height.div_ceil(2);
            let Some(parked) = self.scaled_frames[level].take() else {
                continue;
            };
            let written = self.writers[level].write_frame(&parked);
            if written != parked.len() {
                self.errors.set(ZarrError::ShortWrite {
                    written,
                    expected: parked.len(),
                });
                return;
            }
            if level + 1 < self.writers.len() {
                let (mut w, mut h) = (width, height);
                let down = scale(&parked, &mut w, &mut h);
                self.deliver_scaled_frame(down, level + 1, w, h);
            }
        }
    }

    /// Deliver a downsampled frame to `level` during finalization, writing
    /// completed pairs and cascading further down.
    fn deliver_scaled_frame(&mut self, down: Vec<u8>, level: usize, width: usize, height: usize) {
        let (scale, average) = kernels_for(self.dimensions.data_type());
        match self.scaled_frames[level].take() {
            None => self.scaled_frames[level] = Some(down),
            Some(parked) => {
                let mut averaged = down.clone();
                average(&mut averaged, &parked);
                let written = self.writers[level].write_frame(&averaged);
                if written != averaged.len() {
                    self.errors.set(ZarrError::ShortWrite {
                        written,
                        expected: averaged.len(),
                    });
                    return;
                }
                if level + 1 < self.writers.len() {
                    let (mut w, mut h) = (width, height);
                    let next = scale(&down, &mut w, &mut h);
                    self.deliver_scaled_frame(next, level + 1, w, h);
                }
            }
        }
    }

    fn create_store(&mut self) -> Result<(), ZarrError> {
        match (&self.bucket_name, &self.s3_pool) {
            (Some(bucket), Some(pool)) => {
                let exists = pool.get_connection().bucket_exists(bucket)?;
                if !exists {
                    return Err(ZarrError::IOError(format!(
                        "bucket '{bucket}' does not exist"
                    )));
                }
            }
            _ => {
                let path = Path::new(&self.store_path);
                if path.is_dir() {
                    std::fs::remove_dir_all(path).map_err(|err| {
                        ZarrError::IOError(format!(
                            "failed to remove existing store path '{}': {err}",
                            self.store_path
                        ))
                    })?;
                } else if path.exists() {
                    std::fs::remove_file(path)?;
                }
                std::fs::create_dir_all(path).map_err(|err| {
                    ZarrError::IOError(format!(
                        "failed to create store path '{}': {err}",
                        self.store_path
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn create_writers(
        &mut self,
        multiscale: bool,
        compression: Option<CompressionSettings>,
    ) {
        let mut config = ArrayWriterConfig {
            dimensions: self.dimensions.clone(),
            level_of_detail: 0,
            store_path: self.store_path.clone(),
            bucket_name: self.bucket_name.clone(),
            compression,
        };
        self.writers.push(ArrayWriter::new(
            config.clone(),
            self.version,
            Arc::clone(&self.pool),
            self.s3_pool.clone(),
            self.errors.clone(),
        ));

        if multiscale {
            while let Some(downsampled) = config.downsampled() {
                self.writers.push(ArrayWriter::new(
                    downsampled.clone(),
                    self.version,
                    Arc::clone(&self.pool),
                    self.s3_pool.clone(),
                    self.errors.clone(),
                ));
                config = downsampled;
            }
        }
    }

    /// Write a metadata document to `<store>/<key>` through a fresh sink.
    ///
    /// Rewrites (group metadata at finalization, custom metadata overwrites)
    /// replace the sink rather than writing at offset 0 again: recreating a
    /// file sink truncates, so a shorter document leaves no stale bytes, and
    /// an S3 sink only ever uploads the final document.
    fn write_metadata_document(&mut self, key: &str, document: &Value) -> Result<(), ZarrError> {
        let text = serde_json::to_string_pretty(document)
            .map_err(|err| ZarrError::InternalError(format!("bad metadata document: {err}")))?;
        let path = format!("{}/{key}", self.store_path);
        let mut sink = make_sink(&path, self.bucket_name.as_deref(), self.s3_pool.as_ref())?;
        sink.write(0, text.as_bytes())?;
        self.metadata_sinks.insert(key.to_string(), sink);
        Ok(())
    }

    fn write_base_metadata(&mut self) -> Result<(), ZarrError> {
        let ome = metadata::ome_multiscales(self.version, &self.dimensions, self.writers.len());
        let document = metadata::base_metadata(self.version, &ome);
        let key = match self.version {
            ZarrVersion::V2 => ".zattrs",
            ZarrVersion::V3 => "zarr.json",
        };
        self.write_metadata_document(key, &document)
    }

    fn write_group_metadata(&mut self) -> Result<(), ZarrError> {
        let ome = metadata::ome_multiscales(self.version, &self.dimensions, self.writers.len());
        let document = metadata::group_metadata(self.version, &ome);
        let key = match self.version {
            ZarrVersion::V2 => ".zgroup",
            ZarrVersion::V3 => "zarr.json",
        };
        self.write_metadata_document(key, &document)
    }
}

impl Drop for ZarrStream {
    fn drop(&mut self) {
        if !self.finalized {
            if let Err(err) = self.finalize_inner() {
                log::error!("error finalizing dropped stream: {err}");
            }
        }
    }
}

fn validate_settings(settings: &StreamSettings) -> Result<(), ZarrError> {
    let invalid = |msg: String| Err(ZarrError::InvalidArgument(msg));

    let store_path = settings.store_path.trim();
    if store_path.is_empty() {
        return invalid("store path is empty".to_string());
    }

    if let Some(s3) = &settings.s3 {
        if s3.endpoint.trim().is_empty() {
            return invalid("S3 endpoint is empty".to_string());
        }
        let bucket = s3.bucket_name.trim();
        if bucket.len() < 3 || bucket.len() > 63 {
            return invalid(format!(
                "invalid length for S3 bucket name: {}, must be between 3 and 63 characters",
                bucket.len()
            ));
        }
    } else {
        let path = store_path.strip_prefix("file://").unwrap_or(store_path);
        let parent = match Path::new(path).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        if !parent.is_dir() {
            return invalid(format!(
                "parent path '{}' does not exist or is not a directory",
                parent.display()
            ));
        }
    }

    if let Some(compression) = &settings.compression {
        if compression.level > 9 {
            return invalid(format!(
                "invalid compression level: {}, must be between 0 and 9",
                compression.level
            ));
        }
    }

    let ndims = settings.dimensions.len();
    if ndims < 3 {
        return invalid(format!(
            "invalid number of dimensions: {ndims}, must be at least 3"
        ));
    }
    if settings.dimensions[ndims - 1].kind != DimensionKind::Space {
        return invalid("last dimension must be of kind Space".to_string());
    }
    if settings.dimensions[ndims - 2].kind != DimensionKind::Space {
        return invalid("second to last dimension must be of kind Space".to_string());
    }

    for (i, dim) in settings.dimensions.iter().enumerate() {
        if dim.name.trim().is_empty() {
            return invalid(format!("dimension {i} has an empty name"));
        }
        if i > 0 && dim.array_size_px == 0 {
            return invalid(format!("array size of dimension '{}' must be nonzero", dim.name));
        }
        if dim.chunk_size_px == 0 {
            return invalid(format!("chunk size of dimension '{}' must be nonzero", dim.name));
        }
        if dim.array_size_px > 0 && dim.chunk_size_px > dim.array_size_px {
            return invalid(format!(
                "chunk size of dimension '{}' exceeds its array size",
                dim.name
            ));
        }
        if settings.version == ZarrVersion::V3 && dim.shard_size_chunks == 0 {
            return invalid(format!("shard size of dimension '{}' must be nonzero", dim.name));
        }
    }

    Ok(())
}
