//! `zarr_stream` is a Rust library for streaming N-dimensional image frames
//! into chunked [Zarr](https://zarr.dev) V2 and V3 stores.
//!
//! A [`ZarrStream`] accepts arbitrary byte-length appends, reassembles them
//! into frames, tiles frames into an N-dimensional chunk grid, and writes
//! each chunk to its own object in parallel on a worker pool. Stores land on
//! the local filesystem or, through a caller-provided connection pool, in an
//! S3-compatible object store. Optional features:
//!
//! - **Compression** — chunks pass through Blosc (`lz4` or `zstd`, byte or
//!   bit shuffling) with a bounded worst-case overhead.
//! - **Sharding (V3)** — chunks are packed into shard objects carrying a
//!   little-endian `(offset, size)` index trailer, per the `sharding_indexed`
//!   codec.
//! - **Multiscale pyramids** — frames are 2x2 box-downsampled and pairwise
//!   averaged on the fly into as many levels as the chunk geometry allows,
//!   described by OME multiscales metadata.
//!
//! ## Example
//! ```no_run
//! use zarr_stream::{
//!     DataType, Dimension, DimensionKind, StreamSettings, ZarrStream, ZarrVersion,
//! };
//!
//! let mut stream = ZarrStream::new(StreamSettings {
//!     version: ZarrVersion::V3,
//!     store_path: "acquisition.zarr".to_string(),
//!     data_type: DataType::UInt16,
//!     multiscale: true,
//!     dimensions: vec![
//!         Dimension::new("t", DimensionKind::Time, 0, 64, 1),
//!         Dimension::new("c", DimensionKind::Channel, 2, 1, 1),
//!         Dimension::new("y", DimensionKind::Space, 2048, 256, 2),
//!         Dimension::new("x", DimensionKind::Space, 2048, 256, 2),
//!     ],
//!     ..StreamSettings::default()
//! })?;
//!
//! // frames may arrive in arbitrarily sized pieces
//! let piece = vec![0u8; 1 << 20];
//! while stream.append(&piece) == piece.len() {
//!     # break;
//!     // ...
//! }
//!
//! stream.write_custom_metadata(r#"{"microscope": "sim"}"#, false)?;
//! stream.finalize()?;
//! # Ok::<(), zarr_stream::ZarrError>(())
//! ```
//!
//! ## Logging
//! `zarr_stream` logs through the [`log`] crate facade; enable a logging
//! implementation to capture warnings and errors from worker jobs.

mod array_writer;
pub mod compression;
mod data_type;
mod dimension;
mod downsample;
mod error;
mod metadata;
pub mod sink;
mod stream;
pub mod thread_pool;

pub use compression::{
    CompressionCodec, CompressionSettings, ShuffleMode, BLOSC_MAX_OVERHEAD,
};
pub use data_type::DataType;
pub use dimension::{ArrayDimensions, Dimension, DimensionKind};
pub use error::ZarrError;
pub use sink::s3::{S3Connection, S3ConnectionPool, S3Settings, S3Sink, UploadedPart};
pub use sink::{finalize_sink, FileSink, Sink};
pub use stream::{StreamSettings, ZarrStream, ZarrVersion};
pub use thread_pool::ThreadPool;
