//! The N-dimensional geometry of a streamed array.
//!
//! An array has at least three dimensions. The first is the *append*
//! dimension: the stream grows along it and its extent may be zero, meaning
//! unbounded. The last two are the spatial *height* and *width* dimensions of
//! each incoming frame. Any dimensions in between (channel, other time-like
//! axes, ...) cycle in row-major order between consecutive append positions.

use derive_more::Display;

use crate::data_type::DataType;

/// The semantic kind of a dimension.
///
/// The `Display` form matches the axis `type` used in OME multiscales
/// metadata.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum DimensionKind {
    /// A time axis.
    #[display("time")]
    Time,
    /// A channel axis.
    #[display("channel")]
    Channel,
    /// A spatial axis.
    #[display("space")]
    Space,
    /// Any other axis.
    #[display("other")]
    Other,
}

/// A single axis of the array.
#[derive(Debug, Clone)]
pub struct Dimension {
    /// The axis name, e.g. `"t"` or `"x"`.
    pub name: String,
    /// The semantic kind of the axis.
    pub kind: DimensionKind,
    /// The extent in pixels. Zero on the append dimension means unbounded.
    pub array_size_px: u64,
    /// The chunk size in pixels.
    pub chunk_size_px: u64,
    /// The number of chunks per shard along this axis (Zarr V3 only).
    pub shard_size_chunks: u64,
}

impl Dimension {
    /// Create a new dimension.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: DimensionKind,
        array_size_px: u64,
        chunk_size_px: u64,
        shard_size_chunks: u64,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            array_size_px,
            chunk_size_px,
            shard_size_chunks,
        }
    }

    /// The number of chunks along this axis. Zero for an unbounded axis.
    #[must_use]
    pub fn chunks_along(&self) -> u64 {
        self.array_size_px.div_ceil(self.chunk_size_px)
    }

    /// The number of shards along this axis. Zero for an unbounded axis.
    #[must_use]
    pub fn shards_along(&self) -> u64 {
        self.chunks_along().div_ceil(self.shard_size_chunks)
    }
}

/// The ordered dimensions of an array together with its element type.
#[derive(Debug, Clone)]
pub struct ArrayDimensions {
    dims: Vec<Dimension>,
    data_type: DataType,
}

impl ArrayDimensions {
    /// Create a new set of array dimensions.
    ///
    /// The dimensions are assumed to have passed stream settings validation:
    /// at least three axes, the last two spatial, nonzero chunk sizes, and
    /// nonzero extents everywhere but the append axis.
    #[must_use]
    pub fn new(dims: Vec<Dimension>, data_type: DataType) -> Self {
        debug_assert!(dims.len() >= 3);
        Self { dims, data_type }
    }

    /// The number of dimensions.
    #[must_use]
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// The dimension at `index`.
    #[must_use]
    pub fn dim(&self, index: usize) -> &Dimension {
        &self.dims[index]
    }

    /// Iterate over the dimensions in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Dimension> {
        self.dims.iter()
    }

    /// The append (outermost) dimension.
    #[must_use]
    pub fn append_dim(&self) -> &Dimension {
        &self.dims[0]
    }

    /// The spatial height dimension.
    #[must_use]
    pub fn height_dim(&self) -> &Dimension {
        &self.dims[self.dims.len() - 2]
    }

    /// The spatial width dimension.
    #[must_use]
    pub fn width_dim(&self) -> &Dimension {
        &self.dims[self.dims.len() - 1]
    }

    fn middle_dims(&self) -> &[Dimension] {
        &self.dims[1..self.dims.len() - 2]
    }

    /// The element type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// The size in bytes of one frame.
    #[must_use]
    pub fn bytes_per_frame(&self) -> usize {
        (self.width_dim().array_size_px * self.height_dim().array_size_px) as usize
            * self.data_type.size()
    }

    /// The size in bytes of one (uncompressed) chunk.
    #[must_use]
    pub fn bytes_per_chunk(&self) -> usize {
        let px: u64 = self.dims.iter().map(|d| d.chunk_size_px).product();
        px as usize * self.data_type.size()
    }

    /// The number of frames between consecutive append positions: the product
    /// of the interior dimension extents.
    #[must_use]
    pub fn frames_per_append_step(&self) -> u64 {
        self.middle_dims().iter().map(|d| d.array_size_px).product()
    }

    /// The number of frames that fill one row of chunks along the append
    /// dimension, i.e. the flush cadence.
    #[must_use]
    pub fn frames_per_chunk_row(&self) -> u64 {
        self.append_dim().chunk_size_px * self.frames_per_append_step()
    }

    /// The number of frames that fill one row of shards along the append
    /// dimension (Zarr V3).
    #[must_use]
    pub fn frames_per_shard_row(&self) -> u64 {
        self.append_dim().shard_size_chunks * self.frames_per_chunk_row()
    }

    /// The number of chunks a frame cycle touches: the chunk buffer count of
    /// one append chunk row.
    #[must_use]
    pub fn chunks_per_frame(&self) -> u64 {
        self.dims[1..].iter().map(Dimension::chunks_along).product()
    }

    /// The number of shard objects in one append shard row (Zarr V3).
    #[must_use]
    pub fn shards_per_chunk_row(&self) -> u64 {
        self.dims[1..].iter().map(Dimension::shards_along).product()
    }

    /// The full chunk capacity of a single shard, absent chunks included.
    #[must_use]
    pub fn chunks_per_shard(&self) -> u64 {
        self.dims.iter().map(|d| d.shard_size_chunks).product()
    }

    /// The total number of frames a bounded append dimension can accept, or
    /// [`None`] when unbounded.
    #[must_use]
    pub fn append_capacity_frames(&self) -> Option<u64> {
        (self.append_dim().array_size_px > 0)
            .then(|| self.append_dim().array_size_px * self.frames_per_append_step())
    }

    /// Per-dimension part counts after the append axis, for chunk path
    /// construction.
    pub(crate) fn chunk_parts(&self) -> Vec<u64> {
        self.dims[1..].iter().map(Dimension::chunks_along).collect()
    }

    /// Per-dimension part counts after the append axis, for shard path
    /// construction.
    pub(crate) fn shard_parts(&self) -> Vec<u64> {
        self.dims[1..].iter().map(Dimension::shards_along).collect()
    }

    /// Locate a frame within the current append chunk row.
    ///
    /// Returns the index of the first chunk buffer the frame touches (its
    /// spatial tiles are contiguous from there) and the element offset of the
    /// frame's origin pixel inside each touched chunk, as determined by the
    /// frame's append and interior positions.
    pub(crate) fn frame_chunk_origin(&self, frame_index: u64) -> (usize, usize) {
        let mids = self.middle_dims();

        let append_px = frame_index / self.frames_per_append_step();
        let mut rem = frame_index % self.frames_per_append_step();

        // interior positions, last axis varying fastest
        let mut pos = vec![0u64; mids.len()];
        for (i, d) in mids.iter().enumerate().rev() {
            pos[i] = rem % d.array_size_px;
            rem /= d.array_size_px;
        }

        let mut mid_linear = 0u64;
        for (i, d) in mids.iter().enumerate() {
            mid_linear = mid_linear * d.chunks_along() + pos[i] / d.chunk_size_px;
        }
        let spatial_tiles = self.height_dim().chunks_along() * self.width_dim().chunks_along();
        let buffer_base = mid_linear * spatial_tiles;

        // element offset of the frame origin within a chunk, C order
        let mut offset = 0u64;
        let mut stride = self.height_dim().chunk_size_px * self.width_dim().chunk_size_px;
        for (i, d) in mids.iter().enumerate().rev() {
            offset += (pos[i] % d.chunk_size_px) * stride;
            stride *= d.chunk_size_px;
        }
        offset += (append_px % self.append_dim().chunk_size_px) * stride;

        (buffer_base as usize, offset as usize)
    }

    /// Decompose a chunk buffer index into per-dimension chunk coordinates
    /// over the non-append axes.
    fn chunk_coords(&self, chunk_buffer_index: usize) -> Vec<u64> {
        let parts = self.chunk_parts();
        let mut rem = chunk_buffer_index as u64;
        let mut coords = vec![0u64; parts.len()];
        for (i, n) in parts.iter().enumerate().rev() {
            coords[i] = rem % n;
            rem /= n;
        }
        coords
    }

    /// The shard (sink) a chunk buffer belongs to, as a row-major index over
    /// the non-append shard lattice.
    pub(crate) fn shard_for_chunk(&self, chunk_buffer_index: usize) -> usize {
        let coords = self.chunk_coords(chunk_buffer_index);
        let mut linear = 0u64;
        for (i, d) in self.dims[1..].iter().enumerate() {
            linear = linear * d.shards_along() + coords[i] / d.shard_size_chunks;
        }
        linear as usize
    }

    /// The position of a chunk within its shard's index, row-major over the
    /// shard's full chunk capacity with the append axis outermost.
    pub(crate) fn shard_internal_index(
        &self,
        chunk_buffer_index: usize,
        append_row_in_shard: u64,
    ) -> usize {
        let coords = self.chunk_coords(chunk_buffer_index);
        let mut linear = append_row_in_shard;
        for (i, d) in self.dims[1..].iter().enumerate() {
            linear = linear * d.shard_size_chunks + coords[i] % d.shard_size_chunks;
        }
        linear as usize
    }
}
