//! Blosc compression for chunk payloads.
//!
//! Chunks are compressed one per worker job via the Blosc context API, which
//! needs no global initialisation and is safe to call from multiple threads.

use std::ffi::c_void;
use std::os::raw::{c_char, c_int};

use blosc_src::{
    blosc_cbuffer_validate, blosc_compress_ctx, blosc_decompress_ctx, BLOSC_BITSHUFFLE,
    BLOSC_NOSHUFFLE, BLOSC_SHUFFLE,
};
use derive_more::Display;

use crate::error::ZarrError;

/// The maximum number of bytes compression can add to a chunk.
pub const BLOSC_MAX_OVERHEAD: usize = blosc_src::BLOSC_MAX_OVERHEAD as usize;

/// The inner codec Blosc wraps around a chunk.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CompressionCodec {
    /// LZ4.
    #[display("lz4")]
    Lz4,
    /// Zstandard.
    #[display("zstd")]
    Zstd,
}

impl CompressionCodec {
    fn as_cstr(self) -> *const c_char {
        match self {
            Self::Lz4 => c"lz4".as_ptr(),
            Self::Zstd => c"zstd".as_ptr(),
        }
    }
}

/// The Blosc shuffle filter applied before compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShuffleMode {
    /// No shuffling.
    None,
    /// Byte-level shuffling.
    Byte,
    /// Bit-level shuffling.
    Bit,
}

impl ShuffleMode {
    /// The numeric code used in Zarr V2 `compressor` metadata.
    #[must_use]
    pub const fn as_code(self) -> u8 {
        match self {
            Self::None => BLOSC_NOSHUFFLE as u8,
            Self::Byte => BLOSC_SHUFFLE as u8,
            Self::Bit => BLOSC_BITSHUFFLE as u8,
        }
    }

    /// The identifier used in Zarr V3 `blosc` codec configuration.
    #[must_use]
    pub const fn v3_name(self) -> &'static str {
        match self {
            Self::None => "noshuffle",
            Self::Byte => "shuffle",
            Self::Bit => "bitshuffle",
        }
    }
}

/// Compression parameters shared by every level of the pyramid.
#[derive(Debug, Clone)]
pub struct CompressionSettings {
    /// The inner codec.
    pub codec: CompressionCodec,
    /// The compression level, `0..=9`.
    pub level: u8,
    /// The shuffle filter.
    pub shuffle: ShuffleMode,
}

/// Compress a chunk with Blosc.
///
/// `typesize` is the element size in bytes and drives the shuffle filter.
/// The output never exceeds `data.len() + BLOSC_MAX_OVERHEAD`.
///
/// # Errors
/// Returns [`ZarrError::InternalError`] if Blosc reports a failure.
pub fn compress(
    data: &[u8],
    settings: &CompressionSettings,
    typesize: usize,
) -> Result<Vec<u8>, ZarrError> {
    let mut dest = vec![0u8; data.len() + BLOSC_MAX_OVERHEAD];
    // SAFETY: src and dest are valid for the lengths passed, and dest has
    // room for the worst-case output of `blosc_compress_ctx`.
    let status = unsafe {
        blosc_compress_ctx(
            c_int::from(settings.level),
            c_int::from(settings.shuffle.as_code()),
            typesize,
            data.len(),
            data.as_ptr().cast::<c_void>(),
            dest.as_mut_ptr().cast::<c_void>(),
            dest.len(),
            settings.codec.as_cstr(),
            0, // automatic block size
            1, // internal threads; parallelism comes from the worker pool
        )
    };
    if status <= 0 {
        return Err(ZarrError::InternalError(format!(
            "blosc failed to compress chunk ({} bytes, {}): status {status}",
            data.len(),
            settings.codec,
        )));
    }
    dest.truncate(status as usize);
    Ok(dest)
}

/// Decompress a Blosc-compressed chunk.
///
/// # Errors
/// Returns [`ZarrError::InternalError`] if `data` is not a valid Blosc buffer
/// or decompression fails.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, ZarrError> {
    let mut nbytes = 0usize;
    // SAFETY: `data` is valid for `data.len()` bytes; `nbytes` is written on
    // success only.
    let valid = unsafe {
        blosc_cbuffer_validate(
            data.as_ptr().cast::<c_void>(),
            data.len(),
            std::ptr::addr_of_mut!(nbytes),
        )
    };
    if valid < 0 {
        return Err(ZarrError::InternalError(
            "not a valid blosc-compressed buffer".to_string(),
        ));
    }

    let mut dest = vec![0u8; nbytes];
    // SAFETY: dest is valid for the decompressed size reported above.
    let status = unsafe {
        blosc_decompress_ctx(
            data.as_ptr().cast::<c_void>(),
            dest.as_mut_ptr().cast::<c_void>(),
            dest.len(),
            1,
        )
    };
    if status < 0 || status as usize != nbytes {
        return Err(ZarrError::InternalError(format!(
            "blosc failed to decompress chunk: status {status}"
        )));
    }
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(codec: CompressionCodec, shuffle: ShuffleMode) -> CompressionSettings {
        CompressionSettings {
            codec,
            level: 5,
            shuffle,
        }
    }

    #[test]
    fn round_trip_lz4() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let z = compress(&data, &settings(CompressionCodec::Lz4, ShuffleMode::Byte), 1).unwrap();
        assert!(z.len() <= data.len() + BLOSC_MAX_OVERHEAD);
        assert_eq!(decompress(&z).unwrap(), data);
    }

    #[test]
    fn round_trip_zstd_bitshuffle() {
        let data: Vec<u8> = (0..4096u32).flat_map(|i| (i as u16).to_le_bytes()).collect();
        let z = compress(&data, &settings(CompressionCodec::Zstd, ShuffleMode::Bit), 2).unwrap();
        assert!(z.len() <= data.len() + BLOSC_MAX_OVERHEAD);
        assert_eq!(decompress(&z).unwrap(), data);
    }

    #[test]
    fn incompressible_data_stays_bounded() {
        // a pseudo-random buffer; the bound must still hold
        let mut state = 0x12345678u32;
        let data: Vec<u8> = (0..1024)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();
        let z = compress(&data, &settings(CompressionCodec::Lz4, ShuffleMode::None), 1).unwrap();
        assert!(z.len() <= data.len() + BLOSC_MAX_OVERHEAD);
        assert_eq!(decompress(&z).unwrap(), data);
    }

    #[test]
    fn decompress_rejects_garbage() {
        assert!(decompress(&[0u8; 4]).is_err());
    }
}
