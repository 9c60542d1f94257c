//! Pixel data types supported by the stream.

use derive_more::Display;

/// The element type of the array.
///
/// The `Display` form matches the Zarr V3 `data_type` identifier.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// `uint8`
    #[display("uint8")]
    UInt8,
    /// `uint16`
    #[display("uint16")]
    UInt16,
    /// `uint32`
    #[display("uint32")]
    UInt32,
    /// `uint64`
    #[display("uint64")]
    UInt64,
    /// `int8`
    #[display("int8")]
    Int8,
    /// `int16`
    #[display("int16")]
    Int16,
    /// `int32`
    #[display("int32")]
    Int32,
    /// `int64`
    #[display("int64")]
    Int64,
    /// `float32`
    #[display("float32")]
    Float32,
    /// `float64`
    #[display("float64")]
    Float64,
}

impl DataType {
    /// The size of one element in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Self::UInt8 | Self::Int8 => 1,
            Self::UInt16 | Self::Int16 => 2,
            Self::UInt32 | Self::Int32 | Self::Float32 => 4,
            Self::UInt64 | Self::Int64 | Self::Float64 => 8,
        }
    }

    /// The NumPy-style Zarr V2 `dtype` string (little-endian).
    #[must_use]
    pub const fn v2_dtype(&self) -> &'static str {
        match self {
            Self::UInt8 => "|u1",
            Self::UInt16 => "<u2",
            Self::UInt32 => "<u4",
            Self::UInt64 => "<u8",
            Self::Int8 => "|i1",
            Self::Int16 => "<i2",
            Self::Int32 => "<i4",
            Self::Int64 => "<i8",
            Self::Float32 => "<f4",
            Self::Float64 => "<f8",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(DataType::UInt8.size(), 1);
        assert_eq!(DataType::Int16.size(), 2);
        assert_eq!(DataType::Float32.size(), 4);
        assert_eq!(DataType::UInt64.size(), 8);
    }

    #[test]
    fn identifiers() {
        assert_eq!(DataType::UInt16.to_string(), "uint16");
        assert_eq!(DataType::Float64.to_string(), "float64");
        assert_eq!(DataType::UInt16.v2_dtype(), "<u2");
        assert_eq!(DataType::Int8.v2_dtype(), "|i1");
    }
}
