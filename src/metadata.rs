//! Zarr V2/V3 array, group, and OME multiscales metadata documents.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::compression::CompressionSettings;
use crate::dimension::ArrayDimensions;
use crate::stream::ZarrVersion;

/// The Zarr V2 `compressor` entry for Blosc.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CompressorMetadataV2 {
    id: String,
    cname: String,
    clevel: u8,
    shuffle: u8,
    blocksize: u8,
}

impl From<&CompressionSettings> for CompressorMetadataV2 {
    fn from(settings: &CompressionSettings) -> Self {
        Self {
            id: "blosc".to_string(),
            cname: settings.codec.to_string(),
            clevel: settings.level,
            shuffle: settings.shuffle.as_code(),
            blocksize: 0,
        }
    }
}

/// A Zarr V2 `.zarray` document.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ArrayMetadataV2 {
    zarr_format: u64,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    dtype: String,
    compressor: Option<CompressorMetadataV2>,
    fill_value: u64,
    order: String,
    filters: Option<Value>,
    dimension_separator: String,
}

/// A Zarr V3 array `zarr.json` document.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ArrayMetadataV3 {
    zarr_format: u64,
    node_type: String,
    shape: Vec<u64>,
    data_type: String,
    chunk_grid: Value,
    chunk_key_encoding: Value,
    fill_value: u64,
    codecs: Vec<Value>,
    dimension_names: Vec<String>,
}

/// Build the `.zarray` document for one level.
#[must_use]
pub(crate) fn array_metadata_v2(
    dims: &ArrayDimensions,
    shape: Vec<u64>,
    compression: Option<&CompressionSettings>,
) -> ArrayMetadataV2 {
    ArrayMetadataV2 {
        zarr_format: 2,
        shape,
        chunks: dims.iter().map(|d| d.chunk_size_px).collect(),
        dtype: dims.data_type().v2_dtype().to_string(),
        compressor: compression.map(CompressorMetadataV2::from),
        fill_value: 0,
        order: "C".to_string(),
        filters: None,
        dimension_separator: "/".to_string(),
    }
}

/// Build the array `zarr.json` document for one level.
///
/// The top-level chunk grid describes the shard shape; the inner chunk shape
/// lives in the `sharding_indexed` codec configuration.
#[must_use]
pub(crate) fn array_metadata_v3(
    dims: &ArrayDimensions,
    shape: Vec<u64>,
    compression: Option<&CompressionSettings>,
) -> ArrayMetadataV3 {
    let shard_shape_px: Vec<u64> = dims
        .iter()
        .map(|d| d.shard_size_chunks * d.chunk_size_px)
        .collect();
    let chunk_shape_px: Vec<u64> = dims.iter().map(|d| d.chunk_size_px).collect();

    let mut inner_codecs = vec![json!({
        "name": "bytes",
        "configuration": { "endian": "little" }
    })];
    if let Some(settings) = compression {
        inner_codecs.push(json!({
            "name": "blosc",
            "configuration": {
                "cname": settings.codec.to_string(),
                "clevel": settings.level,
                "shuffle": settings.shuffle.v3_name(),
                "typesize": dims.data_type().size(),
                "blocksize": 0,
            }
        }));
    }

    ArrayMetadataV3 {
        zarr_format: 3,
        node_type: "array".to_string(),
        shape,
        data_type: dims.data_type().to_string(),
        chunk_grid: json!({
            "name": "regular",
            "configuration": { "chunk_shape": shard_shape_px }
        }),
        chunk_key_encoding: json!({
            "name": "default",
            "configuration": { "separator": "/" }
        }),
        fill_value: 0,
        codecs: vec![json!({
            "name": "sharding_indexed",
            "configuration": {
                "chunk_shape": chunk_shape_px,
                "codecs": inner_codecs,
                "index_codecs": [
                    { "name": "bytes", "configuration": { "endian": "little" } }
                ],
                "index_location": "end",
            }
        })],
        dimension_names: dims.iter().map(|d| d.name.clone()).collect(),
    }
}

/// The acquisition-level metadata document (`.zattrs` body for V2, the first
/// root `zarr.json` for V3).
#[must_use]
pub(crate) fn base_metadata(version: ZarrVersion, ome: &Value) -> Value {
    match version {
        ZarrVersion::V2 => json!({ "multiscales": ome }),
        ZarrVersion::V3 => json!({
            "extensions": [],
            "metadata_encoding": "https://purl.org/zarr/spec/protocol/core/3.0",
            "metadata_key_suffix": ".json",
            "zarr_format": "https://purl.org/zarr/spec/protocol/core/3.0",
        }),
    }
}

/// The root group document (`.zgroup` for V2, the group-node `zarr.json` for
/// V3).
#[must_use]
pub(crate) fn group_metadata(version: ZarrVersion, ome: &Value) -> Value {
    match version {
        ZarrVersion::V2 => json!({ "zarr_format": 2 }),
        ZarrVersion::V3 => json!({
            "zarr_format": 3,
            "node_type": "group",
            "consolidated_metadata": null,
            "attributes": { "ome": ome },
        }),
    }
}

/// Build the OME multiscales document for a pyramid of `n_levels` levels.
///
/// For V2 this is the bare `multiscales` array; for V3 it is wrapped with the
/// OME version and name.
#[must_use]
pub(crate) fn ome_multiscales(
    version: ZarrVersion,
    dims: &ArrayDimensions,
    n_levels: usize,
) -> Value {
    let ndims = dims.ndims();

    let axes: Vec<Value> = dims
        .iter()
        .enumerate()
        .map(|(i, d)| {
            if i < ndims - 2 {
                json!({ "name": d.name, "type": d.kind.to_string() })
            } else {
                json!({ "name": d.name, "type": d.kind.to_string(), "unit": "micrometer" })
            }
        })
        .collect();

    let mut datasets = vec![json!({
        "path": "0",
        "coordinateTransformations": [
            { "type": "scale", "scale": vec![1.0; ndims] },
        ],
    })];
    for level in 1..n_levels {
        let factor = f64::from(1 << level);
        let mut scale = vec![factor];
        scale.extend(std::iter::repeat(1.0).take(ndims - 3));
        scale.extend([factor, factor]);
        datasets.push(json!({
            "path": level.to_string(),
            "coordinateTransformations": [
                { "type": "scale", "scale": scale },
            ],
        }));
    }

    let mut multiscale = json!({ "axes": axes, "datasets": datasets });
    if n_levels > 1 {
        multiscale["type"] = json!("local_mean");
        multiscale["metadata"] = json!({
            "description": "The fields in the metadata describe how to \
                reproduce this multiscaling in scikit-image. The method and \
                its parameters are given here.",
            "method": "skimage.transform.downscale_local_mean",
            "version": "0.21.0",
            "args": "[2]",
            "kwargs": ["cval", 0],
        });
    }

    match version {
        ZarrVersion::V2 => {
            multiscale["version"] = json!("0.4");
            multiscale["name"] = json!("/");
            json!([multiscale])
        }
        ZarrVersion::V3 => json!({
            "version": "0.5",
            "name": "/",
            "multiscales": [multiscale],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionCodec, ShuffleMode};
    use crate::data_type::DataType;
    use crate::dimension::{Dimension, DimensionKind};

    fn dims() -> ArrayDimensions {
        ArrayDimensions::new(
            vec![
                Dimension::new("t", DimensionKind::Time, 0, 5, 2),
                Dimension::new("c", DimensionKind::Channel, 3, 1, 1),
                Dimension::new("y", DimensionKind::Space, 48, 16, 2),
                Dimension::new("x", DimensionKind::Space, 48, 16, 2),
            ],
            DataType::UInt16,
        )
    }

    fn compression() -> CompressionSettings {
        CompressionSettings {
            codec: CompressionCodec::Zstd,
            level: 5,
            shuffle: ShuffleMode::Byte,
        }
    }

    #[test]
    fn zarray_document() {
        let meta = array_metadata_v2(&dims(), vec![10, 3, 48, 48], Some(&compression()));
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["zarr_format"], 2);
        assert_eq!(value["shape"], json!([10, 3, 48, 48]));
        assert_eq!(value["chunks"], json!([5, 1, 16, 16]));
        assert_eq!(value["dtype"], "<u2");
        assert_eq!(value["compressor"]["id"], "blosc");
        assert_eq!(value["compressor"]["cname"], "zstd");
        assert_eq!(value["compressor"]["shuffle"], 1);
        assert_eq!(value["fill_value"], 0);
        assert_eq!(value["order"], "C");
        assert_eq!(value["filters"], Value::Null);
        assert_eq!(value["dimension_separator"], "/");
    }

    #[test]
    fn zarray_without_compression_has_null_compressor() {
        let meta = array_metadata_v2(&dims(), vec![10, 3, 48, 48], None);
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["compressor"], Value::Null);
    }

    #[test]
    fn v3_array_document() {
        let meta = array_metadata_v3(&dims(), vec![10, 3, 48, 48], Some(&compression()));
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["zarr_format"], 3);
        assert_eq!(value["node_type"], "array");
        assert_eq!(value["data_type"], "uint16");
        // top-level grid is the shard shape in px
        assert_eq!(
            value["chunk_grid"]["configuration"]["chunk_shape"],
            json!([10, 1, 32, 32])
        );
        let sharding = &value["codecs"][0];
        assert_eq!(sharding["name"], "sharding_indexed");
        assert_eq!(
            sharding["configuration"]["chunk_shape"],
            json!([5, 1, 16, 16])
        );
        assert_eq!(sharding["configuration"]["index_location"], "end");
        let inner = sharding["configuration"]["codecs"].as_array().unwrap();
        assert_eq!(inner[0]["name"], "bytes");
        assert_eq!(inner[1]["name"], "blosc");
        assert_eq!(inner[1]["configuration"]["shuffle"], "shuffle");
        assert_eq!(inner[1]["configuration"]["typesize"], 2);
        assert_eq!(value["dimension_names"], json!(["t", "c", "y", "x"]));
    }

    #[test]
    fn multiscales_scale_vectors() {
        let ome = ome_multiscales(ZarrVersion::V2, &dims(), 3);
        let datasets = ome[0]["datasets"].as_array().unwrap();
        assert_eq!(datasets.len(), 3);
        assert_eq!(
            datasets[0]["coordinateTransformations"][0]["scale"],
            json!([1.0, 1.0, 1.0, 1.0])
        );
        assert_eq!(
            datasets[2]["coordinateTransformations"][0]["scale"],
            json!([4.0, 1.0, 4.0, 4.0])
        );
        assert_eq!(ome[0]["type"], "local_mean");
        assert_eq!(
            ome[0]["metadata"]["method"],
            "skimage.transform.downscale_local_mean"
        );
        assert_eq!(ome[0]["metadata"]["kwargs"], json!(["cval", 0]));
        assert_eq!(ome[0]["version"], "0.4");

        let axes = ome[0]["axes"].as_array().unwrap();
        assert_eq!(axes[0], json!({ "name": "t", "type": "time" }));
        assert_eq!(
            axes[3],
            json!({ "name": "x", "type": "space", "unit": "micrometer" })
        );
    }

    #[test]
    fn single_scale_has_no_downsampling_metadata() {
        let ome = ome_multiscales(ZarrVersion::V2, &dims(), 1);
        assert_eq!(ome[0]["datasets"].as_array().unwrap().len(), 1);
        assert!(ome[0].get("type").is_none());
        assert!(ome[0].get("metadata").is_none());
    }

    #[test]
    fn v3_wraps_multiscales() {
        let ome = ome_multiscales(ZarrVersion::V3, &dims(), 2);
        assert_eq!(ome["version"], "0.5");
        assert_eq!(ome["name"], "/");
        assert!(ome["multiscales"].is_array());

        let group = group_metadata(ZarrVersion::V3, &ome);
        assert_eq!(group["node_type"], "group");
        assert_eq!(group["attributes"]["ome"]["version"], "0.5");
        assert_eq!(group["consolidated_metadata"], Value::Null);

        let base = base_metadata(ZarrVersion::V3, &ome);
        assert_eq!(
            base["zarr_format"],
            "https://purl.org/zarr/spec/protocol/core/3.0"
        );
    }
}
