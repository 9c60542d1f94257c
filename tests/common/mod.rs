//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

/// Collect every file under `root` as store-relative key -> contents.
pub fn collect_store(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    collect_into(root, root, &mut files);
    files
}

fn collect_into(root: &Path, dir: &Path, files: &mut BTreeMap<String, Vec<u8>>) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect_into(root, &path, files);
        } else {
            let key = path
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            files.insert(key, std::fs::read(&path).unwrap());
        }
    }
}

/// A deterministic test frame: `width * height` bytes seeded by the frame
/// index.
pub fn pattern_frame(frame_index: usize, width: usize, height: usize) -> Vec<u8> {
    (0..width * height)
        .map(|i| ((frame_index * 31 + i * 7) % 251) as u8)
        .collect()
}

/// Parse the trailing `(offset, size)` index of a shard object.
pub fn parse_shard_index(shard: &[u8], chunk_capacity: usize) -> Vec<(u64, u64)> {
    let index_bytes = chunk_capacity * 16;
    assert!(shard.len() >= index_bytes, "shard shorter than its index");
    let index = &shard[shard.len() - index_bytes..];
    (0..chunk_capacity)
        .map(|i| {
            let at = i * 16;
            (
                u64::from_le_bytes(index[at..at + 8].try_into().unwrap()),
                u64::from_le_bytes(index[at + 8..at + 16].try_into().unwrap()),
            )
        })
        .collect()
}
