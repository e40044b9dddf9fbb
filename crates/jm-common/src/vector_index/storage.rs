use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::VectorIndexError;

/// On-disk form of the index structure. Rows are stored back to back, so a
/// row's offset is its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IndexSnapshot {
    pub dimension: u32,
    pub vectors: Vec<f32>,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `data` to a sibling temp file, then rename over `path`. Readers see
/// either the old file or the new one.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), VectorIndexError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn save_index(path: &Path, snapshot: &IndexSnapshot) -> Result<(), VectorIndexError> {
    let data = bincode::serialize(snapshot)?;
    write_atomic(path, &data)
}

pub(crate) fn load_index(path: &Path) -> Result<Option<IndexSnapshot>, VectorIndexError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path)?;
    let snapshot: IndexSnapshot = bincode::deserialize(&data)?;
    if snapshot.dimension == 0 || snapshot.vectors.len() % snapshot.dimension as usize != 0 {
        return Err(VectorIndexError::Corrupt(format!(
            "{} floats do not divide into rows of {}",
            snapshot.vectors.len(),
            snapshot.dimension
        )));
    }
    Ok(Some(snapshot))
}

/// Metadata is a flat JSON object keyed by the stringified id.
pub(crate) fn save_metadata(
    path: &Path,
    metadata: &BTreeMap<u64, Value>,
) -> Result<(), VectorIndexError> {
    let object: Map<String, Value> = metadata
        .iter()
        .map(|(id, value)| (id.to_string(), value.clone()))
        .collect();
    let data = serde_json::to_vec_pretty(&Value::Object(object))?;
    write_atomic(path, &data)
}

pub(crate) fn load_metadata(path: &Path) -> Result<BTreeMap<u64, Value>, VectorIndexError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = fs::read(path)?;
    let object: Map<String, Value> = serde_json::from_slice(&data)?;
    object
        .into_iter()
        .map(|(key, value)| {
            key.parse::<u64>()
                .map(|id| (id, value))
                .map_err(|_| VectorIndexError::Corrupt(format!("metadata key {key:?} is not an id")))
        })
        .collect()
}
