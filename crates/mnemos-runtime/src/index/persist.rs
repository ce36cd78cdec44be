//! On-disk form of a vector index.
//!
//! Two files per index: the structure (vectors, centroids, inverted lists)
//! as MessagePack, and a JSON sidecar carrying the per-row metadata so time
//! window filtering never needs a store round trip:
//!
//! ```json
//! {"created_at": "...", "dimension": 512, "index_type": "ivf", "count": 2,
//!  "entries": [{"external_id": "17", "turn_id": "t-9", "timestamp": 1700000000000,
//!               "who": "user", "layer": "input"}]}
//! ```

use super::{ExactIndex, IndexEntry, IndexType, IvfIndex, VectorIndex};
use chrono::{DateTime, Utc};
use mnemos_types::config::IndexConfig;
use mnemos_types::error::{MnemosError, MnemosResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

const FORMAT_VERSION: u32 = 1;

/// Serializable index structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexSnapshot {
    Exact {
        dimension: usize,
        data: Vec<f32>,
    },
    Ivf {
        dimension: usize,
        nprobe: usize,
        centroids: Vec<Vec<f32>>,
        lists: Vec<Vec<u32>>,
        data: Vec<f32>,
    },
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    snapshot: IndexSnapshot,
}

/// JSON sidecar next to the index binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub created_at: DateTime<Utc>,
    pub dimension: usize,
    pub index_type: IndexType,
    pub count: usize,
    pub entries: Vec<IndexEntry>,
}

fn unavailable(path: &Path, e: impl std::fmt::Display) -> MnemosError {
    MnemosError::IndexUnavailable(format!("{}: {e}", path.display()))
}

/// Write the index binary and its sidecar.
pub fn save(index: &dyn VectorIndex, index_path: &Path, meta_path: &Path) -> MnemosResult<()> {
    for path in [index_path, meta_path] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = IndexFile {
        version: FORMAT_VERSION,
        snapshot: index.snapshot(),
    };
    let bytes =
        rmp_serde::to_vec(&file).map_err(|e| MnemosError::Serialization(e.to_string()))?;
    let meta = IndexMeta {
        created_at: Utc::now(),
        dimension: index.dimension(),
        index_type: index.index_type(),
        count: index.len(),
        entries: index.entries().to_vec(),
    };
    let json =
        serde_json::to_vec(&meta).map_err(|e| MnemosError::Serialization(e.to_string()))?;

    write_atomic(index_path, &bytes)?;
    write_atomic(meta_path, &json)?;
    info!(
        path = %index_path.display(),
        count = meta.count,
        index_type = %meta.index_type,
        "Saved vector index"
    );
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> MnemosResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read only the sidecar.
pub fn load_meta(meta_path: &Path) -> MnemosResult<IndexMeta> {
    let raw = std::fs::read(meta_path).map_err(|e| unavailable(meta_path, e))?;
    serde_json::from_slice(&raw).map_err(|e| unavailable(meta_path, e))
}

/// Load an index saved by [`save`]. Any missing, unreadable or inconsistent
/// file is `IndexUnavailable`. With `config`, the clusters searched are recomputed
/// from the loaded cluster count instead of taken from the file.
pub fn load(
    index_path: &Path,
    meta_path: &Path,
    config: Option<&IndexConfig>,
) -> MnemosResult<Box<dyn VectorIndex>> {
    let meta = load_meta(meta_path)?;
    let raw = std::fs::read(index_path).map_err(|e| unavailable(index_path, e))?;
    let file: IndexFile = rmp_serde::from_slice(&raw).map_err(|e| unavailable(index_path, e))?;
    if file.version != FORMAT_VERSION {
        return Err(unavailable(
            index_path,
            format!("unsupported format version {}", file.version),
        ));
    }
    if meta.entries.len() != meta.count {
        return Err(unavailable(meta_path, "entry count mismatch"));
    }

    let rows_ok = |dimension: usize, data: &[f32]| {
        dimension == meta.dimension && data.len() == dimension * meta.count
    };
    let index: Box<dyn VectorIndex> = match file.snapshot {
        IndexSnapshot::Exact { dimension, data } => {
            if !rows_ok(dimension, &data) || meta.index_type != IndexType::Exact {
                return Err(unavailable(index_path, "index does not match sidecar"));
            }
            Box::new(ExactIndex::from_parts(dimension, data, meta.entries))
        }
        IndexSnapshot::Ivf {
            dimension,
            nprobe: saved_nprobe,
            centroids,
            lists,
            data,
        } => {
            let listed: usize = lists.iter().map(Vec::len).sum();
            let lists_ok = listed == meta.count
                && lists.len() == centroids.len()
                && lists.iter().flatten().all(|&r| (r as usize) < meta.count);
            if !rows_ok(dimension, &data) || !lists_ok || meta.index_type != IndexType::Ivf {
                return Err(unavailable(index_path, "index does not match sidecar"));
            }
            let mut ivf = IvfIndex::from_parts(
                dimension,
                saved_nprobe,
                centroids,
                lists,
                data,
                meta.entries,
            );
            if let Some(config) = config {
                ivf.set_nprobe(config.nprobe_for(ivf.nlist()));
            }
            Box::new(ivf)
        }
    };
    info!(
        path = %index_path.display(),
        count = index.len(),
        index_type = %index.index_type(),
        "Loaded vector index"
    );
    Ok(index)
}
