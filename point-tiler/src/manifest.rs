//! Final JSON outputs: the `r.json` tileset manifest and the per-input
//! `sources.json` statistics file. Both are written atomically; the
//! manifest is written last so its existence signals a populated output.

use crate::error::{Result, TilerError};
use point_data::aabb::Aabb;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Manifest format version, checked before INCREMENTAL appends.
pub const MANIFEST_VERSION: u32 = 3;

pub const MANIFEST_FILE: &str = "r.json";
pub const SOURCES_FILE: &str = "sources.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    pub points: u64,
    pub bounds: Aabb,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStatistics {
    pub points_processed: u64,
    pub points_stored: u64,
    pub discarded_by_depth: u64,
    pub sources_failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilesetManifest {
    pub version: u32,
    pub bounds: Aabb,
    pub projection: String,
    pub schema: Vec<String>,
    pub spacing: f64,
    pub max_depth: u32,
    pub sources: Vec<SourceEntry>,
    pub statistics: RunStatistics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesManifest {
    pub bounds: Aabb,
    pub projection: String,
    pub sources: Vec<SourceEntry>,
}

impl TilesetManifest {
    pub fn path_in(output_dir: &Path) -> std::path::PathBuf {
        output_dir.join(MANIFEST_FILE)
    }

    pub fn write(&self, output_dir: &Path) -> Result<()> {
        write_json_atomic(&Self::path_in(output_dir), self)
    }

    pub fn read(output_dir: &Path) -> Result<Self> {
        let path = Self::path_in(output_dir);
        let text = fs::read_to_string(&path)
            .map_err(|e| TilerError::io(format!("reading {}", path.display()), e))?;
        serde_json::from_str(&text).map_err(|e| {
            TilerError::io(
                format!("parsing {}", path.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }
}

impl SourcesManifest {
    pub fn write(&self, output_dir: &Path) -> Result<()> {
        write_json_atomic(&output_dir.join(SOURCES_FILE), self)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| {
        TilerError::io(
            format!("serializing {}", path.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;
    let temp = path.with_extension("json.tmp");
    fs::write(&temp, json)
        .map_err(|e| TilerError::io(format!("writing {}", temp.display()), e))?;
    fs::rename(&temp, path)
        .map_err(|e| TilerError::io(format!("renaming into {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn scratch_dir() -> std::path::PathBuf {
        static UNIQUE: AtomicU64 = AtomicU64::new(0);
        let dir = std::env::temp_dir().join(format!(
            "point-tiler-manifest-{}-{}",
            std::process::id(),
            UNIQUE.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample_manifest() -> TilesetManifest {
        TilesetManifest {
            version: MANIFEST_VERSION,
            bounds: Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]),
            projection: String::new(),
            schema: vec!["POSITION_CARTESIAN".into()],
            spacing: 0.1,
            max_depth: 12,
            sources: vec![SourceEntry {
                name: "cloud.las".into(),
                points: 1000,
                bounds: Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]),
            }],
            statistics: RunStatistics {
                points_processed: 1000,
                points_stored: 990,
                discarded_by_depth: 10,
                sources_failed: 0,
            },
        }
    }

    #[test]
    fn manifest_round_trips() {
        let dir = scratch_dir();
        let manifest = sample_manifest();
        manifest.write(&dir).unwrap();
        let loaded = TilesetManifest::read(&dir).unwrap();
        assert_eq!(loaded.version, MANIFEST_VERSION);
        assert_eq!(loaded.sources.len(), 1);
        assert_eq!(loaded.statistics.points_stored, 990);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn bounds_serialize_as_min_max_arrays() {
        let manifest = sample_manifest();
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["bounds"]["min"], serde_json::json!([0.0, 0.0, 0.0]));
        assert_eq!(json["bounds"]["max"], serde_json::json!([1.0, 1.0, 1.0]));
        assert_eq!(json["sources"][0]["name"], "cloud.las");
    }

    #[test]
    fn no_temp_file_survives_a_write() {
        let dir = scratch_dir();
        sample_manifest().write(&dir).unwrap();
        assert!(dir.join(MANIFEST_FILE).exists());
        assert!(!dir.join("r.json.tmp").exists());
        fs::remove_dir_all(dir).unwrap();
    }
}
