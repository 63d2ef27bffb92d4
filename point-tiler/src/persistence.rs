//! On-disk node payload store.
//!
//! One file per node under `{output}/data/`, named by the node's octant
//! path (root = `r`) with the extension of the configured output format.
//! Writes go to a temp file first and are renamed into place, so a
//! partial payload is never visible. The coordinate transform is applied
//! to positions here and only here; partitioning upstream always sees
//! native coordinates.

use crate::config::OutputFormat;
use crate::error::{Result, TilerError};
use crate::transform::Transform;
use point_data::attributes::{AttributeSchema, PointAttribute};
use point_data::buffer::Point;
use point_data::payload;
use point_data::PointBuffer;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

pub struct NodeStorage {
    data_dir: PathBuf,
    format: OutputFormat,
    transform: Transform,
    schema: AttributeSchema,
}

impl NodeStorage {
    pub fn new(
        output_dir: &Path,
        format: OutputFormat,
        transform: Transform,
        schema: AttributeSchema,
    ) -> Result<Self> {
        let data_dir = output_dir.join("data");
        fs::create_dir_all(&data_dir)
            .map_err(|e| TilerError::io(format!("creating {}", data_dir.display()), e))?;
        Ok(Self {
            data_dir,
            format,
            transform,
            schema,
        })
    }

    pub fn schema(&self) -> &AttributeSchema {
        &self.schema
    }

    fn node_file(&self, name: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", name, self.format.extension()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.node_file(name).exists()
    }

    /// Number of points already stored for a node, read from the payload
    /// header without decoding the body. `None` when the node has no file
    /// yet. INCREMENTAL runs use this to pick up where a previous run
    /// left off.
    pub fn stored_count(&self, name: &str) -> Result<Option<u64>> {
        let path = self.node_file(name);
        if !path.exists() {
            return Ok(None);
        }
        match self.format {
            OutputFormat::Bin => {
                use byteorder::{LittleEndian, ReadBytesExt};
                let file = File::open(&path)
                    .map_err(|e| TilerError::io(format!("opening {}", path.display()), e))?;
                let mut reader = BufReader::new(file);
                let _version = reader
                    .read_u32::<LittleEndian>()
                    .map_err(|e| TilerError::io(format!("reading {}", path.display()), e))?;
                let attribute_count = reader
                    .read_u32::<LittleEndian>()
                    .map_err(|e| TilerError::io(format!("reading {}", path.display()), e))?;
                for _ in 0..attribute_count {
                    reader
                        .read_u8()
                        .map_err(|e| TilerError::io(format!("reading {}", path.display()), e))?;
                }
                let count = reader
                    .read_u64::<LittleEndian>()
                    .map_err(|e| TilerError::io(format!("reading {}", path.display()), e))?;
                Ok(Some(count))
            }
            OutputFormat::Las | OutputFormat::Laz => {
                let file = File::open(&path)
                    .map_err(|e| TilerError::io(format!("opening {}", path.display()), e))?;
                let reader = las::Reader::new(BufReader::new(file))
                    .map_err(|e| TilerError::io(path.display().to_string(), other_io(e)))?;
                Ok(Some(reader.header().number_of_points()))
            }
        }
    }

    /// Writes a node payload, replacing any previous one.
    pub fn store(&self, name: &str, buffer: &PointBuffer) -> Result<()> {
        let transformed = self.transform_buffer(buffer);
        self.write_atomic(name, &transformed)
    }

    /// Extends a node payload with further points, keeping earlier ones.
    pub fn append(&self, name: &str, buffer: &PointBuffer) -> Result<()> {
        let mut merged = if self.exists(name) {
            self.load(name)?
        } else {
            PointBuffer::new(self.schema.clone())
        };
        merged.append(self.transform_buffer(buffer));
        self.write_atomic(name, &merged)
    }

    /// Reads a payload as stored, output coordinates included.
    pub fn load(&self, name: &str) -> Result<PointBuffer> {
        let path = self.node_file(name);
        let file = File::open(&path)
            .map_err(|e| TilerError::io(format!("opening {}", path.display()), e))?;
        match self.format {
            OutputFormat::Bin => payload::read_payload(&mut BufReader::new(file))
                .map_err(|e| TilerError::io(format!("reading {}", path.display()), e)),
            OutputFormat::Las | OutputFormat::Laz => self.read_las(&path),
        }
    }

    /// Reads a payload back into native coordinates for re-tiling.
    pub fn load_native(&self, name: &str) -> Result<PointBuffer> {
        let mut buffer = self.load(name)?;
        if !self.transform.is_identity() {
            for p in buffer.positions_mut() {
                *p = self.transform.apply_inverse(*p);
            }
        }
        Ok(buffer)
    }

    /// Deletes every node payload whose path starts with the given node
    /// name. Node names are octant-path strings, so the prefix relation
    /// is exactly the subtree relation.
    pub fn remove_subtree(&self, name: &str) -> Result<()> {
        let entries = fs::read_dir(&self.data_dir)
            .map_err(|e| TilerError::io(format!("listing {}", self.data_dir.display()), e))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| TilerError::io(format!("listing {}", self.data_dir.display()), e))?;
            let path = entry.path();
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            if stem.starts_with(name) {
                fs::remove_file(&path)
                    .map_err(|e| TilerError::io(format!("removing {}", path.display()), e))?;
            }
        }
        Ok(())
    }

    /// Names of all stored nodes, recovered by listing the data
    /// directory.
    pub fn list_nodes(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.data_dir)
            .map_err(|e| TilerError::io(format!("listing {}", self.data_dir.display()), e))?;
        let extension = self.format.extension();
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| TilerError::io(format!("listing {}", self.data_dir.display()), e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn transform_buffer(&self, buffer: &PointBuffer) -> PointBuffer {
        let mut transformed = buffer.clone();
        if !self.transform.is_identity() {
            for p in transformed.positions_mut() {
                *p = self.transform.apply(*p);
            }
        }
        transformed
    }

    fn write_atomic(&self, name: &str, buffer: &PointBuffer) -> Result<()> {
        let path = self.node_file(name);
        let temp = self.data_dir.join(format!(
            "{}.{}.tmp",
            name,
            self.format.extension()
        ));
        match self.format {
            OutputFormat::Bin => {
                let file = File::create(&temp)
                    .map_err(|e| TilerError::io(format!("creating {}", temp.display()), e))?;
                let mut writer = BufWriter::new(file);
                payload::write_payload(&mut writer, buffer)
                    .map_err(|e| TilerError::io(format!("writing {}", temp.display()), e))?;
            }
            OutputFormat::Las | OutputFormat::Laz => self.write_las(&temp, buffer)?,
        }
        fs::rename(&temp, &path)
            .map_err(|e| TilerError::io(format!("renaming into {}", path.display()), e))
    }

    fn write_las(&self, path: &Path, buffer: &PointBuffer) -> Result<()> {
        let mut builder = las::Builder::from((1, 4));
        let format_id = if self.schema.has_color() { 2 } else { 0 };
        builder.point_format = las::point::Format::new(format_id)
            .map_err(|e| TilerError::io(path.display().to_string(), other_io(e)))?;
        builder.point_format.is_compressed = self.format == OutputFormat::Laz;
        let header = builder
            .into_header()
            .map_err(|e| TilerError::io(path.display().to_string(), other_io(e)))?;

        let file = File::create(path)
            .map_err(|e| TilerError::io(format!("creating {}", path.display()), e))?;
        let mut writer = las::Writer::new(BufWriter::new(file), header)
            .map_err(|e| TilerError::io(path.display().to_string(), other_io(e)))?;

        for point in buffer.iter_points() {
            let mut out = las::Point {
                x: point.position[0],
                y: point.position[1],
                z: point.position[2],
                intensity: point.intensity,
                ..las::Point::default()
            };
            if self.schema.has_color() {
                // Widen packed 8-bit channels back to the 16-bit LAS range.
                out.color = Some(las::Color {
                    red: u16::from(point.color[0]) << 8,
                    green: u16::from(point.color[1]) << 8,
                    blue: u16::from(point.color[2]) << 8,
                });
            }
            if self.schema.contains(PointAttribute::Classification) {
                out.classification = las::point::Classification::new(point.classification)
                    .unwrap_or(las::point::Classification::Unclassified);
            }
            writer
                .write_point(out)
                .map_err(|e| TilerError::io(path.display().to_string(), other_io(e)))?;
        }
        writer
            .close()
            .map_err(|e| TilerError::io(path.display().to_string(), other_io(e)))?;
        Ok(())
    }

    fn read_las(&self, path: &Path) -> Result<PointBuffer> {
        let file = File::open(path)
            .map_err(|e| TilerError::io(format!("opening {}", path.display()), e))?;
        let mut reader = las::Reader::new(BufReader::new(file))
            .map_err(|e| TilerError::io(path.display().to_string(), other_io(e)))?;
        let mut buffer = PointBuffer::new(self.schema.clone());
        for point in reader.points() {
            let point =
                point.map_err(|e| TilerError::io(path.display().to_string(), other_io(e)))?;
            let color = point.color.map_or([0, 0, 0, 255], |c| {
                [(c.red >> 8) as u8, (c.green >> 8) as u8, (c.blue >> 8) as u8, 255]
            });
            buffer.push(Point {
                position: [point.x, point.y, point.z],
                color,
                intensity: point.intensity,
                classification: u8::from(point.classification),
                normal: 0,
            });
        }
        Ok(buffer)
    }
}

fn other_io(error: impl std::error::Error + Send + Sync + 'static) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use point_data::attributes::AttributeSchema;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn scratch_dir(tag: &str) -> PathBuf {
        static UNIQUE: AtomicU64 = AtomicU64::new(0);
        let dir = std::env::temp_dir().join(format!(
            "point-tiler-{}-{}-{}",
            tag,
            std::process::id(),
            UNIQUE.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn buffer_of(positions: &[[f64; 3]]) -> PointBuffer {
        let mut buffer = PointBuffer::new(AttributeSchema::position_only());
        for &position in positions {
            buffer.push(Point {
                position,
                ..Point::default()
            });
        }
        buffer
    }

    fn storage_at(dir: &Path) -> NodeStorage {
        NodeStorage::new(
            dir,
            OutputFormat::Bin,
            Transform::Identity,
            AttributeSchema::position_only(),
        )
        .unwrap()
    }

    #[test]
    fn store_load_round_trips() {
        let dir = scratch_dir("store");
        let storage = storage_at(&dir);
        let buffer = buffer_of(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        storage.store("r", &buffer).unwrap();
        assert!(storage.exists("r"));
        let loaded = storage.load("r").unwrap();
        assert_eq!(loaded.positions(), buffer.positions());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn append_extends_existing_payload() {
        let dir = scratch_dir("append");
        let storage = storage_at(&dir);
        storage.append("r3", &buffer_of(&[[1.0, 0.0, 0.0]])).unwrap();
        storage.append("r3", &buffer_of(&[[2.0, 0.0, 0.0]])).unwrap();
        let loaded = storage.load("r3").unwrap();
        assert_eq!(
            loaded.positions(),
            &[[1.0, 0.0, 0.0], [2.0, 0.0, 0.0]]
        );
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn no_temp_files_remain_after_store() {
        let dir = scratch_dir("atomic");
        let storage = storage_at(&dir);
        storage.store("r", &buffer_of(&[[0.0; 3]])).unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.join("data"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn remove_subtree_is_prefix_scoped() {
        let dir = scratch_dir("subtree");
        let storage = storage_at(&dir);
        for name in ["r", "r1", "r10", "r17", "r2"] {
            storage.store(name, &buffer_of(&[[0.0; 3]])).unwrap();
        }
        storage.remove_subtree("r1").unwrap();
        assert_eq!(storage.list_nodes().unwrap(), vec!["r", "r2"]);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn las_payload_round_trips_colors() {
        let dir = scratch_dir("las");
        let schema = AttributeSchema::new(&[
            PointAttribute::ColorPacked,
            PointAttribute::Intensity,
            PointAttribute::Classification,
        ]);
        let storage = NodeStorage::new(
            &dir,
            OutputFormat::Las,
            Transform::Identity,
            schema.clone(),
        )
        .unwrap();
        let mut buffer = PointBuffer::new(schema);
        buffer.push(Point {
            position: [10.0, 20.0, 30.0],
            color: [200, 100, 50, 255],
            intensity: 4096,
            classification: 2,
            normal: 0,
        });
        storage.store("r", &buffer).unwrap();
        let loaded = storage.load("r").unwrap();
        assert_eq!(loaded.len(), 1);
        let point = loaded.point(0);
        assert_eq!(point.color, [200, 100, 50, 255]);
        assert_eq!(point.intensity, 4096);
        assert_eq!(point.classification, 2);
        // LAS quantizes coordinates to the header scale.
        for axis in 0..3 {
            assert!((point.position[axis] - buffer.position(0)[axis]).abs() < 1e-3);
        }
        fs::remove_dir_all(dir).unwrap();
    }
}
