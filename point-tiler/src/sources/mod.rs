//! Concrete point sources behind an extension-dispatching factory.
//!
//! Each source decodes its file into batches shaped by the run schema.
//! Attributes the file cannot provide are zero-filled; the caller is told
//! which ones so it can warn once per source.

mod las_source;
mod xyz_source;

use crate::error::{Result, TilerError};
use point_data::aabb::Aabb;
use point_data::attributes::{AttributeSchema, PointAttribute};
use point_data::PointBuffer;
use std::path::Path;

pub use las_source::LasSource;
pub use xyz_source::XyzSource;

/// Extensions the converter accepts as point files.
pub const RECOGNIZED_EXTENSIONS: [&str; 5] = ["las", "laz", "xyz", "txt", "pts"];

pub fn is_recognized(path: &Path) -> bool {
    extension_of(path)
        .map(|ext| RECOGNIZED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// What a source knows about itself before any point is decoded.
#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    pub natural_bounds: Option<Aabb>,
    pub point_count: Option<u64>,
}

/// Decoded point source. Closed sum type; the factory below dispatches by
/// file extension.
pub enum SourceReader {
    Las(LasSource),
    Xyz(XyzSource),
}

impl SourceReader {
    /// Opens a source file for the given run schema. `.pts` files default
    /// their intensity range to `[-2048, 2047]` when the caller passes
    /// the full 16-bit default.
    pub fn open(
        path: &Path,
        schema: &AttributeSchema,
        color_range: (f64, f64),
        intensity_range: (f64, f64),
    ) -> Result<SourceReader> {
        if !path.exists() {
            return Err(TilerError::InputNotFound {
                path: path.display().to_string(),
            });
        }
        let extension = extension_of(path).unwrap_or_default();
        match extension.as_str() {
            "las" | "laz" => Ok(SourceReader::Las(LasSource::open(path, schema)?)),
            "xyz" | "txt" => Ok(SourceReader::Xyz(XyzSource::open(
                path,
                schema,
                color_range,
                intensity_range,
            )?)),
            "pts" => {
                let intensity_range = if intensity_range == (0.0, 65535.0) {
                    (-2048.0, 2047.0)
                } else {
                    intensity_range
                };
                Ok(SourceReader::Xyz(XyzSource::open(
                    path,
                    schema,
                    color_range,
                    intensity_range,
                )?))
            }
            other => Err(TilerError::Decode {
                path: path.display().to_string(),
                message: format!("unrecognized file extension \"{}\"", other),
            }),
        }
    }

    pub fn info(&self) -> SourceInfo {
        match self {
            SourceReader::Las(source) => source.info(),
            SourceReader::Xyz(source) => source.info(),
        }
    }

    /// Attributes of the run schema this source cannot provide; they are
    /// zero-filled in every batch.
    pub fn missing_attributes(&self) -> Vec<PointAttribute> {
        match self {
            SourceReader::Las(source) => source.missing_attributes(),
            SourceReader::Xyz(source) => source.missing_attributes(),
        }
    }

    /// Reads up to `max_points` points; `None` at end of file.
    pub fn read_batch(&mut self, max_points: usize) -> Result<Option<PointBuffer>> {
        match self {
            SourceReader::Las(source) => source.read_batch(max_points),
            SourceReader::Xyz(source) => source.read_batch(max_points),
        }
    }
}

/// Normalises a raw attribute value into the packed 8-bit range.
pub(crate) fn normalize_u8(value: f64, range: (f64, f64)) -> u8 {
    let span = range.1 - range.0;
    if span <= 0.0 {
        return 0;
    }
    (((value - range.0) / span).clamp(0.0, 1.0) * 255.0).round() as u8
}

pub(crate) fn normalize_u16(value: f64, range: (f64, f64)) -> u16 {
    let span = range.1 - range.0;
    if span <= 0.0 {
        return 0;
    }
    (((value - range.0) / span).clamp(0.0, 1.0) * 65535.0).round() as u16
}

/// Grayscale packed colour from an already-normalised intensity.
pub(crate) fn color_from_intensity(intensity: u16) -> [u8; 4] {
    let gray = (intensity >> 8) as u8;
    [gray, gray, gray, 255]
}
