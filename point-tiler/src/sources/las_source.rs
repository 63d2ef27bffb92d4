use super::{color_from_intensity, SourceInfo};
use crate::error::{Result, TilerError};
use las::Reader;
use point_data::aabb::Aabb;
use point_data::attributes::{AttributeSchema, PointAttribute};
use point_data::buffer::Point;
use point_data::PointBuffer;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// LAS/LAZ point source. Handles both plain and compressed files.
pub struct LasSource {
    reader: Reader,
    path: String,
    schema: AttributeSchema,
    info: SourceInfo,
    has_color: bool,
}

impl LasSource {
    pub fn open(path: &Path, schema: &AttributeSchema) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| TilerError::io(format!("opening {}", path.display()), e))?;
        let reader = Reader::new(BufReader::new(file)).map_err(|e| TilerError::Decode {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let header = reader.header();
        let bounds = header.bounds();
        let info = SourceInfo {
            natural_bounds: Some(Aabb::new(
                [bounds.min.x, bounds.min.y, bounds.min.z],
                [bounds.max.x, bounds.max.y, bounds.max.z],
            )),
            point_count: Some(header.number_of_points()),
        };
        let has_color = header.point_format().has_color;

        Ok(Self {
            reader,
            path: path.display().to_string(),
            schema: schema.clone(),
            info,
            has_color,
        })
    }

    pub fn info(&self) -> SourceInfo {
        self.info.clone()
    }

    pub fn missing_attributes(&self) -> Vec<PointAttribute> {
        let mut missing = Vec::new();
        if self.schema.contains(PointAttribute::ColorPacked) && !self.has_color {
            missing.push(PointAttribute::ColorPacked);
        }
        if self.schema.contains(PointAttribute::NormalOct16) {
            missing.push(PointAttribute::NormalOct16);
        }
        missing
    }

    pub fn read_batch(&mut self, max_points: usize) -> Result<Option<PointBuffer>> {
        let mut buffer = PointBuffer::with_capacity(self.schema.clone(), max_points);
        let wants_intensity_color = self.schema.contains(PointAttribute::ColorFromIntensity);
        for decoded in self.reader.points().take(max_points) {
            let point = decoded.map_err(|e| TilerError::Decode {
                path: self.path.clone(),
                message: e.to_string(),
            })?;

            // LAS colours are 16 bit per channel; narrow like the rest of
            // the pipeline expects.
            let color = if wants_intensity_color {
                color_from_intensity(point.intensity)
            } else {
                point.color.map_or([0, 0, 0, 255], |c| {
                    [
                        (c.red >> 8) as u8,
                        (c.green >> 8) as u8,
                        (c.blue >> 8) as u8,
                        255,
                    ]
                })
            };

            buffer.push(Point {
                position: [point.x, point.y, point.z],
                color,
                intensity: point.intensity,
                classification: u8::from(point.classification),
                normal: 0,
            });
        }
        if buffer.is_empty() {
            Ok(None)
        } else {
            Ok(Some(buffer))
        }
    }
}
