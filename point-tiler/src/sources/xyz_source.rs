use super::{color_from_intensity, normalize_u16, normalize_u8, SourceInfo};
use crate::error::{Result, TilerError};
use point_data::attributes::{AttributeSchema, PointAttribute};
use point_data::buffer::Point;
use point_data::PointBuffer;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Per-line layout of a text cloud, detected from the first data line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineLayout {
    /// `x y z`
    Position,
    /// `x y z i`
    PositionIntensity,
    /// `x y z r g b`
    PositionColor,
    /// `x y z i r g b`
    PositionIntensityColor,
}

impl LineLayout {
    fn from_token_count(count: usize) -> Option<Self> {
        match count {
            3 => Some(LineLayout::Position),
            4 => Some(LineLayout::PositionIntensity),
            6 => Some(LineLayout::PositionColor),
            7 => Some(LineLayout::PositionIntensityColor),
            _ => None,
        }
    }

    fn has_intensity(self) -> bool {
        matches!(
            self,
            LineLayout::PositionIntensity | LineLayout::PositionIntensityColor
        )
    }

    fn has_color(self) -> bool {
        matches!(
            self,
            LineLayout::PositionColor | LineLayout::PositionIntensityColor
        )
    }
}

/// Whitespace-separated text source for `.xyz`, `.txt` and `.pts` files.
/// Raw colour and intensity values are normalised into the packed ranges
/// with the configured input ranges.
pub struct XyzSource {
    lines: std::io::Lines<BufReader<File>>,
    path: String,
    schema: AttributeSchema,
    layout: LineLayout,
    pending: Option<Point>,
    line_number: u64,
    color_range: (f64, f64),
    intensity_range: (f64, f64),
}

impl XyzSource {
    pub fn open(
        path: &Path,
        schema: &AttributeSchema,
        color_range: (f64, f64),
        intensity_range: (f64, f64),
    ) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| TilerError::io(format!("opening {}", path.display()), e))?;
        let mut source = Self {
            lines: BufReader::new(file).lines(),
            path: path.display().to_string(),
            schema: schema.clone(),
            layout: LineLayout::Position,
            pending: None,
            line_number: 0,
            color_range,
            intensity_range,
        };

        // The first data line fixes the layout for the whole file.
        if let Some((layout, point)) = source.read_first()? {
            source.layout = layout;
            source.pending = Some(point);
        }
        Ok(source)
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo::default()
    }

    pub fn missing_attributes(&self) -> Vec<PointAttribute> {
        let mut missing = Vec::new();
        if self.schema.contains(PointAttribute::ColorPacked) && !self.layout.has_color() {
            missing.push(PointAttribute::ColorPacked);
        }
        if self.schema.contains(PointAttribute::Intensity) && !self.layout.has_intensity() {
            missing.push(PointAttribute::Intensity);
        }
        if self.schema.contains(PointAttribute::ColorFromIntensity)
            && !self.layout.has_intensity()
        {
            missing.push(PointAttribute::ColorFromIntensity);
        }
        if self.schema.contains(PointAttribute::Classification) {
            missing.push(PointAttribute::Classification);
        }
        if self.schema.contains(PointAttribute::NormalOct16) {
            missing.push(PointAttribute::NormalOct16);
        }
        missing
    }

    fn read_first(&mut self) -> Result<Option<(LineLayout, Point)>> {
        loop {
            let Some(line) = self.next_line()? else {
                return Ok(None);
            };
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            let Some(layout) = LineLayout::from_token_count(tokens.len()) else {
                return Err(self.decode_error(format!(
                    "line {}: expected 3, 4, 6 or 7 columns, found {}",
                    self.line_number,
                    tokens.len()
                )));
            };
            let point = self.parse_tokens(layout, &tokens)?;
            return Ok(Some((layout, point)));
        }
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        match self.lines.next() {
            None => Ok(None),
            Some(Ok(line)) => {
                self.line_number += 1;
                Ok(Some(line))
            }
            Some(Err(e)) => Err(TilerError::io(format!("reading {}", self.path), e)),
        }
    }

    fn decode_error(&self, message: String) -> TilerError {
        TilerError::Decode {
            path: self.path.clone(),
            message,
        }
    }

    fn parse_tokens(&self, layout: LineLayout, tokens: &[&str]) -> Result<Point> {
        let value = |index: usize| -> Result<f64> {
            tokens[index].parse::<f64>().map_err(|_| {
                self.decode_error(format!(
                    "line {}: \"{}\" is not a number",
                    self.line_number, tokens[index]
                ))
            })
        };

        let position = [value(0)?, value(1)?, value(2)?];
        let mut intensity = 0u16;
        let mut color = [0, 0, 0, 255];
        match layout {
            LineLayout::Position => {}
            LineLayout::PositionIntensity => {
                intensity = normalize_u16(value(3)?, self.intensity_range);
            }
            LineLayout::PositionColor => {
                color = [
                    normalize_u8(value(3)?, self.color_range),
                    normalize_u8(value(4)?, self.color_range),
                    normalize_u8(value(5)?, self.color_range),
                    255,
                ];
            }
            LineLayout::PositionIntensityColor => {
                intensity = normalize_u16(value(3)?, self.intensity_range);
                color = [
                    normalize_u8(value(4)?, self.color_range),
                    normalize_u8(value(5)?, self.color_range),
                    normalize_u8(value(6)?, self.color_range),
                    255,
                ];
            }
        }
        if self.schema.contains(PointAttribute::ColorFromIntensity) {
            color = color_from_intensity(intensity);
        }

        Ok(Point {
            position,
            color,
            intensity,
            classification: 0,
            normal: 0,
        })
    }

    pub fn read_batch(&mut self, max_points: usize) -> Result<Option<PointBuffer>> {
        let mut buffer = PointBuffer::with_capacity(self.schema.clone(), max_points);
        if let Some(point) = self.pending.take() {
            buffer.push(point);
        }
        while buffer.len() < max_points {
            let Some(line) = self.next_line()? else {
                break;
            };
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            if LineLayout::from_token_count(tokens.len()) != Some(self.layout) {
                return Err(self.decode_error(format!(
                    "line {}: column count {} does not match the rest of the file",
                    self.line_number,
                    tokens.len()
                )));
            }
            buffer.push(self.parse_tokens(self.layout, &tokens)?);
        }
        if buffer.is_empty() {
            Ok(None)
        } else {
            Ok(Some(buffer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn write_source(name: &str, contents: &str) -> std::path::PathBuf {
        static UNIQUE: AtomicU64 = AtomicU64::new(0);
        let path = std::env::temp_dir().join(format!(
            "point-tiler-xyz-{}-{}-{}",
            std::process::id(),
            UNIQUE.fetch_add(1, Ordering::Relaxed),
            name
        ));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn plain_xyz_parses_in_order() {
        let path = write_source("plain.xyz", "0 0 0\n1 2 3\n4 5 6\n");
        let schema = AttributeSchema::position_only();
        let mut source = XyzSource::open(&path, &schema, (0.0, 255.0), (0.0, 65535.0)).unwrap();
        let batch = source.read_batch(10).unwrap().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.position(1), [1.0, 2.0, 3.0]);
        assert!(source.read_batch(10).unwrap().is_none());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn batches_split_at_the_requested_size() {
        let lines: String = (0..10).map(|i| format!("{} 0 0\n", i)).collect();
        let path = write_source("batched.xyz", &lines);
        let schema = AttributeSchema::position_only();
        let mut source = XyzSource::open(&path, &schema, (0.0, 255.0), (0.0, 65535.0)).unwrap();
        let first = source.read_batch(4).unwrap().unwrap();
        assert_eq!(first.len(), 4);
        let second = source.read_batch(4).unwrap().unwrap();
        assert_eq!(second.len(), 4);
        assert_eq!(second.position(0), [4.0, 0.0, 0.0]);
        let third = source.read_batch(4).unwrap().unwrap();
        assert_eq!(third.len(), 2);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn colors_and_intensity_are_normalized() {
        let path = write_source("colored.pts", "1 2 3 2047 255 0 127\n");
        let schema = AttributeSchema::new(&[
            PointAttribute::ColorPacked,
            PointAttribute::Intensity,
        ]);
        let mut source = XyzSource::open(&path, &schema, (0.0, 255.0), (-2048.0, 2047.0)).unwrap();
        let batch = source.read_batch(1).unwrap().unwrap();
        let point = batch.point(0);
        assert_eq!(point.intensity, 65535);
        assert_eq!(point.color[0], 255);
        assert_eq!(point.color[1], 0);
        assert_eq!(point.color[2], 127);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn malformed_line_is_a_decode_error() {
        let path = write_source("broken.xyz", "1 2 3\n4 five 6\n");
        let schema = AttributeSchema::position_only();
        let mut source = XyzSource::open(&path, &schema, (0.0, 255.0), (0.0, 65535.0)).unwrap();
        let result = source.read_batch(10);
        assert!(matches!(result, Err(TilerError::Decode { .. })));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn intensity_derived_color_is_grayscale() {
        let path = write_source("gray.xyz", "0 0 0 65535\n");
        let schema = AttributeSchema::new(&[PointAttribute::ColorFromIntensity]);
        let mut source = XyzSource::open(&path, &schema, (0.0, 255.0), (0.0, 65535.0)).unwrap();
        let batch = source.read_batch(1).unwrap().unwrap();
        assert_eq!(batch.point(0).color, [255, 255, 255, 255]);
        std::fs::remove_file(path).unwrap();
    }
}
