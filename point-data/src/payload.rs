//! BIN node payload codec.
//!
//! Wire layout, little-endian: `u32` version, `u32` attribute count, one
//! `u8` attribute id per attribute, `u64` point count, then one contiguous
//! array per attribute in schema order.

use crate::attributes::{AttributeSchema, PointAttribute};
use crate::buffer::PointBuffer;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

pub const PAYLOAD_VERSION: u32 = 1;

fn invalid<T>(message: String) -> io::Result<T> {
    Err(io::Error::new(io::ErrorKind::InvalidData, message))
}

/// Writes a buffer as a BIN payload.
pub fn write_payload<W: Write>(writer: &mut W, buffer: &PointBuffer) -> io::Result<()> {
    let schema = buffer.schema();
    writer.write_u32::<LittleEndian>(PAYLOAD_VERSION)?;
    writer.write_u32::<LittleEndian>(schema.attributes().len() as u32)?;
    for attribute in schema.attributes() {
        writer.write_u8(attribute.id())?;
    }
    writer.write_u64::<LittleEndian>(buffer.len() as u64)?;

    for &attribute in schema.attributes() {
        match attribute {
            PointAttribute::PositionCartesian => {
                for p in buffer.positions() {
                    writer.write_f64::<LittleEndian>(p[0])?;
                    writer.write_f64::<LittleEndian>(p[1])?;
                    writer.write_f64::<LittleEndian>(p[2])?;
                }
            }
            PointAttribute::ColorPacked | PointAttribute::ColorFromIntensity => {
                let colors = buffer.colors().expect("schema carries a colour column");
                for color in colors {
                    writer.write_all(color)?;
                }
            }
            PointAttribute::Intensity => {
                let intensities = buffer.intensities().expect("schema carries intensity");
                for &intensity in intensities {
                    writer.write_u16::<LittleEndian>(intensity)?;
                }
            }
            PointAttribute::Classification => {
                let classes = buffer.classifications().expect("schema carries class");
                writer.write_all(classes)?;
            }
            PointAttribute::NormalOct16 => {
                let normals = buffer.normals().expect("schema carries normals");
                for &normal in normals {
                    writer.write_u16::<LittleEndian>(normal)?;
                }
            }
        }
    }
    Ok(())
}

/// Reads a BIN payload back into a buffer, validating version and ids.
pub fn read_payload<R: Read>(reader: &mut R) -> io::Result<PointBuffer> {
    let version = reader.read_u32::<LittleEndian>()?;
    if version != PAYLOAD_VERSION {
        return invalid(format!("unsupported payload version {}", version));
    }
    let attribute_count = reader.read_u32::<LittleEndian>()?;
    let mut attributes = Vec::with_capacity(attribute_count as usize);
    for _ in 0..attribute_count {
        let id = reader.read_u8()?;
        match PointAttribute::from_id(id) {
            Some(attribute) => attributes.push(attribute),
            None => return invalid(format!("unknown attribute id {}", id)),
        }
    }
    if attributes.first() != Some(&PointAttribute::PositionCartesian) {
        return invalid("payload does not start with positions".to_string());
    }
    let schema = AttributeSchema::new(&attributes);
    let count = reader.read_u64::<LittleEndian>()? as usize;

    let mut positions = Vec::with_capacity(count);
    let mut colors: Option<Vec<[u8; 4]>> = None;
    let mut intensities: Option<Vec<u16>> = None;
    let mut classifications: Option<Vec<u8>> = None;
    let mut normals: Option<Vec<u16>> = None;

    for &attribute in schema.attributes() {
        match attribute {
            PointAttribute::PositionCartesian => {
                for _ in 0..count {
                    let x = reader.read_f64::<LittleEndian>()?;
                    let y = reader.read_f64::<LittleEndian>()?;
                    let z = reader.read_f64::<LittleEndian>()?;
                    positions.push([x, y, z]);
                }
            }
            PointAttribute::ColorPacked | PointAttribute::ColorFromIntensity => {
                let mut column = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut color = [0u8; 4];
                    reader.read_exact(&mut color)?;
                    column.push(color);
                }
                colors = Some(column);
            }
            PointAttribute::Intensity => {
                let mut column = Vec::with_capacity(count);
                for _ in 0..count {
                    column.push(reader.read_u16::<LittleEndian>()?);
                }
                intensities = Some(column);
            }
            PointAttribute::Classification => {
                let mut column = vec![0u8; count];
                reader.read_exact(&mut column)?;
                classifications = Some(column);
            }
            PointAttribute::NormalOct16 => {
                let mut column = Vec::with_capacity(count);
                for _ in 0..count {
                    column.push(reader.read_u16::<LittleEndian>()?);
                }
                normals = Some(column);
            }
        }
    }

    let mut buffer = PointBuffer::with_capacity(schema, count);
    for index in 0..count {
        buffer.push(crate::buffer::Point {
            position: positions[index],
            color: colors.as_ref().map_or([0, 0, 0, 255], |c| c[index]),
            intensity: intensities.as_ref().map_or(0, |i| i[index]),
            classification: classifications.as_ref().map_or(0, |c| c[index]),
            normal: normals.as_ref().map_or(0, |n| n[index]),
        });
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Point;

    #[test]
    fn payload_round_trips() {
        let schema = AttributeSchema::new(&[
            PointAttribute::ColorPacked,
            PointAttribute::Intensity,
            PointAttribute::Classification,
            PointAttribute::NormalOct16,
        ]);
        let mut buffer = PointBuffer::new(schema);
        for i in 0..10 {
            buffer.push(Point {
                position: [i as f64 * 0.5, -1.0, 1e6 + i as f64],
                color: [i as u8, 10, 20, 255],
                intensity: 1000 + i as u16,
                classification: 2,
                normal: 0x1234,
            });
        }

        let mut bytes = Vec::new();
        write_payload(&mut bytes, &buffer).unwrap();
        let decoded = read_payload(&mut bytes.as_slice()).unwrap();

        assert_eq!(decoded.len(), buffer.len());
        assert_eq!(decoded.schema(), buffer.schema());
        for i in 0..buffer.len() {
            assert_eq!(decoded.point(i), buffer.point(i));
        }
    }

    #[test]
    fn header_layout_is_fixed() {
        let mut buffer = PointBuffer::new(AttributeSchema::position_only());
        buffer.push(Point::default());
        let mut bytes = Vec::new();
        write_payload(&mut bytes, &buffer).unwrap();
        // version, count=1, id 0, one point.
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(bytes[8], 0);
        assert_eq!(&bytes[9..17], &1u64.to_le_bytes());
        assert_eq!(bytes.len(), 17 + 24);
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&9u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        assert!(read_payload(&mut bytes.as_slice()).is_err());
    }
}
