use serde::{Deserialize, Serialize};
use std::fmt;

/// Recognised per-point attributes. Every attribute has a fixed stored
/// width; the ordered set of attributes defines the layout of all buffers
/// and node payloads in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointAttribute {
    PositionCartesian,
    ColorPacked,
    /// Packed grayscale colour derived from the normalised intensity range.
    ColorFromIntensity,
    Intensity,
    Classification,
    NormalOct16,
}

impl PointAttribute {
    /// Stable wire id used in payload headers.
    pub fn id(self) -> u8 {
        match self {
            PointAttribute::PositionCartesian => 0,
            PointAttribute::ColorPacked => 1,
            PointAttribute::ColorFromIntensity => 2,
            PointAttribute::Intensity => 3,
            PointAttribute::Classification => 4,
            PointAttribute::NormalOct16 => 5,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(PointAttribute::PositionCartesian),
            1 => Some(PointAttribute::ColorPacked),
            2 => Some(PointAttribute::ColorFromIntensity),
            3 => Some(PointAttribute::Intensity),
            4 => Some(PointAttribute::Classification),
            5 => Some(PointAttribute::NormalOct16),
            _ => None,
        }
    }

    /// Bytes per point in a node payload.
    pub fn byte_width(self) -> usize {
        match self {
            PointAttribute::PositionCartesian => 24,
            PointAttribute::ColorPacked => 4,
            PointAttribute::ColorFromIntensity => 4,
            PointAttribute::Intensity => 2,
            PointAttribute::Classification => 1,
            PointAttribute::NormalOct16 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PointAttribute::PositionCartesian => "POSITION_CARTESIAN",
            PointAttribute::ColorPacked => "COLOR_PACKED",
            PointAttribute::ColorFromIntensity => "COLOR_FROM_INTENSITY",
            PointAttribute::Intensity => "INTENSITY",
            PointAttribute::Classification => "CLASSIFICATION",
            PointAttribute::NormalOct16 => "NORMAL_OCT16",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "POSITION_CARTESIAN" => Some(PointAttribute::PositionCartesian),
            "COLOR_PACKED" | "RGB" => Some(PointAttribute::ColorPacked),
            "COLOR_FROM_INTENSITY" | "RGB_FROM_INTENSITY" => {
                Some(PointAttribute::ColorFromIntensity)
            }
            "INTENSITY" => Some(PointAttribute::Intensity),
            "CLASSIFICATION" => Some(PointAttribute::Classification),
            "NORMAL_OCT16" | "NORMAL" => Some(PointAttribute::NormalOct16),
            _ => None,
        }
    }

    /// True when the stored column is a packed colour.
    pub fn is_color(self) -> bool {
        matches!(
            self,
            PointAttribute::ColorPacked | PointAttribute::ColorFromIntensity
        )
    }
}

impl fmt::Display for PointAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered attribute list shared by every buffer in a run. Position is
/// always present and always first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSchema {
    attributes: Vec<PointAttribute>,
}

impl AttributeSchema {
    /// Builds a schema from the requested attributes, forcing position to
    /// the front and dropping duplicates while keeping the given order.
    pub fn new(requested: &[PointAttribute]) -> Self {
        let mut attributes = vec![PointAttribute::PositionCartesian];
        for &attribute in requested {
            if !attributes.contains(&attribute) {
                attributes.push(attribute);
            }
        }
        Self { attributes }
    }

    pub fn position_only() -> Self {
        Self::new(&[])
    }

    pub fn attributes(&self) -> &[PointAttribute] {
        &self.attributes
    }

    pub fn contains(&self, attribute: PointAttribute) -> bool {
        self.attributes.contains(&attribute)
    }

    pub fn has_color(&self) -> bool {
        self.attributes.iter().any(|a| a.is_color())
    }

    /// Total payload bytes per point.
    pub fn point_byte_size(&self) -> usize {
        self.attributes.iter().map(|a| a.byte_width()).sum()
    }

    pub fn names(&self) -> Vec<String> {
        self.attributes.iter().map(|a| a.name().to_string()).collect()
    }
}

impl fmt::Display for AttributeSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, attribute) in self.attributes.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            f.write_str(attribute.name())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip() {
        for id in 0..6u8 {
            let attribute = PointAttribute::from_id(id).unwrap();
            assert_eq!(attribute.id(), id);
        }
        assert!(PointAttribute::from_id(6).is_none());
    }

    #[test]
    fn schema_forces_position_first() {
        let schema = AttributeSchema::new(&[
            PointAttribute::Classification,
            PointAttribute::PositionCartesian,
            PointAttribute::ColorPacked,
            PointAttribute::Classification,
        ]);
        assert_eq!(
            schema.attributes(),
            &[
                PointAttribute::PositionCartesian,
                PointAttribute::Classification,
                PointAttribute::ColorPacked,
            ]
        );
        assert_eq!(schema.point_byte_size(), 24 + 1 + 4);
    }

    #[test]
    fn alias_names_resolve() {
        assert_eq!(
            PointAttribute::from_name("RGB"),
            Some(PointAttribute::ColorPacked)
        );
        assert_eq!(
            PointAttribute::from_name("RGB_FROM_INTENSITY"),
            Some(PointAttribute::ColorFromIntensity)
        );
        assert!(PointAttribute::from_name("BOGUS").is_none());
    }
}
