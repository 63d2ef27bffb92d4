use crate::attributes::{AttributeSchema, PointAttribute};

/// One decoded point, in source-native coordinates. Attributes the run
/// schema does not carry are ignored on push.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub position: [f64; 3],
    pub color: [u8; 4],
    pub intensity: u16,
    pub classification: u8,
    pub normal: u16,
}

impl Default for Point {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            color: [0, 0, 0, 255],
            intensity: 0,
            classification: 0,
            normal: 0,
        }
    }
}

/// Columnar batch of points: one contiguous array per attribute of the
/// run schema. All column lengths are equal at all times. Buffers are
/// owned by exactly one holder; handoff is by move.
#[derive(Debug, Clone)]
pub struct PointBuffer {
    schema: AttributeSchema,
    positions: Vec<[f64; 3]>,
    colors: Option<Vec<[u8; 4]>>,
    intensities: Option<Vec<u16>>,
    classifications: Option<Vec<u8>>,
    normals: Option<Vec<u16>>,
}

impl PointBuffer {
    pub fn new(schema: AttributeSchema) -> Self {
        let colors = schema.has_color().then(Vec::new);
        let intensities = schema.contains(PointAttribute::Intensity).then(Vec::new);
        let classifications = schema
            .contains(PointAttribute::Classification)
            .then(Vec::new);
        let normals = schema.contains(PointAttribute::NormalOct16).then(Vec::new);
        Self {
            schema,
            positions: Vec::new(),
            colors,
            intensities,
            classifications,
            normals,
        }
    }

    pub fn with_capacity(schema: AttributeSchema, capacity: usize) -> Self {
        let mut buffer = Self::new(schema);
        buffer.reserve(capacity);
        buffer
    }

    pub fn reserve(&mut self, additional: usize) {
        self.positions.reserve(additional);
        if let Some(colors) = &mut self.colors {
            colors.reserve(additional);
        }
        if let Some(intensities) = &mut self.intensities {
            intensities.reserve(additional);
        }
        if let Some(classifications) = &mut self.classifications {
            classifications.reserve(additional);
        }
        if let Some(normals) = &mut self.normals {
            normals.reserve(additional);
        }
    }

    pub fn schema(&self) -> &AttributeSchema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn push(&mut self, point: Point) {
        self.positions.push(point.position);
        if let Some(colors) = &mut self.colors {
            colors.push(point.color);
        }
        if let Some(intensities) = &mut self.intensities {
            intensities.push(point.intensity);
        }
        if let Some(classifications) = &mut self.classifications {
            classifications.push(point.classification);
        }
        if let Some(normals) = &mut self.normals {
            normals.push(point.normal);
        }
    }

    pub fn point(&self, index: usize) -> Point {
        Point {
            position: self.positions[index],
            color: self
                .colors
                .as_ref()
                .map_or([0, 0, 0, 255], |c| c[index]),
            intensity: self.intensities.as_ref().map_or(0, |i| i[index]),
            classification: self.classifications.as_ref().map_or(0, |c| c[index]),
            normal: self.normals.as_ref().map_or(0, |n| n[index]),
        }
    }

    pub fn position(&self, index: usize) -> [f64; 3] {
        self.positions[index]
    }

    pub fn positions(&self) -> &[[f64; 3]] {
        &self.positions
    }

    pub fn positions_mut(&mut self) -> &mut [[f64; 3]] {
        &mut self.positions
    }

    pub fn colors(&self) -> Option<&[[u8; 4]]> {
        self.colors.as_deref()
    }

    pub fn colors_mut(&mut self) -> Option<&mut [[u8; 4]]> {
        self.colors.as_deref_mut()
    }

    pub fn intensities(&self) -> Option<&[u16]> {
        self.intensities.as_deref()
    }

    pub fn classifications(&self) -> Option<&[u8]> {
        self.classifications.as_deref()
    }

    pub fn normals(&self) -> Option<&[u16]> {
        self.normals.as_deref()
    }

    /// Appends another batch of the same schema, consuming it.
    pub fn append(&mut self, mut other: PointBuffer) {
        assert_eq!(
            self.schema, other.schema,
            "all buffers in a run share one schema"
        );
        self.positions.append(&mut other.positions);
        if let (Some(dst), Some(src)) = (&mut self.colors, &mut other.colors) {
            dst.append(src);
        }
        if let (Some(dst), Some(src)) = (&mut self.intensities, &mut other.intensities) {
            dst.append(src);
        }
        if let (Some(dst), Some(src)) = (&mut self.classifications, &mut other.classifications) {
            dst.append(src);
        }
        if let (Some(dst), Some(src)) = (&mut self.normals, &mut other.normals) {
            dst.append(src);
        }
    }

    /// New buffer holding the points at the given indices, in index order.
    pub fn gather(&self, indices: &[usize]) -> PointBuffer {
        let mut out = PointBuffer::with_capacity(self.schema.clone(), indices.len());
        for &index in indices {
            out.positions.push(self.positions[index]);
        }
        if let (Some(dst), Some(src)) = (&mut out.colors, &self.colors) {
            dst.extend(indices.iter().map(|&i| src[i]));
        }
        if let (Some(dst), Some(src)) = (&mut out.intensities, &self.intensities) {
            dst.extend(indices.iter().map(|&i| src[i]));
        }
        if let (Some(dst), Some(src)) = (&mut out.classifications, &self.classifications) {
            dst.extend(indices.iter().map(|&i| src[i]));
        }
        if let (Some(dst), Some(src)) = (&mut out.normals, &self.normals) {
            dst.extend(indices.iter().map(|&i| src[i]));
        }
        out
    }

    /// Splits off the first `count` points, keeping the remainder.
    pub fn take_prefix(&mut self, count: usize) -> PointBuffer {
        let count = count.min(self.len());
        let mut prefix = PointBuffer::with_capacity(self.schema.clone(), count);
        prefix.positions = self.positions.drain(..count).collect();
        if let (Some(dst), Some(src)) = (&mut prefix.colors, &mut self.colors) {
            *dst = src.drain(..count).collect();
        }
        if let (Some(dst), Some(src)) = (&mut prefix.intensities, &mut self.intensities) {
            *dst = src.drain(..count).collect();
        }
        if let (Some(dst), Some(src)) = (&mut prefix.classifications, &mut self.classifications) {
            *dst = src.drain(..count).collect();
        }
        if let (Some(dst), Some(src)) = (&mut prefix.normals, &mut self.normals) {
            *dst = src.drain(..count).collect();
        }
        prefix
    }

    /// Estimated resident bytes, used for the memory bound.
    pub fn memory_usage(&self) -> usize {
        let mut per_point = std::mem::size_of::<[f64; 3]>();
        if self.colors.is_some() {
            per_point += 4;
        }
        if self.intensities.is_some() {
            per_point += 2;
        }
        if self.classifications.is_some() {
            per_point += 1;
        }
        if self.normals.is_some() {
            per_point += 2;
        }
        std::mem::size_of::<Self>() + self.len() * per_point
    }

    pub fn iter_points(&self) -> impl Iterator<Item = Point> + '_ {
        (0..self.len()).map(move |index| self.point(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_schema() -> AttributeSchema {
        AttributeSchema::new(&[PointAttribute::ColorPacked, PointAttribute::Intensity])
    }

    fn sample_buffer(count: usize) -> PointBuffer {
        let mut buffer = PointBuffer::new(test_schema());
        for i in 0..count {
            buffer.push(Point {
                position: [i as f64, 0.0, 0.0],
                color: [i as u8, 0, 0, 255],
                intensity: i as u16,
                ..Point::default()
            });
        }
        buffer
    }

    #[test]
    fn columns_track_schema() {
        let buffer = sample_buffer(3);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.colors().unwrap().len(), 3);
        assert_eq!(buffer.intensities().unwrap().len(), 3);
        assert!(buffer.classifications().is_none());
    }

    #[test]
    fn append_moves_points_over() {
        let mut a = sample_buffer(2);
        let b = sample_buffer(3);
        a.append(b);
        assert_eq!(a.len(), 5);
        assert_eq!(a.position(2), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn gather_keeps_columns_aligned() {
        let buffer = sample_buffer(5);
        let picked = buffer.gather(&[4, 1]);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked.position(0), [4.0, 0.0, 0.0]);
        assert_eq!(picked.intensities().unwrap(), &[4, 1]);
        assert_eq!(picked.colors().unwrap()[1], [1, 0, 0, 255]);
    }

    #[test]
    fn take_prefix_splits_in_order() {
        let mut buffer = sample_buffer(4);
        let prefix = buffer.take_prefix(3);
        assert_eq!(prefix.len(), 3);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.position(0), [3.0, 0.0, 0.0]);
        assert_eq!(prefix.intensities().unwrap(), &[0, 1, 2]);
    }
}
