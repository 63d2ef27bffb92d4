use point_data::aabb::Aabb;

const WGS84: &str = "+proj=longlat +datum=WGS84 +no_defs";

/// Coordinate transform applied to positions only at persistence. The
/// octree is always partitioned in native coordinates; transforming
/// earlier would let a nonlinear reprojection break octant containment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Identity,
}

impl Transform {
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        match self {
            Transform::Identity => p,
        }
    }

    /// Inverse mapping, used when a flushed node payload is read back for
    /// re-tiling in native coordinates.
    pub fn apply_inverse(&self, p: [f64; 3]) -> [f64; 3] {
        match self {
            Transform::Identity => p,
        }
    }

    pub fn apply_to_bounds(&self, bounds: &Aabb) -> Aabb {
        match self {
            Transform::Identity => *bounds,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Transform::Identity)
    }
}

/// Picks the transform for a source projection description. Absent or
/// WGS84 projections need no transformation; anything else cannot be set
/// up here, which by policy downgrades to the identity with a warning so
/// the run continues.
pub fn transform_for_projection(projection: Option<&str>) -> (Transform, Option<String>) {
    match projection {
        None => (Transform::Identity, None),
        Some(text) if text.trim().is_empty() || text == WGS84 => (Transform::Identity, None),
        Some(text) => (
            Transform::Identity,
            Some(format!(
                "could not set up coordinate transformation for \"{}\", continuing without point transformation",
                text
            )),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wgs84_is_identity_without_warning() {
        let (transform, warning) = transform_for_projection(Some(WGS84));
        assert!(transform.is_identity());
        assert!(warning.is_none());
    }

    #[test]
    fn unknown_projection_warns_and_falls_back() {
        let (transform, warning) = transform_for_projection(Some("+proj=utm +zone=32"));
        assert!(transform.is_identity());
        assert!(warning.unwrap().contains("+proj=utm"));
    }

    #[test]
    fn identity_round_trips() {
        let transform = Transform::Identity;
        let p = [1.0, -2.0, 3.5];
        assert_eq!(transform.apply_inverse(transform.apply(p)), p);
    }
}
