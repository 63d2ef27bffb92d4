use crate::aabb::Aabb;

/// Number of octree levels encoded in a Morton index. 21 levels of three
/// bits each fit a u64 with the top bit to spare.
pub const MORTON_LEVELS: u32 = 21;

/// Morton-style index of a point relative to a root box: the octant path
/// of the point down to `MORTON_LEVELS`, most significant digit first.
/// Sorting by the raw value therefore groups points by subtree at every
/// depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MortonIndex(pub u64);

impl MortonIndex {
    /// Indexes a point by iterative midpoint subdivision. The subdivision
    /// reuses `Aabb::octant_of` at every level so Morton digits and octant
    /// assignment can never disagree, midplane tie-breaks included.
    pub fn from_point(root: &Aabb, p: [f64; 3]) -> Self {
        let mut bounds = *root;
        let mut index = 0u64;
        for _ in 0..MORTON_LEVELS {
            let octant = bounds.octant_of(p);
            index = (index << 3) | u64::from(octant);
            bounds = bounds.child(octant);
        }
        Self(index)
    }

    /// Octant digit at the given depth (0 = child of the root).
    pub fn octant_at(self, depth: u32) -> u8 {
        debug_assert!(depth < MORTON_LEVELS);
        ((self.0 >> (3 * (MORTON_LEVELS - 1 - depth))) & 7) as u8
    }

    /// Leading `depth` digits as a bucket id in `0..8^depth`.
    pub fn prefix(self, depth: u32) -> u64 {
        debug_assert!(depth <= MORTON_LEVELS);
        self.0 >> (3 * (MORTON_LEVELS - depth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_root() -> Aabb {
        Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0])
    }

    #[test]
    fn digits_agree_with_octant_assignment() {
        let root = unit_root();
        let points = [
            [0.1, 0.2, 0.3],
            [0.5, 0.5, 0.5],
            [0.9999, 0.0001, 0.75],
            [1.0, 1.0, 1.0],
        ];
        for p in points {
            let index = MortonIndex::from_point(&root, p);
            let mut bounds = root;
            for depth in 0..MORTON_LEVELS {
                let octant = bounds.octant_of(p);
                assert_eq!(index.octant_at(depth), octant, "depth {} of {:?}", depth, p);
                bounds = bounds.child(octant);
            }
        }
    }

    #[test]
    fn sorting_groups_by_first_octant() {
        let root = unit_root();
        let low = MortonIndex::from_point(&root, [0.1, 0.1, 0.1]);
        let high = MortonIndex::from_point(&root, [0.9, 0.9, 0.9]);
        assert!(low < high);
        assert_eq!(low.octant_at(0), 0);
        assert_eq!(high.octant_at(0), 7);
    }

    #[test]
    fn prefix_extracts_leading_digits() {
        let root = unit_root();
        let index = MortonIndex::from_point(&root, [0.9, 0.9, 0.9]);
        assert_eq!(index.prefix(1), 7);
        assert_eq!(index.prefix(2), 7 * 8 + index.octant_at(1) as u64);
    }
}
