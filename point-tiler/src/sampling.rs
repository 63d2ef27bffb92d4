//! Node-local density reduction.
//!
//! A sampler decides which of a node's candidate points become that
//! node's LOD representatives; the rest descend to children. Samplers
//! keep per-node state across processing rounds so points arriving in a
//! later batch still respect the representatives picked in earlier ones.

use crate::config::SamplingStrategy;
use point_data::aabb::Aabb;
use point_data::PointBuffer;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

/// Indices of one sampling decision, both halves in input order.
#[derive(Debug, Default)]
pub struct SampleOutcome {
    pub accepted: Vec<usize>,
    pub rejected: Vec<usize>,
}

/// Per-node sampler. Closed sum type: the strategy set is fixed and the
/// tiler dispatches without indirection.
pub enum NodeSampler {
    Grid(GridSampler),
    Random(RandomSampler),
}

impl NodeSampler {
    /// Builds the sampler for one node. `spacing` is the minimum point
    /// separation at this node's depth (`root_spacing / 2^depth`).
    pub fn for_node(
        strategy: SamplingStrategy,
        bounds: &Aabb,
        spacing: f64,
        node_path: &str,
    ) -> Self {
        match strategy {
            SamplingStrategy::Grid { grid_size } => {
                NodeSampler::Grid(GridSampler::new(bounds, spacing, grid_size))
            }
            SamplingStrategy::Random { max_points } => {
                NodeSampler::Random(RandomSampler::new(max_points, node_path))
            }
        }
    }

    pub fn sample(&mut self, points: &PointBuffer) -> SampleOutcome {
        match self {
            NodeSampler::Grid(sampler) => sampler.sample(points),
            NodeSampler::Random(sampler) => sampler.sample(points),
        }
    }
}

/// Occupancy-grid sampling: the node's cubic bounds are cut into an
/// `S×S×S` grid and each occupied cell keeps the point closest to the
/// cell center (lowest input index on ties). A winning candidate is still
/// rejected when an already-accepted point in the surrounding 3×3×3 cells
/// lies closer than the spacing in the maximum norm; cells never undercut
/// the spacing, so that neighbourhood is the only place a violation can
/// hide.
pub struct GridSampler {
    bounds: Aabb,
    spacing: f64,
    grid_size: u64,
    cell_extent: f64,
    /// Accepted representative position per occupied cell.
    cells: HashMap<u64, [f64; 3]>,
}

impl GridSampler {
    fn new(bounds: &Aabb, spacing: f64, default_grid_size: u32) -> Self {
        let edge = bounds.extent()[0];
        let fitting = if spacing > 0.0 {
            (edge / spacing).floor() as u64
        } else {
            u64::from(default_grid_size)
        };
        let grid_size = fitting.clamp(1, u64::from(default_grid_size.max(1)));
        Self {
            bounds: *bounds,
            spacing,
            grid_size,
            cell_extent: edge / grid_size as f64,
            cells: HashMap::new(),
        }
    }

    pub fn grid_size(&self) -> u64 {
        self.grid_size
    }

    fn cell_coords(&self, p: [f64; 3]) -> [u64; 3] {
        let mut coords = [0u64; 3];
        for axis in 0..3 {
            let relative = (p[axis] - self.bounds.min[axis]) / self.cell_extent;
            coords[axis] = (relative.floor().max(0.0) as u64).min(self.grid_size - 1);
        }
        coords
    }

    fn cell_id(&self, coords: [u64; 3]) -> u64 {
        (coords[2] * self.grid_size + coords[1]) * self.grid_size + coords[0]
    }

    fn cell_center(&self, coords: [u64; 3]) -> [f64; 3] {
        [
            self.bounds.min[0] + (coords[0] as f64 + 0.5) * self.cell_extent,
            self.bounds.min[1] + (coords[1] as f64 + 0.5) * self.cell_extent,
            self.bounds.min[2] + (coords[2] as f64 + 0.5) * self.cell_extent,
        ]
    }

    fn violates_spacing(&self, coords: [u64; 3], p: [f64; 3]) -> bool {
        for dz in -1i64..=1 {
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let neighbor = [
                        coords[0] as i64 + dx,
                        coords[1] as i64 + dy,
                        coords[2] as i64 + dz,
                    ];
                    if neighbor
                        .iter()
                        .any(|&c| c < 0 || c >= self.grid_size as i64)
                    {
                        continue;
                    }
                    let id = self.cell_id([
                        neighbor[0] as u64,
                        neighbor[1] as u64,
                        neighbor[2] as u64,
                    ]);
                    if let Some(taken) = self.cells.get(&id) {
                        let dist = (0..3)
                            .map(|axis| (taken[axis] - p[axis]).abs())
                            .fold(0.0f64, f64::max);
                        if dist < self.spacing {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    fn sample(&mut self, points: &PointBuffer) -> SampleOutcome {
        // Best candidate per free cell: strictly-closer comparison keeps
        // the lowest input index on equidistant candidates.
        let mut candidates: HashMap<u64, (usize, f64)> = HashMap::new();
        let mut coords_by_point = Vec::with_capacity(points.len());
        for (index, &p) in points.positions().iter().enumerate() {
            let coords = self.cell_coords(p);
            coords_by_point.push(coords);
            let id = self.cell_id(coords);
            if self.cells.contains_key(&id) {
                continue;
            }
            let center = self.cell_center(coords);
            let dist2 = (0..3)
                .map(|axis| {
                    let d = p[axis] - center[axis];
                    d * d
                })
                .sum::<f64>();
            match candidates.get(&id) {
                Some(&(_, best)) if best <= dist2 => {}
                _ => {
                    candidates.insert(id, (index, dist2));
                }
            }
        }

        // Accept in cell-id order so concurrent-round output is a pure
        // function of the input sequence.
        let mut cell_order: Vec<u64> = candidates.keys().copied().collect();
        cell_order.sort_unstable();

        let mut accepted_flags = vec![false; points.len()];
        let mut accepted = Vec::with_capacity(cell_order.len());
        for id in cell_order {
            let (index, _) = candidates[&id];
            let coords = coords_by_point[index];
            let p = points.position(index);
            if self.violates_spacing(coords, p) {
                continue;
            }
            self.cells.insert(id, p);
            accepted_flags[index] = true;
            accepted.push(index);
        }
        accepted.sort_unstable();

        let rejected = (0..points.len())
            .filter(|&index| !accepted_flags[index])
            .collect();
        SampleOutcome { accepted, rejected }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    hash
}

/// Uniform random subset up to a per-node cap, seeded from the node path
/// so repeated runs pick the same representatives.
pub struct RandomSampler {
    rng: StdRng,
    cap: usize,
    accepted_total: usize,
}

impl RandomSampler {
    fn new(cap: usize, node_path: &str) -> Self {
        Self {
            rng: StdRng::seed_from_u64(fnv1a(node_path.as_bytes())),
            cap,
            accepted_total: 0,
        }
    }

    fn sample(&mut self, points: &PointBuffer) -> SampleOutcome {
        let count = points.len();
        let room = self.cap.saturating_sub(self.accepted_total);
        if room == 0 {
            return SampleOutcome {
                accepted: Vec::new(),
                rejected: (0..count).collect(),
            };
        }
        if count <= room {
            self.accepted_total += count;
            return SampleOutcome {
                accepted: (0..count).collect(),
                rejected: Vec::new(),
            };
        }

        let mut accepted: Vec<usize> =
            rand::seq::index::sample(&mut self.rng, count, room).into_vec();
        accepted.sort_unstable();
        self.accepted_total += accepted.len();

        let mut accepted_flags = vec![false; count];
        for &index in &accepted {
            accepted_flags[index] = true;
        }
        let rejected = (0..count).filter(|&i| !accepted_flags[i]).collect();
        SampleOutcome { accepted, rejected }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use point_data::attributes::AttributeSchema;
    use point_data::buffer::Point;

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

    fn unit_bounds() -> Aabb {
        Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0])
    }

    #[test]
    fn grid_keeps_one_point_per_cell() {
        let bounds = unit_bounds();
        let mut sampler = NodeSampler::for_node(
            SamplingStrategy::Grid { grid_size: 2 },
            &bounds,
            0.5,
            "",
        );
        // Two points in the same cell, one in another.
        let points = buffer_of(&[[0.1, 0.1, 0.1], [0.2, 0.2, 0.2], [0.9, 0.9, 0.9]]);
        let outcome = sampler.sample(&points);
        // (0.2)³ is closer to the (0.25)³ cell center than (0.1)³.
        assert_eq!(outcome.accepted, vec![1, 2]);
        assert_eq!(outcome.rejected, vec![0]);
    }

    #[test]
    fn grid_equidistant_tie_keeps_lowest_index() {
        let bounds = unit_bounds();
        let mut sampler = NodeSampler::for_node(
            SamplingStrategy::Grid { grid_size: 1 },
            &bounds,
            1.0,
            "",
        );
        // Mirrored around the cell center: identical distance.
        let points = buffer_of(&[[0.4, 0.5, 0.5], [0.6, 0.5, 0.5]]);
        let outcome = sampler.sample(&points);
        assert_eq!(outcome.accepted, vec![0]);
        assert_eq!(outcome.rejected, vec![1]);
    }

    #[test]
    fn grid_occupancy_persists_across_rounds() {
        let bounds = unit_bounds();
        let mut sampler = NodeSampler::for_node(
            SamplingStrategy::Grid { grid_size: 2 },
            &bounds,
            0.5,
            "",
        );
        let first = sampler.sample(&buffer_of(&[[0.1, 0.1, 0.1]]));
        assert_eq!(first.accepted, vec![0]);
        // Same cell next round: must descend even though the cell map was
        // empty when the sampler was created.
        let second = sampler.sample(&buffer_of(&[[0.2, 0.2, 0.2]]));
        assert!(second.accepted.is_empty());
        assert_eq!(second.rejected, vec![0]);
    }

    #[test]
    fn grid_accepted_points_respect_spacing() {
        let bounds = unit_bounds();
        let spacing = 0.25;
        let mut sampler = NodeSampler::for_node(
            SamplingStrategy::Grid { grid_size: 4 },
            &bounds,
            spacing,
            "",
        );
        // A diagonal cloud dense enough that neighbouring cells collide.
        let positions: Vec<[f64; 3]> = (0..50)
            .map(|i| {
                let t = i as f64 / 50.0;
                [t, t, t]
            })
            .collect();
        let points = buffer_of(&positions);
        let outcome = sampler.sample(&points);
        for (a_pos, &a) in outcome.accepted.iter().enumerate() {
            for &b in outcome.accepted.iter().skip(a_pos + 1) {
                let pa = points.position(a);
                let pb = points.position(b);
                let dist = (0..3)
                    .map(|axis| (pa[axis] - pb[axis]).abs())
                    .fold(0.0f64, f64::max);
                assert!(
                    dist >= spacing,
                    "accepted points {:?} and {:?} closer than spacing",
                    pa,
                    pb
                );
            }
        }
    }

    #[test]
    fn grid_size_shrinks_with_spacing() {
        let bounds = unit_bounds();
        // Spacing of 0.5 fits only two cells per axis even though the
        // default grid is far larger.
        match NodeSampler::for_node(
            SamplingStrategy::Grid { grid_size: 128 },
            &bounds,
            0.5,
            "",
        ) {
            NodeSampler::Grid(sampler) => assert_eq!(sampler.grid_size(), 2),
            _ => unreachable!(),
        }
    }

    #[test]
    fn random_caps_and_reproduces() {
        let positions: Vec<[f64; 3]> = (0..100).map(|i| [i as f64, 0.0, 0.0]).collect();
        let points = buffer_of(&positions);

        let sample = |path: &str| {
            let mut sampler = NodeSampler::for_node(
                SamplingStrategy::Random { max_points: 10 },
                &unit_bounds(),
                0.1,
                path,
            );
            sampler.sample(&points)
        };

        let first = sample("37");
        let again = sample("37");
        assert_eq!(first.accepted.len(), 10);
        assert_eq!(first.rejected.len(), 90);
        assert_eq!(first.accepted, again.accepted);

        let other_node = sample("40");
        assert_ne!(first.accepted, other_node.accepted);
    }

    #[test]
    fn random_cap_spans_rounds() {
        let mut sampler = NodeSampler::for_node(
            SamplingStrategy::Random { max_points: 5 },
            &unit_bounds(),
            0.1,
            "2",
        );
        let first = sampler.sample(&buffer_of(&[[0.0; 3]; 4]));
        assert_eq!(first.accepted.len(), 4);
        let second = sampler.sample(&buffer_of(&[[0.0; 3]; 4]));
        assert_eq!(second.accepted.len(), 1);
        assert_eq!(second.rejected.len(), 3);
        let third = sampler.sample(&buffer_of(&[[0.0; 3]; 4]));
        assert!(third.accepted.is_empty());
    }
}
