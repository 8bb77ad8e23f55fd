use std::collections::HashMap;

use crate::types::{NodeId, Point3};

/// A buffered hash grid over placed node positions.
///
/// Points enter in two stages:
///
/// - [`SpatialIndex::insert`] appends to a pending buffer and marks the index
///   dirty.
/// - [`SpatialIndex::rebuild`] incorporates the buffer into the grid.
///
/// Queries only see incorporated points. Callers decide the rebuild cadence,
/// which bounds how stale collision answers can be.
#[derive(Debug)]
pub struct SpatialIndex {
    /// Edge length of a grid cell.
    cell: f64,
    /// Incorporated points, in insertion order.
    points: Vec<(NodeId, Point3)>,
    /// Inserted but not yet incorporated points.
    pending: Vec<(NodeId, Point3)>,
    /// Cell key -> indices into `points`.
    cells: HashMap<[i64; 3], Vec<usize>>,
    rebuilds: usize,
}

impl SpatialIndex {
    /// Creates an empty index with the given cell size.
    ///
    /// ### Parameters
    /// - `cell` - Grid cell edge length; a value near the typical query
    ///   radius keeps queries cheap. Non-positive values are replaced by `1.0`.
    pub fn new(cell: f64) -> Self {
        Self {
            cell: if cell.is_finite() && cell > 0.0 { cell } else { 1.0 },
            points: Vec::new(),
            pending: Vec::new(),
            cells: HashMap::new(),
            rebuilds: 0,
        }
    }

    #[inline]
    fn key(&self, p: Point3) -> [i64; 3] {
        let k = (p / self.cell).floor();
        [k.x as i64, k.y as i64, k.z as i64]
    }

    /// Buffers a point. It becomes visible after the next [`Self::rebuild`].
    pub fn insert(&mut self, id: NodeId, p: Point3) {
        self.pending.push((id, p));
    }

    /// Incorporates every buffered insertion into the grid.
    pub fn rebuild(&mut self) {
        for (id, p) in std::mem::take(&mut self.pending) {
            let slot = self.points.len();
            self.points.push((id, p));
            let key = self.key(p);
            self.cells.entry(key).or_default().push(slot);
        }
        self.rebuilds += 1;
    }

    /// Returns `true` if insertions are waiting for a rebuild.
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of incorporated points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of [`Self::rebuild`] calls so far.
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds
    }

    /// Visits incorporated points whose cell lies within `radius` of `p`
    /// (per axis). Stops early when `visit` returns `false`.
    fn visit_near(&self, p: Point3, radius: f64, mut visit: impl FnMut(NodeId, Point3) -> bool) {
        if self.points.is_empty() {
            return;
        }
        let lo = self.key(p - radius);
        let hi = self.key(p + radius);
        let span = (0..3)
            .map(|a| (hi[a] as i128 - lo[a] as i128 + 1) as u128)
            .fold(1u128, |acc, n| acc.saturating_mul(n));

        // Scanning the arena is cheaper than visiting mostly-empty cells.
        if span > self.points.len() as u128 {
            for &(id, q) in &self.points {
                if !visit(id, q) {
                    return;
                }
            }
            return;
        }

        for z in lo[2]..=hi[2] {
            for y in lo[1]..=hi[1] {
                for x in lo[0]..=hi[0] {
                    let Some(slots) = self.cells.get(&[x, y, z]) else {
                        continue;
                    };
                    for &slot in slots {
                        let (id, q) = self.points[slot];
                        if !visit(id, q) {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Returns `true` if an incorporated point lies within `radius` of `p`.
    ///
    /// Always `false` for an empty index.
    pub fn query(&self, p: Point3, radius: f64) -> bool {
        self.query_excluding(p, radius, &[])
    }

    /// Like [`Self::query`], ignoring the points whose ids are in `excluded`.
    pub fn query_excluding(&self, p: Point3, radius: f64, excluded: &[NodeId]) -> bool {
        let r2 = radius * radius;
        let mut hit = false;
        self.visit_near(p, radius, |id, q| {
            if q.distance_squared(p) < r2 && !excluded.contains(&id) {
                hit = true;
            }
            !hit
        });
        hit
    }

    /// Distance from `p` to the nearest incorporated point not in `excluded`,
    /// capped at `cutoff`.
    pub fn nearest_distance(&self, p: Point3, cutoff: f64, excluded: &[NodeId]) -> f64 {
        let mut best2 = cutoff * cutoff;
        self.visit_near(p, cutoff, |id, q| {
            let d2 = q.distance_squared(p);
            if d2 < best2 && !excluded.contains(&id) {
                best2 = d2;
            }
            true
        });
        best2.sqrt()
    }

    /// Nearest incorporated point to `p` within `cutoff`, with its distance.
    pub fn nearest(&self, p: Point3, cutoff: f64) -> Option<(NodeId, f64)> {
        let mut best: Option<(NodeId, f64)> = None;
        self.visit_near(p, cutoff, |id, q| {
            let d2 = q.distance_squared(p);
            if d2 <= cutoff * cutoff && best.is_none_or(|(_, b)| d2 < b) {
                best = Some((id, d2));
            }
            true
        });
        best.map(|(id, d2)| (id, d2.sqrt()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::DVec3;

    #[test]
    fn empty_index_never_collides() {
        let index = SpatialIndex::new(0.1);
        assert!(index.is_empty());
        assert!(!index.query(DVec3::ZERO, 10.0));
        assert_eq!(index.nearest(DVec3::ZERO, 1.0), None);
        assert_relative_eq!(index.nearest_distance(DVec3::ZERO, 0.5, &[]), 0.5);
    }

    #[test]
    fn insertions_are_invisible_until_rebuild() {
        let mut index = SpatialIndex::new(0.1);
        index.insert(0, DVec3::new(0.5, 0.5, 0.0));

        assert!(index.is_dirty());
        assert_eq!(index.pending_len(), 1);
        assert!(!index.query(DVec3::new(0.5, 0.5, 0.0), 0.01));

        index.rebuild();

        assert!(!index.is_dirty());
        assert_eq!(index.len(), 1);
        assert_eq!(index.rebuild_count(), 1);
        assert!(index.query(DVec3::new(0.505, 0.5, 0.0), 0.01));
        assert!(!index.query(DVec3::new(0.52, 0.5, 0.0), 0.01));
    }

    #[test]
    fn query_crosses_cell_borders() {
        let mut index = SpatialIndex::new(0.1);
        index.insert(0, DVec3::new(0.099, 0.0, 0.0));
        index.rebuild();
        assert!(index.query(DVec3::new(0.101, 0.0, 0.0), 0.005));
        assert!(index.query(DVec3::new(0.101, 0.0001, -0.0001), 0.005));
    }

    #[test]
    fn excluded_ids_are_ignored() {
        let mut index = SpatialIndex::new(0.05);
        index.insert(3, DVec3::ZERO);
        index.insert(4, DVec3::new(0.2, 0.0, 0.0));
        index.rebuild();

        assert!(index.query(DVec3::new(0.001, 0.0, 0.0), 0.01));
        assert!(!index.query_excluding(DVec3::new(0.001, 0.0, 0.0), 0.01, &[3]));

        let d = index.nearest_distance(DVec3::new(0.05, 0.0, 0.0), 1.0, &[3]);
        assert_relative_eq!(d, 0.15, epsilon = 1e-12);
        let d = index.nearest_distance(DVec3::new(0.05, 0.0, 0.0), 0.1, &[3]);
        assert_relative_eq!(d, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn nearest_matches_brute_force() {
        let mut index = SpatialIndex::new(0.03);
        let pts: Vec<DVec3> = (0..50)
            .map(|i| {
                let t = i as f64 * 0.37;
                DVec3::new(t.sin() * 0.5, (t * 1.3).cos() * 0.5, 0.0)
            })
            .collect();
        for (i, p) in pts.iter().enumerate() {
            index.insert(i, *p);
        }
        index.rebuild();

        let q = DVec3::new(0.1, -0.2, 0.0);
        let (best, d2) = pts
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.distance_squared(q)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap();

        let (id, d) = index.nearest(q, 2.0).unwrap();
        assert_eq!(id, best);
        assert_relative_eq!(d, d2.sqrt(), epsilon = 1e-12);
    }
}
