//! Surface capability used by the growth engine, and a triangle-mesh
//! implementation.
//!
//! The engine only talks to the [`Surface`] trait. [`TriangleMesh`] answers
//! the queries with a uniform-grid triangle locator built once at
//! construction.

use std::collections::{BTreeMap, BTreeSet};

use glam::{DVec2, DVec3};

use crate::error::{GrowthError, Result};
use crate::types::{Point2, Point3, TriangleId};

/// Result of snapping a point onto the surface.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projection {
    /// Closest point on the surface.
    pub point: Point3,
    /// Unit surface normal at `point`.
    pub normal: DVec3,
    pub triangle: TriangleId,
    /// Barycentric weights of `point` in `triangle`.
    pub barycentric: DVec3,
    /// Distance between the query and `point`.
    pub distance: f64,
}

/// An undirected mesh edge, stored with the smaller vertex id first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeRef(pub usize, pub usize);

impl EdgeRef {
    pub fn new(a: usize, b: usize) -> Self {
        if a <= b { Self(a, b) } else { Self(b, a) }
    }
}

/// Queries the growth engine needs from the manifold it grows on.
pub trait Surface {
    /// Number of seedable vertices.
    fn vertex_count(&self) -> usize;

    /// Position of vertex `id`, if it exists.
    fn vertex(&self, id: usize) -> Option<Point3>;

    /// Snaps `p` onto the closest point of the surface.
    ///
    /// ### Errors
    /// [`GrowthError::OffManifold`] if no part of the surface lies within
    /// the search radius of `p`.
    fn project(&self, p: Point3) -> Result<Projection>;

    /// Tangential gradient of `field` at the on-surface point `p`.
    fn gradient(&self, p: Point3, field: &dyn Fn(Point3) -> f64) -> DVec3;

    /// Open boundary edges of the surface.
    fn detect_boundary(&self) -> BTreeSet<EdgeRef>;

    /// Chart coordinates of `p`, if the surface carries a chart.
    fn to_parameter_space(&self, _p: Point3) -> Option<Point2> {
        None
    }

    /// Surface point of chart coordinates `uv`, if the surface carries a chart
    /// and `uv` lies inside it.
    fn from_parameter_space(&self, _uv: Point2) -> Option<Point3> {
        None
    }
}

/// Central-difference gradient of `field` in the plane orthogonal to `normal`.
pub fn tangent_gradient(
    p: Point3,
    normal: DVec3,
    step: f64,
    field: &dyn Fn(Point3) -> f64,
) -> DVec3 {
    let (t1, t2) = normal.any_orthonormal_pair();
    let mut g = DVec3::ZERO;
    for t in [t1, t2] {
        let df = field(p + t * step) - field(p - t * step);
        g += t * (df / (2.0 * step));
    }
    g
}

/// Closest point on triangle `abc` to `p`, as barycentric weights.
///
/// The weights are clamped to the triangle, so the point never lies outside
/// it.
fn closest_barycentric(p: DVec3, a: DVec3, b: DVec3, c: DVec3) -> DVec3 {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;
    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return DVec3::new(1.0, 0.0, 0.0);
    }

    let bp = p - b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return DVec3::new(0.0, 1.0, 0.0);
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return DVec3::new(1.0 - v, v, 0.0);
    }

    let cp = p - c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return DVec3::new(0.0, 0.0, 1.0);
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return DVec3::new(1.0 - w, 0.0, w);
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return DVec3::new(0.0, 1.0 - w, w);
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    DVec3::new(1.0 - v - w, v, w)
}

/// Uniform grid of triangle bounding boxes.
#[derive(Clone, Debug)]
struct TriangleGrid {
    min: DVec3,
    cell: f64,
    dims: [usize; 3],
    cells: Vec<Vec<TriangleId>>,
}

impl TriangleGrid {
    const MAX_CELLS_PER_AXIS: usize = 128;

    fn build(vertices: &[DVec3], triangles: &[[usize; 3]], cell: f64) -> Self {
        let (min, max) = vertices.iter().fold(
            (DVec3::splat(f64::INFINITY), DVec3::splat(f64::NEG_INFINITY)),
            |(lo, hi), v| (lo.min(*v), hi.max(*v)),
        );
        let extent = max - min;
        let cell = cell.max(extent.max_element() / Self::MAX_CELLS_PER_AXIS as f64);
        let dims = [
            ((extent.x / cell).floor() as usize + 1),
            ((extent.y / cell).floor() as usize + 1),
            ((extent.z / cell).floor() as usize + 1),
        ];
        let mut grid = Self {
            min,
            cell,
            dims,
            cells: vec![Vec::new(); dims[0] * dims[1] * dims[2]],
        };

        for (t, tri) in triangles.iter().enumerate() {
            let (lo, hi) = tri.iter().fold(
                (DVec3::splat(f64::INFINITY), DVec3::splat(f64::NEG_INFINITY)),
                |(lo, hi), &i| (lo.min(vertices[i]), hi.max(vertices[i])),
            );
            if let Some((a, b)) = grid.cell_range(lo, hi) {
                for z in a[2]..=b[2] {
                    for y in a[1]..=b[1] {
                        for x in a[0]..=b[0] {
                            let idx = grid.index(x, y, z);
                            grid.cells[idx].push(t);
                        }
                    }
                }
            }
        }
        grid
    }

    #[inline]
    fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.dims[1] + y) * self.dims[0] + x
    }

    /// Inclusive cell range covering the box `[lo, hi]`, or `None` if the box
    /// misses the grid.
    fn cell_range(&self, lo: DVec3, hi: DVec3) -> Option<([usize; 3], [usize; 3])> {
        let mut a = [0usize; 3];
        let mut b = [0usize; 3];
        for axis in 0..3 {
            let l = ((lo[axis] - self.min[axis]) / self.cell).floor();
            let h = ((hi[axis] - self.min[axis]) / self.cell).floor();
            let top = (self.dims[axis] - 1) as f64;
            if h < 0.0 || l > top || !l.is_finite() || !h.is_finite() {
                return None;
            }
            a[axis] = l.max(0.0) as usize;
            b[axis] = h.min(top) as usize;
        }
        Some((a, b))
    }

    /// Triangles whose bounding boxes may lie within `radius` of `p`,
    /// ascending and without duplicates.
    fn candidates(&self, p: DVec3, radius: f64) -> Vec<TriangleId> {
        let r = DVec3::splat(radius);
        let Some((a, b)) = self.cell_range(p - r, p + r) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for z in a[2]..=b[2] {
            for y in a[1]..=b[1] {
                for x in a[0]..=b[0] {
                    out.extend_from_slice(&self.cells[self.index(x, y, z)]);
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// A triangulated surface with optional per-vertex normals and chart (UV)
/// coordinates.
#[derive(Clone, Debug)]
pub struct TriangleMesh {
    vertices: Vec<Point3>,
    triangles: Vec<[usize; 3]>,
    face_normals: Vec<DVec3>,
    normals: Option<Vec<DVec3>>,
    uvs: Option<Vec<Point2>>,
    uv_grid: Option<TriangleGrid>,
    grid: TriangleGrid,
    mean_edge: f64,
    search_radius: f64,
    gradient_step: f64,
}

impl TriangleMesh {
    /// Builds a mesh and its triangle locator.
    ///
    /// The search radius defaults to half the mean edge length.
    ///
    /// ### Errors
    /// [`GrowthError::InvalidMesh`] for empty input, non-finite coordinates,
    /// out-of-range indices or zero-area triangles.
    pub fn new(vertices: Vec<Point3>, triangles: Vec<[usize; 3]>) -> Result<Self> {
        if vertices.is_empty() || triangles.is_empty() {
            return Err(GrowthError::InvalidMesh("mesh has no triangles".into()));
        }
        if let Some(i) = vertices.iter().position(|v| !v.is_finite()) {
            return Err(GrowthError::InvalidMesh(format!("vertex {i} is not finite")));
        }

        let mut face_normals = Vec::with_capacity(triangles.len());
        let mut edge_sum = 0.0;
        for (t, tri) in triangles.iter().enumerate() {
            if tri.iter().any(|&i| i >= vertices.len()) {
                return Err(GrowthError::InvalidMesh(format!(
                    "triangle {t} references a vertex out of range"
                )));
            }
            let [a, b, c] = tri.map(|i| vertices[i]);
            let n = (b - a).cross(c - a);
            if n.length_squared() <= f64::EPSILON * f64::EPSILON {
                return Err(GrowthError::InvalidMesh(format!("triangle {t} has zero area")));
            }
            face_normals.push(n.normalize());
            edge_sum += (b - a).length() + (c - b).length() + (a - c).length();
        }
        let mean_edge = edge_sum / (3 * triangles.len()) as f64;
        let grid = TriangleGrid::build(&vertices, &triangles, 2.0 * mean_edge);

        Ok(Self {
            vertices,
            triangles,
            face_normals,
            normals: None,
            uvs: None,
            uv_grid: None,
            grid,
            mean_edge,
            search_radius: 0.5 * mean_edge,
            gradient_step: 1e-3 * mean_edge,
        })
    }

    /// Regular grid surface `z = height(x, y)` over `[0, size]^2` with
    /// `nx * ny` cells, smooth normals and UVs in `[0, 1]^2`.
    pub fn height_field(
        nx: usize,
        ny: usize,
        size: f64,
        height: impl Fn(f64, f64) -> f64,
    ) -> Result<Self> {
        if nx == 0 || ny == 0 || !(size.is_finite() && size > 0.0) {
            return Err(GrowthError::InvalidMesh(
                "height field needs at least one cell and a positive size".into(),
            ));
        }
        let mut vertices = Vec::with_capacity((nx + 1) * (ny + 1));
        let mut uvs = Vec::with_capacity((nx + 1) * (ny + 1));
        for j in 0..=ny {
            for i in 0..=nx {
                let u = i as f64 / nx as f64;
                let v = j as f64 / ny as f64;
                let (x, y) = (u * size, v * size);
                vertices.push(DVec3::new(x, y, height(x, y)));
                uvs.push(DVec2::new(u, v));
            }
        }

        let id = |i: usize, j: usize| j * (nx + 1) + i;
        let mut triangles = Vec::with_capacity(2 * nx * ny);
        for j in 0..ny {
            for i in 0..nx {
                let (a, b, c, d) = (id(i, j), id(i + 1, j), id(i + 1, j + 1), id(i, j + 1));
                triangles.push([a, b, c]);
                triangles.push([a, c, d]);
            }
        }

        Self::new(vertices, triangles)?
            .with_smooth_normals()
            .with_uvs(uvs)
    }

    /// Flat unit square in the `z = 0` plane, `n * n` cells.
    pub fn unit_square(n: usize) -> Result<Self> {
        Self::height_field(n, n, 1.0, |_, _| 0.0)
    }

    /// Uses the given per-vertex normals for projection.
    pub fn with_normals(mut self, normals: Vec<DVec3>) -> Result<Self> {
        if normals.len() != self.vertices.len() {
            return Err(GrowthError::InvalidMesh(format!(
                "expected {} normals, got {}",
                self.vertices.len(),
                normals.len()
            )));
        }
        if normals.iter().any(|n| !n.is_finite() || n.length_squared() == 0.0) {
            return Err(GrowthError::InvalidMesh("normals must be finite and non-zero".into()));
        }
        self.normals = Some(normals.into_iter().map(|n| n.normalize()).collect());
        Ok(self)
    }

    /// Derives per-vertex normals by area-weighted averaging of face normals.
    pub fn with_smooth_normals(mut self) -> Self {
        let mut acc = vec![DVec3::ZERO; self.vertices.len()];
        for tri in &self.triangles {
            let [a, b, c] = tri.map(|i| self.vertices[i]);
            let weighted = (b - a).cross(c - a);
            for &i in tri {
                acc[i] += weighted;
            }
        }
        self.normals = Some(acc.into_iter().map(|n| n.normalize_or_zero()).collect());
        self
    }

    /// Attaches a chart: one UV coordinate per vertex.
    pub fn with_uvs(mut self, uvs: Vec<Point2>) -> Result<Self> {
        if uvs.len() != self.vertices.len() {
            return Err(GrowthError::InvalidMesh(format!(
                "expected {} uvs, got {}",
                self.vertices.len(),
                uvs.len()
            )));
        }
        if uvs.iter().any(|uv| !uv.is_finite()) {
            return Err(GrowthError::InvalidMesh("uvs must be finite".into()));
        }
        let flat: Vec<DVec3> = uvs.iter().map(|uv| uv.extend(0.0)).collect();
        let uv_edge = self
            .triangles
            .iter()
            .map(|t| (uvs[t[1]] - uvs[t[0]]).length())
            .sum::<f64>()
            / self.triangles.len() as f64;
        let cell = 2.0 * uv_edge.max(f64::EPSILON);
        self.uv_grid = Some(TriangleGrid::build(&flat, &self.triangles, cell));
        self.uvs = Some(uvs);
        Ok(self)
    }

    /// Maximum distance between a query and the surface for
    /// [`Surface::project`] to succeed.
    pub fn with_search_radius(mut self, radius: f64) -> Self {
        self.search_radius = radius;
        self
    }

    /// Finite-difference step of [`Surface::gradient`].
    pub fn with_gradient_step(mut self, step: f64) -> Self {
        self.gradient_step = step;
        self
    }

    pub fn vertices(&self) -> &[Point3] {
        &self.vertices
    }

    pub fn triangles(&self) -> &[[usize; 3]] {
        &self.triangles
    }

    pub fn mean_edge_length(&self) -> f64 {
        self.mean_edge
    }

    pub fn search_radius(&self) -> f64 {
        self.search_radius
    }

    fn normal_at(&self, triangle: TriangleId, bary: DVec3) -> DVec3 {
        let face = self.face_normals[triangle];
        match &self.normals {
            Some(normals) => {
                let [a, b, c] = self.triangles[triangle];
                let n = normals[a] * bary.x + normals[b] * bary.y + normals[c] * bary.z;
                let n = n.normalize_or_zero();
                if n == DVec3::ZERO { face } else { n }
            }
            None => face,
        }
    }
}

impl Surface for TriangleMesh {
    fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    fn vertex(&self, id: usize) -> Option<Point3> {
        self.vertices.get(id).copied()
    }

    fn project(&self, p: Point3) -> Result<Projection> {
        if !p.is_finite() {
            return Err(GrowthError::off_manifold(p));
        }
        let r2 = self.search_radius * self.search_radius;
        let mut best: Option<(TriangleId, DVec3, DVec3, f64)> = None;

        for t in self.grid.candidates(p, self.search_radius) {
            let [a, b, c] = self.triangles[t].map(|i| self.vertices[i]);
            let bary = closest_barycentric(p, a, b, c);
            let q = a * bary.x + b * bary.y + c * bary.z;
            let d2 = q.distance_squared(p);
            if d2 <= r2 && best.is_none_or(|(_, _, _, bd2)| d2 < bd2) {
                best = Some((t, bary, q, d2));
            }
        }

        let (triangle, barycentric, point, d2) = best.ok_or_else(|| GrowthError::off_manifold(p))?;
        Ok(Projection {
            point,
            normal: self.normal_at(triangle, barycentric),
            triangle,
            barycentric,
            distance: d2.sqrt(),
        })
    }

    fn gradient(&self, p: Point3, field: &dyn Fn(Point3) -> f64) -> DVec3 {
        let normal = match self.project(p) {
            Ok(proj) => proj.normal,
            Err(_) => return DVec3::ZERO,
        };
        tangent_gradient(p, normal, self.gradient_step, field)
    }

    fn detect_boundary(&self) -> BTreeSet<EdgeRef> {
        let mut uses: BTreeMap<EdgeRef, usize> = BTreeMap::new();
        for &[a, b, c] in &self.triangles {
            for e in [EdgeRef::new(a, b), EdgeRef::new(b, c), EdgeRef::new(c, a)] {
                *uses.entry(e).or_insert(0) += 1;
            }
        }
        uses.into_iter()
            .filter_map(|(e, n)| (n == 1).then_some(e))
            .collect()
    }

    fn to_parameter_space(&self, p: Point3) -> Option<Point2> {
        let uvs = self.uvs.as_ref()?;
        let proj = self.project(p).ok()?;
        let [a, b, c] = self.triangles[proj.triangle];
        let w = proj.barycentric;
        Some(uvs[a] * w.x + uvs[b] * w.y + uvs[c] * w.z)
    }

    fn from_parameter_space(&self, uv: Point2) -> Option<Point3> {
        const INSIDE_TOL: f64 = 1e-12;
        let uvs = self.uvs.as_ref()?;
        let grid = self.uv_grid.as_ref()?;
        if !uv.is_finite() {
            return None;
        }
        let q = uv.extend(0.0);
        for t in grid.candidates(q, 0.0) {
            let [a, b, c] = self.triangles[t];
            let [ua, ub, uc] = [uvs[a], uvs[b], uvs[c]].map(|uv| uv.extend(0.0));
            let bary = closest_barycentric(q, ua, ub, uc);
            let hit = uvs[a] * bary.x + uvs[b] * bary.y + uvs[c] * bary.z;
            if hit.distance_squared(uv) <= INSIDE_TOL * INSIDE_TOL {
                let [va, vb, vc] = self.triangles[t].map(|i| self.vertices[i]);
                return Some(va * bary.x + vb * bary.y + vc * bary.z);
            }
        }
        None
    }
}
