//! Quadric error metric edge-collapse simplification (Garland & Heckbert).
//!
//! Every vertex carries the sum of the squared-distance quadrics of its
//! incident face planes. Open boundary edges add heavily weighted planes
//! perpendicular to their face so the outline of the terrain holds still.
//! Candidate collapses sit in a min-heap keyed by quadric error; stale
//! entries are detected with per-vertex stamps instead of being removed.
//!
//! A strict pass refuses collapses that would flip a face, break the link
//! condition or pinch the boundary. If that pass stalls above the target, a
//! relaxed pass drops those checks so the face budget is always met.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use tracing::debug;

use super::{cross, dot, length_squared, sub, triangle_normal, TerrainMesh};

/// Weight of boundary constraint planes relative to face planes.
const BOUNDARY_WEIGHT: f64 = 1000.0;

/// Symmetric 4×4 quadric stored as its upper triangle:
/// `[aa, ab, ac, ad, bb, bc, bd, cc, cd, dd]`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Quadric([f64; 10]);

impl Quadric {
    /// Quadric of the plane `n·p + d = 0` with unit `n`, scaled by `weight`.
    fn from_plane(n: [f64; 3], d: f64, weight: f64) -> Self {
        let [a, b, c] = n;
        Self([
            a * a * weight,
            a * b * weight,
            a * c * weight,
            a * d * weight,
            b * b * weight,
            b * c * weight,
            b * d * weight,
            c * c * weight,
            c * d * weight,
            d * d * weight,
        ])
    }

    fn add(&self, other: &Self) -> Self {
        let mut out = self.0;
        for (o, v) in out.iter_mut().zip(other.0) {
            *o += v;
        }
        Self(out)
    }

    /// Sum of weighted squared plane distances at `p`.
    fn error(&self, p: [f64; 3]) -> f64 {
        let q = &self.0;
        let [x, y, z] = p;
        q[0] * x * x
            + 2.0 * q[1] * x * y
            + 2.0 * q[2] * x * z
            + 2.0 * q[3] * x
            + q[4] * y * y
            + 2.0 * q[5] * y * z
            + 2.0 * q[6] * y
            + q[7] * z * z
            + 2.0 * q[8] * z
            + q[9]
    }

    /// Minimizer of the quadric, if the 3×3 system is well conditioned.
    fn optimal(&self) -> Option<[f64; 3]> {
        let q = &self.0;
        let (a, b, c) = (q[0], q[1], q[2]);
        let (e, f) = (q[4], q[5]);
        let h = q[7];
        let rhs = [-q[3], -q[6], -q[8]];

        let det = a * (e * h - f * f) - b * (b * h - f * c) + c * (b * f - e * c);
        let scale = a + e + h;
        if scale <= 0.0 || det.abs() <= 1e-9 * scale * scale * scale {
            return None;
        }

        // Cramer's rule on the symmetric system
        let det_x = rhs[0] * (e * h - f * f) - b * (rhs[1] * h - f * rhs[2])
            + c * (rhs[1] * f - e * rhs[2]);
        let det_y = a * (rhs[1] * h - f * rhs[2]) - rhs[0] * (b * h - f * c)
            + c * (b * rhs[2] - rhs[1] * c);
        let det_z = a * (e * rhs[2] - rhs[1] * f) - b * (b * rhs[2] - rhs[1] * c)
            + rhs[0] * (b * f - e * c);

        Some([det_x / det, det_y / det, det_z / det])
    }
}

/// A pending collapse of `v1` into `v0`.
#[derive(Clone, Copy, Debug)]
struct Collapse {
    cost: f64,
    v0: u32,
    v1: u32,
    stamp0: u32,
    stamp1: u32,
    target: [f64; 3],
}

impl PartialEq for Collapse {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Collapse {}

// Min-heap by cost via reversed ordering.
impl PartialOrd for Collapse {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Collapse {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.v0.cmp(&self.v0))
            .then_with(|| other.v1.cmp(&self.v1))
    }
}

#[inline]
fn edge_key(a: u32, b: u32) -> (u32, u32) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Outcome counters of one [`decimate`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecimationStats {
    pub faces_before: usize,
    pub faces_after: usize,
    pub strict_collapses: usize,
    pub relaxed_collapses: usize,
}

struct Decimator {
    positions: Vec<[f64; 3]>,
    quadrics: Vec<Quadric>,
    faces: Vec<[u32; 3]>,
    face_alive: Vec<bool>,
    vertex_faces: Vec<Vec<u32>>,
    stamps: Vec<u32>,
    removed: Vec<bool>,
    boundary_vertex: Vec<bool>,
    boundary_edges: HashSet<(u32, u32)>,
    alive_faces: usize,
}

impl Decimator {
    fn new(mesh: TerrainMesh) -> Self {
        let n = mesh.vertices.len();
        let mut quadrics = vec![Quadric::default(); n];
        let mut vertex_faces = vec![Vec::new(); n];
        let mut edge_use: HashMap<(u32, u32), (u32, usize)> = HashMap::new();

        for (fi, face) in mesh.faces.iter().enumerate() {
            let [a, b, c] = face.map(|v| mesh.vertices[v as usize]);
            let normal = triangle_normal(a, b, c);
            let len2 = length_squared(normal);
            if len2 > 0.0 {
                let len = len2.sqrt();
                let unit = normal.map(|v| v / len);
                let q = Quadric::from_plane(unit, -dot(unit, a), len / 2.0);
                for &v in face {
                    quadrics[v as usize] = quadrics[v as usize].add(&q);
                }
            }
            for &v in face {
                vertex_faces[v as usize].push(fi as u32);
            }
            for k in 0..3 {
                let entry = edge_use
                    .entry(edge_key(face[k], face[(k + 1) % 3]))
                    .or_insert((0, fi));
                entry.0 += 1;
            }
        }

        let mut boundary_vertex = vec![false; n];
        let mut boundary_edges = HashSet::new();
        let mut open_edges: Vec<((u32, u32), usize)> = edge_use
            .into_iter()
            .filter(|(_, (uses, _))| *uses == 1)
            .map(|(key, (_, fi))| (key, fi))
            .collect();
        open_edges.sort_unstable();

        for ((a, b), fi) in open_edges {
            boundary_edges.insert((a, b));
            boundary_vertex[a as usize] = true;
            boundary_vertex[b as usize] = true;

            let face = mesh.faces[fi];
            let [p, q, r] = face.map(|v| mesh.vertices[v as usize]);
            let face_normal = triangle_normal(p, q, r);
            let (pa, pb) = (mesh.vertices[a as usize], mesh.vertices[b as usize]);
            let edge = sub(pb, pa);
            let plane = cross(edge, face_normal);
            let len2 = length_squared(plane);
            if len2 <= 0.0 {
                continue;
            }
            let len = len2.sqrt();
            let unit = plane.map(|v| v / len);
            let quadric =
                Quadric::from_plane(unit, -dot(unit, pa), BOUNDARY_WEIGHT * length_squared(edge));
            quadrics[a as usize] = quadrics[a as usize].add(&quadric);
            quadrics[b as usize] = quadrics[b as usize].add(&quadric);
        }

        let alive_faces = mesh.faces.len();
        Self {
            positions: mesh.vertices,
            quadrics,
            face_alive: vec![true; alive_faces],
            faces: mesh.faces,
            vertex_faces,
            stamps: vec![0; n],
            removed: vec![false; n],
            boundary_vertex,
            boundary_edges,
            alive_faces,
        }
    }

    fn candidate(&self, v0: u32, v1: u32) -> Collapse {
        let q = self.quadrics[v0 as usize].add(&self.quadrics[v1 as usize]);
        let p0 = self.positions[v0 as usize];
        let p1 = self.positions[v1 as usize];
        let mid = [
            (p0[0] + p1[0]) / 2.0,
            (p0[1] + p1[1]) / 2.0,
            (p0[2] + p1[2]) / 2.0,
        ];

        let mut best = (q.error(p0), p0);
        for p in [p1, mid] {
            let e = q.error(p);
            if e < best.0 {
                best = (e, p);
            }
        }
        if let Some(p) = q.optimal() {
            // Ill-conditioned solves can land far off the edge
            let reach = length_squared(sub(p1, p0)).max(f64::MIN_POSITIVE);
            let e = q.error(p);
            if length_squared(sub(p, mid)) <= 4.0 * reach && e < best.0 {
                best = (e, p);
            }
        }

        Collapse {
            cost: best.0.max(0.0),
            v0,
            v1,
            stamp0: self.stamps[v0 as usize],
            stamp1: self.stamps[v1 as usize],
            target: best.1,
        }
    }

    fn alive_faces_of(&self, v: u32) -> impl Iterator<Item = u32> + '_ {
        self.vertex_faces[v as usize]
            .iter()
            .copied()
            .filter(move |&f| self.face_alive[f as usize])
    }

    /// Sorted distinct neighbours of `v`, written into `out`.
    fn neighbors_into(&self, v: u32, out: &mut Vec<u32>) {
        out.clear();
        out.extend(
            self.alive_faces_of(v)
                .flat_map(|f| self.faces[f as usize])
                .filter(|&u| u != v),
        );
        out.sort_unstable();
        out.dedup();
    }

    fn shared_faces(&self, v0: u32, v1: u32) -> Vec<u32> {
        self.alive_faces_of(v0)
            .filter(|&f| self.faces[f as usize].contains(&v1))
            .collect()
    }

    fn initial_heap(&self) -> BinaryHeap<Collapse> {
        let mut edges = HashSet::new();
        for (fi, face) in self.faces.iter().enumerate() {
            if !self.face_alive[fi] {
                continue;
            }
            for k in 0..3 {
                edges.insert(edge_key(face[k], face[(k + 1) % 3]));
            }
        }
        let mut edges: Vec<_> = edges.into_iter().collect();
        edges.sort_unstable();
        edges
            .into_iter()
            .map(|(a, b)| self.candidate(a, b))
            .collect()
    }

    /// Topology and orientation checks of the strict pass.
    fn allowed(
        &self,
        c: &Collapse,
        shared: &[u32],
        n0: &mut Vec<u32>,
        n1: &mut Vec<u32>,
    ) -> bool {
        let key = edge_key(c.v0, c.v1);
        if self.boundary_vertex[c.v0 as usize]
            && self.boundary_vertex[c.v1 as usize]
            && !self.boundary_edges.contains(&key)
        {
            return false;
        }

        // Link condition: the only common neighbours are the apexes of the
        // faces on the edge
        self.neighbors_into(c.v0, n0);
        self.neighbors_into(c.v1, n1);
        let common = n0.iter().filter(|v| n1.binary_search(v).is_ok()).count();
        if common != shared.len() {
            return false;
        }

        for v in [c.v0, c.v1] {
            for f in self.alive_faces_of(v) {
                if shared.contains(&f) {
                    continue;
                }
                let face = self.faces[f as usize];
                let before = face.map(|u| self.positions[u as usize]);
                let after = face.map(|u| {
                    if u == c.v0 || u == c.v1 {
                        c.target
                    } else {
                        self.positions[u as usize]
                    }
                });
                let n_before = triangle_normal(before[0], before[1], before[2]);
                let n_after = triangle_normal(after[0], after[1], after[2]);
                let len_before = length_squared(n_before);
                let len_after = length_squared(n_after);
                if len_after <= 1e-12 * len_before {
                    return false;
                }
                if dot(n_before, n_after) <= 0.0 {
                    return false;
                }
            }
        }
        true
    }

    fn collapse(&mut self, c: &Collapse, links: &mut Vec<u32>) {
        let (v0, v1) = (c.v0, c.v1);
        // Open edges at v1 run to its current neighbours
        let on_boundary = self.boundary_vertex[v1 as usize];
        if on_boundary {
            self.neighbors_into(v1, links);
        }
        self.positions[v0 as usize] = c.target;
        self.quadrics[v0 as usize] = self.quadrics[v0 as usize].add(&self.quadrics[v1 as usize]);

        let moved = std::mem::take(&mut self.vertex_faces[v1 as usize]);
        for f in moved {
            if !self.face_alive[f as usize] {
                continue;
            }
            let face = &mut self.faces[f as usize];
            if face.contains(&v0) {
                self.face_alive[f as usize] = false;
                self.alive_faces -= 1;
            } else {
                for u in face.iter_mut() {
                    if *u == v1 {
                        *u = v0;
                    }
                }
                self.vertex_faces[v0 as usize].push(f);
            }
        }
        let alive = &self.face_alive;
        self.vertex_faces[v0 as usize].retain(|&f| alive[f as usize]);

        if on_boundary {
            for &other in links.iter() {
                if self.boundary_edges.remove(&edge_key(v1, other)) && other != v0 {
                    self.boundary_edges.insert(edge_key(v0, other));
                }
            }
            self.boundary_vertex[v0 as usize] = true;
        }

        self.removed[v1 as usize] = true;
        self.stamps[v0 as usize] += 1;
        self.stamps[v1 as usize] += 1;
    }

    fn run_pass(&mut self, target: usize, strict: bool) -> usize {
        if self.alive_faces <= target {
            return 0;
        }
        let mut heap = self.initial_heap();
        let mut collapses = 0;
        let (mut near0, mut near1) = (Vec::new(), Vec::new());

        while self.alive_faces > target {
            let Some(c) = heap.pop() else {
                break;
            };
            if self.removed[c.v0 as usize]
                || self.removed[c.v1 as usize]
                || self.stamps[c.v0 as usize] != c.stamp0
                || self.stamps[c.v1 as usize] != c.stamp1
            {
                continue;
            }

            let shared = self.shared_faces(c.v0, c.v1);
            // Skip orphaned edges and collapses that would empty the mesh
            if shared.is_empty() || shared.len() >= self.alive_faces {
                continue;
            }
            if strict && !self.allowed(&c, &shared, &mut near0, &mut near1) {
                continue;
            }

            self.collapse(&c, &mut near1);
            collapses += 1;

            self.neighbors_into(c.v0, &mut near0);
            for &n in &near0 {
                heap.push(self.candidate(c.v0, n));
            }
        }

        collapses
    }

    /// Drop dead faces, duplicate faces and unreferenced vertices.
    fn into_mesh(self) -> TerrainMesh {
        let mut remap = vec![u32::MAX; self.positions.len()];
        let mut seen = HashSet::new();
        let mut faces = Vec::with_capacity(self.alive_faces);

        for (fi, face) in self.faces.iter().enumerate() {
            if !self.face_alive[fi] {
                continue;
            }
            let [a, b, c] = *face;
            if a == b || b == c || a == c {
                continue;
            }
            let mut key = *face;
            key.sort_unstable();
            if !seen.insert(key) {
                continue;
            }
            faces.push(*face);
        }

        let mut referenced: Vec<u32> = faces.iter().flatten().copied().collect();
        referenced.sort_unstable();
        referenced.dedup();

        let mut vertices = Vec::with_capacity(referenced.len());
        for v in referenced {
            remap[v as usize] = vertices.len() as u32;
            vertices.push(self.positions[v as usize]);
        }
        for face in &mut faces {
            for v in face.iter_mut() {
                *v = remap[*v as usize];
            }
        }

        TerrainMesh { vertices, faces }
    }
}

/// Simplify `mesh` to at most `target_faces` triangles.
///
/// Meshes already within budget are only compacted.
pub fn decimate(mesh: TerrainMesh, target_faces: usize) -> (TerrainMesh, DecimationStats) {
    let faces_before = mesh.faces.len();
    let mut decimator = Decimator::new(mesh);

    let strict_collapses = decimator.run_pass(target_faces, true);
    let relaxed_collapses = if decimator.alive_faces > target_faces {
        debug!(
            faces = decimator.alive_faces,
            target = target_faces,
            "strict pass stalled, relaxing checks"
        );
        decimator.run_pass(target_faces, false)
    } else {
        0
    };

    let mesh = decimator.into_mesh();
    let stats = DecimationStats {
        faces_before,
        faces_after: mesh.faces.len(),
        strict_collapses,
        relaxed_collapses,
    };
    debug!(?stats, "decimation finished");
    (mesh, stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Regular grid of `n × n` vertices with a height function.
    fn grid(n: u32, height: impl Fn(f64, f64) -> f64) -> TerrainMesh {
        let mut mesh = TerrainMesh::default();
        for r in 0..n {
            for c in 0..n {
                let (x, y) = (c as f64 * 0.1, r as f64 * 0.1);
                mesh.vertices.push([x, y, height(x, y)]);
            }
        }
        for r in 0..n - 1 {
            for c in 0..n - 1 {
                let v0 = r * n + c;
                let v1 = v0 + 1;
                let v2 = v0 + n;
                let v3 = v2 + 1;
                mesh.faces.push([v0, v2, v1]);
                mesh.faces.push([v1, v2, v3]);
            }
        }
        mesh
    }

    fn assert_valid(mesh: &TerrainMesh) {
        let n = mesh.vertices.len() as u32;
        for face in &mesh.faces {
            for &v in face {
                assert!(v < n);
            }
            assert!(face[0] != face[1] && face[1] != face[2] && face[0] != face[2]);
        }
    }

    #[test]
    fn test_quadric_error_is_plane_distance() {
        let q = Quadric::from_plane([0.0, 0.0, 1.0], -2.0, 1.0);
        assert!((q.error([5.0, -3.0, 2.0])).abs() < 1e-12);
        assert!((q.error([0.0, 0.0, 5.0]) - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_quadric_optimal_corner() {
        let q = Quadric::from_plane([1.0, 0.0, 0.0], -1.0, 1.0)
            .add(&Quadric::from_plane([0.0, 1.0, 0.0], -2.0, 1.0))
            .add(&Quadric::from_plane([0.0, 0.0, 1.0], -3.0, 1.0));
        let p = q.optimal().unwrap();
        assert!((p[0] - 1.0).abs() < 1e-9);
        assert!((p[1] - 2.0).abs() < 1e-9);
        assert!((p[2] - 3.0).abs() < 1e-9);

        let flat = Quadric::from_plane([0.0, 0.0, 1.0], 0.0, 1.0);
        assert!(flat.optimal().is_none());
    }

    #[test]
    fn test_heap_pops_cheapest_first() {
        let mut heap = BinaryHeap::new();
        for (cost, v) in [(3.0, 1), (0.5, 2), (2.0, 3)] {
            heap.push(Collapse {
                cost,
                v0: v,
                v1: v + 10,
                stamp0: 0,
                stamp1: 0,
                target: [0.0; 3],
            });
        }
        let order: Vec<u32> = std::iter::from_fn(|| heap.pop().map(|c| c.v0)).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_decimate_hits_target() {
        let mesh = grid(64, |x, y| (x * 3.0).sin() * (y * 2.0).cos() * 0.5);
        assert_eq!(mesh.faces.len(), 2 * 63 * 63);

        let (out, stats) = decimate(mesh, 1000);
        assert!(out.faces.len() <= 1000);
        assert!(!out.faces.is_empty());
        assert_eq!(stats.faces_after, out.faces.len());
        assert_valid(&out);
    }

    #[test]
    fn test_flat_grid_stays_flat() {
        let mesh = grid(20, |_, _| 1.5);
        let (out, _) = decimate(mesh, 50);
        assert!(out.faces.len() <= 50);
        assert!(!out.faces.is_empty());
        for v in &out.vertices {
            assert!((v[2] - 1.5).abs() < 1e-9);
        }
        assert_valid(&out);
    }

    #[test]
    fn test_flat_grid_keeps_outline() {
        let mesh = grid(16, |_, _| 0.0);
        let (out, _) = decimate(mesh, 200);
        let max_x = out.vertices.iter().map(|v| v[0]).fold(f64::MIN, f64::max);
        let min_y = out.vertices.iter().map(|v| v[1]).fold(f64::MAX, f64::min);
        assert!((max_x - 1.5).abs() < 1e-6);
        assert!(min_y.abs() < 1e-6);
    }

    #[test]
    fn test_tiny_target_still_has_faces() {
        let mesh = grid(10, |x, y| x * y);
        let (out, stats) = decimate(mesh, 1);
        assert_eq!(out.faces.len(), 1);
        assert_eq!(out.vertices.len(), 3);
        assert!(stats.strict_collapses + stats.relaxed_collapses > 0);
        assert_valid(&out);
    }

    #[test]
    fn test_open_edges_stay_tracked_through_collapses() {
        let mesh = grid(12, |x, y| (x * 0.7).sin() + (y * 0.4).cos());
        let mut decimator = Decimator::new(mesh);
        assert!(decimator.run_pass(60, true) > 0);

        let mut uses: HashMap<(u32, u32), usize> = HashMap::new();
        for (fi, face) in decimator.faces.iter().enumerate() {
            if !decimator.face_alive[fi] {
                continue;
            }
            for k in 0..3 {
                *uses.entry(edge_key(face[k], face[(k + 1) % 3])).or_default() += 1;
            }
        }
        for (&(a, b), &count) in &uses {
            if count == 1 {
                assert!(decimator.boundary_edges.contains(&(a, b)), "({a}, {b}) untracked");
                assert!(decimator.boundary_vertex[a as usize]);
                assert!(decimator.boundary_vertex[b as usize]);
            }
        }
    }

    #[test]
    fn test_within_budget_is_untouched() {
        let mesh = grid(5, |x, _| x);
        let before = mesh.clone();
        let (out, stats) = decimate(mesh, 1000);
        assert_eq!(out, before);
        assert_eq!(stats.strict_collapses, 0);
    }
}
