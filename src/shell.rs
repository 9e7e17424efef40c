//! Disposable solver domain for local re-parameterization.
//!
//! A [`Shell`] copies the faces of an optimization area out of the atlas
//! mesh, reindexes their vertices, and equips every face with a *target
//! shape*: its 3D triangle flattened to the plane and globally rescaled so
//! the total target area matches the patch's current UV area. The relaxation
//! solver works entirely on the shell; the solved UVs are copied back into
//! the mesh for validation, and a rejected attempt restores the originals.
//!
//! The solver needs a topological disk. All boundary loops except the
//! longest are closed with ear-clip triangles; those ballast faces are
//! flagged so they never contribute to distortion accounting and are never
//! copied back. Patches that are disconnected, closed, or otherwise not
//! disk-like after filling are rejected.

use std::collections::HashMap;

use nalgebra::Point2;

use crate::mesh::Mesh;

/// Reindexed copy of an optimization area, with per-face target shapes.
#[derive(Debug, Clone)]
pub struct Shell {
    faces: Vec<[usize; 3]>,
    uv: Vec<Point2<f64>>,
    target: Vec<[Point2<f64>; 3]>,
    weight: Vec<f64>,
    hole_filling: Vec<bool>,
    source_face: Vec<Option<usize>>,
    source_vertex: Vec<usize>,
    boundary_vertex: Vec<bool>,
}

impl Shell {
    /// Build a shell from a set of mesh faces.
    ///
    /// Returns `None` when the patch cannot serve as a solver domain: it is
    /// disconnected, has no boundary, has a non-manifold boundary vertex, or
    /// is not a disk once the extra loops are filled.
    pub fn build(mesh: &Mesh, area_faces: &[usize]) -> Option<Shell> {
        if area_faces.is_empty() {
            return None;
        }

        // reindex vertices
        let mut vmap: HashMap<usize, usize> = HashMap::new();
        let mut source_vertex = Vec::new();
        let mut uv = Vec::new();
        let mut faces = Vec::with_capacity(area_faces.len());
        for &f in area_faces {
            let tri = mesh.face(f);
            let mut local = [0usize; 3];
            for (k, &v) in tri.iter().enumerate() {
                let next = vmap.len();
                let lv = *vmap.entry(v).or_insert(next);
                if lv == source_vertex.len() {
                    source_vertex.push(v);
                    uv.push(mesh.uv(v));
                }
                local[k] = lv;
            }
            faces.push(local);
        }

        if !is_connected(&faces, uv.len()) {
            log::debug!("shell rejected: {} faces form multiple components", faces.len());
            return None;
        }

        // target shapes from the 3D geometry, rescaled to the patch UV area
        let mut target = Vec::with_capacity(faces.len());
        let mut weight = Vec::with_capacity(faces.len());
        let mut area_3d_total = 0.0;
        let mut area_uv_total = 0.0;
        for &f in area_faces {
            let shape = flatten_face(mesh, f);
            let a3 = mesh.face_area_3d(f);
            area_3d_total += a3;
            area_uv_total += mesh.face_area_uv_signed(f).abs();
            target.push(shape);
            weight.push(a3);
        }
        if area_3d_total <= 0.0 {
            log::debug!("shell rejected: zero total 3D area");
            return None;
        }
        let scale = (area_uv_total / area_3d_total).sqrt();
        for (shape, w) in target.iter_mut().zip(weight.iter_mut()) {
            for p in shape.iter_mut() {
                p.coords *= scale;
            }
            *w *= scale * scale;
        }

        let mut shell = Shell {
            source_face: area_faces.iter().map(|&f| Some(f)).collect(),
            faces,
            uv,
            target,
            weight,
            hole_filling: vec![false; area_faces.len()],
            source_vertex,
            boundary_vertex: Vec::new(),
        };

        let loops = match shell.boundary_loops() {
            Some(loops) if !loops.is_empty() => loops,
            _ => {
                log::debug!("shell rejected: no usable boundary");
                return None;
            }
        };
        shell.fill_holes(&loops);

        // disk check on the filled patch: V - E + F must be 1
        if shell.euler_characteristic() != 1 {
            log::debug!("shell rejected: not a disk after hole filling");
            return None;
        }

        shell.mark_boundary();
        Some(shell)
    }

    /// Number of shell vertices.
    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.uv.len()
    }

    /// Number of shell faces, fill faces included.
    #[inline]
    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    /// Current UV of a shell vertex.
    #[inline]
    pub fn uv(&self, v: usize) -> Point2<f64> {
        self.uv[v]
    }

    /// Overwrite the UV of a shell vertex.
    #[inline]
    pub fn set_uv(&mut self, v: usize, p: Point2<f64>) {
        self.uv[v] = p;
    }

    /// Local vertex indices of a face.
    #[inline]
    pub fn face(&self, f: usize) -> [usize; 3] {
        self.faces[f]
    }

    /// Target shape of a face (flattened, rescaled 3D triangle).
    #[inline]
    pub fn target(&self, f: usize) -> [Point2<f64>; 3] {
        self.target[f]
    }

    /// Area weight of a face (target-space area).
    #[inline]
    pub fn face_weight(&self, f: usize) -> f64 {
        self.weight[f]
    }

    /// Whether a face is hole-filling ballast.
    #[inline]
    pub fn is_hole_filling(&self, f: usize) -> bool {
        self.hole_filling[f]
    }

    /// Mesh face a shell face came from (`None` for fill faces).
    #[inline]
    pub fn source_face(&self, f: usize) -> Option<usize> {
        self.source_face[f]
    }

    /// Mesh vertex a shell vertex came from.
    #[inline]
    pub fn source_vertex(&self, v: usize) -> usize {
        self.source_vertex[v]
    }

    /// Whether a shell vertex lies on the retained outer boundary.
    #[inline]
    pub fn is_boundary(&self, v: usize) -> bool {
        self.boundary_vertex[v]
    }

    /// Write the shell UVs back into the mesh.
    pub fn copy_back(&self, mesh: &mut Mesh) {
        for (lv, &v) in self.source_vertex.iter().enumerate() {
            mesh.set_uv(v, self.uv[lv]);
        }
    }

    /// Current signed UV area of a face.
    pub fn face_area_uv_signed(&self, f: usize) -> f64 {
        let [v0, v1, v2] = self.faces[f];
        let (a, b, c) = (self.uv[v0], self.uv[v1], self.uv[v2]);
        ((b - a).x * (c - a).y - (b - a).y * (c - a).x) / 2.0
    }

    /// Boundary loops as vertex cycles, or `None` at a bowtie vertex.
    fn boundary_loops(&self) -> Option<Vec<Vec<usize>>> {
        let border = border_half_edges(&self.faces);

        // outgoing border edge per vertex; a collision is a bowtie
        let mut out_edge: HashMap<usize, (usize, usize)> = HashMap::new();
        for &(v0, v1) in &border {
            if out_edge.insert(v0, (v0, v1)).is_some() {
                return None;
            }
        }

        let mut loops = Vec::new();
        let mut visited: HashMap<usize, bool> = HashMap::new();
        for &(start, _) in &border {
            if visited.get(&start).copied().unwrap_or(false) {
                continue;
            }
            let mut cycle = Vec::new();
            let mut v = start;
            loop {
                visited.insert(v, true);
                cycle.push(v);
                let &(_, next) = out_edge.get(&v)?;
                v = next;
                if v == start {
                    break;
                }
                if cycle.len() > border.len() {
                    return None;
                }
            }
            loops.push(cycle);
        }
        Some(loops)
    }

    /// Close every loop but the longest (by UV length) with ear-clip faces.
    fn fill_holes(&mut self, loops: &[Vec<usize>]) {
        let uv_len = |cycle: &[usize]| -> f64 {
            cycle
                .iter()
                .zip(cycle.iter().cycle().skip(1))
                .map(|(&a, &b)| (self.uv[b] - self.uv[a]).norm())
                .sum()
        };
        let keep = loops
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                uv_len(a).partial_cmp(&uv_len(b)).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i);

        for (i, cycle) in loops.iter().enumerate() {
            if Some(i) == keep || cycle.len() < 3 {
                continue;
            }
            for tri in ear_clip(cycle, &self.uv) {
                let shape = [self.uv[tri[0]], self.uv[tri[1]], self.uv[tri[2]]];
                let area = triangle_area(shape[0], shape[1], shape[2]).abs();
                self.faces.push(tri);
                self.target.push(shape);
                self.weight.push(area.max(1e-12));
                self.hole_filling.push(true);
                self.source_face.push(None);
            }
        }
    }

    fn euler_characteristic(&self) -> i64 {
        let mut edges = std::collections::HashSet::new();
        for face in &self.faces {
            for e in 0..3 {
                let (a, b) = (face[e], face[(e + 1) % 3]);
                edges.insert(if a < b { (a, b) } else { (b, a) });
            }
        }
        self.uv.len() as i64 - edges.len() as i64 + self.faces.len() as i64
    }

    fn mark_boundary(&mut self) {
        let border = border_half_edges(&self.faces);
        let mut flags = vec![false; self.uv.len()];
        for (v0, v1) in border {
            flags[v0] = true;
            flags[v1] = true;
        }
        self.boundary_vertex = flags;
    }
}

/// Flatten the 3D triangle of a mesh face into the plane, preserving edge
/// lengths.
pub(crate) fn flatten_face(mesh: &Mesh, f: usize) -> [Point2<f64>; 3] {
    let [p0, p1, p2] = mesh.face_positions(f);
    let l01 = (p1 - p0).norm();
    let l02 = (p2 - p0).norm();
    let l12 = (p2 - p1).norm();
    let x2 = if l01 > 0.0 {
        (l01 * l01 + l02 * l02 - l12 * l12) / (2.0 * l01)
    } else {
        0.0
    };
    let y2 = (l02 * l02 - x2 * x2).max(0.0).sqrt();
    [Point2::origin(), Point2::new(l01, 0.0), Point2::new(x2, y2)]
}

fn triangle_area(a: Point2<f64>, b: Point2<f64>, c: Point2<f64>) -> f64 {
    ((b - a).x * (c - a).y - (b - a).y * (c - a).x) / 2.0
}

/// Directed border half-edges `(v0, v1)` of a face soup (edges with exactly
/// one incident face).
fn border_half_edges(faces: &[[usize; 3]]) -> Vec<(usize, usize)> {
    let mut count: HashMap<(usize, usize), usize> = HashMap::new();
    for face in faces {
        for e in 0..3 {
            let (a, b) = (face[e], face[(e + 1) % 3]);
            let key = if a < b { (a, b) } else { (b, a) };
            *count.entry(key).or_insert(0) += 1;
        }
    }
    let mut border = Vec::new();
    for face in faces {
        for e in 0..3 {
            let (a, b) = (face[e], face[(e + 1) % 3]);
            let key = if a < b { (a, b) } else { (b, a) };
            if count[&key] == 1 {
                border.push((a, b));
            }
        }
    }
    border
}

fn is_connected(faces: &[[usize; 3]], num_vertices: usize) -> bool {
    if faces.is_empty() {
        return false;
    }
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); num_vertices];
    for face in faces {
        for e in 0..3 {
            let (a, b) = (face[e], face[(e + 1) % 3]);
            adj[a].push(b);
            adj[b].push(a);
        }
    }
    let mut seen = vec![false; num_vertices];
    let mut stack = vec![faces[0][0]];
    seen[faces[0][0]] = true;
    while let Some(v) = stack.pop() {
        for &w in &adj[v] {
            if !seen[w] {
                seen[w] = true;
                stack.push(w);
            }
        }
    }
    let used: Vec<bool> = {
        let mut u = vec![false; num_vertices];
        for face in faces {
            for &v in face {
                u[v] = true;
            }
        }
        u
    };
    used.iter().zip(&seen).all(|(&u, &s)| !u || s)
}

/// Triangulate a vertex cycle by ear clipping over its UV coordinates.
///
/// Falls back to a fan when no ear can be found (degenerate hole outlines),
/// which keeps the solver domain closed at the cost of possible slivers.
fn ear_clip(cycle: &[usize], uv: &[Point2<f64>]) -> Vec<[usize; 3]> {
    let mut poly: Vec<usize> = cycle.to_vec();

    // normalize to counterclockwise
    let signed: f64 = poly
        .iter()
        .zip(poly.iter().cycle().skip(1))
        .map(|(&a, &b)| (uv[a].x * uv[b].y - uv[b].x * uv[a].y) / 2.0)
        .sum();
    if signed < 0.0 {
        poly.reverse();
    }

    let mut tris = Vec::new();
    while poly.len() > 3 {
        let n = poly.len();
        let mut clipped = false;
        for i in 0..n {
            let prev = poly[(i + n - 1) % n];
            let cur = poly[i];
            let next = poly[(i + 1) % n];
            if triangle_area(uv[prev], uv[cur], uv[next]) <= 0.0 {
                continue;
            }
            let contains_other = poly.iter().any(|&v| {
                v != prev
                    && v != cur
                    && v != next
                    && point_in_triangle(uv[v], uv[prev], uv[cur], uv[next])
            });
            if contains_other {
                continue;
            }
            tris.push([prev, cur, next]);
            poly.remove(i);
            clipped = true;
            break;
        }
        if !clipped {
            // degenerate outline, fan from the first vertex
            for i in 1..poly.len() - 1 {
                tris.push([poly[0], poly[i], poly[i + 1]]);
            }
            poly.truncate(3);
            return tris;
        }
    }
    if poly.len() == 3 {
        tris.push([poly[0], poly[1], poly[2]]);
    }
    tris
}

fn point_in_triangle(p: Point2<f64>, a: Point2<f64>, b: Point2<f64>, c: Point2<f64>) -> bool {
    let d1 = triangle_area(a, b, p);
    let d2 = triangle_area(b, c, p);
    let d3 = triangle_area(c, a, p);
    (d1 > 0.0 && d2 > 0.0 && d3 > 0.0) || (d1 < 0.0 && d2 < 0.0 && d3 < 0.0)
}
