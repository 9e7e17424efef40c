//! Shared atlas mesh.
//!
//! The defragmenter operates on a triangulated surface whose UV
//! parameterization has already been cut along chart boundaries: every chart
//! owns private copies of its boundary vertices, so UV coordinates live
//! per-vertex. Two face-face topologies coexist:
//!
//! - the **UV topology** ([`Mesh::ff`]), where chart boundaries are borders
//!   (seam edges have no opposite face);
//! - the **3D topology** ([`Mesh::ff3d`]), which crosses seams and records the
//!   adjacency of the underlying surface.
//!
//! Copies of the same 3D vertex produced by the seam cut are grouped into
//! *weld classes*; seam chains, endpoints, and vertex welding during a merge
//! are all expressed in terms of these classes.

use std::collections::HashMap;

use nalgebra::{Point2, Point3};

use crate::error::{DefragError, Result};

/// A directed reference to edge `edge` (0..3) of face `face`.
///
/// Edge `e` of a face connects the face's corner `e` to corner `(e + 1) % 3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HalfEdgeRef {
    /// The face index.
    pub face: usize,
    /// The edge index within the face (0, 1 or 2).
    pub edge: usize,
}

impl HalfEdgeRef {
    /// Create a half-edge reference.
    #[inline]
    pub fn new(face: usize, edge: usize) -> Self {
        debug_assert!(edge < 3);
        Self { face, edge }
    }
}

/// Triangle mesh with per-vertex UVs, per-face chart labels and dual
/// face-face topology (UV and 3D).
#[derive(Debug, Clone)]
pub struct Mesh {
    positions: Vec<Point3<f64>>,
    uvs: Vec<Point2<f64>>,
    faces: Vec<[usize; 3]>,
    face_chart: Vec<u32>,
    ff: Vec<[Option<HalfEdgeRef>; 3]>,
    ff3d: Vec<[Option<HalfEdgeRef>; 3]>,
    manifold3d: Vec<[bool; 3]>,
    weld_class: Vec<usize>,
    num_weld_classes: usize,
}

impl Mesh {
    /// Build a mesh from a pre-cut, pre-labelled atlas.
    ///
    /// `positions` and `uvs` must have equal length; `labels` assigns each
    /// face to an input chart (connected regions are re-identified by
    /// [`ChartGraph::build`](crate::graph::ChartGraph::build)).
    ///
    /// # Errors
    ///
    /// Returns an error if the mesh is empty, an index is out of bounds, a
    /// face is degenerate, or attribute lengths mismatch.
    pub fn from_charts(
        positions: Vec<Point3<f64>>,
        uvs: Vec<Point2<f64>>,
        faces: Vec<[usize; 3]>,
        labels: Vec<u32>,
    ) -> Result<Self> {
        if faces.is_empty() {
            return Err(DefragError::EmptyMesh);
        }
        if positions.len() != uvs.len() {
            return Err(DefragError::AttributeMismatch {
                positions: positions.len(),
                uvs: uvs.len(),
            });
        }
        debug_assert_eq!(labels.len(), faces.len());

        for (fi, face) in faces.iter().enumerate() {
            for &v in face {
                if v >= positions.len() {
                    return Err(DefragError::InvalidVertexIndex { face: fi, vertex: v });
                }
            }
            if face[0] == face[1] || face[1] == face[2] || face[0] == face[2] {
                return Err(DefragError::DegenerateFace { face: fi });
            }
        }

        let weld_class = compute_weld_classes(&positions);
        let num_weld_classes = weld_class.iter().copied().max().map_or(0, |m| m + 1);

        let ff = link_topology(&faces, |v| v);
        let ff3d = link_topology(&faces, |v| weld_class[v]);
        let manifold3d = compute_manifold_flags(&faces, &weld_class);

        Ok(Self {
            positions,
            uvs,
            faces,
            face_chart: labels,
            ff,
            ff3d,
            manifold3d,
            weld_class,
            num_weld_classes,
        })
    }

    /// Number of vertices (counting seam duplicates separately).
    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.positions.len()
    }

    /// Number of faces.
    #[inline]
    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    /// Number of weld classes (distinct 3D vertices).
    #[inline]
    pub fn num_weld_classes(&self) -> usize {
        self.num_weld_classes
    }

    /// 3D position of a vertex.
    #[inline]
    pub fn position(&self, v: usize) -> Point3<f64> {
        self.positions[v]
    }

    /// UV coordinate of a vertex.
    #[inline]
    pub fn uv(&self, v: usize) -> Point2<f64> {
        self.uvs[v]
    }

    /// Set the UV coordinate of a vertex.
    #[inline]
    pub fn set_uv(&mut self, v: usize, uv: Point2<f64>) {
        self.uvs[v] = uv;
    }

    /// Vertex indices of a face.
    #[inline]
    pub fn face(&self, f: usize) -> [usize; 3] {
        self.faces[f]
    }

    /// Rewrite one corner of a face (used by vertex welding and rollback).
    #[inline]
    pub fn set_face_vertex(&mut self, f: usize, corner: usize, v: usize) {
        self.faces[f][corner] = v;
    }

    /// Chart label of a face.
    #[inline]
    pub fn face_chart(&self, f: usize) -> u32 {
        self.face_chart[f]
    }

    /// Relabel a face (used when charts merge).
    #[inline]
    pub fn set_face_chart(&mut self, f: usize, chart: u32) {
        self.face_chart[f] = chart;
    }

    /// The two vertices of edge `e` of face `f`, in face order.
    #[inline]
    pub fn edge_vertices(&self, f: usize, e: usize) -> (usize, usize) {
        let face = self.faces[f];
        (face[e], face[(e + 1) % 3])
    }

    /// UV-topology opposite of a half-edge (`None` on a chart border).
    #[inline]
    pub fn ff(&self, f: usize, e: usize) -> Option<HalfEdgeRef> {
        self.ff[f][e]
    }

    /// Overwrite the UV-topology link of a half-edge.
    #[inline]
    pub fn set_ff(&mut self, f: usize, e: usize, opp: Option<HalfEdgeRef>) {
        self.ff[f][e] = opp;
    }

    /// 3D-topology opposite of a half-edge (`None` on a true surface border
    /// or at a non-manifold 3D edge).
    #[inline]
    pub fn ff3d(&self, f: usize, e: usize) -> Option<HalfEdgeRef> {
        self.ff3d[f][e]
    }

    /// Whether a half-edge lies on a chart border in UV space.
    #[inline]
    pub fn is_uv_border(&self, f: usize, e: usize) -> bool {
        self.ff[f][e].is_none()
    }

    /// Whether the 3D edge under a half-edge is manifold (at most two
    /// incident faces on the surface).
    #[inline]
    pub fn is_edge_manifold_3d(&self, f: usize, e: usize) -> bool {
        self.manifold3d[f][e]
    }

    /// Weld class of a vertex (identity of the underlying 3D vertex).
    #[inline]
    pub fn weld_class(&self, v: usize) -> usize {
        self.weld_class[v]
    }

    /// Length of edge `e` of face `f` in UV space.
    pub fn uv_edge_length(&self, f: usize, e: usize) -> f64 {
        let (v0, v1) = self.edge_vertices(f, e);
        (self.uvs[v1] - self.uvs[v0]).norm()
    }

    /// Length of edge `e` of face `f` on the 3D surface.
    pub fn edge_length_3d(&self, f: usize, e: usize) -> f64 {
        let (v0, v1) = self.edge_vertices(f, e);
        (self.positions[v1] - self.positions[v0]).norm()
    }

    /// Signed UV area of a face (negative when folded).
    pub fn face_area_uv_signed(&self, f: usize) -> f64 {
        let [v0, v1, v2] = self.faces[f];
        let a = self.uvs[v0];
        let b = self.uvs[v1];
        let c = self.uvs[v2];
        ((b - a).x * (c - a).y - (b - a).y * (c - a).x) / 2.0
    }

    /// 3D area of a face.
    pub fn face_area_3d(&self, f: usize) -> f64 {
        let [v0, v1, v2] = self.faces[f];
        let e1 = self.positions[v1] - self.positions[v0];
        let e2 = self.positions[v2] - self.positions[v0];
        e1.cross(&e2).norm() / 2.0
    }

    /// Corner UVs of a face.
    pub fn face_uvs(&self, f: usize) -> [Point2<f64>; 3] {
        let [v0, v1, v2] = self.faces[f];
        [self.uvs[v0], self.uvs[v1], self.uvs[v2]]
    }

    /// Corner positions of a face.
    pub fn face_positions(&self, f: usize) -> [Point3<f64>; 3] {
        let [v0, v1, v2] = self.faces[f];
        [self.positions[v0], self.positions[v1], self.positions[v2]]
    }
}

/// Group vertices by exact 3D position.
fn compute_weld_classes(positions: &[Point3<f64>]) -> Vec<usize> {
    let mut classes: HashMap<[u64; 3], usize> = HashMap::new();
    let mut out = Vec::with_capacity(positions.len());
    for p in positions {
        let key = [p.x.to_bits(), p.y.to_bits(), p.z.to_bits()];
        let next = classes.len();
        out.push(*classes.entry(key).or_insert(next));
    }
    out
}

/// Link half-edges whose endpoint keys match pairwise.
///
/// With the identity key this yields the UV topology (seam edges stay
/// unmatched because the atlas is pre-cut); with weld-class keys it yields
/// the 3D topology. Edges with more than two incident faces are left
/// unlinked.
fn link_topology<K>(faces: &[[usize; 3]], key: K) -> Vec<[Option<HalfEdgeRef>; 3]>
where
    K: Fn(usize) -> usize,
{
    let mut edge_map: HashMap<(usize, usize), Vec<HalfEdgeRef>> = HashMap::new();
    for (fi, face) in faces.iter().enumerate() {
        for e in 0..3 {
            let k0 = key(face[e]);
            let k1 = key(face[(e + 1) % 3]);
            let edge = if k0 < k1 { (k0, k1) } else { (k1, k0) };
            edge_map.entry(edge).or_default().push(HalfEdgeRef::new(fi, e));
        }
    }

    let mut ff = vec![[None; 3]; faces.len()];
    for refs in edge_map.values() {
        if let [a, b] = refs[..] {
            ff[a.face][a.edge] = Some(b);
            ff[b.face][b.edge] = Some(a);
        }
    }
    ff
}

/// Per-half-edge 3D manifoldness: at most two faces share the weld-class edge.
fn compute_manifold_flags(faces: &[[usize; 3]], weld_class: &[usize]) -> Vec<[bool; 3]> {
    let mut edge_count: HashMap<(usize, usize), usize> = HashMap::new();
    for face in faces {
        for e in 0..3 {
            let k0 = weld_class[face[e]];
            let k1 = weld_class[face[(e + 1) % 3]];
            let edge = if k0 < k1 { (k0, k1) } else { (k1, k0) };
            *edge_count.entry(edge).or_insert(0) += 1;
        }
    }

    let mut flags = vec![[true; 3]; faces.len()];
    for (fi, face) in faces.iter().enumerate() {
        for e in 0..3 {
            let k0 = weld_class[face[e]];
            let k1 = weld_class[face[(e + 1) % 3]];
            let edge = if k0 < k1 { (k0, k1) } else { (k1, k0) };
            flags[fi][e] = edge_count[&edge] <= 2;
        }
    }
    flags
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_build_validates_input() {
        let positions = vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)];
        let uvs = vec![Point2::new(0.0, 0.0), Point2::new(1.0, 0.0)];

        let err = Mesh::from_charts(positions.clone(), uvs.clone(), vec![], vec![]);
        assert!(matches!(err, Err(DefragError::EmptyMesh)));

        let err = Mesh::from_charts(positions.clone(), uvs.clone(), vec![[0, 1, 5]], vec![0]);
        assert!(matches!(err, Err(DefragError::InvalidVertexIndex { .. })));

        let err = Mesh::from_charts(positions, uvs, vec![[0, 1, 1]], vec![0]);
        assert!(matches!(err, Err(DefragError::DegenerateFace { .. })));
    }

    #[test]
    fn test_split_square_topology() {
        let mesh = split_square();

        // the diagonal is a UV border on both sides
        assert!(mesh.is_uv_border(0, 2)); // edge (2, 0) of face 0
        assert!(mesh.is_uv_border(1, 0)); // edge (3, 4) of face 1

        // but the faces are 3D-adjacent across it
        assert_eq!(mesh.ff3d(0, 2), Some(HalfEdgeRef::new(1, 0)));
        assert_eq!(mesh.ff3d(1, 0), Some(HalfEdgeRef::new(0, 2)));

        // seam duplicates share weld classes
        assert_eq!(mesh.weld_class(0), mesh.weld_class(3));
        assert_eq!(mesh.weld_class(2), mesh.weld_class(4));
        assert_eq!(mesh.num_weld_classes(), 4);
    }

    #[test]
    fn test_areas_and_lengths() {
        let mesh = split_square();
        assert!((mesh.face_area_3d(0) - 0.5).abs() < 1e-12);
        assert!((mesh.face_area_uv_signed(0) - 0.5).abs() < 1e-12);
        assert!((mesh.uv_edge_length(0, 0) - 1.0).abs() < 1e-12);
        assert!((mesh.edge_length_3d(0, 2) - 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_split_grid_charts() {
        let mesh = split_grid(4);
        assert_eq!(mesh.num_faces(), 32);
        let left = (0..mesh.num_faces()).filter(|&f| mesh.face_chart(f) == 0).count();
        assert_eq!(left, 16);

        // every face of the seam column is 3D-adjacent to the other chart
        let mut seam_edges = 0;
        for f in 0..mesh.num_faces() {
            for e in 0..3 {
                if mesh.is_uv_border(f, e) {
                    if let Some(opp) = mesh.ff3d(f, e) {
                        if mesh.face_chart(opp.face) != mesh.face_chart(f) {
                            seam_edges += 1;
                        }
                    }
                }
            }
        }
        assert_eq!(seam_edges, 8); // 4 seam edges, counted from both sides
    }

    #[test]
    fn test_slit_square_topology() {
        let mesh = slit_square();

        // the slit sides are UV borders of the same chart
        assert!(mesh.is_uv_border(0, 1)); // edge (9, 4) of face 0
        assert!(mesh.is_uv_border(3, 2)); // edge (4, 1) of face 3
        assert_eq!(mesh.face_chart(0), mesh.face_chart(3));

        // and 3D-adjacent across the cut
        assert_eq!(mesh.ff3d(0, 1), Some(HalfEdgeRef::new(3, 2)));
        assert_eq!(mesh.ff3d(3, 2), Some(HalfEdgeRef::new(0, 1)));
        assert_eq!(mesh.weld_class(1), mesh.weld_class(9));
        assert_eq!(mesh.num_weld_classes(), 9);
    }
}
