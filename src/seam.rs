//! Seam model: chart-boundary edges clustered into mergeable units.
//!
//! A [`Seam`] is an ordered chain of shared-boundary edges between exactly
//! two charts (or within one chart, for a self seam). Chains break at
//! topological junctions, that is, weld classes where the number of incident
//! seam edges is not two. A [`ClusteredSeam`] groups all seams between one
//! unordered chart pair and is the unit of cost evaluation and merging.
//!
//! Chart ids are never stored on seams; they are resolved live from face
//! labels, so an accepted merge invalidates nothing here.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use nalgebra::Point2;

use crate::graph::ChartId;
use crate::mesh::{HalfEdgeRef, Mesh};

/// One edge of a seam: the two 3D-coincident UV-border half-edges, plus the
/// weld classes of its endpoints (in `a`'s traversal order).
#[derive(Debug, Clone, Copy)]
pub struct SeamEdge {
    /// Half-edge on the first side.
    pub a: HalfEdgeRef,
    /// Half-edge on the other side of the cut.
    pub b: HalfEdgeRef,
    /// Weld class under `a`'s first vertex.
    pub w0: usize,
    /// Weld class under `a`'s second vertex.
    pub w1: usize,
}

/// An ordered chain of seam edges with zero or two boundary endpoints
/// (weld classes). A closed loop has none.
#[derive(Debug, Clone)]
pub struct Seam {
    /// Chain edges, in walking order.
    pub edges: Vec<SeamEdge>,
    /// Terminal weld classes: empty for a closed loop, two for an open chain.
    pub endpoints: Vec<usize>,
}

impl Seam {
    /// The unordered chart pair of this seam, resolved from face labels.
    pub fn chart_pair(&self, mesh: &Mesh) -> (ChartId, ChartId) {
        let edge = &self.edges[0];
        let ca = ChartId::new(mesh.face_chart(edge.a.face));
        let cb = ChartId::new(mesh.face_chart(edge.b.face));
        if ca <= cb {
            (ca, cb)
        } else {
            (cb, ca)
        }
    }

    /// Total length of the seam on the 3D surface.
    pub fn length_3d(&self, mesh: &Mesh) -> f64 {
        self.edges.iter().map(|e| mesh.edge_length_3d(e.a.face, e.a.edge)).sum()
    }
}

/// All seams between one unordered chart pair: the unit of merging.
///
/// Self seams (both sides in the same chart) are never grouped; each one
/// forms its own singleton cluster.
#[derive(Debug, Clone)]
pub struct ClusteredSeam {
    /// Member seams.
    pub seams: Vec<Seam>,
}

impl ClusteredSeam {
    /// The unordered chart pair, resolved live.
    pub fn chart_pair(&self, mesh: &Mesh) -> (ChartId, ChartId) {
        self.seams[0].chart_pair(mesh)
    }

    /// Whether both sides lie in the same chart.
    pub fn is_self(&self, mesh: &Mesh) -> bool {
        let (a, b) = self.chart_pair(mesh);
        a == b
    }

    /// Number of member edges across all seams.
    pub fn num_edges(&self) -> usize {
        self.seams.iter().map(|s| s.edges.len()).sum()
    }

    /// Iterate over all member edges.
    pub fn edges(&self) -> impl Iterator<Item = &SeamEdge> {
        self.seams.iter().flat_map(|s| s.edges.iter())
    }

    /// Boundary endpoints of the cluster: weld classes that appear exactly
    /// once among member-seam endpoints. Classes seen twice are interior
    /// junctions between member seams, not true boundary points.
    pub fn endpoints(&self) -> BTreeSet<usize> {
        let mut count: BTreeMap<usize, usize> = BTreeMap::new();
        for seam in &self.seams {
            for &w in &seam.endpoints {
                *count.entry(w).or_insert(0) += 1;
            }
        }
        count.into_iter().filter(|&(_, n)| n == 1).map(|(w, _)| w).collect()
    }

    /// Total 3D length across member seams.
    pub fn length_3d(&self, mesh: &Mesh) -> f64 {
        self.seams.iter().map(|s| s.length_3d(mesh)).sum()
    }

    /// Per-chart UV length of the seam (each side measured in its own
    /// parameterization).
    pub fn uv_length_by_chart(&self, mesh: &Mesh) -> BTreeMap<ChartId, f64> {
        let mut out = BTreeMap::new();
        for edge in self.edges() {
            let ca = ChartId::new(mesh.face_chart(edge.a.face));
            let cb = ChartId::new(mesh.face_chart(edge.b.face));
            *out.entry(ca).or_insert(0.0) += mesh.uv_edge_length(edge.a.face, edge.a.edge);
            *out.entry(cb).or_insert(0.0) += mesh.uv_edge_length(edge.b.face, edge.b.edge);
        }
        out
    }

    /// Ordered boundary point sequences for the two sides of the seam.
    ///
    /// The first sequence holds the UVs on `side_a`'s side of every edge,
    /// two points per edge; the second holds the matching points on the
    /// other side, paired by weld class so the sequences correspond
    /// point-wise.
    pub fn extract_uv_coordinates(
        &self,
        mesh: &Mesh,
        side_a: ChartId,
    ) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
        let mut pa = Vec::with_capacity(2 * self.num_edges());
        let mut pb = Vec::with_capacity(2 * self.num_edges());
        for edge in self.edges() {
            let (ha, hb) = if mesh.face_chart(edge.a.face) == side_a.to_u32() {
                (edge.a, edge.b)
            } else {
                (edge.b, edge.a)
            };
            let (a0, a1) = mesh.edge_vertices(ha.face, ha.edge);
            let (b0, b1) = mesh.edge_vertices(hb.face, hb.edge);
            // pair the b side by weld class, not traversal order
            let (b0, b1) = if mesh.weld_class(b0) == mesh.weld_class(a0) {
                (b0, b1)
            } else {
                (b1, b0)
            };
            pa.push(mesh.uv(a0));
            pa.push(mesh.uv(a1));
            pb.push(mesh.uv(b0));
            pb.push(mesh.uv(b1));
        }
        (pa, pb)
    }

    /// A shortened copy of this cluster keeping a prefix (or, with
    /// `backward`, a suffix) of roughly `target_len` of 3D seam length.
    ///
    /// Used when a full-length match is infeasible; the caller evaluates
    /// both directions and keeps the cheaper one.
    pub fn reduced(&self, mesh: &Mesh, target_len: f64, backward: bool) -> ClusteredSeam {
        let mut seams = Vec::new();
        let mut len = 0.0;

        let seam_iter: Box<dyn Iterator<Item = &Seam>> = if backward {
            Box::new(self.seams.iter().rev())
        } else {
            Box::new(self.seams.iter())
        };

        for seam in seam_iter {
            if len >= target_len {
                break;
            }
            let mut edges = Vec::new();
            let edge_iter: Box<dyn Iterator<Item = &SeamEdge>> = if backward {
                Box::new(seam.edges.iter().rev())
            } else {
                Box::new(seam.edges.iter())
            };
            for edge in edge_iter {
                if len >= target_len {
                    break;
                }
                edges.push(*edge);
                len += mesh.edge_length_3d(edge.a.face, edge.a.edge);
            }
            if backward {
                edges.reverse();
            }

            let endpoints = if edges.len() == seam.edges.len() {
                seam.endpoints.clone()
            } else {
                endpoints_of_chain(&edges)
            };
            seams.push(Seam { edges, endpoints });
        }

        if backward {
            seams.reverse();
        }
        ClusteredSeam { seams }
    }
}

/// Recompute the terminal weld classes of an edge chain.
///
/// Classes seen once across the chain's edges are the endpoints, ordered so
/// the first endpoint touches the first edge. A multi-edge open chain with
/// no detected endpoint means the upstream chain walk is broken; that is a
/// contract violation, not a recoverable state.
fn endpoints_of_chain(edges: &[SeamEdge]) -> Vec<usize> {
    let mut count: BTreeMap<usize, usize> = BTreeMap::new();
    for edge in edges {
        *count.entry(edge.w0).or_insert(0) += 1;
        *count.entry(edge.w1).or_insert(0) += 1;
    }
    let mut endpoints: Vec<usize> =
        count.into_iter().filter(|&(_, n)| n == 1).map(|(w, _)| w).collect();

    if endpoints.is_empty() {
        // a closed loop is legal only when nothing was truncated
        assert!(
            edges.len() >= 3,
            "seam chain of {} edges has no endpoints",
            edges.len()
        );
        return endpoints;
    }
    assert_eq!(endpoints.len(), 2, "open seam chain must have exactly two endpoints");

    let first = edges[0];
    if endpoints[0] != first.w0 && endpoints[0] != first.w1 {
        endpoints.reverse();
    }
    endpoints
}

/// Extract all seams of the current atlas state.
///
/// Walks every UV-border half-edge exactly once (via a visitation flag),
/// pairs it with its 3D opposite, then chains edges per chart pair, breaking
/// chains at junction classes (incident seam-edge count other than two).
pub fn extract_seams(mesh: &Mesh) -> Vec<Seam> {
    let mut visited = vec![[false; 3]; mesh.num_faces()];
    let mut raw: Vec<SeamEdge> = Vec::new();

    for f in 0..mesh.num_faces() {
        for e in 0..3 {
            if visited[f][e] || !mesh.is_uv_border(f, e) {
                continue;
            }
            visited[f][e] = true;
            let opp = match mesh.ff3d(f, e) {
                Some(opp) => opp,
                None => continue, // true surface border, not a seam
            };
            visited[opp.face][opp.edge] = true;
            let (v0, v1) = mesh.edge_vertices(f, e);
            raw.push(SeamEdge {
                a: HalfEdgeRef::new(f, e),
                b: opp,
                w0: mesh.weld_class(v0),
                w1: mesh.weld_class(v1),
            });
        }
    }

    // group by unordered chart pair, then chain within each group
    let mut groups: BTreeMap<(ChartId, ChartId), Vec<SeamEdge>> = BTreeMap::new();
    for edge in raw {
        let ca = ChartId::new(mesh.face_chart(edge.a.face));
        let cb = ChartId::new(mesh.face_chart(edge.b.face));
        let key = if ca <= cb { (ca, cb) } else { (cb, ca) };
        groups.entry(key).or_default().push(edge);
    }

    let mut seams = Vec::new();
    for edges in groups.into_values() {
        seams.extend(chain_edges(edges));
    }
    seams
}

/// Chain a group of seam edges into ordered walks.
pub(crate) fn chain_edges(edges: Vec<SeamEdge>) -> Vec<Seam> {
    let mut incident: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, edge) in edges.iter().enumerate() {
        incident.entry(edge.w0).or_default().push(i);
        incident.entry(edge.w1).or_default().push(i);
    }

    // chain breakers: junction classes and chain terminals
    let breaker: BTreeSet<usize> = incident
        .iter()
        .filter(|(_, v)| v.len() != 2)
        .map(|(&w, _)| w)
        .collect();

    let mut used = vec![false; edges.len()];
    let mut seams = Vec::new();

    let mut walk = |start_edge: usize, start_class: usize, used: &mut Vec<bool>| -> Seam {
        let mut chain = Vec::new();
        let mut edge_idx = start_edge;
        let mut class = start_class;
        loop {
            used[edge_idx] = true;
            chain.push(edges[edge_idx]);
            let edge = &edges[edge_idx];
            let next_class = if edge.w0 == class { edge.w1 } else { edge.w0 };
            class = next_class;
            if breaker.contains(&class) {
                break;
            }
            let next = incident[&class].iter().copied().find(|&i| !used[i]);
            match next {
                Some(i) => edge_idx = i,
                None => break, // closed the loop
            }
        }
        let endpoints = if chain.len() >= 3 && class == start_class && !breaker.contains(&class) {
            Vec::new() // closed loop
        } else {
            vec![start_class, class]
        };
        Seam { edges: chain, endpoints }
    };

    // open chains first, starting from breakers
    for &w in &breaker {
        loop {
            let start = incident[&w].iter().copied().find(|&i| !used[i]);
            match start {
                Some(i) => seams.push(walk(i, w, &mut used)),
                None => break,
            }
        }
    }

    // leftovers are closed loops
    for i in 0..edges.len() {
        if !used[i] {
            seams.push(walk(i, edges[i].w0, &mut used));
        }
    }

    seams
}

/// Cluster seams by unordered chart pair.
///
/// Disconnecting seams sharing a chart pair are grouped into one cluster;
/// self seams each become a singleton cluster.
pub fn cluster_by_chart_pair(mesh: &Mesh, seams: Vec<Seam>) -> Vec<ClusteredSeam> {
    let mut grouped: BTreeMap<(ChartId, ChartId), Vec<Seam>> = BTreeMap::new();
    let mut clusters = Vec::new();

    for seam in seams {
        let (a, b) = seam.chart_pair(mesh);
        if a == b {
            clusters.push(ClusteredSeam { seams: vec![seam] });
        } else {
            grouped.entry((a, b)).or_default().push(seam);
        }
    }
    for seams in grouped.into_values() {
        clusters.push(ClusteredSeam { seams });
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::fixtures::{split_grid, split_square};
    use crate::graph::ChartGraph;

    #[test]
    fn test_extract_single_seam() {
        let mut mesh = split_square();
        ChartGraph::build(&mut mesh);
        let seams = extract_seams(&mesh);
        assert_eq!(seams.len(), 1);
        assert_eq!(seams[0].edges.len(), 1);
        assert_eq!(seams[0].endpoints.len(), 2);
    }

    #[test]
    fn test_extract_grid_seam_chain() {
        let mut mesh = split_grid(4);
        ChartGraph::build(&mut mesh);
        let seams = extract_seams(&mesh);
        assert_eq!(seams.len(), 1);
        assert_eq!(seams[0].edges.len(), 4);
        assert_eq!(seams[0].endpoints.len(), 2);
        assert!((seams[0].length_3d(&mesh) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_cluster_endpoints() {
        let mut mesh = split_grid(4);
        ChartGraph::build(&mut mesh);
        let clusters = cluster_by_chart_pair(&mesh, extract_seams(&mesh));
        assert_eq!(clusters.len(), 1);
        let endpoints = clusters[0].endpoints();
        assert_eq!(endpoints.len(), 2);
        assert!(!clusters[0].is_self(&mesh));
    }

    #[test]
    fn test_extract_uv_sides_match_by_class() {
        let mut mesh = split_grid(4);
        ChartGraph::build(&mut mesh);
        let clusters = cluster_by_chart_pair(&mesh, extract_seams(&mesh));
        let (a, _b) = clusters[0].chart_pair(&mesh);
        let (pa, pb) = clusters[0].extract_uv_coordinates(&mesh, a);
        assert_eq!(pa.len(), pb.len());
        assert_eq!(pa.len(), 2 * clusters[0].num_edges());
        // the grid fixture translates chart 1 by (n + 2, 0) in UV
        for (qa, qb) in pa.iter().zip(&pb) {
            assert!((qb.x - qa.x - 6.0).abs() < 1e-12);
            assert!((qb.y - qa.y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_reduce_forward_and_backward() {
        let mut mesh = split_grid(4);
        ChartGraph::build(&mut mesh);
        let clusters = cluster_by_chart_pair(&mesh, extract_seams(&mesh));
        let full = &clusters[0];
        let total = full.length_3d(&mesh);

        let fwd = full.reduced(&mesh, total / 2.0, false);
        let bwd = full.reduced(&mesh, total / 2.0, true);
        assert_eq!(fwd.num_edges(), 2);
        assert_eq!(bwd.num_edges(), 2);
        assert_eq!(fwd.seams[0].endpoints.len(), 2);
        assert_eq!(bwd.seams[0].endpoints.len(), 2);

        // forward keeps the head of the chain, backward the tail
        let first = full.seams[0].edges[0].a;
        assert_eq!(fwd.seams[0].edges[0].a, first);
        let last = full.seams[0].edges[3].a;
        assert_eq!(bwd.seams[0].edges[1].a, last);
    }
}
