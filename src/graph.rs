//! Chart model: the atlas as a mutable graph of face groups.
//!
//! A [`Chart`] is a maximal connected set of faces mapped into one UV-atlas
//! region. Charts are stored in a [`ChartGraph`] arena keyed by stable
//! [`ChartId`]s; adjacency is a symmetric set of ids rather than shared
//! references, so merges never invalidate outstanding handles.

use std::collections::{BTreeMap, BTreeSet};

use crate::mesh::Mesh;

/// Stable identifier of a chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChartId(u32);

impl ChartId {
    /// Create a chart id from its raw value.
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw id value (the per-face label stored in the mesh).
    #[inline]
    pub fn to_u32(self) -> u32 {
        self.0
    }
}

/// A group of faces sharing one UV-atlas region.
///
/// Cached aggregates (UV area, 3D area, UV border length) are refreshed
/// explicitly after a merge mutates the parameterization.
#[derive(Debug, Clone)]
pub struct Chart {
    id: ChartId,
    faces: Vec<usize>,
    adj: BTreeSet<ChartId>,
    area_uv: f64,
    area_3d: f64,
    border_uv: f64,
}

impl Chart {
    fn new(id: ChartId) -> Self {
        Self {
            id,
            faces: Vec::new(),
            adj: BTreeSet::new(),
            area_uv: 0.0,
            area_3d: 0.0,
            border_uv: 0.0,
        }
    }

    /// The chart's id.
    #[inline]
    pub fn id(&self) -> ChartId {
        self.id
    }

    /// Faces owned by this chart.
    #[inline]
    pub fn faces(&self) -> &[usize] {
        &self.faces
    }

    /// Number of faces.
    #[inline]
    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    /// Ids of adjacent charts.
    #[inline]
    pub fn adjacent(&self) -> &BTreeSet<ChartId> {
        &self.adj
    }

    /// Cached total UV area (absolute).
    #[inline]
    pub fn area_uv(&self) -> f64 {
        self.area_uv
    }

    /// Cached total 3D area.
    #[inline]
    pub fn area_3d(&self) -> f64 {
        self.area_3d
    }

    /// Cached UV border length (perimeter in texture space).
    #[inline]
    pub fn border_uv(&self) -> f64 {
        self.border_uv
    }

    /// Recompute the cached aggregates from the current mesh state.
    pub fn refresh(&mut self, mesh: &Mesh) {
        self.area_uv = 0.0;
        self.area_3d = 0.0;
        self.border_uv = 0.0;
        for &f in &self.faces {
            self.area_uv += mesh.face_area_uv_signed(f).abs();
            self.area_3d += mesh.face_area_3d(f);
            for e in 0..3 {
                if mesh.is_uv_border(f, e) {
                    self.border_uv += mesh.uv_edge_length(f, e);
                }
            }
        }
    }
}

/// Arena of live charts, keyed by [`ChartId`].
///
/// Invariants: every mesh face belongs to exactly one live chart, and
/// adjacency is symmetric.
#[derive(Debug, Clone)]
pub struct ChartGraph {
    charts: BTreeMap<ChartId, Chart>,
}

impl ChartGraph {
    /// Decompose the labelled mesh into connected same-label regions.
    ///
    /// Each connected region becomes one chart with a fresh sequential id,
    /// and the mesh face labels are rewritten to those ids. Adjacency is
    /// derived from the 3D topology: two charts are adjacent when some pair
    /// of their faces shares a 3D edge across a UV border.
    pub fn build(mesh: &mut Mesh) -> Self {
        let n = mesh.num_faces();
        let mut region = vec![u32::MAX; n];
        let mut next_id = 0u32;

        // connected components over UV adjacency, restricted to equal labels
        for seed in 0..n {
            if region[seed] != u32::MAX {
                continue;
            }
            let label = mesh.face_chart(seed);
            let id = next_id;
            next_id += 1;

            let mut stack = vec![seed];
            region[seed] = id;
            while let Some(f) = stack.pop() {
                for e in 0..3 {
                    if let Some(opp) = mesh.ff(f, e) {
                        if region[opp.face] == u32::MAX && mesh.face_chart(opp.face) == label {
                            region[opp.face] = id;
                            stack.push(opp.face);
                        }
                    }
                }
            }
        }

        let mut charts: BTreeMap<ChartId, Chart> = BTreeMap::new();
        for f in 0..n {
            let id = ChartId::new(region[f]);
            mesh.set_face_chart(f, id.to_u32());
            charts.entry(id).or_insert_with(|| Chart::new(id)).faces.push(f);
        }

        // adjacency across seams
        for f in 0..n {
            for e in 0..3 {
                if !mesh.is_uv_border(f, e) {
                    continue;
                }
                if let Some(opp) = mesh.ff3d(f, e) {
                    let a = ChartId::new(mesh.face_chart(f));
                    let b = ChartId::new(mesh.face_chart(opp.face));
                    if a != b {
                        if let Some(c) = charts.get_mut(&a) {
                            c.adj.insert(b);
                        }
                        if let Some(c) = charts.get_mut(&b) {
                            c.adj.insert(a);
                        }
                    }
                }
            }
        }

        for chart in charts.values_mut() {
            chart.refresh(mesh);
        }

        Self { charts }
    }

    /// Number of live charts.
    #[inline]
    pub fn num_charts(&self) -> usize {
        self.charts.len()
    }

    /// Look up a chart by id.
    #[inline]
    pub fn chart(&self, id: ChartId) -> &Chart {
        &self.charts[&id]
    }

    /// Look up a chart mutably.
    #[inline]
    pub fn chart_mut(&mut self, id: ChartId) -> &mut Chart {
        self.charts.get_mut(&id).expect("stale chart id")
    }

    /// Whether a chart is still live.
    #[inline]
    pub fn contains(&self, id: ChartId) -> bool {
        self.charts.contains_key(&id)
    }

    /// Iterate over live charts.
    pub fn charts(&self) -> impl Iterator<Item = &Chart> {
        self.charts.values()
    }

    /// Ids of live charts.
    pub fn chart_ids(&self) -> impl Iterator<Item = ChartId> + '_ {
        self.charts.keys().copied()
    }

    /// Absorb chart `b` into chart `a`.
    ///
    /// Relabels `b`'s faces, appends them to `a`, unions adjacency (fixing
    /// up the neighbors' sets), removes `b` from the arena and refreshes
    /// `a`'s caches.
    pub fn merge(&mut self, a: ChartId, b: ChartId, mesh: &mut Mesh) {
        assert_ne!(a, b, "cannot merge a chart into itself");

        let chart_b = self.charts.remove(&b).expect("stale chart id");
        for &f in &chart_b.faces {
            mesh.set_face_chart(f, a.to_u32());
        }

        let chart_a = self.charts.get_mut(&a).expect("stale chart id");
        chart_a.faces.extend_from_slice(&chart_b.faces);
        chart_a.adj.remove(&b);

        let neighbors: Vec<ChartId> = chart_b.adj.iter().copied().filter(|&c| c != a).collect();
        for c in &neighbors {
            self.charts.get_mut(&a).expect("stale chart id").adj.insert(*c);
            let nc = self.charts.get_mut(c).expect("stale chart id");
            nc.adj.remove(&b);
            nc.adj.insert(a);
        }

        self.charts.get_mut(&a).expect("stale chart id").refresh(mesh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::fixtures::{split_grid, split_square};

    #[test]
    fn test_build_finds_charts() {
        let mut mesh = split_square();
        let graph = ChartGraph::build(&mut mesh);
        assert_eq!(graph.num_charts(), 2);

        // every face in exactly one chart
        let total: usize = graph.charts().map(|c| c.num_faces()).sum();
        assert_eq!(total, mesh.num_faces());

        // adjacency is symmetric
        for chart in graph.charts() {
            for &other in chart.adjacent() {
                assert!(graph.chart(other).adjacent().contains(&chart.id()));
            }
        }
    }

    #[test]
    fn test_chart_caches() {
        let mut mesh = split_square();
        let graph = ChartGraph::build(&mut mesh);
        for chart in graph.charts() {
            assert!((chart.area_uv() - 0.5).abs() < 1e-12);
            assert!((chart.area_3d() - 0.5).abs() < 1e-12);
            // 1 + 1 + sqrt(2)
            assert!((chart.border_uv() - (2.0 + 2.0_f64.sqrt())).abs() < 1e-12);
        }
    }

    #[test]
    fn test_merge_unions_adjacency() {
        let mut mesh = split_grid(4);
        let mut graph = ChartGraph::build(&mut mesh);
        assert_eq!(graph.num_charts(), 2);

        let ids: Vec<ChartId> = graph.chart_ids().collect();
        graph.merge(ids[0], ids[1], &mut mesh);

        assert_eq!(graph.num_charts(), 1);
        let merged = graph.chart(ids[0]);
        assert_eq!(merged.num_faces(), 32);
        assert!(merged.adjacent().is_empty());
        for f in 0..mesh.num_faces() {
            assert_eq!(mesh.face_chart(f), ids[0].to_u32());
        }
    }

    #[test]
    fn test_disconnected_same_label_regions_split() {
        // two islands that carry the same input label must become two charts
        use nalgebra::{Point2, Point3};
        let positions = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(5.0, 0.0, 0.0),
            Point3::new(6.0, 0.0, 0.0),
            Point3::new(5.0, 1.0, 0.0),
        ];
        let uvs = vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(0.0, 1.0),
            Point2::new(5.0, 0.0),
            Point2::new(6.0, 0.0),
            Point2::new(5.0, 1.0),
        ];
        let faces = vec![[0, 1, 2], [3, 4, 5]];
        let mut mesh = crate::mesh::Mesh::from_charts(positions, uvs, faces, vec![7, 7]).unwrap();
        let graph = ChartGraph::build(&mut mesh);
        assert_eq!(graph.num_charts(), 2);
    }
}
