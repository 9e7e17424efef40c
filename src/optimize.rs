//! Greedy seam-merge driver.
//!
//! The driver keeps a min-cost priority queue of seam clusters with lazy
//! invalidation: entries are compared against a live cost table on pop and
//! stale ones are discarded. Each attempt is a transaction. The moving chart
//! is rigidly aligned, seam vertex copies are welded, a bounded optimization
//! area around the weld is re-relaxed, and a pipeline of distortion and
//! overlap checks decides between commit and an exact rollback to the
//! pre-attempt snapshot.
//!
//! Rejected clusters are never discarded: they are re-queued at infinite
//! cost with an escalating penalty, so a later merge elsewhere can still
//! trigger a useful re-evaluation of their neighborhood.

use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};

use nalgebra::Point2;

use crate::arap::{self, ArapOptions};
use crate::error::Result;
use crate::graph::{ChartGraph, ChartId};
use crate::intersection::{Segment, SegmentGrid};
use crate::matching::{matching_error_avg, rigid_align, RigidMatch};
use crate::mesh::{HalfEdgeRef, Mesh};
use crate::seam::{self, ClusteredSeam};
use crate::shell::{flatten_face, Shell};

/// Outcome of one merge attempt's validation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckStatus {
    /// All checks passed; the merge was committed.
    Pass,
    /// The optimized area increases its folded UV area.
    FailLocalOverlap,
    /// The fixed borders of the two charts already cross before optimizing.
    FailGlobalOverlapBefore,
    /// The optimized border self-intersects or crosses the merged charts'
    /// fixed geometry.
    FailGlobalOverlapAfterOpt,
    /// The merged charts cross each other outside the optimization area.
    FailGlobalOverlapAfterBnd,
    /// Overlap persisted after every fixable-vertex retry was exhausted.
    FailGlobalOverlapUnfixable,
    /// The optimized patch exceeds the local distortion tolerance.
    FailDistortionLocal,
    /// The merge would push atlas-wide distortion past its bound.
    FailDistortionGlobal,
    /// The optimization area is not a usable solver domain.
    FailTopology,
    /// The sparse factorization or solve failed.
    FailNumericalError,
}

/// Configuration of a defragmentation run.
#[derive(Debug, Clone)]
pub struct Parameters {
    /// Reject a match whose average residual exceeds this multiple of the
    /// average UV length of the seam's two sides.
    pub matching_threshold: f64,
    /// A seam shorter than this fraction of both charts' borders is not
    /// worth merging.
    pub boundary_tolerance: f64,
    /// Upper bound on the optimized patch's average distortion.
    pub local_distortion_tolerance: f64,
    /// Upper bound on the atlas-wide distortion ratio after a merge.
    pub global_distortion_threshold: f64,
    /// Expansion factor for the optimization area around the weld.
    pub offset_factor: f64,
    /// Fraction of a seam kept when retrying with a shortened match.
    pub reduction_factor: f64,
    /// Penalty growth applied to a cluster after each rejection.
    pub penalty_multiplier: f64,
    /// Exponent of the border-to-seam ratio in the cost formula.
    pub seam_length_exponent: f64,
    /// Whether infeasible matches may retry with a shortened seam.
    pub seam_reduction: bool,
    /// Whether island charts bypass the boundary-length feasibility gate.
    pub island_bypass: bool,
    /// Wall-clock budget for the whole run.
    pub time_limit: Option<Duration>,
    /// Stop once this fraction of the initial UV border length has been
    /// removed (zero runs to exhaustion).
    pub border_reduction_target: f64,
    /// Options forwarded to the local relaxation solver.
    pub arap: ArapOptions,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            matching_threshold: 2.0,
            boundary_tolerance: 0.2,
            local_distortion_tolerance: 0.5,
            global_distortion_threshold: 0.025,
            offset_factor: 5.0,
            reduction_factor: 0.5,
            penalty_multiplier: 2.0,
            seam_length_exponent: 1.0,
            seam_reduction: true,
            island_bypass: true,
            time_limit: None,
            border_reduction_target: 0.0,
            arap: ArapOptions::default(),
        }
    }
}

impl Parameters {
    /// Set the matching-error threshold.
    pub fn with_matching_threshold(mut self, t: f64) -> Self {
        self.matching_threshold = t;
        self
    }

    /// Set the boundary-length feasibility tolerance.
    pub fn with_boundary_tolerance(mut self, t: f64) -> Self {
        self.boundary_tolerance = t;
        self
    }

    /// Set the local distortion tolerance.
    pub fn with_local_distortion_tolerance(mut self, t: f64) -> Self {
        self.local_distortion_tolerance = t;
        self
    }

    /// Set the global distortion threshold.
    pub fn with_global_distortion_threshold(mut self, t: f64) -> Self {
        self.global_distortion_threshold = t;
        self
    }

    /// Set the optimization-area expansion factor.
    pub fn with_offset_factor(mut self, f: f64) -> Self {
        self.offset_factor = f;
        self
    }

    /// Set the wall-clock time limit.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Set the border-reduction stopping target.
    pub fn with_border_reduction_target(mut self, t: f64) -> Self {
        self.border_reduction_target = t;
        self
    }

    /// Enable or disable shortened-seam retries.
    pub fn with_seam_reduction(mut self, enabled: bool) -> Self {
        self.seam_reduction = enabled;
        self
    }

    /// Enable or disable the island boundary-tolerance bypass.
    pub fn with_island_bypass(mut self, enabled: bool) -> Self {
        self.island_bypass = enabled;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for values outside their meaningful ranges.
    pub fn validate(&self) -> Result<()> {
        use crate::error::DefragError;
        if !(self.matching_threshold > 0.0) {
            return Err(DefragError::invalid_param(
                "matching_threshold",
                self.matching_threshold,
                "must be positive",
            ));
        }
        if !(self.offset_factor > 0.0) {
            return Err(DefragError::invalid_param(
                "offset_factor",
                self.offset_factor,
                "must be positive",
            ));
        }
        if !(self.reduction_factor > 0.0 && self.reduction_factor <= 1.0) {
            return Err(DefragError::invalid_param(
                "reduction_factor",
                self.reduction_factor,
                "must be in (0, 1]",
            ));
        }
        if !(self.penalty_multiplier >= 1.0) {
            return Err(DefragError::invalid_param(
                "penalty_multiplier",
                self.penalty_multiplier,
                "must be at least 1",
            ));
        }
        if !(0.0..1.0).contains(&self.border_reduction_target) {
            return Err(DefragError::invalid_param(
                "border_reduction_target",
                self.border_reduction_target,
                "must be in [0, 1)",
            ));
        }
        Ok(())
    }
}

/// Execution statistics of a run, intended for logging.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Merge attempts made.
    pub attempts: usize,
    /// Attempts committed.
    pub accepted: usize,
    /// Attempts rolled back.
    pub rejected: usize,
    /// Rejection counts per failure kind.
    pub rejections: HashMap<CheckStatus, usize>,
    /// Charts before the run.
    pub initial_charts: usize,
    /// Charts after the run.
    pub final_charts: usize,
    /// Total UV border length before the run.
    pub initial_border_length: f64,
    /// Total UV border length after the run.
    pub final_border_length: f64,
    /// Final atlas-wide distortion ratio.
    pub distortion: f64,
    /// Time spent computing costs.
    pub cost_time: Duration,
    /// Time spent in the local solver.
    pub solve_time: Duration,
    /// Time spent in validity checks.
    pub check_time: Duration,
    /// Whole-run wall time.
    pub total_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct ClusterId(u64);

/// Queue entry; reversed ordering turns [`BinaryHeap`] into a min-heap.
#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    cost: f64,
    id: ClusterId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.id == other.id
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Feasibility of a candidate at cost-computation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feasibility {
    Feasible,
    ZeroArea,
    UnfeasibleBoundary,
    UnfeasibleMatching,
}

#[derive(Debug, Clone)]
struct CostInfo {
    cost: f64,
    feasibility: Feasibility,
    transform: RigidMatch,
    /// Shortened cluster to attempt instead of the full one.
    reduced: Option<ClusteredSeam>,
}

impl CostInfo {
    fn infeasible(feasibility: Feasibility) -> Self {
        Self {
            cost: f64::INFINITY,
            feasibility,
            transform: RigidMatch::identity(),
            reduced: None,
        }
    }
}

/// Max-heap entry for the budgeted area expansion.
#[derive(Debug, Clone, Copy)]
struct BudgetEntry {
    remaining: f64,
    vertex: usize,
}

impl PartialEq for BudgetEntry {
    fn eq(&self, other: &Self) -> bool {
        self.remaining == other.remaining && self.vertex == other.vertex
    }
}
impl Eq for BudgetEntry {}
impl PartialOrd for BudgetEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for BudgetEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.remaining
            .partial_cmp(&other.remaining)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| other.vertex.cmp(&self.vertex))
    }
}

/// Undo record of one merge attempt.
///
/// Rollback restores exact pre-attempt vertex positions, face corners and
/// face-face links; partial restores would poison later cost computations.
struct SeamData {
    uv_snapshot: Vec<(usize, Point2<f64>)>,
    corner_snapshot: Vec<(usize, usize, usize)>,
    ff_snapshot: Vec<(usize, usize, Option<HalfEdgeRef>)>,
}

impl SeamData {
    fn rollback(&self, mesh: &mut Mesh) {
        for &(f, c, v) in &self.corner_snapshot {
            mesh.set_face_vertex(f, c, v);
        }
        for &(f, e, opp) in &self.ff_snapshot {
            mesh.set_ff(f, e, opp);
        }
        for &(v, uv) in &self.uv_snapshot {
            mesh.set_uv(v, uv);
        }
    }
}

struct AttemptOutcome {
    pre_num: f64,
    post_num: f64,
}

/// Whole-run optimization state.
struct AlgoState {
    clusters: HashMap<ClusterId, ClusteredSeam>,
    costs: HashMap<ClusterId, CostInfo>,
    penalties: HashMap<ClusterId, f64>,
    queue: BinaryHeap<QueueEntry>,
    chart_clusters: HashMap<ChartId, BTreeSet<ClusterId>>,
    endpoint_clusters: HashMap<usize, BTreeSet<ClusterId>>,
    cluster_charts: HashMap<ClusterId, (ChartId, ChartId)>,
    cluster_endpoints: HashMap<ClusterId, BTreeSet<usize>>,
    next_id: u64,
    /// Atlas distortion accumulators (energy times area, and area).
    arap_num: f64,
    arap_denom: f64,
    /// Global factor mapping 3D lengths into UV units.
    scale: f64,
    border_length: f64,
}

impl AlgoState {
    fn new(mesh: &Mesh, graph: &ChartGraph) -> Self {
        let mut area_uv = 0.0;
        let mut area_3d = 0.0;
        for f in 0..mesh.num_faces() {
            area_uv += mesh.face_area_uv_signed(f).abs();
            area_3d += mesh.face_area_3d(f);
        }
        let scale = if area_3d > 0.0 { (area_uv / area_3d).sqrt() } else { 1.0 };

        let mut arap_num = 0.0;
        let mut arap_denom = 0.0;
        for f in 0..mesh.num_faces() {
            let (n, d) = arap::mesh_face_distortion(mesh, f, scale);
            arap_num += n;
            arap_denom += d;
        }

        let border_length = graph.charts().map(|c| c.border_uv()).sum();

        Self {
            clusters: HashMap::new(),
            costs: HashMap::new(),
            penalties: HashMap::new(),
            queue: BinaryHeap::new(),
            chart_clusters: HashMap::new(),
            endpoint_clusters: HashMap::new(),
            cluster_charts: HashMap::new(),
            cluster_endpoints: HashMap::new(),
            next_id: 0,
            arap_num,
            arap_denom,
            scale,
            border_length,
        }
    }

    fn distortion_ratio(&self) -> f64 {
        if self.arap_denom > 0.0 {
            self.arap_num / self.arap_denom
        } else {
            0.0
        }
    }

    fn insert_cluster(
        &mut self,
        mesh: &Mesh,
        graph: &ChartGraph,
        params: &Parameters,
        cluster: ClusteredSeam,
        penalty: f64,
    ) -> ClusterId {
        let id = ClusterId(self.next_id);
        self.next_id += 1;

        let info = compute_cost(mesh, graph, params, &cluster, penalty, true);
        let (a, b) = cluster.chart_pair(mesh);
        let endpoints = cluster.endpoints();

        self.chart_clusters.entry(a).or_default().insert(id);
        self.chart_clusters.entry(b).or_default().insert(id);
        for &w in &endpoints {
            self.endpoint_clusters.entry(w).or_default().insert(id);
        }
        self.cluster_charts.insert(id, (a, b));
        self.cluster_endpoints.insert(id, endpoints);
        self.queue.push(QueueEntry { cost: info.cost, id });
        self.costs.insert(id, info);
        self.penalties.insert(id, penalty);
        self.clusters.insert(id, cluster);
        id
    }

    /// Remove a cluster from every index (queue entries go stale instead).
    fn remove_cluster(&mut self, id: ClusterId) -> Option<(ClusteredSeam, f64)> {
        let cluster = self.clusters.remove(&id)?;
        self.costs.remove(&id);
        let penalty = self.penalties.remove(&id).unwrap_or(1.0);
        if let Some((a, b)) = self.cluster_charts.remove(&id) {
            if let Some(set) = self.chart_clusters.get_mut(&a) {
                set.remove(&id);
            }
            if let Some(set) = self.chart_clusters.get_mut(&b) {
                set.remove(&id);
            }
        }
        if let Some(endpoints) = self.cluster_endpoints.remove(&id) {
            for w in endpoints {
                if let Some(set) = self.endpoint_clusters.get_mut(&w) {
                    set.remove(&id);
                }
            }
        }
        Some((cluster, penalty))
    }

    /// Rebuild the heap when stale entries dominate it.
    fn purge_queue(&mut self) {
        if self.queue.len() > 5 * self.costs.len() + 16 {
            self.queue = self
                .costs
                .iter()
                .map(|(&id, info)| QueueEntry { cost: info.cost, id })
                .collect();
        }
    }
}

/// Evaluate the cost and feasibility of merging along a cluster.
fn compute_cost(
    mesh: &Mesh,
    graph: &ChartGraph,
    params: &Parameters,
    cluster: &ClusteredSeam,
    penalty: f64,
    allow_reduce: bool,
) -> CostInfo {
    let (ca, cb) = cluster.chart_pair(mesh);
    let self_seam = ca == cb;

    let area_a = graph.chart(ca).area_uv();
    let area_b = graph.chart(cb).area_uv();
    if area_a.min(area_b) <= 1e-12 {
        return CostInfo::infeasible(Feasibility::ZeroArea);
    }

    let lengths = cluster.uv_length_by_chart(mesh);
    let (seam_a, seam_b) = if self_seam {
        let total = lengths.get(&ca).copied().unwrap_or(0.0);
        (total / 2.0, total / 2.0)
    } else {
        (
            lengths.get(&ca).copied().unwrap_or(0.0),
            lengths.get(&cb).copied().unwrap_or(0.0),
        )
    };
    if seam_a <= 0.0 || seam_b <= 0.0 {
        return CostInfo::infeasible(Feasibility::ZeroArea);
    }

    let border_a = graph.chart(ca).border_uv();
    let border_b = graph.chart(cb).border_uv();
    let island = params.island_bypass
        && (graph.chart(ca).adjacent().len() <= 1 || graph.chart(cb).adjacent().len() <= 1);
    if !self_seam
        && !island
        && seam_a < params.boundary_tolerance * border_a
        && seam_b < params.boundary_tolerance * border_b
    {
        return CostInfo::infeasible(Feasibility::UnfeasibleBoundary);
    }

    let (pa, pb) = cluster.extract_uv_coordinates(mesh, ca);
    let transform = if self_seam { RigidMatch::identity() } else { rigid_align(&pb, &pa) };
    let avg_err = matching_error_avg(&transform, &pb, &pa);
    let seam_len_avg = (seam_a + seam_b) / 2.0;

    if avg_err > params.matching_threshold * seam_len_avg {
        if allow_reduce && params.seam_reduction {
            let target = cluster.length_3d(mesh) * params.reduction_factor;
            let mut best: Option<CostInfo> = None;
            for backward in [false, true] {
                let short = cluster.reduced(mesh, target, backward);
                if short.num_edges() == 0 || short.num_edges() == cluster.num_edges() {
                    continue;
                }
                let info = compute_cost(mesh, graph, params, &short, penalty, false);
                if info.feasibility == Feasibility::Feasible
                    && best.as_ref().map_or(true, |b| info.cost < b.cost)
                {
                    best = Some(CostInfo { reduced: Some(short), ..info });
                }
            }
            if let Some(info) = best {
                return info;
            }
        }
        return CostInfo::infeasible(Feasibility::UnfeasibleMatching);
    }

    let ratio = (border_a / seam_a).min(border_b / seam_b);
    let mut cost =
        avg_err * ratio.powf(params.seam_length_exponent) * area_a.min(area_b) * penalty;
    // a rejected perfect seam must still feel its penalty
    if cost == 0.0 && penalty > 1.0 {
        cost = penalty;
    }

    CostInfo {
        cost,
        feasibility: Feasibility::Feasible,
        transform,
        reduced: None,
    }
}

/// Distortion of one face evaluated at explicit UV corners.
fn face_distortion_at(mesh: &Mesh, f: usize, uvs: [Point2<f64>; 3], scale: f64) -> (f64, f64) {
    let area = mesh.face_area_3d(f) * scale * scale;
    if area <= 0.0 {
        return (0.0, 0.0);
    }
    let mut target = flatten_face(mesh, f);
    for p in target.iter_mut() {
        p.coords *= scale;
    }
    (arap::face_energy(target, uvs) * area, area)
}

fn signed_area(uvs: [Point2<f64>; 3]) -> f64 {
    let (a, b, c) = (uvs[0], uvs[1], uvs[2]);
    ((b - a).x * (c - a).y - (b - a).y * (c - a).x) / 2.0
}

/// Fraction of folded (negatively oriented) UV area among the given faces.
fn fold_ratio(areas: impl Iterator<Item = f64>) -> f64 {
    let mut neg = 0.0;
    let mut total = 0.0;
    for a in areas {
        if a < 0.0 {
            neg += -a;
        }
        total += a.abs();
    }
    if total > 0.0 {
        neg / total
    } else {
        0.0
    }
}

/// UV border segments of the given faces, skipping faces in `exclude`.
fn fixed_border_segments(
    mesh: &Mesh,
    faces: &[usize],
    exclude: &HashSet<usize>,
) -> Vec<Segment> {
    let mut segs = Vec::new();
    for &f in faces {
        if exclude.contains(&f) {
            continue;
        }
        for e in 0..3 {
            if mesh.is_uv_border(f, e) {
                let (v0, v1) = mesh.edge_vertices(f, e);
                segs.push(Segment::new(mesh.uv(v0), mesh.uv(v1)));
            }
        }
    }
    segs
}

/// Every UV edge segment of the given faces, skipping faces in `exclude`.
fn chart_segments(mesh: &Mesh, faces: &[usize], exclude: &HashSet<usize>) -> Vec<Segment> {
    let mut segs = Vec::new();
    for &f in faces {
        if exclude.contains(&f) {
            continue;
        }
        for e in 0..3 {
            let (v0, v1) = mesh.edge_vertices(f, e);
            segs.push(Segment::new(mesh.uv(v0), mesh.uv(v1)));
        }
    }
    segs
}

/// Outline of the optimization area: its segments plus their vertex pairs.
fn area_border(mesh: &Mesh, area: &[usize], area_set: &HashSet<usize>) -> (Vec<Segment>, Vec<(usize, usize)>) {
    let mut segs = Vec::new();
    let mut verts = Vec::new();
    for &f in area {
        for e in 0..3 {
            let outside = match mesh.ff(f, e) {
                None => true,
                Some(opp) => !area_set.contains(&opp.face),
            };
            if outside {
                let (v0, v1) = mesh.edge_vertices(f, e);
                segs.push(Segment::new(mesh.uv(v0), mesh.uv(v1)));
                verts.push((v0, v1));
            }
        }
    }
    (segs, verts)
}

fn bbox_of_faces(mesh: &Mesh, faces: &[usize]) -> (Point2<f64>, Point2<f64>) {
    let mut lo = Point2::new(f64::INFINITY, f64::INFINITY);
    let mut hi = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
    for &f in faces {
        for p in mesh.face_uvs(f) {
            lo.x = lo.x.min(p.x);
            lo.y = lo.y.min(p.y);
            hi.x = hi.x.max(p.x);
            hi.y = hi.y.max(p.y);
        }
    }
    (lo, hi)
}

fn segment_in_bbox(s: &Segment, lo: Point2<f64>, hi: Point2<f64>) -> bool {
    let sx0 = s.a.x.min(s.b.x);
    let sx1 = s.a.x.max(s.b.x);
    let sy0 = s.a.y.min(s.b.y);
    let sy1 = s.a.y.max(s.b.y);
    sx0 <= hi.x && lo.x <= sx1 && sy0 <= hi.y && lo.y <= sy1
}

struct CheckOutcome {
    status: CheckStatus,
    /// Mesh vertices on offending area-border edges, for the freeze retry.
    offenders: Vec<usize>,
    post_num: f64,
}

/// The post-optimization validation pipeline, in order: global distortion,
/// local distortion, fold ratio, optimized-border self-intersection,
/// optimized border against the merged charts' fixed geometry, and the
/// merged pair against each other within the smaller chart's bounding box.
#[allow(clippy::too_many_arguments)]
fn run_checks(
    mesh: &Mesh,
    graph: &ChartGraph,
    state: &AlgoState,
    params: &Parameters,
    ca: ChartId,
    cb: ChartId,
    area: &[usize],
    area_set: &HashSet<usize>,
    final_energy: f64,
    pre_num: f64,
    pre_fold: f64,
) -> CheckOutcome {
    let mut post_num = 0.0;
    for &f in area {
        let (n, _) = arap::mesh_face_distortion(mesh, f, state.scale);
        post_num += n;
    }
    let fail = |status| CheckOutcome { status, offenders: Vec::new(), post_num };

    let new_num = state.arap_num - pre_num + post_num;
    if new_num > params.global_distortion_threshold * state.arap_denom {
        return fail(CheckStatus::FailDistortionGlobal);
    }

    if final_energy > params.local_distortion_tolerance {
        return fail(CheckStatus::FailDistortionLocal);
    }

    let post_fold = fold_ratio(area.iter().map(|&f| mesh.face_area_uv_signed(f)));
    if post_fold > pre_fold + 1e-12 {
        return fail(CheckStatus::FailLocalOverlap);
    }

    let (border_segs, border_verts) = area_border(mesh, area, area_set);
    let border_grid = SegmentGrid::build(&border_segs);
    let overlaps = border_grid.self_intersections();
    if !overlaps.is_empty() {
        let offenders = overlaps
            .iter()
            .flat_map(|&(i, j)| {
                let (a0, a1) = border_verts[i];
                let (b0, b1) = border_verts[j];
                [a0, a1, b0, b1]
            })
            .collect();
        return CheckOutcome {
            status: CheckStatus::FailGlobalOverlapAfterOpt,
            offenders,
            post_num,
        };
    }

    // fixed geometry of the merged charts: every edge outside the area
    let mut fixed_segs = chart_segments(mesh, graph.chart(ca).faces(), area_set);
    if cb != ca {
        fixed_segs.extend(chart_segments(mesh, graph.chart(cb).faces(), area_set));
    }
    if !fixed_segs.is_empty() {
        let crossings = border_grid.cross_intersections(&fixed_segs);
        if !crossings.is_empty() {
            let offenders = crossings
                .iter()
                .flat_map(|&(_, bi)| {
                    let (v0, v1) = border_verts[bi];
                    [v0, v1]
                })
                .collect();
            return CheckOutcome {
                status: CheckStatus::FailGlobalOverlapAfterOpt,
                offenders,
                post_num,
            };
        }
    }

    // the merged pair against each other, away from the optimization area,
    // restricted to the smaller chart's bounding box
    if cb != ca {
        let (small, big) = if graph.chart(ca).area_uv() <= graph.chart(cb).area_uv() {
            (ca, cb)
        } else {
            (cb, ca)
        };
        let (lo, hi) = bbox_of_faces(mesh, graph.chart(small).faces());
        let small_segs = chart_segments(mesh, graph.chart(small).faces(), area_set);
        let big_segs: Vec<Segment> = chart_segments(mesh, graph.chart(big).faces(), area_set)
            .into_iter()
            .filter(|s| segment_in_bbox(s, lo, hi))
            .collect();
        if !small_segs.is_empty() && !big_segs.is_empty() {
            let pair_grid = SegmentGrid::build(&small_segs);
            if !pair_grid.cross_intersections(&big_segs).is_empty() {
                return fail(CheckStatus::FailGlobalOverlapAfterBnd);
            }
        }
    }

    CheckOutcome {
        status: CheckStatus::Pass,
        offenders: Vec::new(),
        post_num,
    }
}

const MAX_FREEZE_RETRIES: usize = 20;

/// Execute one candidate merge as a transaction.
///
/// On any non-[`CheckStatus::Pass`] status the caller must roll back using
/// the returned [`SeamData`].
#[allow(clippy::too_many_arguments)]
fn attempt_merge(
    mesh: &mut Mesh,
    graph: &ChartGraph,
    state: &AlgoState,
    params: &Parameters,
    cluster: &ClusteredSeam,
    transform: &RigidMatch,
    solve_time: &mut Duration,
    check_time: &mut Duration,
) -> (CheckStatus, SeamData, Option<AttemptOutcome>) {
    let (ca, cb) = cluster.chart_pair(mesh);
    let self_seam = ca == cb;

    // snapshot every vertex of both charts
    let mut touched: BTreeSet<usize> = BTreeSet::new();
    for &f in graph.chart(ca).faces() {
        touched.extend(mesh.face(f));
    }
    if !self_seam {
        for &f in graph.chart(cb).faces() {
            touched.extend(mesh.face(f));
        }
    }
    let uv_snapshot: Vec<(usize, Point2<f64>)> =
        touched.iter().map(|&v| (v, mesh.uv(v))).collect();
    let pre_uv: HashMap<usize, Point2<f64>> = uv_snapshot.iter().copied().collect();
    let mut data = SeamData {
        uv_snapshot,
        corner_snapshot: Vec::new(),
        ff_snapshot: Vec::new(),
    };

    // align the moving chart
    if !self_seam {
        let moving: BTreeSet<usize> =
            graph.chart(cb).faces().iter().flat_map(|&f| mesh.face(f)).collect();
        for v in moving {
            mesh.set_uv(v, transform.apply(mesh.uv(v)));
        }
    }

    // weld the seam's duplicate vertices at their centroids
    let mut weld_groups: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for edge in cluster.edges() {
        for half in [edge.a, edge.b] {
            let (v0, v1) = mesh.edge_vertices(half.face, half.edge);
            weld_groups.entry(mesh.weld_class(v0)).or_default().insert(v0);
            weld_groups.entry(mesh.weld_class(v1)).or_default().insert(v1);
        }
    }
    let mut remap: HashMap<usize, usize> = HashMap::new();
    let mut rep_offsets: HashMap<usize, f64> = HashMap::new();
    for verts in weld_groups.values() {
        let rep = *verts.iter().next().unwrap_or(&0);
        let n = verts.len() as f64;
        let mut centroid = Point2::origin();
        for &v in verts {
            centroid.coords += mesh.uv(v).coords / n;
        }
        let mut offset = 0.0f64;
        for &v in verts {
            offset = offset.max((mesh.uv(v) - centroid).norm());
            if v != rep {
                remap.insert(v, rep);
            }
        }
        mesh.set_uv(rep, centroid);
        rep_offsets.insert(rep, offset);
    }
    let merged_faces: Vec<usize> = if self_seam {
        graph.chart(ca).faces().to_vec()
    } else {
        graph
            .chart(ca)
            .faces()
            .iter()
            .chain(graph.chart(cb).faces())
            .copied()
            .collect()
    };
    for &f in &merged_faces {
        let corners = mesh.face(f);
        for (c, &v) in corners.iter().enumerate() {
            if let Some(&rep) = remap.get(&v) {
                data.corner_snapshot.push((f, c, v));
                mesh.set_face_vertex(f, c, rep);
            }
        }
    }
    for edge in cluster.edges() {
        data.ff_snapshot.push((edge.a.face, edge.a.edge, mesh.ff(edge.a.face, edge.a.edge)));
        data.ff_snapshot.push((edge.b.face, edge.b.edge, mesh.ff(edge.b.face, edge.b.edge)));
        mesh.set_ff(edge.a.face, edge.a.edge, Some(edge.b));
        mesh.set_ff(edge.b.face, edge.b.edge, Some(edge.a));
    }

    // budgeted expansion from the welded vertices
    let avg_len: f64 = cluster
        .edges()
        .map(|e| mesh.uv_edge_length(e.a.face, e.a.edge))
        .sum::<f64>()
        / cluster.num_edges() as f64;
    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();
    for &f in &merged_faces {
        let face = mesh.face(f);
        for e in 0..3 {
            adjacency.entry(face[e]).or_default().push(face[(e + 1) % 3]);
            adjacency.entry(face[(e + 1) % 3]).or_default().push(face[e]);
        }
    }
    let mut remaining: HashMap<usize, f64> = HashMap::new();
    let mut heap: BinaryHeap<BudgetEntry> = BinaryHeap::new();
    for (&rep, &offset) in &rep_offsets {
        let budget = params.offset_factor * offset.max(avg_len);
        remaining.insert(rep, budget);
        heap.push(BudgetEntry { remaining: budget, vertex: rep });
    }
    while let Some(entry) = heap.pop() {
        if remaining.get(&entry.vertex).copied().unwrap_or(f64::NEG_INFINITY) > entry.remaining {
            continue;
        }
        if let Some(neighbors) = adjacency.get(&entry.vertex) {
            for &n in neighbors {
                let step = (mesh.uv(n) - mesh.uv(entry.vertex)).norm();
                let rem = entry.remaining - step;
                if rem >= 0.0
                    && rem > remaining.get(&n).copied().unwrap_or(f64::NEG_INFINITY)
                {
                    remaining.insert(n, rem);
                    heap.push(BudgetEntry { remaining: rem, vertex: n });
                }
            }
        }
    }
    let area: Vec<usize> = merged_faces
        .iter()
        .copied()
        .filter(|&f| {
            let face = mesh.face(f);
            face.iter().all(|v| remaining.contains_key(v))
                && (0..3).all(|e| mesh.is_edge_manifold_3d(f, e))
        })
        .collect();
    if area.is_empty() {
        return (CheckStatus::FailTopology, data, None);
    }
    let area_set: HashSet<usize> = area.iter().copied().collect();

    // pre-attempt accounting at the snapshot coordinates
    let orig_corner: HashMap<(usize, usize), usize> =
        data.corner_snapshot.iter().map(|&(f, c, v)| ((f, c), v)).collect();
    let pre_face_uvs = |f: usize| -> [Point2<f64>; 3] {
        let corners = mesh.face(f);
        let mut uvs = [Point2::origin(); 3];
        for c in 0..3 {
            let v = orig_corner.get(&(f, c)).copied().unwrap_or(corners[c]);
            uvs[c] = pre_uv.get(&v).copied().unwrap_or_else(|| mesh.uv(v));
        }
        uvs
    };
    let mut pre_num = 0.0;
    for &f in &area {
        let (n, _) = face_distortion_at(mesh, f, pre_face_uvs(f), state.scale);
        pre_num += n;
    }
    let pre_fold = fold_ratio(area.iter().map(|&f| signed_area(pre_face_uvs(f))));

    // a disconnecting merge cannot fix borders outside the area
    if !self_seam {
        let fixed_a = fixed_border_segments(mesh, graph.chart(ca).faces(), &area_set);
        let fixed_b = fixed_border_segments(mesh, graph.chart(cb).faces(), &area_set);
        if !fixed_a.is_empty() && !fixed_b.is_empty() {
            let grid = SegmentGrid::build(&fixed_a);
            if !grid.cross_intersections(&fixed_b).is_empty() {
                return (CheckStatus::FailGlobalOverlapBefore, data, None);
            }
        }
    }

    let base_shell = match Shell::build(mesh, &area) {
        Some(shell) => shell,
        None => return (CheckStatus::FailTopology, data, None),
    };
    let shell_index: HashMap<usize, usize> = (0..base_shell.num_vertices())
        .map(|v| (base_shell.source_vertex(v), v))
        .collect();

    // the frontier to the rest of the atlas stays fixed
    let mut frontier: BTreeSet<usize> = BTreeSet::new();
    for &f in &merged_faces {
        if !area_set.contains(&f) {
            for v in mesh.face(f) {
                if let Some(&lv) = shell_index.get(&v) {
                    frontier.insert(lv);
                }
            }
        }
    }

    let mut frozen = frontier;
    for retry in 0..MAX_FREEZE_RETRIES {
        let mut shell = base_shell.clone();
        let mut fixed: Vec<usize> = frozen.iter().copied().collect();
        if fixed.len() < 2 {
            match arap::select_fixed_edge(&shell) {
                Some((a, b)) => {
                    if !frozen.contains(&a) {
                        fixed.push(a);
                    }
                    if !frozen.contains(&b) {
                        fixed.push(b);
                    }
                }
                None => return (CheckStatus::FailTopology, data, None),
            }
        }

        let t = Instant::now();
        let info = match arap::solve(&mut shell, &fixed, &params.arap) {
            Ok(info) => info,
            Err(_) => return (CheckStatus::FailNumericalError, data, None),
        };
        *solve_time += t.elapsed();
        shell.copy_back(mesh);

        let t = Instant::now();
        let outcome = run_checks(
            mesh,
            graph,
            state,
            params,
            ca,
            cb,
            &area,
            &area_set,
            info.final_energy,
            pre_num,
            pre_fold,
        );
        *check_time += t.elapsed();

        match outcome.status {
            CheckStatus::Pass => {
                log::debug!(
                    "merge {:?}+{:?}: accepted after {} retries, energy {:.3e} -> {:.3e}",
                    ca,
                    cb,
                    retry,
                    info.initial_energy,
                    info.final_energy
                );
                return (
                    CheckStatus::Pass,
                    data,
                    Some(AttemptOutcome { pre_num, post_num: outcome.post_num }),
                );
            }
            CheckStatus::FailGlobalOverlapAfterOpt => {
                let before = frozen.len();
                for v in &outcome.offenders {
                    if let Some(&lv) = shell_index.get(v) {
                        frozen.insert(lv);
                    }
                }
                if frozen.len() == before {
                    return (CheckStatus::FailGlobalOverlapUnfixable, data, None);
                }
                // retry with the offending border vertices pinned
            }
            status => return (status, data, None),
        }
    }
    (CheckStatus::FailGlobalOverlapUnfixable, data, None)
}

/// Commit an accepted merge: fold charts, refresh accumulators, and rebuild
/// every cluster whose neighborhood changed.
#[allow(clippy::too_many_arguments)]
fn commit_merge(
    mesh: &mut Mesh,
    graph: &mut ChartGraph,
    state: &mut AlgoState,
    params: &Parameters,
    id: ClusterId,
    attempted: &ClusteredSeam,
    ca: ChartId,
    cb: ChartId,
    outcome: AttemptOutcome,
) {
    state.arap_num += outcome.post_num - outcome.pre_num;

    // gather affected clusters while the old chart labels are still live
    let mut affected: BTreeSet<ClusterId> = BTreeSet::new();
    if let Some(set) = state.chart_clusters.get(&ca) {
        affected.extend(set.iter().copied());
    }
    if let Some(set) = state.chart_clusters.get(&cb) {
        affected.extend(set.iter().copied());
    }
    for &w in &attempted.endpoints() {
        if let Some(set) = state.endpoint_clusters.get(&w) {
            affected.extend(set.iter().copied());
        }
    }
    affected.remove(&id);

    let full = state.remove_cluster(id);
    let mut pool: Vec<(seam::Seam, f64)> = Vec::new();
    for other in affected {
        if let Some((cluster, penalty)) = state.remove_cluster(other) {
            for s in cluster.seams {
                pool.push((s, penalty));
            }
        }
    }

    // a reduced merge leaves the unwelded remainder behind as new seams
    if let Some((full_cluster, _)) = full {
        let welded: HashSet<HalfEdgeRef> = attempted.edges().map(|e| e.a).collect();
        let leftover: Vec<seam::SeamEdge> = full_cluster
            .edges()
            .filter(|e| !welded.contains(&e.a))
            .copied()
            .collect();
        if !leftover.is_empty() {
            for s in seam::chain_edges(leftover) {
                pool.push((s, 1.0));
            }
        }
    }

    // fold the charts and refresh the border accumulator
    let border_a_old = graph.chart(ca).border_uv();
    if ca == cb {
        graph.chart_mut(ca).refresh(mesh);
        state.border_length += graph.chart(ca).border_uv() - border_a_old;
    } else {
        let border_b_old = graph.chart(cb).border_uv();
        graph.merge(ca, cb, mesh);
        state.border_length += graph.chart(ca).border_uv() - border_a_old - border_b_old;
    }

    // regroup the pooled seams under the post-merge chart labels
    let mut groups: BTreeMap<(ChartId, ChartId), (Vec<seam::Seam>, f64)> = BTreeMap::new();
    for (s, penalty) in pool {
        let (a, b) = s.chart_pair(mesh);
        if a == b {
            // self seams stay singleton clusters
            state.insert_cluster(mesh, graph, params, ClusteredSeam { seams: vec![s] }, penalty);
        } else {
            let entry = groups.entry((a, b)).or_insert_with(|| (Vec::new(), 1.0));
            entry.0.push(s);
            entry.1 = entry.1.max(penalty);
        }
    }
    for ((_, _), (seams, penalty)) in groups {
        state.insert_cluster(mesh, graph, params, ClusteredSeam { seams }, penalty);
    }
    state.purge_queue();
}

/// Run the defragmentation loop to convergence.
///
/// The mesh and chart graph are mutated in place; the returned [`Stats`]
/// summarize the run for logging.
///
/// # Errors
///
/// Returns an error when the parameters are out of range. Per-candidate
/// failures are not errors; they are counted in the statistics.
pub fn defragment(mesh: &mut Mesh, graph: &mut ChartGraph, params: &Parameters) -> Result<Stats> {
    params.validate()?;
    let start = Instant::now();

    let mut state = AlgoState::new(mesh, graph);
    let mut stats = Stats {
        initial_charts: graph.num_charts(),
        initial_border_length: state.border_length,
        ..Stats::default()
    };

    let t = Instant::now();
    let clusters = seam::cluster_by_chart_pair(mesh, seam::extract_seams(mesh));
    for cluster in clusters {
        state.insert_cluster(mesh, graph, params, cluster, 1.0);
    }
    stats.cost_time += t.elapsed();
    log::info!(
        "defragmentation start: {} charts, {} seam clusters, border {:.4}",
        stats.initial_charts,
        state.clusters.len(),
        state.border_length
    );

    while let Some(entry) = state.queue.pop() {
        if let Some(limit) = params.time_limit {
            if start.elapsed() >= limit {
                log::info!("time limit reached after {} attempts", stats.attempts);
                break;
            }
        }
        if params.border_reduction_target > 0.0 && stats.initial_border_length > 0.0 {
            let reduction =
                1.0 - state.border_length / stats.initial_border_length;
            if reduction >= params.border_reduction_target {
                log::info!("border reduction target reached ({:.1}%)", reduction * 100.0);
                break;
            }
        }

        let Some(info) = state.costs.get(&entry.id) else {
            continue; // cluster merged away
        };
        if entry.cost != info.cost {
            continue; // stale entry
        }
        if !info.cost.is_finite() {
            break; // nothing feasible remains
        }

        let attempted = match &info.reduced {
            Some(short) => short.clone(),
            None => match state.clusters.get(&entry.id) {
                Some(cluster) => cluster.clone(),
                None => continue,
            },
        };
        let transform = info.transform;
        let (ca, cb) = attempted.chart_pair(mesh);

        stats.attempts += 1;
        let (status, data, outcome) = attempt_merge(
            mesh,
            graph,
            &state,
            params,
            &attempted,
            &transform,
            &mut stats.solve_time,
            &mut stats.check_time,
        );

        if let (CheckStatus::Pass, Some(outcome)) = (status, outcome) {
            stats.accepted += 1;
            let t = Instant::now();
            commit_merge(mesh, graph, &mut state, params, entry.id, &attempted, ca, cb, outcome);
            stats.cost_time += t.elapsed();
        } else {
            data.rollback(mesh);
            stats.rejected += 1;
            *stats.rejections.entry(status).or_insert(0) += 1;
            log::debug!("merge {:?}+{:?} rejected: {:?}", ca, cb, status);

            let penalty = state.penalties.entry(entry.id).or_insert(1.0);
            *penalty *= params.penalty_multiplier;
            if let Some(info) = state.costs.get_mut(&entry.id) {
                info.cost = f64::INFINITY;
            }
            state.queue.push(QueueEntry { cost: f64::INFINITY, id: entry.id });
        }
    }

    stats.final_charts = graph.num_charts();
    stats.final_border_length = state.border_length;
    stats.distortion = state.distortion_ratio();
    stats.total_time = start.elapsed();
    log::info!(
        "defragmentation done: {} -> {} charts, border {:.4} -> {:.4}, \
         {} accepted / {} rejected in {:.2?}",
        stats.initial_charts,
        stats.final_charts,
        stats.initial_border_length,
        stats.final_border_length,
        stats.accepted,
        stats.rejected,
        stats.total_time
    );
    for (status, count) in &stats.rejections {
        log::info!("  rejections {:?}: {}", status, count);
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::fixtures::{slit_square, split_grid, split_square};
    use nalgebra::Point3;

    fn clusters_of(mesh: &Mesh) -> Vec<ClusteredSeam> {
        seam::cluster_by_chart_pair(mesh, seam::extract_seams(mesh))
    }

    #[test]
    fn test_cost_zero_for_perfect_seam() {
        let mut mesh = split_square();
        let graph = ChartGraph::build(&mut mesh);
        let clusters = clusters_of(&mesh);
        assert_eq!(clusters.len(), 1);

        let info = compute_cost(&mesh, &graph, &Parameters::default(), &clusters[0], 1.0, true);
        assert_eq!(info.feasibility, Feasibility::Feasible);
        assert!(info.cost < 1e-12);
    }

    #[test]
    fn test_cost_boundary_infeasible() {
        let mut mesh = split_grid(6);
        let graph = ChartGraph::build(&mut mesh);
        let clusters = clusters_of(&mesh);

        // seam length 6, borders 18: a 0.9 tolerance rules the merge out
        // once the island bypass is disabled
        let params = Parameters::default()
            .with_boundary_tolerance(0.9)
            .with_island_bypass(false);
        let info = compute_cost(&mesh, &graph, &params, &clusters[0], 1.0, true);
        assert_eq!(info.feasibility, Feasibility::UnfeasibleBoundary);
        assert!(info.cost.is_infinite());

        // the same charts are islands, so the default bypass keeps them in
        let info = compute_cost(&mesh, &graph, &Parameters::default(), &clusters[0], 1.0, true);
        assert_eq!(info.feasibility, Feasibility::Feasible);
    }

    #[test]
    fn test_cost_bad_matching_rejected_without_reduction() {
        let mut mesh = split_grid(4);
        let graph = ChartGraph::build(&mut mesh);

        // stretch chart 1 so the seam sides no longer match rigidly
        let moving: BTreeSet<usize> = (0..mesh.num_faces())
            .filter(|&f| mesh.face_chart(f) == 1)
            .flat_map(|f| mesh.face(f))
            .collect();
        for v in moving {
            let p = mesh.uv(v);
            mesh.set_uv(v, Point2::new(p.x, p.y * 3.0));
        }

        let params = Parameters::default()
            .with_matching_threshold(0.01)
            .with_seam_reduction(false);
        let clusters = clusters_of(&mesh);
        let info = compute_cost(&mesh, &graph, &params, &clusters[0], 1.0, true);
        assert_eq!(info.feasibility, Feasibility::UnfeasibleMatching);
        assert!(info.cost.is_infinite());
    }

    #[test]
    fn test_matching_gate_scales_with_seam_length() {
        let mut mesh = split_grid(6);
        let graph = ChartGraph::build(&mut mesh);

        // stretch chart 1 along the seam: the rigid fit keeps a residual
        // that is small next to the seam's total length but large next to
        // a single edge
        let moving: BTreeSet<usize> = (0..mesh.num_faces())
            .filter(|&f| mesh.face_chart(f) == 1)
            .flat_map(|f| mesh.face(f))
            .collect();
        for v in moving {
            let p = mesh.uv(v);
            mesh.set_uv(v, Point2::new(p.x, p.y * 1.1));
        }
        let clusters = clusters_of(&mesh);
        let base = Parameters::default().with_seam_reduction(false);

        // avg residual is 0.15; the bound is threshold times the two-sided
        // average seam length 6.3, not times the unit edge length
        let params = base.clone().with_matching_threshold(0.05);
        let info = compute_cost(&mesh, &graph, &params, &clusters[0], 1.0, true);
        assert_eq!(info.feasibility, Feasibility::Feasible);

        let params = base.with_matching_threshold(0.01);
        let info = compute_cost(&mesh, &graph, &params, &clusters[0], 1.0, true);
        assert_eq!(info.feasibility, Feasibility::UnfeasibleMatching);
    }

    #[test]
    fn test_self_seam_skips_boundary_gate() {
        let mut mesh = slit_square();
        let graph = ChartGraph::build(&mut mesh);
        let clusters = clusters_of(&mesh);
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].is_self(&mesh));

        // a tolerance that rules out a chart-pair seam this short must not
        // touch a seam of a chart onto itself
        let params = Parameters::default()
            .with_boundary_tolerance(0.9)
            .with_island_bypass(false);
        let info = compute_cost(&mesh, &graph, &params, &clusters[0], 1.0, true);
        assert_eq!(info.feasibility, Feasibility::Feasible);
    }

    #[test]
    fn test_queue_orders_by_cost() {
        let mut heap = BinaryHeap::new();
        heap.push(QueueEntry { cost: 3.0, id: ClusterId(0) });
        heap.push(QueueEntry { cost: 1.0, id: ClusterId(1) });
        heap.push(QueueEntry { cost: f64::INFINITY, id: ClusterId(2) });
        heap.push(QueueEntry { cost: 2.0, id: ClusterId(3) });

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop()).map(|e| e.id.0).collect();
        assert_eq!(order, vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_end_to_end_flat_square() {
        let mut mesh = split_square();
        let mut graph = ChartGraph::build(&mut mesh);
        assert_eq!(graph.num_charts(), 2);

        let stats = defragment(&mut mesh, &mut graph, &Parameters::default()).unwrap();

        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 0);
        assert_eq!(graph.num_charts(), 1);
        let chart = graph.charts().next().unwrap();
        assert!((chart.area_uv() - 1.0).abs() < 1e-9);
        assert!(stats.distortion < 1e-9);
        assert!(stats.final_border_length < stats.initial_border_length);
    }

    #[test]
    fn test_end_to_end_grid_merge() {
        let mut mesh = split_grid(4);
        let mut graph = ChartGraph::build(&mut mesh);

        let stats = defragment(&mut mesh, &mut graph, &Parameters::default()).unwrap();

        assert_eq!(graph.num_charts(), 1);
        assert_eq!(stats.accepted, 1);
        // faces are conserved, only labels and UVs changed
        assert_eq!(mesh.num_faces(), 32);
        let area_3d: f64 = (0..mesh.num_faces()).map(|f| mesh.face_area_3d(f)).sum();
        assert!((area_3d - 16.0).abs() < 1e-9);
        // a merged 4x4 grid has a 16-long outline
        assert!((stats.final_border_length - 16.0).abs() < 1e-6);
    }

    #[test]
    fn test_self_seam_merge_closes_slit() {
        let mut mesh = slit_square();
        let mut graph = ChartGraph::build(&mut mesh);
        assert_eq!(graph.num_charts(), 1);
        assert_eq!(clusters_of(&mesh).len(), 1);

        let stats = defragment(&mut mesh, &mut graph, &Parameters::default()).unwrap();

        assert_eq!(stats.accepted, 1);
        assert_eq!(graph.num_charts(), 1);
        // the slit is welded shut: no seam clusters remain
        assert!(clusters_of(&mesh).is_empty());
        assert!(stats.final_border_length < stats.initial_border_length);
    }

    #[test]
    fn test_global_distortion_bound_is_absolute() {
        // shear the whole atlas so every face carries distortion well above
        // the configured bound; relaxing a window around the seam cannot
        // bring the atlas ratio under it, so no merge may be admitted
        let mut mesh = split_grid(20);
        for v in 0..mesh.num_vertices() {
            let p = mesh.uv(v);
            mesh.set_uv(v, Point2::new(p.x + 0.5 * p.y, p.y));
        }
        let mut graph = ChartGraph::build(&mut mesh);

        let params = Parameters::default();
        let stats = defragment(&mut mesh, &mut graph, &params).unwrap();

        assert_eq!(stats.accepted, 0);
        assert!(stats.rejected > 0);
        assert_eq!(
            stats.rejections.get(&CheckStatus::FailDistortionGlobal).copied(),
            Some(stats.rejected)
        );
        assert!(stats.distortion > params.global_distortion_threshold);
    }

    #[test]
    fn test_unrelated_chart_does_not_block_merge() {
        // the split square plus a third, unconnected chart parked right on
        // top of the region where the merged square lands; repacking owns
        // that overlap, the merge gates do not
        let positions = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 5.0),
            Point3::new(1.0, 0.0, 5.0),
            Point3::new(0.0, 1.0, 5.0),
        ];
        let uvs = vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(3.0, 0.0),
            Point2::new(4.0, 1.0),
            Point2::new(3.0, 1.0),
            Point2::new(0.5, 0.5),
            Point2::new(1.5, 0.5),
            Point2::new(0.5, 1.5),
        ];
        let faces = vec![[0, 1, 2], [3, 4, 5], [6, 7, 8]];
        let mut mesh = Mesh::from_charts(positions, uvs, faces, vec![0, 1, 2]).unwrap();
        let mut graph = ChartGraph::build(&mut mesh);
        assert_eq!(graph.num_charts(), 3);

        let stats = defragment(&mut mesh, &mut graph, &Parameters::default()).unwrap();

        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 0);
        assert_eq!(graph.num_charts(), 2);
    }

    #[test]
    fn test_rejected_merge_rolls_back_exactly() {
        let mut mesh = split_grid(4);
        let mut graph = ChartGraph::build(&mut mesh);
        let before = mesh.clone();

        // an impossible global bound forces rejection of every attempt
        let params = Parameters {
            global_distortion_threshold: -1e9,
            ..Parameters::default()
        };
        let stats = defragment(&mut mesh, &mut graph, &params).unwrap();

        assert_eq!(stats.accepted, 0);
        assert!(stats.rejected > 0);
        assert_eq!(
            stats.rejections.get(&CheckStatus::FailDistortionGlobal).copied(),
            Some(stats.rejected)
        );
        assert_eq!(graph.num_charts(), 2);

        // bit-identical restore of positions, corners and adjacency
        for v in 0..mesh.num_vertices() {
            assert_eq!(mesh.uv(v), before.uv(v));
        }
        for f in 0..mesh.num_faces() {
            assert_eq!(mesh.face(f), before.face(f));
            for e in 0..3 {
                assert_eq!(mesh.ff(f, e), before.ff(f, e));
            }
        }
    }

    #[test]
    fn test_stats_track_border_and_charts() {
        let mut mesh = split_grid(4);
        let mut graph = ChartGraph::build(&mut mesh);
        let stats = defragment(&mut mesh, &mut graph, &Parameters::default()).unwrap();

        assert_eq!(stats.initial_charts, 2);
        assert_eq!(stats.final_charts, 1);
        assert!(stats.initial_border_length > stats.final_border_length);
        assert_eq!(stats.attempts, stats.accepted + stats.rejected);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let mut mesh = split_square();
        let mut graph = ChartGraph::build(&mut mesh);
        let params = Parameters::default().with_matching_threshold(0.0);
        assert!(defragment(&mut mesh, &mut graph, &params).is_err());
    }
}
