//! Segment intersection queries in UV space.
//!
//! Overlap gating works on boundary outlines: a merge is rejected when the
//! merged boundary self-intersects or when it crosses the outlines of other
//! charts. The narrow phase is an orientation-sign predicate; segments that
//! share an endpoint bit-exactly are never reported, since consecutive
//! boundary edges always touch. A uniform grid sized from the segment count
//! keeps the candidate pair sets small.

use nalgebra::Point2;

/// A UV-space line segment.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    /// First endpoint.
    pub a: Point2<f64>,
    /// Second endpoint.
    pub b: Point2<f64>,
}

impl Segment {
    /// Create a segment.
    #[inline]
    pub fn new(a: Point2<f64>, b: Point2<f64>) -> Self {
        Self { a, b }
    }

    fn bbox(&self) -> (Point2<f64>, Point2<f64>) {
        (
            Point2::new(self.a.x.min(self.b.x), self.a.y.min(self.b.y)),
            Point2::new(self.a.x.max(self.b.x), self.a.y.max(self.b.y)),
        )
    }
}

/// Sign of the orientation of the triangle `(a, b, c)`.
fn orient(a: Point2<f64>, b: Point2<f64>, c: Point2<f64>) -> f64 {
    let v = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn same_point(p: Point2<f64>, q: Point2<f64>) -> bool {
    p.x == q.x && p.y == q.y
}

/// Whether point `c`, known collinear with `a`-`b`, lies inside that segment.
fn on_segment(a: Point2<f64>, b: Point2<f64>, c: Point2<f64>) -> bool {
    c.x >= a.x.min(b.x) && c.x <= a.x.max(b.x) && c.y >= a.y.min(b.y) && c.y <= a.y.max(b.y)
}

/// Whether two segments intersect, ignoring shared endpoints.
///
/// Segments touching only at a bit-identical endpoint are not considered
/// intersecting; any other contact (proper crossing, endpoint interior to
/// the other segment, collinear overlap) is.
pub fn segments_intersect(s: &Segment, t: &Segment) -> bool {
    let shared = same_point(s.a, t.a)
        || same_point(s.a, t.b)
        || same_point(s.b, t.a)
        || same_point(s.b, t.b);
    if shared {
        // a second shared point would mean the segments coincide
        let both = (same_point(s.a, t.a) || same_point(s.a, t.b))
            && (same_point(s.b, t.a) || same_point(s.b, t.b));
        return both;
    }

    let d1 = orient(t.a, t.b, s.a);
    let d2 = orient(t.a, t.b, s.b);
    let d3 = orient(s.a, s.b, t.a);
    let d4 = orient(s.a, s.b, t.b);

    if d1 * d2 < 0.0 && d3 * d4 < 0.0 {
        return true;
    }
    (d1 == 0.0 && on_segment(t.a, t.b, s.a))
        || (d2 == 0.0 && on_segment(t.a, t.b, s.b))
        || (d3 == 0.0 && on_segment(s.a, s.b, t.a))
        || (d4 == 0.0 && on_segment(s.a, s.b, t.b))
}

/// Uniform spatial hash over a set of segments.
///
/// Cell size is derived from the bounding-box area and the segment count so
/// that the expected occupancy stays near one segment per cell.
pub struct SegmentGrid<'a> {
    segments: &'a [Segment],
    origin: Point2<f64>,
    cell: f64,
    nx: usize,
    ny: usize,
    bins: Vec<Vec<usize>>,
}

impl<'a> SegmentGrid<'a> {
    /// Build a grid over the given segments.
    pub fn build(segments: &'a [Segment]) -> Self {
        let mut lo = Point2::new(f64::INFINITY, f64::INFINITY);
        let mut hi = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for s in segments {
            let (slo, shi) = s.bbox();
            lo.x = lo.x.min(slo.x);
            lo.y = lo.y.min(slo.y);
            hi.x = hi.x.max(shi.x);
            hi.y = hi.y.max(shi.y);
        }
        if segments.is_empty() {
            lo = Point2::origin();
            hi = Point2::new(1.0, 1.0);
        }

        let w = (hi.x - lo.x).max(f64::MIN_POSITIVE);
        let h = (hi.y - lo.y).max(f64::MIN_POSITIVE);
        let n = segments.len().max(1) as f64;
        let cell = (w * h / n).sqrt().max(f64::MIN_POSITIVE);
        let nx = ((w / cell).ceil() as usize).max(1);
        let ny = ((h / cell).ceil() as usize).max(1);

        let mut grid = Self {
            segments,
            origin: lo,
            cell,
            nx,
            ny,
            bins: vec![Vec::new(); nx * ny],
        };
        for (i, s) in segments.iter().enumerate() {
            grid.for_cells_of(s, |bin| bin.push(i));
        }
        grid
    }

    fn cell_range(&self, s: &Segment) -> (usize, usize, usize, usize) {
        let (lo, hi) = s.bbox();
        let cx0 = (((lo.x - self.origin.x) / self.cell) as isize).clamp(0, self.nx as isize - 1);
        let cy0 = (((lo.y - self.origin.y) / self.cell) as isize).clamp(0, self.ny as isize - 1);
        let cx1 = (((hi.x - self.origin.x) / self.cell) as isize).clamp(0, self.nx as isize - 1);
        let cy1 = (((hi.y - self.origin.y) / self.cell) as isize).clamp(0, self.ny as isize - 1);
        (cx0 as usize, cy0 as usize, cx1 as usize, cy1 as usize)
    }

    fn for_cells_of<F: FnMut(&mut Vec<usize>)>(&mut self, s: &Segment, mut f: F) {
        let (cx0, cy0, cx1, cy1) = self.cell_range(s);
        for cy in cy0..=cy1 {
            for cx in cx0..=cx1 {
                f(&mut self.bins[cy * self.nx + cx]);
            }
        }
    }

    /// Candidate indices whose cells overlap the query segment's bbox.
    fn candidates(&self, s: &Segment, out: &mut Vec<usize>) {
        out.clear();
        let (cx0, cy0, cx1, cy1) = self.cell_range(s);
        for cy in cy0..=cy1 {
            for cx in cx0..=cx1 {
                out.extend_from_slice(&self.bins[cy * self.nx + cx]);
            }
        }
        out.sort_unstable();
        out.dedup();
    }

    /// All intersecting pairs within the grid's own segment set.
    pub fn self_intersections(&self) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        let mut cand = Vec::new();
        for (i, s) in self.segments.iter().enumerate() {
            self.candidates(s, &mut cand);
            for &j in &cand {
                if j > i && bbox_overlap(s, &self.segments[j])
                    && segments_intersect(s, &self.segments[j])
                {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }

    /// Intersections between an external segment set and this grid's set.
    ///
    /// Pairs are `(query index, grid index)`.
    pub fn cross_intersections(&self, queries: &[Segment]) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        let mut cand = Vec::new();
        for (i, s) in queries.iter().enumerate() {
            self.candidates(s, &mut cand);
            for &j in &cand {
                if bbox_overlap(s, &self.segments[j]) && segments_intersect(s, &self.segments[j]) {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }
}

fn bbox_overlap(s: &Segment, t: &Segment) -> bool {
    let (slo, shi) = s.bbox();
    let (tlo, thi) = t.bbox();
    slo.x <= thi.x && tlo.x <= shi.x && slo.y <= thi.y && tlo.y <= shi.y
}
