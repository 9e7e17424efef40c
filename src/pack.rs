//! Rasterized outline packing of the final chart set.
//!
//! Charts are reduced to their UV border outlines, rasterized column by
//! column onto a coarse occupancy grid (per-column bottom and top spans), and
//! placed bottom-left against a per-container skyline. A chart that fits no
//! existing container opens a new one. Every chart keeps its shape; the only
//! transform applied is one uniform scale shared by the whole atlas plus a
//! per-chart translation.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{Point2, Vector2};

use crate::error::{DefragError, Result};
use crate::graph::{Chart, ChartGraph, ChartId};
use crate::intersection::Segment;
use crate::mesh::Mesh;
use crate::texture::TextureSet;

/// Options for the packing pass.
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Occupancy grid resolution (cells per container side).
    pub resolution: usize,
    /// Gap between charts, in grid cells.
    pub padding: usize,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            resolution: 256,
            padding: 1,
        }
    }
}

impl PackOptions {
    /// Set the occupancy grid resolution.
    pub fn with_resolution(mut self, resolution: usize) -> Self {
        self.resolution = resolution;
        self
    }

    /// Set the inter-chart padding in grid cells.
    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }
}

/// Where one chart landed: `uv ↦ scale · uv + offset` into container space.
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    /// Index into [`PackResult::container_sizes`].
    pub container: usize,
    /// Translation into the container's unit UV square.
    pub offset: Vector2<f64>,
    /// Uniform scale, shared by all charts of the run.
    pub scale: f64,
}

impl Placement {
    /// Apply the placement to a UV coordinate.
    #[inline]
    pub fn apply(&self, uv: Point2<f64>) -> Point2<f64> {
        Point2::from(uv.coords * self.scale + self.offset)
    }
}

/// Result of a packing pass.
#[derive(Debug, Clone)]
pub struct PackResult {
    /// Placement per live chart.
    pub placements: BTreeMap<ChartId, Placement>,
    /// Pixel sizes of the output containers, in placement order.
    pub container_sizes: Vec<(u32, u32)>,
}

/// UV border outline of a chart.
pub fn chart_outline(mesh: &Mesh, chart: &Chart) -> Vec<Segment> {
    let mut outline = Vec::new();
    for &f in chart.faces() {
        for e in 0..3 {
            if mesh.is_uv_border(f, e) {
                let (v0, v1) = mesh.edge_vertices(f, e);
                outline.push(Segment::new(mesh.uv(v0), mesh.uv(v1)));
            }
        }
    }
    outline
}

/// Per-column occupancy spans of one chart, in grid cells relative to the
/// chart's own bbox origin.
struct Raster {
    cols: usize,
    bottom: Vec<usize>,
    top: Vec<usize>,
    /// Scaled UV bbox minimum, mapped to cell `(0, 0)`.
    origin: Point2<f64>,
}

impl Raster {
    fn height(&self) -> usize {
        self.top.iter().copied().max().unwrap_or(0)
    }
}

/// Vertical extent of a segment clipped to the slab `x0..x1`.
fn column_span(seg: &Segment, x0: f64, x1: f64) -> Option<(f64, f64)> {
    let (a, b) = (seg.a, seg.b);
    let dx = b.x - a.x;
    if dx.abs() < 1e-15 {
        if a.x < x0 || a.x > x1 {
            return None;
        }
        return Some((a.y.min(b.y), a.y.max(b.y)));
    }
    let mut t0 = (x0 - a.x) / dx;
    let mut t1 = (x1 - a.x) / dx;
    if t0 > t1 {
        std::mem::swap(&mut t0, &mut t1);
    }
    let t0 = t0.max(0.0);
    let t1 = t1.min(1.0);
    if t0 > t1 {
        return None;
    }
    let y0 = a.y + (b.y - a.y) * t0;
    let y1 = a.y + (b.y - a.y) * t1;
    Some((y0.min(y1), y0.max(y1)))
}

fn rasterize(outline: &[Segment], scale: f64, cell: f64, padding: usize) -> Raster {
    let mut lo = Point2::new(f64::INFINITY, f64::INFINITY);
    let mut hi = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
    let scaled: Vec<Segment> = outline
        .iter()
        .map(|s| {
            Segment::new(
                Point2::from(s.a.coords * scale),
                Point2::from(s.b.coords * scale),
            )
        })
        .collect();
    for s in &scaled {
        for p in [s.a, s.b] {
            lo.x = lo.x.min(p.x);
            lo.y = lo.y.min(p.y);
            hi.x = hi.x.max(p.x);
            hi.y = hi.y.max(p.y);
        }
    }

    let geo_cols = (((hi.x - lo.x) / cell).ceil() as usize).max(1);
    let cols = geo_cols + padding;
    let mut ymin = vec![f64::INFINITY; cols];
    let mut ymax = vec![f64::NEG_INFINITY; cols];
    for s in &scaled {
        let c0 = (((s.a.x.min(s.b.x) - lo.x) / cell) as usize).min(geo_cols - 1);
        let c1 = (((s.a.x.max(s.b.x) - lo.x) / cell) as usize).min(geo_cols - 1);
        for c in c0..=c1 {
            let x0 = lo.x + c as f64 * cell;
            if let Some((y0, y1)) = column_span(s, x0, x0 + cell) {
                ymin[c] = ymin[c].min(y0);
                ymax[c] = ymax[c].max(y1);
            }
        }
    }

    let mut bottom = vec![0usize; cols];
    let mut top = vec![0usize; cols];
    for c in 0..cols {
        // untouched columns (padding or discretization gaps) block fully
        let (y0, y1) = if ymin[c].is_finite() { (ymin[c], ymax[c]) } else { (lo.y, hi.y) };
        bottom[c] = ((y0 - lo.y) / cell).floor() as usize;
        top[c] = ((y1 - lo.y) / cell).ceil() as usize + padding;
        if top[c] <= bottom[c] {
            top[c] = bottom[c] + 1;
        }
    }
    Raster { cols, bottom, top, origin: lo }
}

/// One open container's skyline, in cells.
struct Container {
    skyline: Vec<usize>,
}

impl Container {
    fn new(resolution: usize) -> Self {
        Self { skyline: vec![0; resolution] }
    }

    /// Best bottom-left position for a raster, or `None` if it cannot fit.
    fn find_spot(&self, raster: &Raster, rows: usize) -> Option<(usize, usize)> {
        if raster.cols > self.skyline.len() {
            return None;
        }
        let mut best: Option<(usize, usize)> = None;
        for x in 0..=(self.skyline.len() - raster.cols) {
            let mut y = 0usize;
            for c in 0..raster.cols {
                let floor = self.skyline[x + c].saturating_sub(raster.bottom[c]);
                y = y.max(floor);
            }
            let peak = (0..raster.cols).map(|c| y + raster.top[c]).max().unwrap_or(y);
            if peak > rows {
                continue;
            }
            if best.map_or(true, |(_, by)| y < by) {
                best = Some((x, y));
            }
        }
        best
    }

    fn place(&mut self, raster: &Raster, x: usize, y: usize) {
        for c in 0..raster.cols {
            self.skyline[x + c] = y + raster.top[c];
        }
    }
}

/// Pack the live charts into unit-square containers.
///
/// All charts share one uniform scale, chosen so the largest chart fits a
/// container; placement is bottom-left against a per-container skyline, and a
/// chart that fits nowhere opens a new container sized from the texture set.
///
/// # Errors
///
/// Returns an error when the texture set is empty or the resolution is too
/// coarse to rasterize against.
pub fn pack(
    mesh: &Mesh,
    graph: &ChartGraph,
    textures: &TextureSet,
    options: &PackOptions,
) -> Result<PackResult> {
    if options.resolution < 8 {
        return Err(DefragError::invalid_param(
            "resolution",
            options.resolution as f64,
            "must be at least 8",
        ));
    }
    if options.padding >= options.resolution / 2 {
        return Err(DefragError::invalid_param(
            "padding",
            options.padding as f64,
            "must be well below the resolution",
        ));
    }
    let container_size = textures.max_size().ok_or_else(|| {
        DefragError::invalid_param("texture_set", 0.0, "must contain at least one texture")
    })?;

    let cell = 1.0 / options.resolution as f64;

    // uniform scale fitting the largest chart into the usable container span
    let mut max_dim = 0.0f64;
    let outlines: Vec<(ChartId, Vec<Segment>)> = graph
        .charts()
        .map(|chart| {
            let outline = chart_outline(mesh, chart);
            for s in &outline {
                max_dim = max_dim.max((s.a.x - s.b.x).abs()).max((s.a.y - s.b.y).abs());
            }
            let mut lo = Point2::new(f64::INFINITY, f64::INFINITY);
            let mut hi = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
            for s in &outline {
                for p in [s.a, s.b] {
                    lo.x = lo.x.min(p.x);
                    lo.y = lo.y.min(p.y);
                    hi.x = hi.x.max(p.x);
                    hi.y = hi.y.max(p.y);
                }
            }
            max_dim = max_dim.max(hi.x - lo.x).max(hi.y - lo.y);
            (chart.id(), outline)
        })
        .collect();
    let usable = 1.0 - options.padding as f64 * cell;
    let scale = if max_dim > 0.0 { (0.95 * usable / max_dim).min(1.0) } else { 1.0 };

    // rasterize, then place tallest first
    let mut rasters: Vec<(ChartId, Raster)> = outlines
        .into_iter()
        .map(|(id, outline)| (id, rasterize(&outline, scale, cell, options.padding)))
        .collect();
    rasters.sort_by(|(ida, ra), (idb, rb)| {
        rb.height().cmp(&ra.height()).then_with(|| ida.cmp(idb))
    });

    let mut containers: Vec<Container> = Vec::new();
    let mut placements = BTreeMap::new();
    for (id, raster) in &rasters {
        let mut placed = None;
        for (ci, container) in containers.iter_mut().enumerate() {
            if let Some((x, y)) = container.find_spot(raster, options.resolution) {
                container.place(raster, x, y);
                placed = Some((ci, x, y));
                break;
            }
        }
        let (ci, x, y) = match placed {
            Some(p) => p,
            None => {
                let mut container = Container::new(options.resolution);
                let (x, y) = container.find_spot(raster, options.resolution).ok_or_else(|| {
                    DefragError::invalid_param(
                        "resolution",
                        options.resolution as f64,
                        "too coarse for the chart set",
                    )
                })?;
                container.place(raster, x, y);
                containers.push(container);
                (containers.len() - 1, x, y)
            }
        };
        let cell_pos = Vector2::new(x as f64 * cell, y as f64 * cell);
        placements.insert(
            *id,
            Placement {
                container: ci,
                offset: cell_pos - raster.origin.coords,
                scale,
            },
        );
    }

    log::info!(
        "packed {} charts into {} containers at scale {:.4}",
        placements.len(),
        containers.len(),
        scale
    );

    Ok(PackResult {
        placements,
        container_sizes: vec![container_size; containers.len()],
    })
}

/// Rewrite the mesh UVs according to a packing result.
///
/// Vertices are chart-private after the seam cut, so each vertex is moved by
/// exactly one chart's placement.
pub fn apply_packing(mesh: &mut Mesh, graph: &ChartGraph, result: &PackResult) {
    for chart in graph.charts() {
        let Some(placement) = result.placements.get(&chart.id()) else {
            continue;
        };
        let verts: BTreeSet<usize> =
            chart.faces().iter().flat_map(|&f| mesh.face(f)).collect();
        for v in verts {
            mesh.set_uv(v, placement.apply(mesh.uv(v)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::fixtures::split_grid;
    use nalgebra::Point3;

    fn bbox_after(mesh: &Mesh, chart: &Chart, p: &Placement) -> (Point2<f64>, Point2<f64>) {
        let mut lo = Point2::new(f64::INFINITY, f64::INFINITY);
        let mut hi = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for &f in chart.faces() {
            for uv in mesh.face_uvs(f) {
                let q = p.apply(uv);
                lo.x = lo.x.min(q.x);
                lo.y = lo.y.min(q.y);
                hi.x = hi.x.max(q.x);
                hi.y = hi.y.max(q.y);
            }
        }
        (lo, hi)
    }

    /// `n` unit-square charts parked far apart in UV space.
    fn squares(n: usize) -> Mesh {
        let mut positions = Vec::new();
        let mut uvs = Vec::new();
        let mut faces = Vec::new();
        let mut labels = Vec::new();
        for k in 0..n {
            let base = positions.len();
            let ox = k as f64 * 10.0;
            for (dx, dy) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
                positions.push(Point3::new(ox + dx, dy, 0.0));
                uvs.push(Point2::new(ox + dx, dy));
            }
            faces.push([base, base + 1, base + 2]);
            faces.push([base, base + 2, base + 3]);
            labels.push(k as u32);
            labels.push(k as u32);
        }
        Mesh::from_charts(positions, uvs, faces, labels).unwrap()
    }

    #[test]
    fn test_outline_of_square_chart() {
        let mut mesh = squares(1);
        let graph = ChartGraph::build(&mut mesh);
        let chart = graph.charts().next().unwrap();
        let outline = chart_outline(&mesh, chart);
        assert_eq!(outline.len(), 4);
        let total: f64 = outline.iter().map(|s| (s.b - s.a).norm()).sum();
        assert!((total - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_two_charts_share_one_container() {
        let mut mesh = split_grid(8);
        let graph = ChartGraph::build(&mut mesh);
        let textures = TextureSet::single(1024, 1024);

        let result = pack(&mesh, &graph, &textures, &PackOptions::default()).unwrap();

        assert_eq!(result.placements.len(), 2);
        assert_eq!(result.container_sizes, vec![(1024, 1024)]);

        // both inside the unit square, and disjoint
        let boxes: Vec<_> = graph
            .charts()
            .map(|c| bbox_after(&mesh, c, &result.placements[&c.id()]))
            .collect();
        for (lo, hi) in &boxes {
            assert!(lo.x >= -1e-9 && lo.y >= -1e-9);
            assert!(hi.x <= 1.0 + 1e-9 && hi.y <= 1.0 + 1e-9);
        }
        let (a, b) = (&boxes[0], &boxes[1]);
        let overlap_x = a.0.x < b.1.x && b.0.x < a.1.x;
        let overlap_y = a.0.y < b.1.y && b.0.y < a.1.y;
        assert!(!(overlap_x && overlap_y));
    }

    #[test]
    fn test_oversized_charts_open_new_containers() {
        // each chart scales to nearly a full container, so none can share
        let mut mesh = squares(3);
        let graph = ChartGraph::build(&mut mesh);
        let textures = TextureSet::single(512, 512);

        let result = pack(&mesh, &graph, &textures, &PackOptions::default()).unwrap();
        assert_eq!(result.container_sizes.len(), 3);
        for p in result.placements.values() {
            assert!(p.container < 3);
        }
    }

    #[test]
    fn test_apply_packing_moves_all_chart_vertices() {
        let mut mesh = squares(2);
        let graph = ChartGraph::build(&mut mesh);
        let textures = TextureSet::single(256, 256);
        let result = pack(&mesh, &graph, &textures, &PackOptions::default()).unwrap();

        apply_packing(&mut mesh, &graph, &result);
        for chart in graph.charts() {
            for &f in chart.faces() {
                for uv in mesh.face_uvs(f) {
                    assert!(uv.x >= -1e-9 && uv.x <= 1.0 + 1e-9);
                    assert!(uv.y >= -1e-9 && uv.y <= 1.0 + 1e-9);
                }
            }
            // shape preserved: area scales by the square of the uniform factor
            let placement = &result.placements[&chart.id()];
            let area: f64 =
                chart.faces().iter().map(|&f| mesh.face_area_uv_signed(f).abs()).sum();
            assert!((area - chart.area_uv() * placement.scale * placement.scale).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rejects_empty_texture_set() {
        let mut mesh = squares(1);
        let graph = ChartGraph::build(&mut mesh);
        let textures = TextureSet::new(vec![]);
        assert!(pack(&mesh, &graph, &textures, &PackOptions::default()).is_err());
    }
}
