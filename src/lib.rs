//! # uvdefrag
//!
//! Texture atlas defragmentation for triangulated surfaces.
//!
//! Given a mesh whose UV parameterization is split into many small charts,
//! `uvdefrag` greedily merges charts across their shared seams, re-relaxing
//! the parameterization around each merge so the result stays low-distortion
//! and overlap-free, then repacks the surviving charts into as few texture
//! containers as possible.
//!
//! ## Pipeline
//!
//! - **Chart graph** ([`graph`]): the atlas as a mutable graph of face
//!   groups with cached areas and border lengths.
//! - **Seams** ([`seam`]): chart-boundary edges chained and clustered into
//!   mergeable units.
//! - **Merge driver** ([`optimize`]): a cost-ordered greedy loop; every
//!   candidate merge is aligned ([`matching`]), locally re-relaxed
//!   ([`arap`] on a disposable [`shell`]), validated by exact geometric
//!   predicates ([`intersection`]) and distortion bounds, and committed or
//!   rolled back exactly.
//! - **Packing** ([`pack`]): rasterized outline packing of the final charts.
//!
//! ## Quick Start
//!
//! ```
//! use uvdefrag::prelude::*;
//! use nalgebra::{Point2, Point3};
//!
//! // a unit square split into two single-triangle charts along the diagonal
//! let positions = vec![
//!     Point3::new(0.0, 0.0, 0.0),
//!     Point3::new(1.0, 0.0, 0.0),
//!     Point3::new(1.0, 1.0, 0.0),
//!     Point3::new(0.0, 0.0, 0.0), // seam duplicates
//!     Point3::new(1.0, 1.0, 0.0),
//!     Point3::new(0.0, 1.0, 0.0),
//! ];
//! let uvs = vec![
//!     Point2::new(0.0, 0.0),
//!     Point2::new(1.0, 0.0),
//!     Point2::new(1.0, 1.0),
//!     Point2::new(3.0, 0.0), // second chart parked elsewhere in UV
//!     Point2::new(4.0, 1.0),
//!     Point2::new(3.0, 1.0),
//! ];
//! let faces = vec![[0, 1, 2], [3, 4, 5]];
//!
//! let mut mesh = Mesh::from_charts(positions, uvs, faces, vec![0, 1]).unwrap();
//! let mut graph = ChartGraph::build(&mut mesh);
//! assert_eq!(graph.num_charts(), 2);
//!
//! // merge everything that passes the validity gates
//! let stats = defragment(&mut mesh, &mut graph, &Parameters::default()).unwrap();
//! assert_eq!(graph.num_charts(), 1);
//! assert_eq!(stats.accepted, 1);
//!
//! // lay the surviving charts out into unit-square containers
//! let textures = TextureSet::single(1024, 1024);
//! let packed = pack(&mesh, &graph, &textures, &PackOptions::default()).unwrap();
//! apply_packing(&mut mesh, &graph, &packed);
//! assert_eq!(packed.container_sizes.len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arap;
pub mod error;
pub mod graph;
pub mod intersection;
pub mod matching;
pub mod mesh;
pub mod optimize;
pub mod pack;
pub mod seam;
pub mod shell;
pub mod sparse;
pub mod texture;

/// Prelude module for convenient imports.
///
/// This module re-exports the most commonly used types and functions:
///
/// ```
/// use uvdefrag::prelude::*;
/// ```
pub mod prelude {
    pub use crate::arap::ArapOptions;
    pub use crate::error::{DefragError, Result};
    pub use crate::graph::{Chart, ChartGraph, ChartId};
    pub use crate::mesh::{HalfEdgeRef, Mesh};
    pub use crate::optimize::{defragment, CheckStatus, Parameters, Stats};
    pub use crate::pack::{apply_packing, pack, PackOptions, PackResult, Placement};
    pub use crate::texture::TextureSet;
}

// Re-export nalgebra types for convenience
pub use nalgebra;

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use crate::mesh::fixtures::split_grid;

    #[test]
    fn test_full_pipeline_on_split_grid() {
        let mut mesh = split_grid(4);
        let mut graph = ChartGraph::build(&mut mesh);
        assert_eq!(graph.num_charts(), 2);

        let stats = defragment(&mut mesh, &mut graph, &Parameters::default()).unwrap();
        assert_eq!(graph.num_charts(), 1);
        assert!(stats.final_border_length < stats.initial_border_length);

        let textures = TextureSet::single(2048, 2048);
        let packed = pack(&mesh, &graph, &textures, &PackOptions::default()).unwrap();
        apply_packing(&mut mesh, &graph, &packed);

        assert_eq!(packed.container_sizes.len(), 1);
        for f in 0..mesh.num_faces() {
            for uv in mesh.face_uvs(f) {
                assert!(uv.x >= -1e-9 && uv.x <= 1.0 + 1e-9);
                assert!(uv.y >= -1e-9 && uv.y <= 1.0 + 1e-9);
            }
        }
    }
}
