//! Error types for uvdefrag.
//!
//! This module defines the errors reported at the public API boundary.
//! Per-candidate merge failures are not errors: they are encoded in
//! [`CheckStatus`](crate::optimize::CheckStatus) and handled by rollback.

use thiserror::Error;

/// Result type alias using [`DefragError`].
pub type Result<T> = std::result::Result<T, DefragError>;

/// Errors that can occur while building or defragmenting an atlas.
#[derive(Error, Debug)]
pub enum DefragError {
    /// The mesh has no faces.
    #[error("mesh has no faces")]
    EmptyMesh,

    /// A face references an invalid vertex index.
    #[error("face {face} references invalid vertex index {vertex}")]
    InvalidVertexIndex {
        /// The face index.
        face: usize,
        /// The invalid vertex index.
        vertex: usize,
    },

    /// A face has duplicate vertex indices (degenerate triangle).
    #[error("face {face} is degenerate (has duplicate vertices)")]
    DegenerateFace {
        /// The face index.
        face: usize,
    },

    /// Vertex attribute arrays have mismatched lengths.
    #[error("attribute length mismatch: {positions} positions but {uvs} UVs")]
    AttributeMismatch {
        /// Number of 3D positions.
        positions: usize,
        /// Number of UV coordinates.
        uvs: usize,
    },

    /// The sparse factorization encountered a non-positive pivot.
    #[error("sparse Cholesky factorization failed at row {row}")]
    FactorizationFailed {
        /// The row at which the pivot became non-positive.
        row: usize,
    },

    /// Invalid parameter value.
    #[error("invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// The invalid value (as string).
        value: String,
        /// Reason the value is invalid.
        reason: &'static str,
    },
}

impl DefragError {
    /// Create an invalid parameter error.
    pub fn invalid_param<T: std::fmt::Display>(
        name: &'static str,
        value: T,
        reason: &'static str,
    ) -> Self {
        DefragError::InvalidParameter {
            name,
            value: value.to_string(),
            reason,
        }
    }
}
