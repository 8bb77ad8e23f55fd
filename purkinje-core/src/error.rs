//! Error types for the growth engine.

use thiserror::Error;

use crate::types::Point3;

/// Result type alias for growth operations.
pub type Result<T> = std::result::Result<T, GrowthError>;

/// Errors that can occur while configuring or running a growth.
///
/// Only configuration, mesh and invariant errors abort a run. `OffManifold`
/// is raised by the surface and recovered by the stepper as a per-tip
/// termination.
#[derive(Error, Debug)]
pub enum GrowthError {
    /// A growth parameter is missing, non-finite or out of range.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The triangulated surface is malformed.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),

    /// No triangle lies within the projection search radius.
    #[error("point ({x:.6}, {y:.6}, {z:.6}) is off the manifold")]
    OffManifold { x: f64, y: f64, z: f64 },

    /// The tree lost one of its structural invariants.
    #[error("tree invariant violated: {0}")]
    InvariantViolation(String),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GrowthError {
    pub(crate) fn off_manifold(p: Point3) -> Self {
        Self::OffManifold {
            x: p.x,
            y: p.y,
            z: p.z,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }
}
