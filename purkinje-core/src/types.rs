use glam::{DVec2, DVec3};

/// Identifier for a node in a [`crate::tree::TreeState`].
///
/// This is an index into the tree's node list, and is only meaningful within
/// the lifetime of a given growth run.
pub type NodeId = usize;

/// Identifier for a branch, assigned in spawn order.
///
/// Branches are always stepped in ascending id order.
pub type BranchId = usize;

/// Index of a triangle in a [`crate::surface::TriangleMesh`].
pub type TriangleId = usize;

/// Position on (or near) the surface.
pub type Point3 = DVec3;

/// Position in a 2-D parameter chart.
pub type Point2 = DVec2;
