//! Fractal Purkinje tree growth on triangulated surfaces.
//!
//! Main components:
//! - [`surface`]: projection, gradients, boundary and chart of a surface.
//! - [`spatial_index`]: buffered proximity queries over placed nodes.
//! - [`stepper`]: advances one tip by one segment.
//! - [`growth`]: the generation loop and the finalized tree.
//! - [`tree`]: append-only nodes, edges and branches.
//! - [`config`]: growth parameters and their JSON form.
//! - [`error`]: error type shared by every component.
//! - [`types`]: shared type aliases and IDs.

pub mod config;
pub mod error;
pub mod growth;
pub mod spatial_index;
pub mod stepper;
pub mod surface;
pub mod tree;
pub mod types;

pub use config::{BifurcationPolicy, GrowthConfig, GrowthSpace, RebuildPolicy, StepPolicy};
pub use error::{GrowthError, Result};
pub use growth::{FractalTree, GenerationReport, Grower, GrowthDiagnostics, grow};
pub use surface::{Surface, TriangleMesh};
