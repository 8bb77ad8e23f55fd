//! Growth parameters and the policies that govern stepping, bifurcation and
//! spatial-index rebuilds.
//!
//! [`GrowthConfig`] reads and writes the legacy JSON layout of the
//! parameter files (`N_it`, `w`, `l_segment`, `fascicles_*`, ...). Unknown keys
//! are dropped with a warning rather than rejected.

use std::fs;
use std::path::Path;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{GrowthError, Result};

/// Keys accepted by [`GrowthConfig::from_value`], including serde aliases.
const KNOWN_KEYS: &[&str] = &[
    "meshfile",
    "init_node_id",
    "second_node_id",
    "init_direction",
    "init_length",
    "N_it",
    "generations",
    "length",
    "branch_angle",
    "w",
    "repulsion_weight",
    "l_segment",
    "min_spacing",
    "repulsion_radius",
    "fascicles_angles",
    "fascicles_length",
    "length_jitter",
    "seed",
    "step",
    "bifurcation",
    "rebuild",
];

/// Keys written by older parameter files that carry no meaning here.
const LEGACY_KEYS: &[&str] = &["save"];

/// Where the position proposal of a step is computed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthSpace {
    /// Advance directly in 3-D, then snap onto the surface.
    #[default]
    Surface,
    /// Advance in the surface's 2-D chart and map back to 3-D.
    Chart,
}

/// Per-step retry and projection settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepPolicy {
    /// Number of shrunken retries after the first collision.
    pub max_retries: usize,
    /// Factor in `(0, 1)` applied to the step length on every retry.
    pub shrink_factor: f64,
    /// Offset along the tip normal applied to a candidate before snapping.
    pub pre_projection_offset: f64,
    /// Smallest accepted fraction of the proposed step after snapping. A
    /// snap that truncates the step further means the tip ran into an open
    /// boundary and counts as leaving the manifold.
    pub min_advance: f64,
    pub growth_space: GrowthSpace,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            shrink_factor: 0.5,
            pre_projection_offset: 0.0,
            min_advance: 0.5,
            growth_space: GrowthSpace::Surface,
        }
    }
}

/// Decides whether a branch that completed its quota splits in two.
///
/// A branch that does not split is continued by a single child that keeps
/// the parent's direction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "generations", rename_all = "snake_case")]
pub enum BifurcationPolicy {
    #[default]
    Always,
    Never,
    /// Split only after the listed (0-based) generations.
    Generations(Vec<usize>),
}

impl BifurcationPolicy {
    /// Returns `true` if a branch of `generation` splits when it completes.
    pub fn splits_after(&self, generation: usize) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Generations(list) => list.contains(&generation),
        }
    }
}

/// How often the spatial index incorporates buffered insertions.
///
/// The index is always rebuilt at generation boundaries. Between rebuilds,
/// nodes placed in the current window are invisible to collision queries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "n", rename_all = "snake_case")]
pub enum RebuildPolicy {
    #[default]
    PerGeneration,
    /// Also rebuild after every `n` insertions.
    EveryInsertions(usize),
}

/// Holds all settings for growing a fractal tree.
///
/// ### Fields
/// - `meshfile` - Informational path of the source mesh; never opened here.
/// - `init_node_id` - Surface vertex the root grows from.
/// - `second_node_id` - Surface vertex fixing the initial direction.
/// - `init_direction` - Explicit initial direction; overrides `second_node_id`.
/// - `init_length` - Length of the root branch.
/// - `generations` - Number of growth rounds (`N_it`).
/// - `length` - Mean length of regular branches.
/// - `branch_angle` - Half-angle between the two children of a split (radians).
/// - `repulsion_weight` - Weight `w` of the repulsion gradient.
/// - `l_segment` - Approximate segment length.
/// - `min_spacing` - Collision radius; defaults to `l_segment / 2`.
/// - `repulsion_radius` - Cutoff of the distance field; defaults to `length`.
/// - `fascicles_angles` / `fascicles_length` - Extra seed branches.
/// - `length_jitter` - Relative uniform jitter of child branch lengths.
/// - `seed` - Seed of the run's random generator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthConfig {
    pub meshfile: Option<String>,
    pub init_node_id: usize,
    pub second_node_id: Option<usize>,
    pub init_direction: Option<DVec3>,
    pub init_length: f64,
    #[serde(rename = "N_it", alias = "generations")]
    pub generations: usize,
    pub length: f64,
    pub branch_angle: f64,
    #[serde(rename = "w", alias = "repulsion_weight")]
    pub repulsion_weight: f64,
    pub l_segment: f64,
    pub min_spacing: Option<f64>,
    pub repulsion_radius: Option<f64>,
    pub fascicles_angles: Vec<f64>,
    pub fascicles_length: Vec<f64>,
    pub length_jitter: f64,
    pub seed: u64,
    pub step: StepPolicy,
    pub bifurcation: BifurcationPolicy,
    pub rebuild: RebuildPolicy,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            meshfile: None,
            init_node_id: 0,
            second_node_id: Some(1),
            init_direction: None,
            init_length: 0.1,
            generations: 10,
            length: 0.1,
            branch_angle: 0.15,
            repulsion_weight: 0.1,
            l_segment: 0.01,
            min_spacing: None,
            repulsion_radius: None,
            fascicles_angles: Vec::new(),
            fascicles_length: Vec::new(),
            length_jitter: 0.0,
            seed: 0,
            step: StepPolicy::default(),
            bifurcation: BifurcationPolicy::default(),
            rebuild: RebuildPolicy::default(),
        }
    }
}

fn require(cond: bool, msg: impl Into<String>) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(GrowthError::invalid(msg))
    }
}

fn positive(name: &str, v: f64) -> Result<()> {
    require(v.is_finite() && v > 0.0, format!("{name} must be > 0, got {v}"))
}

impl GrowthConfig {
    /// Checks every parameter that does not depend on the surface.
    ///
    /// Seed ids are checked against the surface by
    /// [`crate::growth::Grower::new`].
    pub fn validate(&self) -> Result<()> {
        positive("init_length", self.init_length)?;
        positive("length", self.length)?;
        positive("l_segment", self.l_segment)?;
        require(
            self.repulsion_weight.is_finite() && self.repulsion_weight >= 0.0,
            format!("w must be >= 0, got {}", self.repulsion_weight),
        )?;
        require(
            self.branch_angle.is_finite()
                && self.branch_angle > 0.0
                && self.branch_angle <= std::f64::consts::PI,
            format!("branch_angle must be in (0, pi], got {}", self.branch_angle),
        )?;

        let min_len = self.init_length.min(self.length);
        require(
            self.l_segment <= min_len,
            format!(
                "l_segment must be <= min(init_length, length); got l_segment={}, min={}",
                self.l_segment, min_len
            ),
        )?;

        if let Some(second) = self.second_node_id {
            require(
                second != self.init_node_id,
                "second_node_id must differ from init_node_id",
            )?;
        }
        match self.init_direction {
            Some(d) => require(
                d.is_finite() && d.length_squared() > 0.0,
                "init_direction must be a finite non-zero vector",
            )?,
            None => require(
                self.second_node_id.is_some(),
                "either second_node_id or init_direction is required",
            )?,
        }

        if let Some(r) = self.min_spacing {
            positive("min_spacing", r)?;
        }
        if let Some(r) = self.repulsion_radius {
            positive("repulsion_radius", r)?;
        }
        require(
            self.length_jitter.is_finite() && (0.0..1.0).contains(&self.length_jitter),
            format!("length_jitter must be in [0, 1), got {}", self.length_jitter),
        )?;

        require(
            self.fascicles_angles.len() == self.fascicles_length.len(),
            "fascicles_angles and fascicles_length must have the same length",
        )?;
        for (i, a) in self.fascicles_angles.iter().enumerate() {
            require(
                a.is_finite(),
                format!("fascicles_angles[{i}] must be a finite real number"),
            )?;
        }
        for (i, l) in self.fascicles_length.iter().enumerate() {
            require(
                l.is_finite() && *l > 0.0,
                format!("fascicles_length[{i}] must be finite and > 0, got {l}"),
            )?;
        }

        let step = &self.step;
        require(
            step.shrink_factor.is_finite() && step.shrink_factor > 0.0 && step.shrink_factor < 1.0,
            format!("shrink_factor must be in (0, 1), got {}", step.shrink_factor),
        )?;
        require(
            step.pre_projection_offset.is_finite(),
            "pre_projection_offset must be finite",
        )?;
        require(
            step.min_advance.is_finite() && (0.0..1.0).contains(&step.min_advance),
            format!("min_advance must be in [0, 1), got {}", step.min_advance),
        )?;
        if let RebuildPolicy::EveryInsertions(n) = self.rebuild {
            require(n > 0, "rebuild interval must be > 0")?;
        }
        Ok(())
    }

    /// Collision radius used by the stepper.
    pub fn spacing(&self) -> f64 {
        self.min_spacing.unwrap_or(0.5 * self.l_segment)
    }

    /// Cutoff of the distance-to-nearest-node field.
    pub fn repulsion_cutoff(&self) -> f64 {
        self.repulsion_radius.unwrap_or(self.length)
    }

    /// Number of segments a branch of `length` is split into,
    /// `ceil(length / l_segment)`, at least one.
    pub fn segments_for(&self, length: f64) -> usize {
        // Absorb rounding so 0.1 / 0.01 stays 10.
        let n = (length / self.l_segment - 1e-9).ceil();
        n.max(1.0) as usize
    }

    /// Builds a configuration from a JSON value.
    ///
    /// Unknown keys are ignored with a warning.
    pub fn from_value(value: Value) -> Result<Self> {
        let value = match value {
            Value::Object(mut map) => {
                let unknown: Vec<String> = map
                    .keys()
                    .filter(|k| {
                        !KNOWN_KEYS.contains(&k.as_str()) && !LEGACY_KEYS.contains(&k.as_str())
                    })
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    warn!(?unknown, "ignoring unknown parameter keys");
                }
                map.retain(|k, _| KNOWN_KEYS.contains(&k.as_str()));
                Value::Object(map)
            }
            other => other,
        };
        let cfg: Self = serde_json::from_value(value)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses and validates a JSON string.
    pub fn from_json(s: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(s)?)
    }

    /// Reads and validates a JSON parameter file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Compact JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }
}
