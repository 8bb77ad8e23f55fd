//! Advances one branch tip by one segment.
//!
//! A step runs a small state machine:
//!
//! 1. **Propose**: place a candidate `step` ahead along the updated
//!    direction (in 3-D or in the surface chart), optionally lift it along
//!    the normal, and snap it onto the surface.
//! 2. **Validate**: ask the [`SpatialIndex`] whether the snapped point is
//!    closer than the spacing radius to foreign structure.
//! 3. **Retry**: on collision, shrink the step and propose again, up to
//!    [`StepPolicy::max_retries`] times.
//! 4. **Accept** / **Terminate**: report the new tip, or the reason the tip
//!    cannot continue.
//!
//! The stepper never mutates the tree or the index; the orchestrator applies
//! the [`StepReport`].

use glam::{DQuat, DVec3};
use tracing::debug;

use crate::config::{GrowthSpace, StepPolicy};
use crate::spatial_index::SpatialIndex;
use crate::surface::{Projection, Surface};
use crate::tree::TerminationReason;
use crate::types::{NodeId, Point2, Point3};

/// Fraction of the step used to probe the chart image of the direction.
const CHART_PROBE: f64 = 1e-3;

/// Shared, read-only inputs of every step in a run.
pub struct StepContext<'a, S: Surface + ?Sized> {
    pub surface: &'a S,
    pub index: &'a SpatialIndex,
    pub policy: &'a StepPolicy,
    pub repulsion_weight: f64,
    /// Cutoff of the distance-to-nearest-node field.
    pub repulsion_cutoff: f64,
    /// Minimum spacing to foreign nodes.
    pub spacing: f64,
}

/// State of the tip being advanced.
#[derive(Clone, Copy, Debug)]
pub struct Tip<'a> {
    pub position: Point3,
    pub direction: DVec3,
    pub normal: DVec3,
    /// Nominal step length of the branch.
    pub step_length: f64,
    /// Nodes ignored by collision and repulsion, normally the tip segment of
    /// the stepping branch.
    pub own_nodes: &'a [NodeId],
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepOutcome {
    Accepted {
        position: Point3,
        uv: Option<Point2>,
        /// Unit direction at the new tip, tangent to the surface there.
        direction: DVec3,
        normal: DVec3,
    },
    Terminated(TerminationReason),
}

/// Result of one step together with its retry trace.
#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    pub outcome: StepOutcome,
    /// Step length of every proposal, in order.
    pub attempts: Vec<f64>,
}

impl StepReport {
    /// Number of shrunken retries the step needed.
    pub fn retries(&self) -> usize {
        self.attempts.len().saturating_sub(1)
    }
}

#[derive(Debug)]
enum StepState {
    Propose { step: f64, retries: usize },
    Validate { snapped: Projection, step: f64, retries: usize },
    Retry { step: f64, retries: usize },
    Accept(Projection),
    Terminate(TerminationReason),
}

/// Projects `v` into the plane orthogonal to `normal` and normalizes it.
///
/// Returns `None` when nothing tangential is left.
#[inline]
pub fn tangent_unit(v: DVec3, normal: DVec3) -> Option<DVec3> {
    (v - normal * v.dot(normal)).try_normalize()
}

/// Rotates `direction` by `angle` about `normal`, staying in the tangent
/// plane.
pub fn rotate_in_tangent_plane(direction: DVec3, normal: DVec3, angle: f64) -> Option<DVec3> {
    let d = tangent_unit(direction, normal)?;
    tangent_unit(DQuat::from_axis_angle(normal, angle) * d, normal)
}

/// Direction update, `normalize(d + w * gradient(x))` restricted to the
/// tangent plane.
///
/// The gradient is taken of the distance to the nearest foreign node, capped
/// at the repulsion cutoff, so it points away from existing structure and
/// vanishes far from it.
///
/// ### Returns
/// `None` if the blended vector is zero or not finite.
pub fn update_direction<S: Surface + ?Sized>(
    ctx: &StepContext<'_, S>,
    tip: &Tip<'_>,
) -> Option<DVec3> {
    let mut blend = tip.direction;
    if ctx.repulsion_weight > 0.0 && !ctx.index.is_empty() {
        let field = |q: Point3| ctx.index.nearest_distance(q, ctx.repulsion_cutoff, tip.own_nodes);
        let g = ctx.surface.gradient(tip.position, &field);
        blend += g * ctx.repulsion_weight;
    }
    tangent_unit(blend, tip.normal)
}

fn chart_candidate<S: Surface + ?Sized>(
    surface: &S,
    tip: &Tip<'_>,
    direction: DVec3,
    step: f64,
) -> Option<Point3> {
    let uv0 = surface.to_parameter_space(tip.position)?;
    let probe_len = step * CHART_PROBE;
    let probe = surface.project(tip.position + direction * probe_len).ok()?;
    let uv1 = surface.to_parameter_space(probe.point)?;
    let duv = (uv1 - uv0) / probe_len;
    surface.from_parameter_space(uv0 + duv * step)
}

fn propose<S: Surface + ?Sized>(
    ctx: &StepContext<'_, S>,
    tip: &Tip<'_>,
    direction: DVec3,
    step: f64,
) -> Result<Projection, TerminationReason> {
    let candidate = match ctx.policy.growth_space {
        GrowthSpace::Surface => tip.position + direction * step,
        GrowthSpace::Chart => chart_candidate(ctx.surface, tip, direction, step)
            .ok_or(TerminationReason::OffManifold)?,
    };
    let candidate = candidate + tip.normal * ctx.policy.pre_projection_offset;

    let snapped = ctx.surface.project(candidate).map_err(|e| {
        debug!(error = %e, "candidate rejected by surface");
        TerminationReason::OffManifold
    })?;
    if snapped.point.distance(tip.position) < ctx.policy.min_advance * step {
        debug!(step, "snap truncated the step; tip reached the boundary");
        return Err(TerminationReason::OffManifold);
    }
    Ok(snapped)
}

/// Advances `tip` by one segment.
///
/// Never fails: every problem a single tip can run into is reported as a
/// [`StepOutcome::Terminated`] reason.
pub fn step<S: Surface + ?Sized>(ctx: &StepContext<'_, S>, tip: &Tip<'_>) -> StepReport {
    let mut attempts = Vec::with_capacity(1);
    let Some(direction) = update_direction(ctx, tip) else {
        return StepReport {
            outcome: StepOutcome::Terminated(TerminationReason::DegenerateDirection),
            attempts,
        };
    };

    let mut state = StepState::Propose {
        step: tip.step_length,
        retries: 0,
    };
    loop {
        state = match state {
            StepState::Propose { step, retries } => {
                attempts.push(step);
                match propose(ctx, tip, direction, step) {
                    Ok(snapped) => StepState::Validate { snapped, step, retries },
                    Err(reason) => StepState::Terminate(reason),
                }
            }
            StepState::Validate { snapped, step, retries } => {
                if ctx.index.query_excluding(snapped.point, ctx.spacing, tip.own_nodes) {
                    StepState::Retry { step, retries }
                } else {
                    StepState::Accept(snapped)
                }
            }
            StepState::Retry { step, retries } => {
                if retries >= ctx.policy.max_retries {
                    StepState::Terminate(TerminationReason::CollisionExceeded)
                } else {
                    StepState::Propose {
                        step: step * ctx.policy.shrink_factor,
                        retries: retries + 1,
                    }
                }
            }
            StepState::Accept(snapped) => {
                let direction = tangent_unit(direction, snapped.normal).unwrap_or(direction);
                return StepReport {
                    outcome: StepOutcome::Accepted {
                        position: snapped.point,
                        uv: ctx.surface.to_parameter_space(snapped.point),
                        direction,
                        normal: snapped.normal,
                    },
                    attempts,
                };
            }
            StepState::Terminate(reason) => {
                return StepReport {
                    outcome: StepOutcome::Terminated(reason),
                    attempts,
                };
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GrowthError, Result};
    use crate::surface::{EdgeRef, TriangleMesh, tangent_gradient};
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use std::collections::BTreeSet;

    /// The `z = 0` plane restricted to `|x|, |y| <= half`, with an optional
    /// fixed gradient.
    struct Plane {
        half: f64,
        forced_gradient: Option<DVec3>,
    }

    impl Surface for Plane {
        fn vertex_count(&self) -> usize {
            0
        }

        fn vertex(&self, _id: usize) -> Option<Point3> {
            None
        }

        fn project(&self, p: Point3) -> Result<Projection> {
            if p.x.abs() > self.half || p.y.abs() > self.half {
                return Err(GrowthError::OffManifold { x: p.x, y: p.y, z: p.z });
            }
            Ok(Projection {
                point: DVec3::new(p.x, p.y, 0.0),
                normal: DVec3::Z,
                triangle: 0,
                barycentric: DVec3::X,
                distance: p.z.abs(),
            })
        }

        fn gradient(&self, p: Point3, field: &dyn Fn(Point3) -> f64) -> DVec3 {
            self.forced_gradient
                .unwrap_or_else(|| tangent_gradient(p, DVec3::Z, 1e-6, field))
        }

        fn detect_boundary(&self) -> BTreeSet<EdgeRef> {
            BTreeSet::new()
        }
    }

    fn plane() -> Plane {
        Plane {
            half: 1.0,
            forced_gradient: None,
        }
    }

    fn ctx<'a, S: Surface>(
        surface: &'a S,
        index: &'a SpatialIndex,
        policy: &'a StepPolicy,
    ) -> StepContext<'a, S> {
        StepContext {
            surface,
            index,
            policy,
            repulsion_weight: 0.1,
            repulsion_cutoff: 0.1,
            spacing: 0.005,
        }
    }

    fn tip(position: Point3, own: &[NodeId]) -> Tip<'_> {
        Tip {
            position,
            direction: DVec3::Y,
            normal: DVec3::Z,
            step_length: 0.01,
            own_nodes: own,
        }
    }

    #[test]
    fn free_step_moves_one_segment_forward() {
        let surface = plane();
        let index = SpatialIndex::new(0.02);
        let policy = StepPolicy::default();
        let report = step(&ctx(&surface, &index, &policy), &tip(DVec3::ZERO, &[]));

        assert_eq!(report.attempts, vec![0.01]);
        assert_eq!(report.retries(), 0);
        match report.outcome {
            StepOutcome::Accepted { position, direction, normal, uv } => {
                assert_abs_diff_eq!(position, DVec3::new(0.0, 0.01, 0.0), epsilon = 1e-12);
                assert_abs_diff_eq!(direction, DVec3::Y, epsilon = 1e-12);
                assert_eq!(normal, DVec3::Z);
                assert_eq!(uv, None);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn repulsion_bends_away_and_stays_unit() {
        let surface = plane();
        let mut index = SpatialIndex::new(0.02);
        // Foreign node to the left of the tip.
        index.insert(7, DVec3::new(-0.02, 0.0, 0.0));
        index.rebuild();
        let policy = StepPolicy::default();
        let c = ctx(&surface, &index, &policy);

        let t = tip(DVec3::ZERO, &[]);
        let d = update_direction(&c, &t).unwrap();
        assert_relative_eq!(d.length(), 1.0, epsilon = 1e-9);
        assert!(d.x > 0.0, "direction {d} should bend away from the node");
        assert_abs_diff_eq!(d, (DVec3::Y + DVec3::X * 0.1).normalize(), epsilon = 1e-6);

        // Own nodes do not repel.
        let own = [7];
        let d = update_direction(&c, &tip(DVec3::ZERO, &own)).unwrap();
        assert_abs_diff_eq!(d, DVec3::Y, epsilon = 1e-9);
    }

    #[test]
    fn direction_is_renormalized_into_tangent_plane() {
        let surface = plane();
        let index = SpatialIndex::new(0.02);
        let policy = StepPolicy::default();
        let c = ctx(&surface, &index, &policy);
        let mut t = tip(DVec3::ZERO, &[]);
        t.direction = DVec3::new(0.0, 3.0, 4.0);
        let d = update_direction(&c, &t).unwrap();
        assert_abs_diff_eq!(d, DVec3::Y, epsilon = 1e-12);
    }

    #[test]
    fn degenerate_blend_terminates() {
        let surface = Plane {
            half: 1.0,
            forced_gradient: Some(DVec3::new(0.0, -10.0, 0.0)),
        };
        let mut index = SpatialIndex::new(0.02);
        index.insert(0, DVec3::new(0.5, 0.5, 0.0));
        index.rebuild();
        let policy = StepPolicy::default();
        let report = step(&ctx(&surface, &index, &policy), &tip(DVec3::ZERO, &[]));

        assert_eq!(
            report.outcome,
            StepOutcome::Terminated(TerminationReason::DegenerateDirection)
        );
        assert!(report.attempts.is_empty());
    }

    #[test]
    fn collision_retries_with_shrinking_steps() {
        let surface = plane();
        let mut index = SpatialIndex::new(0.02);
        // Blocks the first proposal only.
        index.insert(1, DVec3::new(0.0, 0.012, 0.0));
        index.rebuild();
        let policy = StepPolicy {
            max_retries: 3,
            shrink_factor: 0.5,
            min_advance: 0.0,
            ..Default::default()
        };
        let mut c = ctx(&surface, &index, &policy);
        c.repulsion_weight = 0.0;
        let report = step(&c, &tip(DVec3::ZERO, &[]));

        assert_eq!(report.attempts, vec![0.01, 0.005]);
        assert!(report.attempts.windows(2).all(|w| w[1] < w[0]));
        match report.outcome {
            StepOutcome::Accepted { position, .. } => {
                assert_abs_diff_eq!(position, DVec3::new(0.0, 0.005, 0.0), epsilon = 1e-12);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn exhausted_retries_terminate() {
        let surface = plane();
        // Every proposal 0.01 * 0.7^k along +Y lands within 0.005 of it.
        let mut index = SpatialIndex::new(0.02);
        index.insert(1, DVec3::new(0.0, 0.006, 0.0));
        index.rebuild();
        let policy = StepPolicy {
            max_retries: 4,
            shrink_factor: 0.7,
            min_advance: 0.0,
            ..Default::default()
        };
        let mut c = ctx(&surface, &index, &policy);
        c.repulsion_weight = 0.0;
        let report = step(&c, &tip(DVec3::ZERO, &[]));

        assert_eq!(
            report.outcome,
            StepOutcome::Terminated(TerminationReason::CollisionExceeded)
        );
        assert_eq!(report.attempts.len(), 5);
        assert_relative_eq!(report.attempts[4], 0.01 * 0.7f64.powi(4), epsilon = 1e-15);
        assert_eq!(report.retries(), 4);
        assert!(report.attempts.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn leaving_the_surface_terminates() {
        let surface = Plane {
            half: 0.005,
            forced_gradient: None,
        };
        let index = SpatialIndex::new(0.02);
        let policy = StepPolicy::default();
        let report = step(&ctx(&surface, &index, &policy), &tip(DVec3::ZERO, &[]));
        assert_eq!(report.outcome, StepOutcome::Terminated(TerminationReason::OffManifold));
        assert_eq!(report.attempts, vec![0.01]);
    }

    #[test]
    fn boundary_truncation_counts_as_off_manifold() {
        let mesh = TriangleMesh::unit_square(10).unwrap();
        let index = SpatialIndex::new(0.02);
        let policy = StepPolicy::default();
        let c = ctx(&mesh, &index, &policy);
        // One micro-step from the top edge, heading out.
        let report = step(&c, &tip(DVec3::new(0.5, 0.999, 0.0), &[]));
        assert_eq!(report.outcome, StepOutcome::Terminated(TerminationReason::OffManifold));
    }

    #[test]
    fn pre_projection_offset_is_snapped_away() {
        let mesh = TriangleMesh::unit_square(10).unwrap();
        let index = SpatialIndex::new(0.02);
        let policy = StepPolicy {
            pre_projection_offset: 0.002,
            ..Default::default()
        };
        let report = step(&ctx(&mesh, &index, &policy), &tip(DVec3::new(0.5, 0.5, 0.0), &[]));
        match report.outcome {
            StepOutcome::Accepted { position, uv, .. } => {
                assert_abs_diff_eq!(position, DVec3::new(0.5, 0.51, 0.0), epsilon = 1e-12);
                assert_abs_diff_eq!(uv.unwrap(), glam::DVec2::new(0.5, 0.51), epsilon = 1e-12);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn chart_growth_follows_the_chart() {
        let mesh = TriangleMesh::height_field(10, 10, 2.0, |_, _| 0.0).unwrap();
        let index = SpatialIndex::new(0.02);
        let policy = StepPolicy {
            growth_space: GrowthSpace::Chart,
            ..Default::default()
        };
        let c = ctx(&mesh, &index, &policy);
        let report = step(&c, &tip(DVec3::new(1.0, 1.0, 0.0), &[]));
        match report.outcome {
            StepOutcome::Accepted { position, .. } => {
                assert_abs_diff_eq!(position, DVec3::new(1.0, 1.01, 0.0), epsilon = 1e-9);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        // Stepping out of the chart leaves the manifold.
        let report = step(&c, &tip(DVec3::new(1.0, 1.995, 0.0), &[]));
        assert_eq!(report.outcome, StepOutcome::Terminated(TerminationReason::OffManifold));
    }

    #[test]
    fn rotation_stays_in_tangent_plane() {
        let d = rotate_in_tangent_plane(DVec3::Y, DVec3::Z, 0.15).unwrap();
        assert_relative_eq!(d.length(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(d.dot(DVec3::Y).acos(), 0.15, epsilon = 1e-9);
        assert_abs_diff_eq!(d.z, 0.0, epsilon = 1e-12);
        assert!(d.x < 0.0, "positive angles turn counter-clockwise about the normal");
        assert_eq!(tangent_unit(DVec3::Z, DVec3::Z), None);
    }
}
