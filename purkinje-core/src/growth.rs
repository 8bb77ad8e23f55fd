//! Generation loop: seeds the root, steps every active tip in a fixed order,
//! spawns bifurcations at generation boundaries and finalizes the tree.
//!
//! One generation looks like:
//! 1. Round-robin stepping: every growing branch (ascending id) takes one
//!    step per pass, until each has met its quota or terminated.
//! 2. Rebuild: buffered nodes become visible to collision queries.
//! 3. Bifurcation: completed branches hand their tip to one or two children
//!    (or to the fascicles, for the root).
//! 4. Bookkeeping: terminal refresh, invariant check, report.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{GrowthConfig, RebuildPolicy};
use crate::error::{GrowthError, Result};
use crate::spatial_index::SpatialIndex;
use crate::stepper::{self, StepContext, StepOutcome, Tip, rotate_in_tangent_plane, tangent_unit};
use crate::surface::Surface;
use crate::tree::{Branch, BranchKind, BranchSeed, Edge, Node, TerminationReason, TreeState};
use crate::types::{BranchId, NodeId};

/// Counts that help tuning parameters; not needed for correctness.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GrowthDiagnostics {
    pub generations_run: usize,
    pub accepted_segments: usize,
    pub retries: usize,
    pub bifurcations: usize,
    pub collision_terminations: usize,
    pub off_manifold_terminations: usize,
    pub degenerate_terminations: usize,
    pub budget_terminations: usize,
    pub rebuilds: usize,
    pub rebuild_policy: RebuildPolicy,
}

impl GrowthDiagnostics {
    fn record(&mut self, reason: TerminationReason) {
        match reason {
            TerminationReason::CollisionExceeded => self.collision_terminations += 1,
            TerminationReason::OffManifold => self.off_manifold_terminations += 1,
            TerminationReason::DegenerateDirection => self.degenerate_terminations += 1,
            TerminationReason::Budget => self.budget_terminations += 1,
        }
    }

    /// Terminations caused by a failed step.
    pub fn early_terminations(&self) -> usize {
        self.collision_terminations + self.off_manifold_terminations + self.degenerate_terminations
    }
}

/// Summary of one generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationReport {
    pub generation: usize,
    /// Branches growing when the generation started.
    pub active: usize,
    pub accepted: usize,
    pub terminated: usize,
    /// Branches spawned at the end of the generation.
    pub spawned: usize,
}

/// Finalized, read-only growth result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FractalTree {
    /// Index = node id.
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Degree-1 leaves.
    pub terminals: BTreeSet<NodeId>,
    pub branches: Vec<Branch>,
    pub diagnostics: GrowthDiagnostics,
}

impl FractalTree {
    /// Node coordinates as plain arrays.
    pub fn nodes_xyz(&self) -> Vec<[f64; 3]> {
        self.nodes.iter().map(|n| n.position.to_array()).collect()
    }

    /// Edge list as node id pairs.
    pub fn connectivity(&self) -> Vec<[NodeId; 2]> {
        self.edges.iter().map(|e| [e.parent, e.child]).collect()
    }

    /// Terminal ids, ascending.
    pub fn end_nodes(&self) -> Vec<NodeId> {
        self.terminals.iter().copied().collect()
    }

    /// Degree of every node.
    pub fn degrees(&self) -> Vec<usize> {
        let mut degree = vec![0; self.nodes.len()];
        for e in &self.edges {
            degree[e.parent] += 1;
            degree[e.child] += 1;
        }
        degree
    }

    /// Number of branches per generation index.
    pub fn branches_per_generation(&self) -> Vec<usize> {
        let depth = self.branches.iter().map(|b| b.generation + 1).max().unwrap_or(0);
        let mut counts = vec![0; depth];
        for b in &self.branches {
            counts[b.generation] += 1;
        }
        counts
    }
}

/// Owns the state of one growth run over a borrowed surface.
pub struct Grower<'s, S: Surface + ?Sized> {
    surface: &'s S,
    cfg: GrowthConfig,
    tree: TreeState,
    index: SpatialIndex,
    rng: StdRng,
    diagnostics: GrowthDiagnostics,
    /// Next generation to run.
    generation: usize,
    inserted_since_rebuild: usize,
}

impl<'s, S: Surface + ?Sized> Grower<'s, S> {
    /// Validates `cfg` against `surface` and seeds the root branch.
    ///
    /// ### Errors
    /// [`GrowthError::InvalidParameters`] if a parameter is out of range, a
    /// seed id is not a surface vertex, or the initial direction has no
    /// tangential component.
    pub fn new(surface: &'s S, cfg: GrowthConfig) -> Result<Self> {
        cfg.validate()?;
        let n = surface.vertex_count();
        let seed_vertex = |id: usize, name: &str| {
            surface.vertex(id).ok_or_else(|| {
                GrowthError::invalid(format!("{name} {id} out of range [0, {n})"))
            })
        };
        let root_vertex = seed_vertex(cfg.init_node_id, "init_node_id")?;
        let second_vertex = match cfg.second_node_id {
            Some(id) => Some(seed_vertex(id, "second_node_id")?),
            None => None,
        };

        let root = surface
            .project(root_vertex)
            .map_err(|e| GrowthError::invalid(format!("root vertex is not on the surface: {e}")))?;
        let raw_direction = match (cfg.init_direction, second_vertex) {
            (Some(d), _) => d,
            (None, Some(second)) => second - root.point,
            (None, None) => {
                return Err(GrowthError::invalid(
                    "either second_node_id or init_direction is required",
                ));
            }
        };
        let direction = tangent_unit(raw_direction, root.normal).ok_or_else(|| {
            GrowthError::invalid("initial direction has no component tangent to the surface")
        })?;

        info!(
            meshfile = ?cfg.meshfile,
            init_node_id = cfg.init_node_id,
            second_node_id = ?cfg.second_node_id,
            generations = cfg.generations,
            init_length = cfg.init_length,
            length = cfg.length,
            branch_angle = cfg.branch_angle,
            w = cfg.repulsion_weight,
            l_segment = cfg.l_segment,
            spacing = cfg.spacing(),
            fascicles = cfg.fascicles_angles.len(),
            "initialized growth"
        );
        if let Ok(json) = cfg.to_json() {
            debug!(config = %json, "full growth config");
        }

        let mut tree = TreeState::new();
        let mut index = SpatialIndex::new(cfg.spacing().max(cfg.repulsion_cutoff() / 4.0));

        let uv = surface.to_parameter_space(root.point);
        let root_node = tree.add_node(root.point, uv, 0);
        let quota = cfg.segments_for(cfg.init_length);
        tree.spawn_branch(BranchSeed {
            kind: BranchKind::Root,
            generation: 0,
            parent: None,
            start: root_node,
            direction,
            normal: root.normal,
            quota,
            step_length: cfg.init_length / quota as f64,
        });
        index.insert(root_node, root.point);
        index.rebuild();

        let diagnostics = GrowthDiagnostics {
            rebuild_policy: cfg.rebuild,
            ..Default::default()
        };
        Ok(Self {
            surface,
            rng: StdRng::seed_from_u64(cfg.seed),
            cfg,
            tree,
            index,
            diagnostics,
            generation: 0,
            inserted_since_rebuild: 0,
        })
    }

    pub fn tree(&self) -> &TreeState {
        &self.tree
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn config(&self) -> &GrowthConfig {
        &self.cfg
    }

    /// Index of the next generation to run.
    pub fn generation(&self) -> usize {
        self.generation
    }

    fn rebuild_index(&mut self) {
        self.index.rebuild();
        self.inserted_since_rebuild = 0;
    }

    /// Steps `branch` once and applies the outcome.
    ///
    /// Returns `true` if a segment was accepted.
    fn advance(&mut self, branch: BranchId) -> Result<bool> {
        let b = self.tree.branch(branch);
        let tip = Tip {
            position: self.tree.position(b.tip()),
            direction: b.direction,
            normal: b.normal,
            step_length: b.step_length,
            own_nodes: b.tip_segment(),
        };
        let ctx = StepContext {
            surface: self.surface,
            index: &self.index,
            policy: &self.cfg.step,
            repulsion_weight: self.cfg.repulsion_weight,
            repulsion_cutoff: self.cfg.repulsion_cutoff(),
            spacing: self.cfg.spacing(),
        };
        let report = stepper::step(&ctx, &tip);
        self.diagnostics.retries += report.retries();

        match report.outcome {
            StepOutcome::Accepted {
                position,
                uv,
                direction,
                normal,
            } => {
                let id = self.tree.extend_branch(branch, position, uv, direction, normal)?;
                self.index.insert(id, position);
                self.diagnostics.accepted_segments += 1;
                self.inserted_since_rebuild += 1;
                if let RebuildPolicy::EveryInsertions(n) = self.cfg.rebuild
                    && self.inserted_since_rebuild >= n
                {
                    self.rebuild_index();
                }
                Ok(true)
            }
            StepOutcome::Terminated(reason) => {
                if self.tree.terminate_branch(branch, reason) {
                    self.diagnostics.record(reason);
                    let tip = self.tree.branch(branch).tip();
                    debug!(branch, ?reason, tip, "branch terminated");
                }
                Ok(false)
            }
        }
    }

    fn child_length(&mut self, mean: f64) -> f64 {
        if self.cfg.length_jitter > 0.0 {
            let j = self.cfg.length_jitter;
            mean * (1.0 + self.rng.random_range(-j..=j))
        } else {
            mean
        }
    }

    fn spawn_child(&mut self, parent: BranchId, kind: BranchKind, angle: f64, length: f64) {
        let p = self.tree.branch(parent);
        let direction = if angle == 0.0 {
            p.direction
        } else {
            rotate_in_tangent_plane(p.direction, p.normal, angle).unwrap_or(p.direction)
        };
        let quota = self.cfg.segments_for(length);
        let seed = BranchSeed {
            kind,
            generation: p.generation + 1,
            parent: Some(parent),
            start: p.tip(),
            direction,
            normal: p.normal,
            quota,
            step_length: length / quota as f64,
        };
        self.tree.spawn_branch(seed);
    }

    /// Hands the tip of every completed branch in `completed` over to its
    /// children. Returns the number of branches spawned.
    fn spawn_children(&mut self, completed: &[BranchId]) -> usize {
        let before = self.tree.branches().len();
        for &id in completed {
            let b = self.tree.branch(id);
            if !b.is_growing() || !b.completed() {
                continue;
            }
            let (kind, generation) = (b.kind, b.generation);

            if kind == BranchKind::Root && !self.cfg.fascicles_angles.is_empty() {
                let fascicles: Vec<(f64, f64)> = self
                    .cfg
                    .fascicles_angles
                    .iter()
                    .copied()
                    .zip(self.cfg.fascicles_length.iter().copied())
                    .collect();
                for (angle, length) in fascicles {
                    self.spawn_child(id, BranchKind::Fascicle, angle, length);
                }
            } else if self.cfg.bifurcation.splits_after(generation) {
                let angle = self.cfg.branch_angle;
                for signed in [angle, -angle] {
                    let length = self.child_length(self.cfg.length);
                    self.spawn_child(id, BranchKind::Regular, signed, length);
                }
                self.diagnostics.bifurcations += 1;
            } else {
                let length = self.child_length(self.cfg.length);
                self.spawn_child(id, BranchKind::Regular, 0.0, length);
            }
            self.tree.retire_branch(id);
        }
        self.tree.branches().len() - before
    }

    /// Runs one generation.
    ///
    /// Returns `None` without doing anything if the generation budget is
    /// spent or no branch is growing.
    pub fn run_generation(&mut self) -> Result<Option<GenerationReport>> {
        if self.generation >= self.cfg.generations {
            return Ok(None);
        }
        let active = self.tree.growing();
        if active.is_empty() {
            return Ok(None);
        }

        let mut accepted = 0;
        let mut pending = active.clone();
        while !pending.is_empty() {
            let mut still = Vec::with_capacity(pending.len());
            for &id in &pending {
                if self.advance(id)? {
                    accepted += 1;
                }
                let b = self.tree.branch(id);
                if b.is_growing() && !b.completed() {
                    still.push(id);
                }
            }
            pending = still;
        }
        let terminated = active
            .iter()
            .filter(|&&id| self.tree.branch(id).termination.is_some())
            .count();

        self.rebuild_index();
        let spawned = self.spawn_children(&active);
        self.tree.refresh_terminals();
        self.tree.check_invariants()?;

        let report = GenerationReport {
            generation: self.generation,
            active: active.len(),
            accepted,
            terminated,
            spawned,
        };
        info!(
            generation = report.generation,
            active = report.active,
            accepted = report.accepted,
            terminated = report.terminated,
            spawned = report.spawned,
            nodes = self.tree.nodes().len(),
            "generation complete"
        );
        self.generation += 1;
        self.diagnostics.generations_run = self.generation;
        Ok(Some(report))
    }

    /// Runs every remaining generation and finalizes the tree.
    pub fn run(mut self) -> Result<FractalTree> {
        while self.run_generation()?.is_some() {}
        if self.generation < self.cfg.generations {
            warn!(
                generation = self.generation,
                budget = self.cfg.generations,
                "no growing branches left before the generation budget"
            );
        }
        self.finalize()
    }

    /// Terminates the remaining branches and freezes the tree.
    pub fn finalize(mut self) -> Result<FractalTree> {
        if self.index.is_dirty() {
            self.rebuild_index();
        }
        for id in self.tree.growing() {
            if self.tree.terminate_branch(id, TerminationReason::Budget) {
                self.diagnostics.record(TerminationReason::Budget);
            }
        }
        self.tree.refresh_terminals();
        self.tree.check_invariants()?;
        self.diagnostics.rebuilds = self.index.rebuild_count();

        let d = &self.diagnostics;
        info!(
            nodes = self.tree.nodes().len(),
            edges = self.tree.edges().len(),
            terminals = self.tree.terminals().len(),
            branches = self.tree.branches().len(),
            retries = d.retries,
            collision = d.collision_terminations,
            off_manifold = d.off_manifold_terminations,
            degenerate = d.degenerate_terminations,
            rebuilds = d.rebuilds,
            "growth finished"
        );

        let (nodes, edges, terminals, branches) = self.tree.into_parts();
        Ok(FractalTree {
            nodes,
            edges,
            terminals,
            branches,
            diagnostics: self.diagnostics,
        })
    }
}

/// Grows a tree on `surface` with `cfg` in one call.
pub fn grow<S: Surface + ?Sized>(surface: &S, cfg: GrowthConfig) -> Result<FractalTree> {
    Grower::new(surface, cfg)?.run()
}
