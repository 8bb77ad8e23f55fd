use std::collections::{BTreeSet, HashSet};

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::error::{GrowthError, Result};
use crate::types::{BranchId, NodeId, Point2, Point3};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub position: Point3,
    /// Chart coordinates, when the surface carries a chart.
    pub uv: Option<Point2>,
    /// Branch that placed this node.
    pub branch: BranchId,
}

/// Undirected edge; `parent` is the endpoint closer to the root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub parent: NodeId,
    pub child: NodeId,
    pub branch: BranchId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchStatus {
    Growing,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Every retry of a step collided with existing structure.
    CollisionExceeded,
    /// The candidate left the surface.
    OffManifold,
    /// The blended direction vanished.
    DegenerateDirection,
    /// The generation budget ran out.
    Budget,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchKind {
    Root,
    Fascicle,
    Regular,
}

/// A growing (or finished) chain of nodes.
///
/// `nodes[0]` is the start node, shared with the parent branch's tip for
/// every non-root branch. The last entry is the current tip.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub kind: BranchKind,
    pub generation: usize,
    pub parent: Option<BranchId>,
    pub nodes: Vec<NodeId>,
    /// Unit growth direction at the tip.
    pub direction: DVec3,
    /// Unit surface normal at the tip.
    pub normal: DVec3,
    /// Segments to grow before bifurcation is evaluated.
    pub quota: usize,
    pub segments: usize,
    /// Nominal step, `branch length / quota`.
    pub step_length: f64,
    pub status: BranchStatus,
    pub termination: Option<TerminationReason>,
}

impl Branch {
    #[inline]
    pub fn tip(&self) -> NodeId {
        self.nodes[self.nodes.len() - 1]
    }

    /// The tip and its predecessor on this branch. Collision and repulsion
    /// ignore these; every older node of the branch counts as structure.
    #[inline]
    pub fn tip_segment(&self) -> &[NodeId] {
        &self.nodes[self.nodes.len().saturating_sub(2)..]
    }

    #[inline]
    pub fn is_growing(&self) -> bool {
        self.status == BranchStatus::Growing
    }

    /// Returns `true` once the segment quota is met.
    #[inline]
    pub fn completed(&self) -> bool {
        self.segments >= self.quota
    }
}

/// Parameters of a branch about to be spawned.
#[derive(Clone, Copy, Debug)]
pub struct BranchSeed {
    pub kind: BranchKind,
    pub generation: usize,
    pub parent: Option<BranchId>,
    pub start: NodeId,
    pub direction: DVec3,
    pub normal: DVec3,
    pub quota: usize,
    pub step_length: f64,
}

/// Mutable tree under construction.
///
/// Nodes and edges are append-only. All mutation goes through methods that
/// keep the degree table and edge set in sync.
#[derive(Debug, Default)]
pub struct TreeState {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    edge_keys: HashSet<(NodeId, NodeId)>,
    degree: Vec<usize>,
    terminals: BTreeSet<NodeId>,
    branches: Vec<Branch>,
}

impl TreeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn branch(&self, id: BranchId) -> &Branch {
        &self.branches[id]
    }

    pub fn terminals(&self) -> &BTreeSet<NodeId> {
        &self.terminals
    }

    pub fn degree(&self, id: NodeId) -> usize {
        self.degree.get(id).copied().unwrap_or(0)
    }

    pub fn position(&self, id: NodeId) -> Point3 {
        self.nodes[id].position
    }

    /// Ids of branches that are still growing, ascending.
    pub fn growing(&self) -> Vec<BranchId> {
        self.branches
            .iter()
            .filter(|b| b.is_growing())
            .map(|b| b.id)
            .collect()
    }

    pub fn add_node(&mut self, position: Point3, uv: Option<Point2>, branch: BranchId) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            position,
            uv,
            branch,
        });
        self.degree.push(0);
        id
    }

    fn add_edge(&mut self, parent: NodeId, child: NodeId, branch: BranchId) -> Result<()> {
        let n = self.nodes.len();
        if parent >= n || child >= n {
            return Err(GrowthError::InvariantViolation(format!(
                "edge ({parent}, {child}) references a missing node"
            )));
        }
        if parent == child {
            return Err(GrowthError::InvariantViolation(format!("self edge at node {parent}")));
        }
        if !self.edge_keys.insert((parent.min(child), parent.max(child))) {
            return Err(GrowthError::InvariantViolation(format!(
                "duplicate edge ({parent}, {child})"
            )));
        }
        self.edges.push(Edge {
            parent,
            child,
            branch,
        });
        self.degree[parent] += 1;
        self.degree[child] += 1;
        Ok(())
    }

    pub fn spawn_branch(&mut self, seed: BranchSeed) -> BranchId {
        let id = self.branches.len();
        self.branches.push(Branch {
            id,
            kind: seed.kind,
            generation: seed.generation,
            parent: seed.parent,
            nodes: vec![seed.start],
            direction: seed.direction,
            normal: seed.normal,
            quota: seed.quota,
            segments: 0,
            step_length: seed.step_length,
            status: BranchStatus::Growing,
            termination: None,
        });
        id
    }

    /// Appends an accepted segment to `branch`: a new node, the edge from the
    /// old tip, and the updated tip state.
    pub fn extend_branch(
        &mut self,
        branch: BranchId,
        position: Point3,
        uv: Option<Point2>,
        direction: DVec3,
        normal: DVec3,
    ) -> Result<NodeId> {
        let tip = self.branches[branch].tip();
        let id = self.add_node(position, uv, branch);
        self.add_edge(tip, id, branch)?;
        let b = &mut self.branches[branch];
        b.nodes.push(id);
        b.direction = direction;
        b.normal = normal;
        b.segments += 1;
        Ok(id)
    }

    /// Moves `branch` to `Terminated`. Returns `false` if it already was.
    pub fn terminate_branch(&mut self, branch: BranchId, reason: TerminationReason) -> bool {
        let b = &mut self.branches[branch];
        if !b.is_growing() {
            return false;
        }
        b.status = BranchStatus::Terminated;
        b.termination = Some(reason);
        true
    }

    /// Marks `branch` as finished without a termination reason; used when it
    /// hands its tip over to children.
    pub fn retire_branch(&mut self, branch: BranchId) {
        self.branches[branch].status = BranchStatus::Terminated;
    }

    /// Recomputes the terminal set: tips of terminated branches that have no
    /// children and degree one.
    pub fn refresh_terminals(&mut self) {
        let growing_starts: HashSet<NodeId> = self
            .branches
            .iter()
            .filter(|b| b.is_growing())
            .map(|b| b.nodes[0])
            .collect();
        self.terminals = self
            .branches
            .iter()
            .filter(|b| !b.is_growing())
            .map(|b| b.tip())
            .filter(|tip| self.degree[*tip] == 1 && !growing_starts.contains(tip))
            .collect();
    }

    /// Checks the structural invariants of the tree.
    ///
    /// 1. Edge endpoints are valid node ids.
    /// 2. No self edges and no duplicate undirected edges.
    /// 3. The edges form a forest.
    /// 4. Terminals have degree one.
    /// 5. Coordinates are finite.
    /// 6. Terminals are nodes.
    pub fn check_invariants(&self) -> Result<()> {
        let n = self.nodes.len();
        let fail = |msg: String| Err(GrowthError::InvariantViolation(msg));

        let mut seen = HashSet::with_capacity(self.edges.len());
        let mut parent: Vec<usize> = (0..n).collect();
        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }

        for e in &self.edges {
            if e.parent >= n || e.child >= n {
                return fail(format!("edge ({}, {}) out of range", e.parent, e.child));
            }
            if e.parent == e.child {
                return fail(format!("self edge at {}", e.parent));
            }
            if !seen.insert((e.parent.min(e.child), e.parent.max(e.child))) {
                return fail(format!("duplicate edge ({}, {})", e.parent, e.child));
            }
            let (a, b) = (find(&mut parent, e.parent), find(&mut parent, e.child));
            if a == b {
                return fail(format!("edge ({}, {}) closes a cycle", e.parent, e.child));
            }
            parent[a] = b;
        }

        for &t in &self.terminals {
            if t >= n {
                return fail(format!("terminal {t} is not a node"));
            }
            if self.degree[t] != 1 {
                return fail(format!("terminal {t} has degree {}", self.degree[t]));
            }
        }

        if let Some(node) = self.nodes.iter().find(|node| !node.position.is_finite()) {
            return fail(format!("node {} has non-finite position", node.id));
        }
        Ok(())
    }

    pub fn into_parts(self) -> (Vec<Node>, Vec<Edge>, BTreeSet<NodeId>, Vec<Branch>) {
        (self.nodes, self.edges, self.terminals, self.branches)
    }
}
