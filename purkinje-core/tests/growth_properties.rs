use std::collections::HashSet;

use approx::assert_abs_diff_eq;
use purkinje_core::tree::BranchKind;
use purkinje_core::{
    FractalTree, GrowthConfig, GrowthError, GrowthSpace, RebuildPolicy, Surface, TriangleMesh,
    grow,
};

const N: usize = 30;

/// Smooth bump over the unit square.
fn cap() -> TriangleMesh {
    TriangleMesh::height_field(N, N, 1.0, |x, y| {
        let r2 = (x - 0.5).powi(2) + (y - 0.5).powi(2);
        0.3 * (-r2 / 0.1).exp()
    })
    .unwrap()
}

fn vid(i: usize, j: usize) -> usize {
    j * (N + 1) + i
}

fn cfg(generations: usize) -> GrowthConfig {
    GrowthConfig {
        init_node_id: vid(15, 3),
        second_node_id: Some(vid(15, 4)),
        generations,
        ..Default::default()
    }
}

fn assert_is_tree(tree: &FractalTree) {
    let n = tree.nodes.len();
    assert_eq!(tree.edges.len(), n - 1, "a connected tree has n - 1 edges");

    let mut seen = HashSet::new();
    for e in &tree.edges {
        assert!(e.parent < n && e.child < n);
        assert_ne!(e.parent, e.child);
        assert!(seen.insert((e.parent.min(e.child), e.parent.max(e.child))));
    }

    let degrees = tree.degrees();
    for &t in &tree.terminals {
        assert_eq!(degrees[t], 1, "terminal {t}");
    }
    for (id, node) in tree.nodes.iter().enumerate() {
        assert_eq!(node.id, id);
        assert!(node.position.is_finite());
    }
}

#[test]
fn curved_growth_keeps_a_tree_on_the_surface() {
    let mesh = cap();
    let tree = grow(&mesh, cfg(5)).unwrap();

    assert!(tree.nodes.len() > 100);
    assert_is_tree(&tree);
    assert!(!tree.terminals.is_empty());

    for node in &tree.nodes {
        let p = mesh.project(node.position).unwrap();
        assert_abs_diff_eq!(p.distance, 0.0, epsilon = 1e-9);
    }
}

#[test]
fn identical_inputs_grow_identical_trees() {
    let mesh = cap();
    let a = grow(&mesh, cfg(4)).unwrap();
    let b = grow(&mesh, cfg(4)).unwrap();
    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}

#[test]
fn nodes_keep_spacing_to_older_generations() {
    let mesh = cap();
    let config = cfg(5);
    let spacing = config.spacing();
    let tree = grow(&mesh, config).unwrap();

    let generation = |node: usize| tree.branches[tree.nodes[node].branch].generation;
    for a in &tree.nodes {
        let own = &tree.branches[a.branch].nodes;
        for b in &tree.nodes {
            if generation(b.id) >= generation(a.id) || own.contains(&b.id) {
                continue;
            }
            let d = a.position.distance(b.position);
            assert!(d >= spacing - 1e-12, "nodes {} and {} are {d} apart", a.id, b.id);
        }
    }
}

#[test]
fn per_insertion_rebuilds_keep_spacing_to_every_earlier_node() {
    let mesh = cap();
    let config = GrowthConfig {
        rebuild: RebuildPolicy::EveryInsertions(1),
        ..cfg(4)
    };
    let spacing = config.spacing();
    let tree = grow(&mesh, config).unwrap();

    assert!(tree.diagnostics.rebuilds >= tree.nodes.len() - 1);
    for a in &tree.nodes[1..] {
        // Only the two nodes behind `a` on its branch were exempt.
        let own = &tree.branches[a.branch].nodes;
        let k = own.iter().position(|&id| id == a.id).unwrap();
        let exempt = &own[k.saturating_sub(2)..k];
        for b in &tree.nodes[..a.id] {
            if exempt.contains(&b.id) {
                continue;
            }
            let d = a.position.distance(b.position);
            assert!(d >= spacing - 1e-12, "nodes {} and {} are {d} apart", a.id, b.id);
        }
    }
    assert_is_tree(&tree);
}

#[test]
fn first_segments_of_siblings_open_at_twice_the_branch_angle() {
    let mesh = TriangleMesh::unit_square(20).unwrap();
    let config = GrowthConfig {
        init_node_id: 21 * 2 + 10,
        second_node_id: Some(21 * 3 + 10),
        generations: 2,
        repulsion_weight: 0.0,
        branch_angle: 0.3,
        ..Default::default()
    };
    let tree = grow(&mesh, config).unwrap();

    let first_dir = |branch: usize| {
        let nodes = &tree.branches[branch].nodes;
        (tree.nodes[nodes[1]].position - tree.nodes[nodes[0]].position).normalize()
    };
    let (left, right) = (first_dir(1), first_dir(2));
    assert_abs_diff_eq!(left.angle_between(right), 0.6, epsilon = 1e-9);
    assert_abs_diff_eq!(left.angle_between(first_dir(0)), 0.3, epsilon = 1e-9);
}

#[test]
fn fascicles_grow_from_the_root_tip() {
    let mesh = cap();
    let config = GrowthConfig {
        fascicles_angles: vec![-0.6, 0.0, 0.6],
        fascicles_length: vec![0.05, 0.1, 0.05],
        ..cfg(3)
    };
    let tree = grow(&mesh, config).unwrap();
    let root_tip = *tree.branches[0].nodes.last().unwrap();

    let fascicles: Vec<_> = tree
        .branches
        .iter()
        .filter(|b| b.kind == BranchKind::Fascicle)
        .collect();
    assert_eq!(fascicles.len(), 3);
    for f in fascicles {
        assert_eq!(f.parent, Some(0));
        assert_eq!(f.nodes[0], root_tip);
    }
    assert_is_tree(&tree);
}

#[test]
fn chart_growth_stays_inside_the_chart() {
    let mesh = cap();
    let mut config = cfg(4);
    config.step.growth_space = GrowthSpace::Chart;
    let tree = grow(&mesh, config).unwrap();

    assert!(tree.nodes.len() > 30);
    for node in &tree.nodes {
        let uv = node.uv.expect("chart coordinates");
        assert!((0.0..=1.0).contains(&uv.x) && (0.0..=1.0).contains(&uv.y));
    }
    assert_is_tree(&tree);
}

#[test]
fn json_parameters_drive_a_run() {
    let mesh = cap();
    let json = format!(
        r#"{{
            "init_node_id": {},
            "second_node_id": {},
            "N_it": 2,
            "w": 0.05,
            "length": 0.08,
            "save": true
        }}"#,
        vid(15, 3),
        vid(15, 4)
    );
    let config = GrowthConfig::from_json(&json).unwrap();
    assert_eq!(config.generations, 2);

    let tree = grow(&mesh, config).unwrap();
    assert_eq!(tree.branches_per_generation(), vec![1, 2, 4]);

    let out: serde_json::Value = serde_json::to_value(&tree).unwrap();
    for key in ["nodes", "edges", "terminals", "branches", "diagnostics"] {
        assert!(out.get(key).is_some(), "missing {key}");
    }
}

#[test]
fn invalid_parameters_abort_before_growth() {
    let mesh = cap();
    let config = GrowthConfig {
        l_segment: 0.5,
        ..cfg(2)
    };
    assert!(matches!(grow(&mesh, config), Err(GrowthError::InvalidParameters(_))));
}
