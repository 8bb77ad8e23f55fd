//! Command-line driver for the growth engine.
//!
//! Grows a tree on a generated demo surface, with parameters taken from a
//! JSON file and/or command line overrides, and optionally writes the result
//! as JSON.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use glam::DVec3;
use purkinje_core::{FractalTree, GrowthConfig, GrowthSpace, Surface, TriangleMesh, grow};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Demo {
    /// Flat unit square.
    Flat,
    /// Unit square with a smooth bump in the middle.
    Cap,
}

#[derive(Debug, Parser)]
#[command(
    name = "purkinje-grow",
    version,
    about = "Grow a fractal Purkinje tree on a demo surface"
)]
struct Args {
    /// JSON parameter file; command line values override it.
    #[arg(short, long)]
    params: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Demo::Cap)]
    surface: Demo,

    /// Grid cells per side of the demo surface.
    #[arg(long, default_value_t = 40)]
    resolution: usize,

    /// Root vertex; defaults to the bottom centre of the demo surface.
    #[arg(long)]
    init_node: Option<usize>,

    /// Initial direction as `x,y,z`; replaces the second seed vertex.
    #[arg(long, value_parser = parse_vec3)]
    direction: Option<DVec3>,

    #[arg(long)]
    generations: Option<usize>,

    /// Repulsion weight.
    #[arg(short, long)]
    w: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Grow in the surface chart instead of in 3-D.
    #[arg(long)]
    chart: bool,

    /// Writes the finalized tree as JSON.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pretty-prints JSON output.
    #[arg(long)]
    pretty: bool,

    /// Writes the effective parameters as JSON.
    #[arg(long)]
    save_params: Option<PathBuf>,
}

fn parse_vec3(s: &str) -> Result<DVec3> {
    let parts = s
        .split(',')
        .map(|c| c.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid vector {s:?}"))?;
    match parts[..] {
        [x, y, z] => Ok(DVec3::new(x, y, z)),
        _ => bail!("expected three comma-separated components, got {s:?}"),
    }
}

fn demo_surface(kind: Demo, n: usize) -> Result<TriangleMesh> {
    let mesh = match kind {
        Demo::Flat => TriangleMesh::unit_square(n),
        Demo::Cap => TriangleMesh::height_field(n, n, 1.0, |x, y| {
            let r2 = (x - 0.5).powi(2) + (y - 0.5).powi(2);
            0.3 * (-r2 / 0.1).exp()
        }),
    };
    mesh.context("failed to build demo surface")
}

fn configure(args: &Args) -> Result<GrowthConfig> {
    let mut cfg = match &args.params {
        Some(path) => GrowthConfig::from_json_file(path)
            .with_context(|| format!("failed to load parameters from {}", path.display()))?,
        None => {
            // Bottom centre heading up the grid.
            let n = args.resolution;
            let (i, j) = (n / 2, (n / 10).max(1));
            GrowthConfig {
                init_node_id: j * (n + 1) + i,
                second_node_id: Some((j + 1) * (n + 1) + i),
                ..Default::default()
            }
        }
    };

    if let Some(id) = args.init_node {
        cfg.init_node_id = id;
    }
    if let Some(d) = args.direction {
        cfg.init_direction = Some(d);
        cfg.second_node_id = None;
    }
    if let Some(g) = args.generations {
        cfg.generations = g;
    }
    if let Some(w) = args.w {
        cfg.repulsion_weight = w;
    }
    if let Some(seed) = args.seed {
        cfg.seed = seed;
    }
    if args.chart {
        cfg.step.growth_space = GrowthSpace::Chart;
    }
    Ok(cfg)
}

fn write_tree(tree: &FractalTree, path: &Path, pretty: bool) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let writer = BufWriter::new(file);
    if pretty {
        serde_json::to_writer_pretty(writer, tree)?;
    } else {
        serde_json::to_writer(writer, tree)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = configure(&args)?;
    let mesh = demo_surface(args.surface, args.resolution)?;
    info!(
        surface = ?args.surface,
        vertices = mesh.vertex_count(),
        triangles = mesh.triangles().len(),
        boundary_edges = mesh.detect_boundary().len(),
        "demo surface ready"
    );

    if let Some(path) = &args.save_params {
        cfg.to_json_file(path)
            .with_context(|| format!("failed to save parameters to {}", path.display()))?;
    }

    let tree = grow(&mesh, cfg).context("growth failed")?;
    info!(
        nodes = tree.nodes.len(),
        edges = tree.edges.len(),
        terminals = tree.terminals.len(),
        per_generation = ?tree.branches_per_generation(),
        early_terminations = tree.diagnostics.early_terminations(),
        "tree grown"
    );

    if let Some(path) = &args.output {
        write_tree(&tree, path, args.pretty)?;
        info!(path = %path.display(), "tree written");
    }
    Ok(())
}
