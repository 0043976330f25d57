use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::{Color, Colorize};
use modelsplit::{
    graph::dot::DotOptions, partition_model, profile::ProfileSet, PartitionedModel, RunConfig,
    SequentialPartitioner, Trace,
};
use rayon::prelude::*;
use tracing_subscriber::EnvFilter;

/// Partition traced models across devices.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// A trace file, or a directory of `*.json` traces
    #[arg(short, long)]
    traces: PathBuf,
    /// JSON run configuration
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// CSV of per-layer timings (`scope,forward_ms,backward_ms,memory_bytes`)
    #[arg(short, long)]
    profile: Option<PathBuf>,
    /// Number of target devices; overrides the configuration
    #[arg(short, long)]
    devices: Option<usize>,
    /// Multiplier turning mean layer milliseconds into solver weights
    #[arg(long)]
    time_scale: Option<f64>,
    /// Allow partitions that are not connected
    #[arg(long)]
    no_contiguous: bool,
    /// Directory receiving `<trace>.json` results and `<trace>.dot` graphs
    #[arg(short, long)]
    out_dir: Option<PathBuf>,
    /// Draw parameter and buffer nodes in the DOT output
    #[arg(long)]
    show_params: bool,
}

fn load_config(args: &Args) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_path(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RunConfig::default(),
    };
    if let Some(path) = &args.profile {
        let profiles = ProfileSet::from_path(path)
            .with_context(|| format!("Failed to load profile {}", path.display()))?;
        tracing::info!("loaded {} layer profiles", profiles.len());
        for (scope, profile) in profiles.iter() {
            tracing::debug!(
                "profile {}: fwd {:.3}ms bwd {:.3}ms, {} bytes",
                scope,
                profile.forward_ms,
                profile.backward_ms,
                profile.memory_bytes
            );
        }
        config.build = config.build.with_profiles(profiles);
    }
    if let Some(devices) = args.devices {
        config.partition.devices = devices;
    }
    if let Some(scale) = args.time_scale {
        config.partition.weights.time_scale = scale;
    }
    if args.no_contiguous {
        config.partition.contiguous = false;
    }
    config.validate()?;
    Ok(config)
}

fn trace_paths(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_dir() {
        let pattern = path.join("*.json");
        let pattern = pattern
            .to_str()
            .ok_or_else(|| anyhow!("Non UTF-8 trace directory {}", path.display()))?;
        Ok(glob::glob(pattern)?.collect::<Result<Vec<_>, _>>()?)
    } else {
        Ok(vec![path.to_path_buf()])
    }
}

fn stage_color(partition: usize) -> Color {
    const COLORS: [Color; 6] = [
        Color::Green,
        Color::Red,
        Color::Yellow,
        Color::Blue,
        Color::Magenta,
        Color::Cyan,
    ];
    COLORS[partition % COLORS.len()]
}

fn print_result(path: &Path, model: &PartitionedModel) {
    println!(
        "{} {} nodes, {} parts, {} nodes removed by optimization",
        path.display().to_string().bold(),
        model.graph.len(),
        model.n_parts,
        model.report.removed()
    );
    for &part in &model.schedule.order {
        let stage = &model.schedule.stages[part];
        println!(
            "  {} nodes {:>5}  weight {:>8}  layer memory {:>8.2}MB  parameters {}",
            format!("stage {}", part).color(stage_color(part)),
            stage.nodes,
            stage.solver_weight,
            stage.memory_bytes as f64 / 1e6,
            stage.parameter_elements
        );
    }
    if !model.schedule.edges.is_empty() {
        println!("  stage edges: {:?}", model.schedule.edges);
    }
}

fn write_outputs(dir: &Path, path: &Path, model: &PartitionedModel, options: &DotOptions) -> Result<()> {
    let stem = path
        .file_stem()
        .ok_or_else(|| anyhow!("Trace path {} has no file name", path.display()))?
        .to_string_lossy();
    let json = serde_json::to_string_pretty(model)?;
    fs::write(dir.join(format!("{}.json", stem)), json).context("Unable to write result")?;
    fs::write(dir.join(format!("{}.dot", stem)), model.graph.to_dot(options))
        .context("Unable to write graph")?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let paths = trace_paths(&args.traces)?;
    if paths.is_empty() {
        return Err(anyhow!("No traces found at {}", args.traces.display()));
    }
    if let Some(dir) = &args.out_dir {
        fs::create_dir_all(dir).context("Failed to create output directory")?;
    }

    // each trace gets its own single-threaded pipeline run
    let results: Vec<(PathBuf, Result<PartitionedModel>)> = paths
        .into_par_iter()
        .map(|path| {
            let result = Trace::from_path(&path)
                .and_then(|trace| partition_model(&trace, &config, &SequentialPartitioner))
                .with_context(|| format!("Failed to partition {}", path.display()));
            (path, result)
        })
        .collect();

    let options = DotOptions {
        show_parameters: args.show_params,
        ..Default::default()
    };
    let mut hist = histo::Histogram::with_buckets(10);
    let mut failures = 0;
    for (path, result) in &results {
        match result {
            Ok(model) => {
                print_result(path, model);
                for stage in &model.schedule.stages {
                    hist.add(stage.solver_weight);
                }
                if let Some(dir) = &args.out_dir {
                    write_outputs(dir, path, model, &options)?;
                }
            }
            Err(e) => {
                eprintln!("{} {:?}", "error:".red().bold(), e);
                failures += 1;
            }
        }
    }
    println!("Stage weight distribution:\n{}", hist);

    if failures > 0 {
        return Err(anyhow!("{} of {} traces failed", failures, results.len()));
    }
    Ok(())
}
