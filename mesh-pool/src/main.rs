//! mesh-pool command line interface
//!
//! ## Commands
//! - `run` - Combine two matrices stored as JSON on a fresh worker pool
//! - `demo` - Generate inputs, run a job and verify the result locally
//! - `init-config` - Write the default configuration file

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mesh_pool::{
    init_production_logging, init_simple_logging, AmbientGroup, CombineOp, Config, GroupMode,
    JobOutput, Manager, Matrix, ProcessLauncher,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Elementwise matrix jobs on a spawned worker pool
#[derive(Parser, Debug)]
#[command(name = "mesh-pool")]
#[command(about = "Run elementwise matrix jobs on a pool of worker processes", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.meshpool/pool.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Job options shared by `run` and `demo`
#[derive(clap::Args, Debug)]
struct JobArgs {
    /// Number of workers to spawn
    #[arg(short, long)]
    workers: Option<usize>,

    /// Merge manager and workers into one group before the exchange
    #[arg(long)]
    merged: bool,

    /// Combining operation (add, sub, mul, max, min)
    #[arg(long)]
    op: Option<CombineOp>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Combine two matrices stored as JSON {rows, cols, data}
    Run {
        /// First input matrix
        #[arg(long)]
        a: PathBuf,

        /// Second input matrix
        #[arg(long)]
        b: PathBuf,

        /// Where to write the result (printed to stdout if omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Generate two matrices, run a job and check it against a local result
    Demo {
        #[arg(long, default_value = "4")]
        rows: usize,

        #[arg(long, default_value = "8")]
        cols: usize,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Write the default configuration
    InitConfig {
        /// Destination (default: ~/.meshpool/pool.toml)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig { path, force } => {
            init_simple_logging(cli.log_level.as_deref().unwrap_or("warn"))?;
            cmd_init_config(path, force)?;
        }

        Commands::Run { a, b, out, job } => {
            let config = load_config(cli.config.as_ref(), &job)?;
            init_logging(&config, cli.log_level.as_deref())?;
            cmd_run(&config, a, b, out).await?;
        }

        Commands::Demo { rows, cols, job } => {
            let config = load_config(cli.config.as_ref(), &job)?;
            init_logging(&config, cli.log_level.as_deref())?;
            cmd_demo(&config, rows, cols).await?;
        }
    }

    Ok(())
}

/// Load the config file and apply command line overrides
fn load_config(path: Option<&PathBuf>, job: &JobArgs) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path()?)?,
    };

    if let Some(workers) = job.workers {
        config.pool.workers = workers;
    }
    if job.merged {
        config.pool.mode = GroupMode::Merged;
    }
    if let Some(op) = job.op {
        config.pool.op = op;
    }
    Ok(config)
}

fn init_logging(config: &Config, level: Option<&str>) -> Result<()> {
    let level = level.unwrap_or(config.logging.level.as_str());
    if config.logging.log_to_file {
        init_production_logging(level, config.log_dir(), "mesh-pool.log")
    } else {
        init_simple_logging(level)
    }
}

fn build_manager(config: &Config) -> Result<Manager> {
    let worker_exe = config.resolve_worker_exe()?;
    if !worker_exe.exists() {
        bail!(
            "Worker executable not found at {} (set pool.worker_exe in the config)",
            worker_exe.display()
        );
    }
    let launcher = ProcessLauncher::new(worker_exe).with_join_timeout(config.spawn_timeout());
    let ambient = AmbientGroup::detect()?;
    Ok(Manager::new(config.manager_config(), Arc::new(launcher)).with_ambient(ambient))
}

async fn execute(config: &Config, a: &Matrix, b: &Matrix) -> Result<JobOutput> {
    let manager = build_manager(config)?;
    manager.run(a, b).await.map_err(|e| {
        let kind = e.kind();
        anyhow::Error::new(e).context(format!("Job failed ({})", kind))
    })
}

/// Run a job on matrices read from disk
async fn cmd_run(config: &Config, a: PathBuf, b: PathBuf, out: Option<PathBuf>) -> Result<()> {
    let a = Matrix::load_json(&a).context("Failed to read first input")?;
    let b = Matrix::load_json(&b).context("Failed to read second input")?;

    let job = execute(config, &a, &b).await?;

    match out {
        Some(path) => {
            job.output
                .save_json(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✓ Job {} complete, result written to {}", job.report.job_id, path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&job.output)?),
    }

    Ok(())
}

/// Run a generated job and compare with the locally computed result
async fn cmd_demo(config: &Config, rows: usize, cols: usize) -> Result<()> {
    println!(
        "🔧 Demo: {}x{} matrices, {} workers, {} mode, op {}\n",
        rows, cols, config.pool.workers, config.pool.mode, config.pool.op
    );

    let a = Matrix::from_fn(rows, cols, |r, c| (r * cols + c) as f64);
    let b = Matrix::from_fn(rows, cols, |r, c| (r + 1) as f64 * 0.5 + c as f64);

    let job = execute(config, &a, &b).await?;
    let expected = a.combine(&b, config.pool.op)?;

    let widths: Vec<usize> = job.report.partitions.iter().map(|p| p.column_count).collect();
    println!("   Job ID: {}", job.report.job_id);
    println!("   Column widths: {:?}", widths);
    println!(
        "   Total time: {:.2} ms",
        job.report.timings.total().as_secs_f64() * 1000.0
    );

    if job.output != expected {
        bail!("Result does not match the locally computed combination");
    }
    info!(job_id = %job.report.job_id, "Demo result verified");
    println!("\n✅ Result matches local computation");

    Ok(())
}

/// Write the default configuration
fn cmd_init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => Config::default_path()?,
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    Config::default().save(&path)?;
    println!("✓ Configuration saved to: {}", path.display());
    Ok(())
}
