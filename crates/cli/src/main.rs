use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use qexplore_common::{LoggingContext, Workload};
use qexplore_search::{
    collect_results, save_result, write_candidates_csv, ExplorerOptions, QuantizationExplorer,
    SelectionPolicy,
};

/// Name of the CSV written by `select`.
const CANDIDATES_FILE: &str = "candidates.csv";

#[derive(Parser, Debug)]
#[command(name = "qexplore", about = "Layer-wise quantisation bit-width exploration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Collect activation ranges and write the calibration file.
    Calibrate(CalibrateArgs),
    /// Search the bit-width space with NSGA-II and save the result.
    Explore(ExploreArgs),
    /// Pick retraining candidates from one or more exploration results.
    Select(SelectArgs),
    /// Evaluate a single bit-width vector.
    EvalConfig(EvalConfigArgs),
}

// ── Calibrate ──────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct CalibrateArgs {
    workload: PathBuf,
    /// Overwrite an existing calibration file.
    #[arg(short, long)]
    force: bool,
    #[arg(short, long)]
    progress: bool,
    #[arg(short, long)]
    verbose: bool,
    /// Calibration file; defaults to the workload's.
    #[arg(long)]
    filename: Option<PathBuf>,
}

// ── Explore ────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct ExploreArgs {
    calibration_file: PathBuf,
    workload: PathBuf,
    #[arg(short, long)]
    progress: bool,
    #[arg(short, long)]
    verbose: bool,
    /// Do not measure unquantised accuracy first.
    #[arg(short, long)]
    skip_baseline: bool,
    /// Overrides the workload's results directory.
    #[arg(long)]
    results_dir: Option<PathBuf>,
}

// ── Select / Eval-config ───────────────────────────────────────────────────────

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    LowestCost,
    WeightedProduct,
}

#[derive(Parser, Debug)]
struct SelectArgs {
    /// An exploration result file or a directory of them.
    results_path: PathBuf,
    output_dir: PathBuf,
    #[arg(short, default_value_t = 5)]
    n: usize,
    #[arg(long, value_enum, default_value_t = PolicyArg::LowestCost)]
    policy: PolicyArg,
    /// Largest accuracy shortfall, in units of the accuracy limit.
    #[arg(long, default_value_t = 1.0)]
    max_shortfall: f64,
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct EvalConfigArgs {
    workload: PathBuf,
    /// Comma-separated, one per quantizable layer, e.g. `4,8,6`.
    #[arg(long, value_delimiter = ',', required = true)]
    bit_widths: Vec<u32>,
    /// Defaults to the workload's calibration file.
    #[arg(long)]
    calibration_file: Option<PathBuf>,
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Calibrate(args) => cmd_calibrate(args),
        Command::Explore(args) => cmd_explore(args),
        Command::Select(args) => cmd_select(args),
        Command::EvalConfig(args) => cmd_eval_config(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_calibrate(args: CalibrateArgs) -> Result<()> {
    LoggingContext::new(args.verbose).init()?;
    let workload = Workload::load(&args.workload)?;
    let options = ExplorerOptions {
        skip_baseline: true,
        progress: args.progress,
    };
    let explorer = QuantizationExplorer::new(workload, options)?;
    match explorer.calibrate(args.force, args.filename.as_deref())? {
        Some(path) => println!("Calibration saved to: {}", path.display()),
        None => println!("Calibration file exists; nothing written (use --force)"),
    }
    Ok(())
}

fn cmd_explore(args: ExploreArgs) -> Result<()> {
    let mut workload = Workload::load(&args.workload)?;
    if let Some(dir) = args.results_dir {
        workload.results_dir = dir;
    }
    LoggingContext::new(args.verbose)
        .with_results_dir(&workload.results_dir)
        .init()?;

    let results_dir = workload.results_dir.clone();
    let options = ExplorerOptions {
        skip_baseline: args.skip_baseline,
        progress: args.progress,
    };
    let explorer = QuantizationExplorer::new(workload, options)?;
    let rt = tokio::runtime::Runtime::new()?;
    let Some(result) = rt.block_on(explorer.explore_async(args.calibration_file))? else {
        println!("No solutions found");
        return Ok(());
    };
    let path = save_result(&result, &results_dir)?;

    println!("\n=== Exploration Complete ===");
    if let Some(acc) = result.info.baseline_accuracy {
        println!("Baseline accuracy: {acc:.4}");
    }
    println!("Evaluations: {}", result.n_evals);
    println!("Pareto front ({} points):", result.pareto_front.len());
    for point in &result.pareto_front {
        println!(
            "  {:<24} accuracy {:.4}  cost {:.2}",
            point.bit_widths.to_string(),
            point.accuracy,
            point.cost
        );
    }
    println!("Result saved to: {}", path.display());
    Ok(())
}

fn cmd_select(args: SelectArgs) -> Result<()> {
    LoggingContext::new(args.verbose).init()?;
    let mut collection = collect_results(&args.results_path)
        .with_context(|| format!("collecting results from {}", args.results_path.display()))?;
    collection.drop_duplicate_parameters();
    let policy = match args.policy {
        PolicyArg::LowestCost => SelectionPolicy::LowestCost {
            max_shortfall: args.max_shortfall,
        },
        PolicyArg::WeightedProduct => SelectionPolicy::WeightedProduct,
    };
    let candidates = collection.select(args.n, policy);
    if candidates.is_empty() {
        anyhow::bail!("no candidates satisfy the selection policy");
    }
    let path = args.output_dir.join(CANDIDATES_FILE);
    write_candidates_csv(&path, &candidates)?;
    for c in &candidates {
        println!(
            "{:<40} gen {:>3}  {:<24} accuracy {:.4}  cost {:.2}",
            c.run,
            c.individual.generation,
            c.individual.bit_widths.to_string(),
            c.individual.accuracy(),
            c.individual.cost()
        );
    }
    println!("Candidates written to: {}", path.display());
    Ok(())
}

fn cmd_eval_config(args: EvalConfigArgs) -> Result<()> {
    #[derive(Serialize)]
    struct EvalResult<'a> {
        bit_widths: &'a [u32],
        accuracy: f64,
        cost: f64,
    }

    LoggingContext::new(args.verbose).init()?;
    let workload = Workload::load(&args.workload)?;
    let calibration_file = args
        .calibration_file
        .unwrap_or_else(|| workload.calibration.file.clone());
    let options = ExplorerOptions {
        skip_baseline: true,
        progress: false,
    };
    let explorer = QuantizationExplorer::new(workload, options)?;
    let score = explorer.evaluate_bit_widths(&calibration_file, &args.bit_widths)?;
    let out = EvalResult {
        bit_widths: &args.bit_widths,
        accuracy: score.accuracy,
        cost: score.cost,
    };
    println!("{}", serde_json::to_string(&out)?);
    Ok(())
}
