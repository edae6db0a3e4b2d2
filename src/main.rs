// ========================================================================================
//
//                      COMMAND-LINE DRIVER: SVRLSM
//
// ========================================================================================
//
// Parses the command line, configures logging and the rayon pool, and hands a
// validated `AnalysisConfig` to the library. Every failure ends up as a single
// `Error: ...` line on stderr and exit status 1.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use svrlsm::config::AnalysisConfig;
use svrlsm::grid_search::Parallelism;
use svrlsm::pipeline::run_analysis;
use svrlsm::progress::{NoopProgress, ProgressBars, ProgressObserver};

#[derive(Parser)]
#[command(
    name = "svrlsm",
    version,
    about = "Support-vector regression lesion-symptom mapping",
    long_about = "Relates lesion maps to behavioral scores with support-vector regression, \
                 selects hyperparameters by cross-validated grid search, and assesses every \
                 voxel against a permutation null distribution."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a complete analysis described by a TOML configuration file
    #[command(about = "Run an analysis (outputs: maps, results table, summary.toml)")]
    Run {
        /// Path to the analysis configuration (.toml)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Override the output directory from the configuration
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Override the number of permutations from the configuration
        #[arg(long, value_name = "N")]
        permutations: Option<usize>,

        /// Number of worker threads (defaults to all cores)
        #[arg(long, value_name = "N")]
        threads: Option<usize>,

        /// Evaluate folds and permutations one at a time
        #[arg(long)]
        sequential: bool,

        /// Hide progress bars
        #[arg(long)]
        quiet: bool,
    },

    /// Write a default configuration file to edit
    #[command(about = "Write a default analysis configuration")]
    Init {
        /// Destination of the configuration file
        #[arg(value_name = "PATH", default_value = "svrlsm.toml")]
        path: PathBuf,
    },
}

struct RunArgs {
    config: PathBuf,
    output: Option<PathBuf>,
    permutations: Option<usize>,
    threads: Option<usize>,
    sequential: bool,
    quiet: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Run {
            config,
            output,
            permutations,
            threads,
            sequential,
            quiet,
        }) => run(RunArgs {
            config,
            output,
            permutations,
            threads,
            sequential,
            quiet,
        }),
        Some(Commands::Init { path }) => init(path),
        None => Cli::command()
            .print_help()
            .map_err(|e| e.to_string())
            .map(|()| println!()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(args: RunArgs) -> Result<(), String> {
    let mut config = AnalysisConfig::load(&args.config).map_err(|e| {
        format!(
            "failed to load configuration {}: {e}",
            args.config.display()
        )
    })?;
    if let Some(output) = args.output {
        config.output.directory = output;
    }
    if let Some(permutations) = args.permutations {
        config.permutation.n_permutations = permutations;
    }
    if args.sequential {
        config.search.parallelism = Parallelism::Sequential;
        config.permutation.parallelism = Parallelism::Sequential;
    }
    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| format!("failed to configure {threads} worker threads: {e}"))?;
    }
    log::info!(
        "Running analysis from {} into {}",
        args.config.display(),
        config.output.directory.display()
    );

    let mut bars = ProgressBars::new();
    let mut noop = NoopProgress;
    let observer: &mut dyn ProgressObserver = if args.quiet { &mut noop } else { &mut bars };
    let summary = run_analysis(&config, observer).map_err(|e| e.to_string())?;

    println!(
        "Best parameters: {} (score {:.4}, iteration {} of {})",
        summary.best_model.params,
        summary.best_model.score,
        summary.best_model.iteration,
        summary.grid_points
    );
    for threshold in &summary.thresholds {
        println!(
            "  {:<5} |z| > {:<8} {} voxels",
            threshold.label, threshold.critical_z, threshold.surviving_voxels
        );
    }
    println!("Outputs written to {}", config.output.directory.display());
    Ok(())
}

fn init(path: PathBuf) -> Result<(), String> {
    if path.exists() {
        return Err(format!(
            "{} already exists; refusing to overwrite it",
            path.display()
        ));
    }
    AnalysisConfig::default()
        .save(&path)
        .map_err(|e| e.to_string())?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
