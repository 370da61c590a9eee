// ========================================================================================
//
//                         The command-line driver: sieve
//
// ========================================================================================
//
// Loads the tab-separated inputs of one weakly supervised training run, hands them to
// the denoising trainer and writes the evaluation report. All denoising logic lives in
// the library; this binary only owns argument parsing, logging setup and progress
// display.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::Serialize;
use sieve::data::{DataError, load_label_mapping, load_labels, load_matrix};
use sieve::{
    ClassificationReport, ConfigError, DenoiseError, DenoisingTrainer, RunConfig,
    SoftmaxRegression, TrainingProgress, TrainingStage, TrainingSummary,
};
use std::fs;
use std::io::{BufWriter, IsTerminal, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Parser)]
#[command(
    name = "sieve",
    version,
    about = "Train classifiers from rule-based weak supervision with label denoising."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a denoised classifier from rule matches
    #[command(about = "Train a denoised classifier (outputs: JSON report)")]
    Train(TrainArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// TOML file with [trainer] and [model] tables
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    /// Rule-match matrix, instances x rules
    #[arg(long, value_name = "PATH")]
    rule_matches: PathBuf,

    /// Rule-to-label mapping, rules x classes
    #[arg(long, value_name = "PATH")]
    mapping: PathBuf,

    /// Training features, one row per instance
    #[arg(long, value_name = "PATH")]
    features: PathBuf,

    /// Test features for evaluation
    #[arg(long, value_name = "PATH", requires = "test_labels")]
    test_features: Option<PathBuf>,

    /// Gold test labels, one class id per line
    #[arg(long, value_name = "PATH", requires = "test_features")]
    test_labels: Option<PathBuf>,

    /// Class names, `name<TAB>id` per line
    #[arg(long, value_name = "PATH")]
    labels: Option<PathBuf>,

    /// Where to write the JSON report (stdout when omitted)
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Also train and score the majority-vote baseline
    #[arg(long, requires = "test_features")]
    baseline: bool,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Denoise(#[from] DenoiseError),
    #[error("Failed to write the report: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize the report: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct RunReport {
    summary: TrainingSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    test: Option<ClassificationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    baseline: Option<ClassificationReport>,
}

/// Shows one bar for the fold trainings; stage changes go to the log.
struct FoldProgressBar {
    bar: Mutex<Option<ProgressBar>>,
}

impl FoldProgressBar {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl TrainingProgress for FoldProgressBar {
    fn on_stage_start(&self, stage: TrainingStage) {
        log::info!("Starting {}.", stage);
    }

    fn on_folds_start(&self, n_folds: usize) {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let pb = ProgressBar::with_draw_target(Some(n_folds as u64), draw_target);
        if let Ok(style) =
            ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} folds {msg}")
        {
            pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(pb);
        }
    }

    fn on_fold_finished(&self, fold: usize, held_out: usize) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(pb) = slot.as_ref() {
                pb.set_message(format!("(fold {fold}: {held_out} held out)"));
                pb.inc(1);
            }
        }
    }

    fn on_folds_finish(&self) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(pb) = slot.take() {
                pb.finish_and_clear();
            }
        }
    }

    fn on_stage_finish(&self, stage: TrainingStage) {
        log::debug!("Finished {}.", stage);
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Train(args)) => train(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn train(args: TrainArgs) -> Result<(), CliError> {
    let config = RunConfig::load(&args.config)?;
    let rule_matches = load_matrix(&args.rule_matches)?;
    let mapping = load_matrix(&args.mapping)?;
    let features = load_matrix(&args.features)?;

    let model = SoftmaxRegression::new(mapping.ncols(), config.model.clone());
    let mut trainer = DenoisingTrainer::new(model, mapping, features, rule_matches, config.trainer)?
        .with_progress(FoldProgressBar::new());
    if let Some(path) = &args.labels {
        trainer = trainer.with_label_mapping(load_label_mapping(path)?);
    }

    let summary = trainer.train()?;
    log::info!(
        "Training finished: {} instances retained, {} pruned, {} filtered.",
        summary.n_retained,
        summary.n_pruned,
        summary.n_filtered
    );

    let (test, baseline) = match (&args.test_features, &args.test_labels) {
        (Some(x_path), Some(y_path)) => {
            let test_x = load_matrix(x_path)?;
            let test_y = load_labels(y_path)?;
            let test = trainer.test(&test_x, &test_y)?;
            log::info!("Test accuracy: {:.4}", test.accuracy);
            let baseline = if args.baseline {
                let report = trainer.baseline(&test_x, &test_y)?;
                log::info!("Baseline accuracy: {:.4}", report.accuracy);
                Some(report)
            } else {
                None
            };
            (Some(test), baseline)
        }
        _ => (None, None),
    };

    let json = serde_json::to_string_pretty(&RunReport {
        summary,
        test,
        baseline,
    })?;
    match &args.report {
        Some(path) => {
            let mut file = BufWriter::new(fs::File::create(path)?);
            file.write_all(json.as_bytes())?;
            file.flush()?;
            log::info!("Report written to {}.", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
