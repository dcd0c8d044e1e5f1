//! simple-ocr CLI: train and query the digit classifier on MNIST files.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use log::info;

use simple_ocr::backend::Backend;
use simple_ocr::dataset::{Dataset, load_mnist_images, load_mnist_labels};
use simple_ocr::train::{TrainConfig, Trainer, TrainingOutcome};

#[derive(Parser)]
#[command(name = "simple-ocr")]
#[command(about = "Two-layer digit classifier with CPU and accelerated execution paths")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on the MNIST training set and report test accuracy
    Train {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Train, then classify one test image
    Classify {
        #[command(flatten)]
        run: RunArgs,

        /// Index of the test image to classify
        #[arg(short, long, default_value = "0")]
        index: usize,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Directory holding the four IDX files (plain or .gz)
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// JSON training configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Executor: cpu, emulated or wgpu (overrides the config)
    #[arg(short, long)]
    backend: Option<Backend>,

    /// Compare every pass against the CPU reference and log the result
    #[arg(long)]
    cross_check: bool,

    /// Maximum epochs (overrides the config)
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Random seed for reproducibility (overrides the config)
    #[arg(long)]
    seed: Option<u64>,

    /// Use only the first N samples of each set
    #[arg(long)]
    limit: Option<usize>,
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Train { run } => cmd_train(&run),
        Commands::Classify { run, index } => cmd_classify(&run, index),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Prefers the uncompressed file, falls back to `<name>.gz`.
fn idx_path(dir: &Path, name: &str) -> PathBuf {
    let plain = dir.join(name);
    if plain.exists() {
        plain
    } else {
        dir.join(format!("{name}.gz"))
    }
}

fn load_set(dir: &Path, images: &str, labels: &str, limit: Option<usize>) -> CliResult<Dataset> {
    let images = load_mnist_images(idx_path(dir, images))?;
    let labels = load_mnist_labels(idx_path(dir, labels))?;
    let set = Dataset::from_mnist(&images, &labels)?;
    Ok(match limit {
        Some(n) => set.take(n),
        None => set,
    })
}

fn build_config(run: &RunArgs) -> CliResult<TrainConfig> {
    let mut config = match &run.config {
        Some(path) => TrainConfig::from_json_file(path)?,
        None => TrainConfig::default(),
    };
    if let Some(backend) = run.backend {
        config.backend = backend;
    }
    if run.cross_check {
        config.cross_check = true;
    }
    if let Some(epochs) = run.epochs {
        config.max_epochs = epochs;
    }
    if run.seed.is_some() {
        config.seed = run.seed;
    }
    config.validate()?;
    Ok(config)
}

fn train(run: &RunArgs) -> CliResult<(Trainer, Dataset)> {
    let config = build_config(run)?;

    println!("Training digit classifier");
    println!("=========================");
    println!("Backend:      {}{}", config.backend, if config.cross_check { " (cross-checked)" } else { "" });
    println!("Hidden units: {}", config.hidden_dim);
    println!("Batch size:   {}", config.batch_size);
    println!("Learn rate:   {}", config.learning_rate);
    println!("Max epochs:   {}", config.max_epochs);
    println!();

    let train_set = load_set(
        &run.data_dir,
        "train-images-idx3-ubyte",
        "train-labels-idx1-ubyte",
        run.limit,
    )?;
    let test_set = load_set(&run.data_dir, "t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte", run.limit)?;
    let input_dim = train_set.input_dim().ok_or("training set is empty")?;
    println!("Loaded {} training and {} test samples", train_set.len(), test_set.len());

    let mut trainer = Trainer::new(input_dim, config)?;
    let start = Instant::now();
    let report = trainer.train(&train_set)?;
    info!("training finished in {:.2?}", start.elapsed());

    let how = match report.outcome {
        TrainingOutcome::Completed => "completed",
        TrainingOutcome::EarlyStopped => "stopped early",
        TrainingOutcome::Cancelled => "cancelled",
    };
    println!(
        "Training {how} after {} epochs, final loss {:.6}",
        report.epochs_run,
        report.final_loss.unwrap_or(f32::NAN)
    );

    Ok((trainer, test_set))
}

fn cmd_train(run: &RunArgs) -> CliResult<()> {
    let (mut trainer, test_set) = train(run)?;
    let accuracy = trainer.evaluate(&test_set)?;
    println!("Test accuracy: {:.2}%", accuracy * 100.0);
    Ok(())
}

fn cmd_classify(run: &RunArgs, index: usize) -> CliResult<()> {
    let (mut trainer, test_set) = train(run)?;
    let (x, actual) = test_set
        .sample(index)
        .ok_or_else(|| format!("test index {index} out of range (have {})", test_set.len()))?;
    let predicted = trainer.classify(x)?;
    println!("Sample {index}: predicted {predicted}, actual {actual}");
    Ok(())
}
