use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use fashion_encoder::fashion::settings::parse_override;
use fashion_encoder::fashion::task::EncoderTask;
use fashion_encoder::{HyperParams, Result};

type TrainingBackend = Autodiff<NdArray<f32>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Train,
    Debug,
}

/// Train the masked outfit encoder and score it with Fill-In-The-Blank.
#[derive(Debug, Parser)]
#[command(name = "fashion-encoder", version)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Train)]
    mode: Mode,

    /// Hyperparameter preset (`base` or `distance_base`)
    #[arg(long, default_value = "base")]
    preset: String,

    /// Config file layered over the preset (toml, yaml or json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra `key=value` override, may be repeated
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Training dataset shards
    #[arg(long, num_args = 1..)]
    dataset_files: Vec<PathBuf>,

    /// Held-out outfit shards for masking-style validation
    #[arg(long, num_args = 1..)]
    valid_files: Vec<PathBuf>,

    /// FITB questions used for validation
    #[arg(long)]
    fitb_file: Option<PathBuf>,

    /// FITB questions used for the final test
    #[arg(long)]
    test_fitb_file: Option<PathBuf>,

    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Categories CSV for category grouping
    #[arg(long)]
    category_file: Option<PathBuf>,

    /// Directory for the metrics CSV
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    epoch_count: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,
}

impl Cli {
    /// Typed flags first, then the generic `--set` overrides.
    fn overrides(&self) -> Result<Vec<(String, String)>> {
        let mut pairs = Vec::new();
        let mut push = |key: &str, value: String| pairs.push((key.to_string(), value));

        if let Some(path) = &self.fitb_file {
            push("fitb_file", path.display().to_string());
        }
        if let Some(path) = &self.test_fitb_file {
            push("test_fitb_file", path.display().to_string());
        }
        if let Some(path) = &self.checkpoint_dir {
            push("checkpoint_dir", path.display().to_string());
        }
        if let Some(path) = &self.category_file {
            push("category_file", path.display().to_string());
        }
        if let Some(path) = &self.log_dir {
            push("log_dir", path.display().to_string());
        }
        if let Some(size) = self.batch_size {
            push("batch_size", size.to_string());
        }
        if let Some(count) = self.epoch_count {
            push("epoch_count", count.to_string());
        }
        if let Some(rate) = self.learning_rate {
            push("learning_rate", rate.to_string());
        }

        for raw in &self.overrides {
            pairs.push(parse_override(raw)?);
        }
        Ok(pairs)
    }

    fn resolve(&self) -> Result<HyperParams> {
        let mut params = HyperParams::resolve(&self.preset, self.config.as_deref(), &self.overrides()?)?;
        if !self.dataset_files.is_empty() {
            params.dataset_files = self.dataset_files.clone();
        }
        if !self.valid_files.is_empty() {
            params.valid_files = self.valid_files.clone();
        }
        params.validate()?;
        Ok(params)
    }
}

fn run(cli: Cli) -> Result<()> {
    let params = cli.resolve()?;
    log::info!("resolved settings: {:?}", params);

    let task = EncoderTask::new(params)?;
    let device = NdArrayDevice::default();

    match cli.mode {
        Mode::Train => {
            let report = task.train::<TrainingBackend>(device)?;
            log::info!(
                "finished after {} epochs and {} batches; best valid acc {:?}, test acc {:?}{}",
                report.epochs_run,
                report.batch_count,
                report.best_score,
                report.test_accuracy,
                if report.stopped_early { " (stopped early)" } else { "" }
            );
        }
        Mode::Debug => {
            let trace = task.debug::<TrainingBackend>(device)?;
            log::info!("debug trace: {:?}", trace);
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let default_filter = match cli.mode {
        Mode::Train => "info",
        Mode::Debug => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    if let Err(err) = run(cli) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}
