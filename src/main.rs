//! Dense classifier CLI
//!
//! Trains, exports and scores tabular models described by a config file.

use clap::{Args, Parser, Subcommand};
use dense_classifier::{
    parse_dnn_struct, HarnessError, Mode, ModelKind, OptimizerKind, Result, RunConfig, Scenario,
};
use std::path::PathBuf;

#[cfg(not(feature = "wgpu"))]
type AppBackend = burn::backend::Autodiff<burn::backend::NdArray<f32>>;
#[cfg(feature = "wgpu")]
type AppBackend = burn::backend::Autodiff<burn::backend::Wgpu<f32, i32>>;

#[derive(Parser)]
#[command(name = "dense-classifier")]
#[command(about = "Train, export and score dense tabular models", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mode named in the config file
    Run {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Train, validate and checkpoint, then export the final model
    Train {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Export the latest checkpoint as a serving artifact
    Export {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Score the inference data file with the latest checkpoint
    Infer {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Convert a delimited text file to the binary record format
    Convert {
        /// Input CSV file
        input: PathBuf,
        /// Output record file
        output: PathBuf,
    },
    /// Show checkpoints and the export target
    Info,
    /// Write a default config file
    Init,
}

/// Command line values that take precedence over the config file
#[derive(Args, Debug, Default)]
struct Overrides {
    #[arg(long)]
    scenario: Option<Scenario>,
    #[arg(long)]
    model: Option<ModelKind>,
    /// Hidden layer widths, e.g. "128 32 8"
    #[arg(long)]
    dnn_struct: Option<String>,
    #[arg(long)]
    optimizer: Option<OptimizerKind>,
    #[arg(long)]
    learning_rate: Option<f64>,
    /// Epoch count, 0 or less repeats forever
    #[arg(long, allow_negative_numbers = true)]
    epochs: Option<i64>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    steps_to_validate: Option<u64>,
    #[arg(long)]
    train_file: Option<String>,
    #[arg(long)]
    validation_file: Option<String>,
    #[arg(long)]
    checkpoint_path: Option<PathBuf>,
    #[arg(long)]
    model_path: Option<PathBuf>,
    #[arg(long)]
    model_version: Option<u64>,
    /// Skip validation, checkpoints and export
    #[arg(long)]
    benchmark: bool,
    /// Start from fresh parameters even if a checkpoint exists
    #[arg(long)]
    no_resume: bool,
}

impl Overrides {
    fn apply(self, config: &mut RunConfig) -> Result<()> {
        if let Some(scenario) = self.scenario {
            config.scenario = scenario;
        }
        if let Some(kind) = self.model {
            config.model.kind = kind;
        }
        if let Some(layers) = self.dnn_struct {
            config.model.dnn_struct = parse_dnn_struct(&layers)?;
        }
        if let Some(kind) = self.optimizer {
            config.optimizer.kind = kind;
        }
        if let Some(lr) = self.learning_rate {
            config.optimizer.learning_rate = lr;
        }
        if let Some(epochs) = self.epochs {
            config.training.epoch_number = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.train_batch_size = batch_size;
        }
        if let Some(steps) = self.steps_to_validate {
            config.training.steps_to_validate = steps;
        }
        if let Some(file) = self.train_file {
            config.data.train_file = file;
        }
        if let Some(file) = self.validation_file {
            config.data.validation_file = file;
        }
        if let Some(path) = self.checkpoint_path {
            config.paths.checkpoint_path = path;
        }
        if let Some(path) = self.model_path {
            config.paths.model_path = path;
        }
        if let Some(version) = self.model_version {
            config.paths.model_version = version;
        }
        if self.benchmark {
            config.enable_benchmark = true;
        }
        if self.no_resume {
            config.resume_from_checkpoint = false;
        }
        Ok(())
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load or create config
    let config = if std::path::Path::new(&cli.config).exists() {
        match RunConfig::load(&cli.config) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error loading config: {}", e);
                std::process::exit(e.exit_code());
            }
        }
    } else {
        RunConfig::default()
    };

    let result = match cli.command {
        Commands::Run { overrides } => commands::run(config, None, overrides),
        Commands::Train { overrides } => commands::run(config, Some(Mode::Train), overrides),
        Commands::Export { overrides } => commands::run(config, Some(Mode::Export), overrides),
        Commands::Infer { overrides } => commands::run(config, Some(Mode::Infer), overrides),
        Commands::Convert { input, output } => commands::convert(&config, &input, &output),
        Commands::Info => commands::info(&config),
        Commands::Init => commands::init(&cli.config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

mod commands {
    use super::*;
    use dense_classifier::data::decoder::convert_csv_to_binary;
    use dense_classifier::run::{inventory, run as run_mode, RunOutcome};
    use std::path::Path;

    pub fn init(config_path: &str) -> Result<()> {
        if Path::new(config_path).exists() {
            return Err(HarnessError::Configuration(format!(
                "{} already exists",
                config_path
            )));
        }
        let config = RunConfig::default();
        config.save(config_path)?;
        println!("Created default config at {}", config_path);

        println!("\nNext steps:");
        println!("  1. Edit {} to point at your data files", config_path);
        println!("  2. Run 'dense-classifier train' to train and export the model");
        println!("  3. Run 'dense-classifier infer' to score the inference file");

        Ok(())
    }

    pub fn run(mut config: RunConfig, mode: Option<Mode>, overrides: Overrides) -> Result<()> {
        if let Some(mode) = mode {
            config.mode = mode;
        }
        overrides.apply(&mut config)?;

        let device = Default::default();
        match run_mode::<AppBackend>(&config, &device)? {
            RunOutcome::Trained(report) => {
                println!("\nTraining complete");
                println!("  Global step:  {}", report.global_step);
                println!("  Steps run:    {}", report.steps);
                if let Some(step) = report.resumed_from {
                    println!("  Resumed from: step {}", step);
                }
                println!("  Checkpoints:  {}", report.checkpoints.len());
                if let Some(sample) = report.samples.last() {
                    println!("  Last sample:  {}", sample);
                }
                match report.export {
                    Some(path) => println!("  Exported to:  {}", path.display()),
                    None => println!("  Exported to:  (skipped)"),
                }
                println!("  Elapsed:      {:.2}s", report.elapsed.as_secs_f64());
            }
            RunOutcome::Exported(path) => {
                println!("Exported model to {}", path.display());
            }
            RunOutcome::Inferred(result) => {
                println!("\nScored {} records", result.probabilities.rows());
                println!("  Checkpoint: {}", result.checkpoint.path.display());
                if let Some(accuracy) = result.accuracy {
                    println!("  Accuracy:   {:.4}", accuracy);
                }
                if let Some(auc) = result.auc {
                    println!("  AUC:        {:.4}", auc);
                }
                if let Some(loss) = result.loss {
                    println!("  MSE:        {:.6}", loss);
                }
                println!("  Results:    {}", result.result_file.display());
            }
        }

        Ok(())
    }

    pub fn convert(config: &RunConfig, input: &Path, output: &Path) -> Result<()> {
        let count = convert_csv_to_binary(input, output, config.data.feature_size)?;
        println!(
            "Wrote {} records with {} features to {}",
            count,
            config.data.feature_size,
            output.display()
        );
        Ok(())
    }

    pub fn info(config: &RunConfig) -> Result<()> {
        let inventory = inventory(config)?;

        println!("Model: {} ({})", config.model.kind, config.scenario);
        println!(
            "Data:  {} features, {} labels",
            config.data.feature_size, config.data.label_size
        );

        println!("\nCheckpoints in {}:", config.paths.checkpoint_path.display());
        if inventory.checkpoints.is_empty() {
            println!("  (none)");
        }
        for checkpoint in &inventory.checkpoints {
            println!("  step {:>8}  {}", checkpoint.step, checkpoint.path.display());
        }

        println!(
            "\nExport target: {} ({})",
            inventory.export_target.display(),
            if inventory.export_exists {
                "exists"
            } else {
                "not exported"
            }
        );

        Ok(())
    }
}
