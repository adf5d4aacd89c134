//! Voice conversion autoencoder training binary

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use voiceaae::trainers::ResumeFrom;
use voiceaae::{RunOverrides, TrainOutcome};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train the style/content adversarial autoencoder", long_about = None)]
struct Args {
    /// Run configuration (YAML, or JSON by extension)
    config: PathBuf,

    /// Flat hyperparameter file overriding the train section
    #[arg(long)]
    hps: Option<PathBuf>,

    /// cpu, auto, cuda or cuda:N
    #[arg(long)]
    device: Option<String>,

    /// Override the iteration count
    #[arg(long)]
    iterations: Option<usize>,

    /// Continue from a checkpoint iteration, or `latest`
    #[arg(long)]
    resume: Option<ResumeFrom>,

    /// Train on random frames instead of the feature store
    #[arg(long)]
    synthetic: bool,
}

fn main() -> Result<()> {
    voiceaae::logging::init_logger();
    let args = Args::parse();

    if !args.config.exists() {
        anyhow::bail!("Config file not found: {}", args.config.display());
    }
    info!("Starting trainer with config: {}", args.config.display());

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, finishing the current iteration...");
        handler_flag.store(true, Ordering::SeqCst);
    }) {
        warn!("Could not install interrupt handler: {}", e);
    }

    let overrides = RunOverrides {
        hps_file: args.hps,
        device: args.device,
        iterations: args.iterations,
        resume: args.resume,
        synthetic: args.synthetic,
        stop: Some(stop),
    };

    match voiceaae::train_from_config(&args.config, overrides)? {
        TrainOutcome::Completed { iterations } => {
            info!("Training completed successfully ({} iterations)", iterations)
        }
        TrainOutcome::Interrupted { iteration } => {
            info!("Training stopped after iteration {}", iteration)
        }
    }
    Ok(())
}
