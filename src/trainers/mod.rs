pub mod aae_trainer;
pub mod adam;
pub mod checkpoint;
pub mod device;
pub mod losses;
pub mod metrics;
pub mod progress;
pub mod training_helpers;
pub mod triplet_loader;

// Re-export key types
pub use aae_trainer::{AaeTrainer, TrainOutcome, TrainerOptions};
pub use adam::Adam;
pub use checkpoint::{CheckpointManager, CheckpointRecord};
pub use metrics::{JsonlMetricsSink, LossBundle, MetricsSink};
pub use triplet_loader::{FeatureStoreStream, SampleStream, SampleTriplet, SyntheticStream};

use anyhow::{Context, Result};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::TrainError;

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub job: String,
    pub config: ConfigData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<MetaConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigData {
    pub name: Option<String>,
    pub process: Vec<ProcessConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(rename = "type")]
    pub process_type: Option<String>,
    pub device: Option<String>,
    pub model: ModelConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub train: TrainConfig,
    pub save: SaveConfig,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub feature_dim: usize,
    pub code_dim: usize,
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// safetensors file of `(frames, feature_dim)` matrices keyed `speaker/utterance`
    pub feature_store: Option<PathBuf>,
    pub speaker_index: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_offset")]
    pub max_offset: usize,
    #[serde(default)]
    pub seed: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            feature_store: None,
            speaker_index: None,
            batch_size: default_batch_size(),
            max_offset: default_max_offset(),
            seed: 0,
        }
    }
}

/// Optimization settings. The hyperparameter fields may instead come from a
/// separate hps file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainConfig {
    pub lr: Option<f64>,
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
    pub max_grad_norm: Option<f64>,
    pub iterations: Option<usize>,
    #[serde(default)]
    pub detach_content_codes: bool,
    pub prob_clamp: Option<f64>,
}

impl TrainConfig {
    pub fn hps(&self) -> Result<Hps> {
        fn required<T: Copy>(value: Option<T>, name: &str) -> Result<T> {
            value.ok_or_else(|| TrainError::config(format!("train.{} is required", name)).into())
        }
        Ok(Hps {
            lr: required(self.lr, "lr")?,
            alpha: required(self.alpha, "alpha")?,
            beta: required(self.beta, "beta")?,
            max_grad_norm: required(self.max_grad_norm, "max_grad_norm")?,
            iterations: required(self.iterations, "iterations")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveConfig {
    pub output_dir: PathBuf,
    #[serde(default = "default_save_every")]
    pub save_every: usize,
    #[serde(default = "default_max_keep")]
    pub max_step_saves_to_keep: usize,
    #[serde(default = "default_true")]
    pub save_on_interrupt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaConfig {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
}

fn default_hidden_dim() -> usize {
    256
}

fn default_batch_size() -> usize {
    32
}

fn default_max_offset() -> usize {
    8
}

fn default_save_every() -> usize {
    100
}

fn default_max_keep() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./log/")
}

/// Training hyperparameters, fixed for the whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hps {
    pub lr: f64,
    pub alpha: f64,
    pub beta: f64,
    pub max_grad_norm: f64,
    pub iterations: usize,
}

impl Hps {
    /// Flat JSON or YAML file with exactly the hyperparameter fields
    pub fn load(path: &Path) -> Result<Self> {
        parse_by_extension(path)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(TrainError::config(format!("lr must be positive, got {}", self.lr)).into());
        }
        for (name, value) in [("alpha", self.alpha), ("beta", self.beta)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(TrainError::config(format!("{} must be non-negative, got {}", name, value)).into());
            }
        }
        if !(self.max_grad_norm.is_finite() && self.max_grad_norm > 0.0) {
            return Err(TrainError::config(format!(
                "max_grad_norm must be positive, got {}",
                self.max_grad_norm
            ))
            .into());
        }
        if self.iterations == 0 {
            return Err(TrainError::config("iterations must be at least 1").into());
        }
        Ok(())
    }
}

impl Config {
    /// The first process block; the only one a run uses
    pub fn process(&self) -> Result<&ProcessConfig> {
        self.config
            .process
            .first()
            .ok_or_else(|| TrainError::config("config.process is empty").into())
    }
}

impl ProcessConfig {
    /// Range checks for everything except the hyperparameters
    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        if m.feature_dim == 0 || m.code_dim == 0 || m.hidden_dim == 0 {
            return Err(TrainError::config("model dimensions must be at least 1").into());
        }
        if self.dataset.batch_size == 0 || self.dataset.max_offset == 0 {
            return Err(TrainError::config("dataset.batch_size and dataset.max_offset must be at least 1").into());
        }
        if self.save.save_every == 0 {
            return Err(TrainError::config("save.save_every must be at least 1").into());
        }
        if self.save.max_step_saves_to_keep == 0 {
            return Err(TrainError::config("save.max_step_saves_to_keep must be at least 1").into());
        }
        if let Some(eps) = self.train.prob_clamp {
            if !(eps > 0.0 && eps < 0.5) {
                return Err(TrainError::config(format!("train.prob_clamp must be in (0, 0.5), got {}", eps)).into());
            }
        }
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.logging
            .as_ref()
            .map(|l| l.log_dir.clone())
            .unwrap_or_else(default_log_dir)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    parse_by_extension(path)
}

fn parse_by_extension<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        serde_json::from_str(&text).map_err(|e| {
            TrainError::config(format!("Failed to parse JSON {}: {}", path.display(), e)).into()
        })
    } else {
        serde_yaml::from_str(&text).map_err(|e| {
            TrainError::config(format!("Failed to parse YAML {}: {}", path.display(), e)).into()
        })
    }
}

/// Which checkpoint generation to continue from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeFrom {
    Latest,
    Iteration(usize),
}

impl FromStr for ResumeFrom {
    type Err = TrainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(ResumeFrom::Latest);
        }
        s.parse()
            .map(ResumeFrom::Iteration)
            .map_err(|_| TrainError::config(format!("resume expects an iteration or 'latest', got '{}'", s)))
    }
}

/// Command-line values that take precedence over the config file
#[derive(Debug, Default)]
pub struct RunOverrides {
    pub hps_file: Option<PathBuf>,
    pub device: Option<String>,
    pub iterations: Option<usize>,
    pub resume: Option<ResumeFrom>,
    pub synthetic: bool,
    pub stop: Option<Arc<AtomicBool>>,
}

/// Hyperparameters from the hps file if given, else the train section,
/// with the iteration override applied
pub fn resolve_hps(process: &ProcessConfig, overrides: &RunOverrides) -> Result<Hps> {
    let mut hps = match &overrides.hps_file {
        Some(path) => Hps::load(path)?,
        None => process.train.hps()?,
    };
    if let Some(iterations) = overrides.iterations {
        hps.iterations = iterations;
    }
    hps.validate()?;
    Ok(hps)
}

/// Load, validate and run one training job
pub fn train_from_config(config_path: &Path, overrides: RunOverrides) -> Result<TrainOutcome> {
    let config = load_config(config_path)?;
    let process = config.process()?;
    process.validate()?;
    let hps = resolve_hps(process, &overrides)?;

    info!(
        "Job '{}' ({})",
        config.job,
        config.config.name.as_deref().unwrap_or("unnamed")
    );
    info!("Hyperparameters: {:?}", hps);

    let device_spec = overrides
        .device
        .as_deref()
        .or(process.device.as_deref())
        .unwrap_or("auto");
    let device = device::resolve_device(device_spec)?;

    let stream: Box<dyn SampleStream> = if overrides.synthetic {
        info!("Using synthetic sample stream");
        Box::new(SyntheticStream::new(
            process.model.feature_dim,
            process.dataset.batch_size,
            process.dataset.seed,
            &device,
        ))
    } else {
        Box::new(FeatureStoreStream::open(&process.dataset, &device)?)
    };

    let output_dir = process.save.output_dir.clone();
    let checkpoints = CheckpointManager::new(&output_dir, process.save.max_step_saves_to_keep)?;
    let metrics = JsonlMetricsSink::new(process.log_dir())?;
    info!("Metrics: {}", metrics.path().display());

    let options = TrainerOptions {
        hps,
        detach_content_codes: process.train.detach_content_codes,
        prob_clamp: process.train.prob_clamp,
        save_every: process.save.save_every,
        save_on_interrupt: process.save.save_on_interrupt,
    };
    let mut trainer = AaeTrainer::new(
        &process.model,
        options,
        stream,
        Some(checkpoints),
        Box::new(metrics),
        &device,
    )?;
    if let Some(stop) = overrides.stop {
        trainer = trainer.with_stop_flag(stop);
    }

    let start = match overrides.resume {
        None => 0,
        Some(ResumeFrom::Iteration(iteration)) => trainer.resume_from(&output_dir, iteration)?,
        Some(ResumeFrom::Latest) => match CheckpointManager::latest_on_disk(&output_dir)? {
            Some(iteration) => trainer.resume_from(&output_dir, iteration)?,
            None => {
                warn!("No checkpoint in {}, starting from scratch", output_dir.display());
                0
            }
        },
    };

    trainer.train(start)
}
