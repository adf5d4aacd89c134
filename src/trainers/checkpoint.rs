//! Checkpoint generations with bounded retention
//!
//! A generation is four safetensors files, one per network, named
//! `{tag}-{iteration}.safetensors`. The manager remembers the generations it
//! wrote in save order and deletes the oldest once more than `max_keep` are
//! on disk.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use log::{debug, info};
use safetensors::{serialize, tensor::TensorView, Dtype as SafeDtype, SafeTensors};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TrainError;
use crate::models::{ModuleTag, ParamSet};

const EXTENSION: &str = "safetensors";

/// One saved generation
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub iteration: usize,
    /// In `ModuleTag::ALL` order
    pub paths: [PathBuf; 4],
}

pub struct CheckpointManager {
    dir: PathBuf,
    max_keep: usize,
    kept: VecDeque<CheckpointRecord>,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, max_keep: usize) -> Result<Self> {
        if max_keep == 0 {
            return Err(TrainError::config("max_step_saves_to_keep must be at least 1").into());
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| TrainError::checkpoint(&dir, e))
            .with_context(|| format!("Failed to create checkpoint directory: {}", dir.display()))?;

        Ok(Self {
            dir,
            max_keep,
            kept: VecDeque::with_capacity(max_keep + 1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_keep(&self) -> usize {
        self.max_keep
    }

    /// Generations currently retained, oldest first
    pub fn kept(&self) -> impl Iterator<Item = &CheckpointRecord> {
        self.kept.iter()
    }

    pub fn checkpoint_path(dir: &Path, tag: ModuleTag, iteration: usize) -> PathBuf {
        dir.join(format!("{}-{}.{}", tag, iteration, EXTENSION))
    }

    /// Take over complete generations already in the directory that are
    /// older than `before`, so a resumed run keeps rotating them.
    pub fn adopt_existing(&mut self, before: usize) -> Result<usize> {
        let mut adopted = 0;
        for iteration in complete_generations(&self.dir)? {
            if iteration >= before || self.kept.iter().any(|r| r.iteration == iteration) {
                continue;
            }
            self.kept.push_back(self.record_for(iteration));
            adopted += 1;
        }
        self.kept.make_contiguous().sort_by_key(|r| r.iteration);
        Ok(adopted)
    }

    /// Write one generation and evict the oldest beyond `max_keep`.
    ///
    /// `modules` must be in `ModuleTag::ALL` order. Evicted files are gone
    /// when this returns.
    pub fn save(&mut self, iteration: usize, modules: [&ParamSet; 4]) -> Result<&CheckpointRecord> {
        for (expected, set) in ModuleTag::ALL.iter().zip(modules.iter()) {
            if set.tag() != *expected {
                return Err(TrainError::config(format!(
                    "checkpoint slot {} was given module {}",
                    expected,
                    set.tag()
                ))
                .into());
            }
        }

        let record = self.record_for(iteration);
        for (set, path) in modules.iter().zip(record.paths.iter()) {
            write_param_file(path, set, iteration)?;
        }
        info!("Saved checkpoint generation {} to {}", iteration, self.dir.display());

        self.kept.push_back(record);
        while self.kept.len() > self.max_keep {
            if let Some(oldest) = self.kept.pop_front() {
                for path in &oldest.paths {
                    fs::remove_file(path).map_err(|e| TrainError::checkpoint(path, e))?;
                }
                debug!("Evicted checkpoint generation {}", oldest.iteration);
            }
        }

        self.kept
            .back()
            .ok_or_else(|| anyhow::anyhow!("checkpoint ring unexpectedly empty"))
    }

    /// Load generation `iteration` from `dir` into `modules` (in
    /// `ModuleTag::ALL` order).
    pub fn load(dir: &Path, iteration: usize, modules: [&ParamSet; 4]) -> Result<()> {
        for set in modules {
            let path = Self::checkpoint_path(dir, set.tag(), iteration);
            read_param_file(&path, set)?;
        }
        info!("Loaded checkpoint generation {} from {}", iteration, dir.display());
        Ok(())
    }

    /// Highest iteration with all four files present
    pub fn latest_on_disk(dir: &Path) -> Result<Option<usize>> {
        Ok(complete_generations(dir)?.into_iter().max())
    }

    fn record_for(&self, iteration: usize) -> CheckpointRecord {
        CheckpointRecord {
            iteration,
            paths: ModuleTag::ALL.map(|tag| Self::checkpoint_path(&self.dir, tag, iteration)),
        }
    }
}

/// Iterations in `dir` for which every module file exists, ascending
fn complete_generations(dir: &Path) -> Result<Vec<usize>> {
    let mut seen: BTreeMap<usize, usize> = BTreeMap::new();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read checkpoint directory: {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some((tag, iteration)) = stem.split_once('-') else {
            continue;
        };
        if let (Some(_), Ok(iteration)) = (ModuleTag::parse(tag), iteration.parse::<usize>()) {
            *seen.entry(iteration).or_insert(0) += 1;
        }
    }

    Ok(seen
        .into_iter()
        .filter(|(_, count)| *count == ModuleTag::ALL.len())
        .map(|(iteration, _)| iteration)
        .collect())
}

fn write_param_file(path: &Path, set: &ParamSet, iteration: usize) -> Result<()> {
    let snapshot = set.snapshot()?;

    // First collect all tensor data
    let mut tensor_data = Vec::with_capacity(snapshot.len());
    let mut tensor_info = Vec::with_capacity(snapshot.len());
    for (name, tensor) in &snapshot {
        tensor_info.push((
            name.clone(),
            convert_dtype(tensor.dtype())?,
            tensor.dims().to_vec(),
            tensor_data.len(),
        ));
        tensor_data.push(tensor_to_vec(tensor)?);
    }

    // Now create TensorViews using indices
    let mut tensors = HashMap::new();
    for (name, dtype, shape, idx) in tensor_info {
        tensors.insert(name, TensorView::new(dtype, shape, &tensor_data[idx])?);
    }

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), "voiceaae".to_string());
    metadata.insert("module".to_string(), set.tag().to_string());
    metadata.insert("iteration".to_string(), iteration.to_string());

    let serialized = serialize(&tensors, &Some(metadata))?;
    fs::write(path, serialized).map_err(|e| TrainError::checkpoint(path, e))?;
    Ok(())
}

fn read_param_file(path: &Path, set: &ParamSet) -> Result<()> {
    let bytes = fs::read(path).map_err(|e| TrainError::checkpoint(path, e))?;

    let (_, header) = SafeTensors::read_metadata(&bytes)
        .map_err(|e| TrainError::checkpoint(path, format!("{:?}", e)))?;
    let module = header
        .metadata()
        .as_ref()
        .and_then(|m| m.get("module").cloned());
    if let Some(module) = module {
        if module != set.tag().as_str() {
            return Err(TrainError::checkpoint(
                path,
                format!("file holds module {}, expected {}", module, set.tag()),
            )
            .into());
        }
    }

    let tensors = candle_core::safetensors::load_buffer(&bytes, set.device())?;
    set.restore(&tensors)
        .map_err(|e| TrainError::checkpoint(path, format!("{:#}", e)).into())
}

fn convert_dtype(dtype: DType) -> Result<SafeDtype> {
    match dtype {
        DType::F32 => Ok(SafeDtype::F32),
        DType::F16 => Ok(SafeDtype::F16),
        DType::BF16 => Ok(SafeDtype::BF16),
        _ => anyhow::bail!("Unsupported dtype for safetensors: {:?}", dtype),
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<u8>> {
    let flattened = tensor.flatten_all()?;

    let data = match tensor.dtype() {
        DType::F32 => {
            let data: Vec<f32> = flattened.to_vec1()?;
            bytemuck::cast_slice(&data).to_vec()
        }
        DType::F16 => {
            let data: Vec<half::f16> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        DType::BF16 => {
            let data: Vec<half::bf16> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        other => anyhow::bail!("Unsupported tensor dtype for conversion: {:?}", other),
    };
    Ok(data)
}
