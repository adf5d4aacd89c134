//! Compute device selection
//!
//! The device is resolved once at startup and handed to every constructor.
//! CUDA devices are cached per ordinal so repeated lookups share one context.

use anyhow::{Context, Result};
use candle_core::Device;
use log::info;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::TrainError;

static CUDA_DEVICES: OnceLock<Mutex<HashMap<usize, Device>>> = OnceLock::new();

/// Parse `cpu`, `auto`, `cuda` or `cuda:N` into a device.
///
/// `auto` falls back to the CPU when CUDA is unavailable; an explicit
/// `cuda` request does not.
pub fn resolve_device(spec: &str) -> Result<Device> {
    let spec = spec.trim().to_ascii_lowercase();
    let device = match spec.as_str() {
        "cpu" => Device::Cpu,
        "auto" => Device::cuda_if_available(0)?,
        "cuda" | "gpu" => cuda_device(0)?,
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => {
                let ordinal: usize = ordinal
                    .parse()
                    .map_err(|_| TrainError::config(format!("invalid CUDA ordinal in '{}'", other)))?;
                cuda_device(ordinal)?
            }
            None => {
                return Err(TrainError::config(format!(
                    "unknown device '{}', expected cpu, auto, cuda or cuda:N",
                    other
                ))
                .into())
            }
        },
    };
    info!("Using device: {:?}", device);
    Ok(device)
}

fn cuda_device(ordinal: usize) -> Result<Device> {
    let cache = CUDA_DEVICES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = cache
        .lock()
        .map_err(|_| anyhow::anyhow!("CUDA device cache lock poisoned"))?;
    if let Some(device) = cache.get(&ordinal) {
        return Ok(device.clone());
    }
    let device = Device::new_cuda(ordinal)
        .with_context(|| format!("Failed to open CUDA device {}", ordinal))?;
    cache.insert(ordinal, device.clone());
    Ok(device)
}
