//! Trainable networks and the parameter bookkeeping shared by all of them

pub mod discriminator;
pub mod frame_encoder;

pub use discriminator::PairDiscriminator;
pub use frame_encoder::FrameEncoder;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;
use std::fmt;

use crate::error::TrainError;
use crate::trainers::training_helpers::GradientAccumulator;

/// Identifies one of the four networks; also the checkpoint file prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleTag {
    Es,
    Ec,
    Dec,
    Dis,
}

impl ModuleTag {
    /// Checkpoint order
    pub const ALL: [ModuleTag; 4] = [ModuleTag::Es, ModuleTag::Ec, ModuleTag::Dec, ModuleTag::Dis];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleTag::Es => "Es",
            ModuleTag::Ec => "Ec",
            ModuleTag::Dec => "Dec",
            ModuleTag::Dis => "Dis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == s)
    }
}

impl fmt::Display for ModuleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters owned by exactly one network, plus its gradient buffer.
///
/// The `Var` handles share storage with the layers built from them, and
/// optimizers receive clones of the same handles, so an optimizer step
/// mutates the module in place.
pub struct ParamSet {
    tag: ModuleTag,
    device: Device,
    // Sorted by local name
    params: Vec<(String, Var)>,
    grads: GradientAccumulator,
}

impl ParamSet {
    /// Create the parameters for a network. `init` builds the layers from the
    /// var builder; every variable it creates ends up in this set.
    pub fn build<T>(
        tag: ModuleTag,
        device: &Device,
        init: impl FnOnce(VarBuilder) -> Result<T>,
    ) -> Result<(Self, T)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let layers = init(vb).with_context(|| format!("Failed to build {} layers", tag))?;

        let mut params: Vec<(String, Var)> = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("{} var map lock poisoned", tag))?;
            data.iter().map(|(name, var)| (name.clone(), var.clone())).collect()
        };
        params.sort_by(|a, b| a.0.cmp(&b.0));

        Ok((
            Self {
                tag,
                device: device.clone(),
                params,
                grads: GradientAccumulator::new(),
            },
            layers,
        ))
    }

    pub fn tag(&self) -> ModuleTag {
        self.tag
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Parameter handles with their local names, in a stable order
    pub fn named(&self) -> &[(String, Var)] {
        &self.params
    }

    pub fn vars(&self) -> Vec<Var> {
        self.params.iter().map(|(_, var)| var.clone()).collect()
    }

    /// Name used by optimizers and gradient buffers: `{tag}.{local}`
    pub fn qualified_name(&self, local: &str) -> String {
        format!("{}.{}", self.tag, local)
    }

    pub fn num_elements(&self) -> usize {
        self.params.iter().map(|(_, var)| var.elem_count()).sum()
    }

    pub fn zero_grad(&mut self) {
        self.grads.reset();
    }

    /// Add this module's share of a backward pass to its gradient buffer.
    /// Returns how many parameters received a gradient.
    pub fn accumulate(&mut self, grads: &GradStore) -> Result<usize> {
        let mut touched = 0;
        for (name, var) in &self.params {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let qualified = format!("{}.{}", self.tag, name);
                self.grads.accumulate(&qualified, grad)?;
                touched += 1;
            }
        }
        Ok(touched)
    }

    pub fn gradients(&self) -> &GradientAccumulator {
        &self.grads
    }

    pub fn gradients_mut(&mut self) -> &mut GradientAccumulator {
        &mut self.grads
    }

    /// Copy of the current parameter values, keyed by local name
    pub fn snapshot(&self) -> Result<Vec<(String, Tensor)>> {
        self.params
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect()
    }

    /// Overwrite parameters in place from `tensors`.
    ///
    /// Every parameter must be present with a matching shape. Extra entries
    /// are an error too, since they mean the file belongs to another layout.
    pub fn restore(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        if tensors.len() != self.params.len() {
            return Err(TrainError::config(format!(
                "{} expects {} tensors, found {}",
                self.tag,
                self.params.len(),
                tensors.len()
            ))
            .into());
        }
        for (name, var) in &self.params {
            let value = tensors.get(name).ok_or_else(|| {
                TrainError::config(format!("{} tensor '{}' missing", self.tag, name))
            })?;
            if value.dims() != var.dims() {
                return Err(TrainError::config(format!(
                    "{} tensor '{}' has shape {:?}, expected {:?}",
                    self.tag,
                    name,
                    value.dims(),
                    var.dims()
                ))
                .into());
            }
            let value = value.to_device(&self.device)?.to_dtype(var.dtype())?;
            var.set(&value)?;
        }
        Ok(())
    }
}

/// Anything that owns a `ParamSet`
pub trait Trainable {
    fn params(&self) -> &ParamSet;
    fn params_mut(&mut self) -> &mut ParamSet;

    fn tag(&self) -> ModuleTag {
        self.params().tag()
    }

    fn zero_grad(&mut self) {
        self.params_mut().zero_grad();
    }
}
