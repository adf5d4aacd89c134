//! Content-pair discriminator
//!
//! Scores whether two content codes come from nearby frames of the same
//! utterance. The final sigmoid keeps the output inside (0, 1) in exact
//! arithmetic, but f32 saturates to exactly 0 or 1 for large logits. Its
//! gradient stays finite (zero) when saturated.

use anyhow::Result;
use candle_core::{Device, Module, Tensor};
use candle_nn::{linear, ops, Linear};

use super::{ModuleTag, ParamSet, Trainable};

pub struct PairDiscriminator {
    fc1: Linear,
    fc2: Linear,
    out: Linear,
    params: ParamSet,
}

impl PairDiscriminator {
    pub fn new(code_dim: usize, hidden_dim: usize, device: &Device) -> Result<Self> {
        let (params, (fc1, fc2, out)) = ParamSet::build(ModuleTag::Dis, device, |vb| {
            let fc1 = linear(2 * code_dim, hidden_dim, vb.pp("fc1"))?;
            let fc2 = linear(hidden_dim, hidden_dim, vb.pp("fc2"))?;
            let out = linear(hidden_dim, 1, vb.pp("out"))?;
            Ok((fc1, fc2, out))
        })?;

        Ok(Self {
            fc1,
            fc2,
            out,
            params,
        })
    }

    /// Pre-sigmoid score, `(batch,)`
    pub fn logits(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let x = Tensor::cat(&[a, b], 1)?;
        let h = self.fc1.forward(&x)?.relu()?;
        let h = self.fc2.forward(&h)?.relu()?;
        Ok(self.out.forward(&h)?.squeeze(1)?)
    }

    /// Probability that `(a, b)` is a same-utterance pair, `(batch,)`
    pub fn forward(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        Ok(ops::sigmoid(&self.logits(a, b)?)?)
    }
}

impl Trainable for PairDiscriminator {
    fn params(&self) -> &ParamSet {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }
}
