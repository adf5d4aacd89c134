//! Gradient bookkeeping and clipping helpers

use anyhow::Result;
use candle_core::Tensor;
use log::debug;
use std::collections::HashMap;

use crate::models::ParamSet;

/// Per-module gradient buffer.
///
/// Gradients from successive backward passes are summed until `reset`, which
/// is what `zero_grad` means for a module.
#[derive(Default)]
pub struct GradientAccumulator {
    accumulated_grads: HashMap<String, Tensor>,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        let grad = grad.detach();
        if let Some(acc) = self.accumulated_grads.get_mut(name) {
            *acc = (&*acc + &grad)?;
        } else {
            self.accumulated_grads.insert(name.to_string(), grad);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.accumulated_grads.get(name)
    }

    pub fn reset(&mut self) {
        self.accumulated_grads.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.accumulated_grads.is_empty()
    }

    /// Sum of squared gradient entries over every buffered tensor
    pub fn norm_sq(&self) -> Result<f64> {
        let mut total = 0.0f64;
        for grad in self.accumulated_grads.values() {
            total += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
        Ok(total)
    }

    /// Multiply every buffered gradient by `factor`
    pub fn scale(&mut self, factor: f64) -> Result<()> {
        for grad in self.accumulated_grads.values_mut() {
            *grad = grad.affine(factor, 0.0)?;
        }
        Ok(())
    }
}

/// Global L2 norm of the gradients held by a parameter group
pub fn grad_norm(groups: &[&ParamSet]) -> Result<f64> {
    let mut total_sq = 0.0;
    for group in groups {
        total_sq += group.gradients().norm_sq()?;
    }
    Ok(total_sq.sqrt())
}

/// Clip the combined gradient norm of `groups` to `max_norm`.
///
/// Gradients are rescaled by `max_norm / (norm + 1e-6)` only when that factor
/// is below one, so a group already under the threshold is left untouched.
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(groups: &mut [&mut ParamSet], max_norm: f64) -> Result<f64> {
    let mut total_sq = 0.0;
    for group in groups.iter() {
        total_sq += group.gradients().norm_sq()?;
    }
    let total_norm = total_sq.sqrt();

    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        debug!(
            "Gradient clipping: norm {:.4} > max {:.4}, scale={:.4}",
            total_norm, max_norm, clip_coef
        );
        for group in groups.iter_mut() {
            group.gradients_mut().scale(clip_coef)?;
        }
    }

    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FrameEncoder, ModuleTag, Trainable};
    use candle_core::{Device, Module};

    fn encoder_with_grads(scale: f64) -> FrameEncoder {
        let device = Device::Cpu;
        let mut enc = FrameEncoder::new(ModuleTag::Es, 4, 8, 3, &device).unwrap();
        let x = (Tensor::ones((2, 4), candle_core::DType::F32, &device).unwrap() * scale).unwrap();
        let loss = enc.forward(&x).unwrap().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        enc.params_mut().accumulate(&grads).unwrap();
        enc
    }

    #[test]
    fn test_accumulate_sums_and_reset_clears() {
        let device = Device::Cpu;
        let mut acc = GradientAccumulator::new();
        let g = Tensor::new(&[1.0f32, 2.0], &device).unwrap();
        acc.accumulate("w", &g).unwrap();
        acc.accumulate("w", &g).unwrap();
        let summed: Vec<f32> = acc.get("w").unwrap().to_vec1().unwrap();
        assert_eq!(summed, vec![2.0, 4.0]);
        assert!((acc.norm_sq().unwrap() - 20.0).abs() < 1e-6);

        acc.reset();
        assert!(acc.is_empty());
    }

    #[test]
    fn test_clip_caps_norm() {
        let mut enc = encoder_with_grads(50.0);
        let before = grad_norm(&[enc.params()]).unwrap();
        assert!(before > 1.0);

        let reported = clip_grad_norm(&mut [enc.params_mut()], 1.0).unwrap();
        assert!((reported - before).abs() < 1e-3 * before);

        let after = grad_norm(&[enc.params()]).unwrap();
        assert!(after <= 1.0 + 1e-4, "post-clip norm {after}");
    }

    #[test]
    fn test_clip_leaves_small_gradients_alone() {
        let mut enc = encoder_with_grads(0.01);
        let before = grad_norm(&[enc.params()]).unwrap();
        let threshold = before * 10.0 + 1.0;

        clip_grad_norm(&mut [enc.params_mut()], threshold).unwrap();

        let after = grad_norm(&[enc.params()]).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_clip_spans_all_groups() {
        let mut a = encoder_with_grads(20.0);
        let mut b = encoder_with_grads(20.0);
        clip_grad_norm(&mut [a.params_mut(), b.params_mut()], 2.0).unwrap();
        let joint = grad_norm(&[a.params(), b.params()]).unwrap();
        assert!(joint <= 2.0 + 1e-4);
    }
}
