//! MLP mapping one fixed-width vector to another
//!
//! Used three times: as the style encoder and the content encoder
//! (`feature_dim -> code_dim`), and as the decoder (`2 * code_dim ->
//! feature_dim`) fed with a concatenated style/content pair.

use anyhow::Result;
use candle_core::{Device, Module, Tensor};
use candle_nn::{linear, Linear};

use super::{ModuleTag, ParamSet, Trainable};

pub struct FrameEncoder {
    fc1: Linear,
    fc2: Linear,
    out: Linear,
    params: ParamSet,
}

impl FrameEncoder {
    pub fn new(
        tag: ModuleTag,
        in_dim: usize,
        hidden_dim: usize,
        out_dim: usize,
        device: &Device,
    ) -> Result<Self> {
        let (params, (fc1, fc2, out)) = ParamSet::build(tag, device, |vb| {
            let fc1 = linear(in_dim, hidden_dim, vb.pp("fc1"))?;
            let fc2 = linear(hidden_dim, hidden_dim, vb.pp("fc2"))?;
            let out = linear(hidden_dim, out_dim, vb.pp("out"))?;
            Ok((fc1, fc2, out))
        })?;

        Ok(Self {
            fc1,
            fc2,
            out,
            params,
        })
    }

}

impl Module for FrameEncoder {
    /// `(batch, in_dim) -> (batch, out_dim)`
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.fc1.forward(xs)?.relu()?;
        let h = self.fc2.forward(&h)?.relu()?;
        self.out.forward(&h)
    }
}

impl Trainable for FrameEncoder {
    fn params(&self) -> &ParamSet {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_output_shape() {
        let device = Device::Cpu;
        let enc = FrameEncoder::new(ModuleTag::Ec, 6, 16, 3, &device).unwrap();
        let x = Tensor::zeros((5, 6), DType::F32, &device).unwrap();
        assert_eq!(enc.forward(&x).unwrap().dims(), &[5, 3]);
    }

    #[test]
    fn test_params_are_named_and_ordered() {
        let device = Device::Cpu;
        let enc = FrameEncoder::new(ModuleTag::Dec, 4, 8, 4, &device).unwrap();
        let names: Vec<&str> = enc.params().named().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["fc1.bias", "fc1.weight", "fc2.bias", "fc2.weight", "out.bias", "out.weight"]
        );
        assert_eq!(enc.params().num_elements(), 4 * 8 + 8 + 8 * 8 + 8 + 8 * 4 + 4);
    }

    #[test]
    fn test_rejects_wrong_input_width() {
        let device = Device::Cpu;
        let enc = FrameEncoder::new(ModuleTag::Es, 4, 8, 2, &device).unwrap();
        let x = Tensor::zeros((2, 5), DType::F32, &device).unwrap();
        assert!(enc.forward(&x).is_err());
    }
}
