//! Adam optimizer over a fixed list of named parameters
//! Each optimizer keeps its own first/second moment estimates

use anyhow::Result;
use candle_core::{DType, Tensor, Var};
use std::collections::HashMap;

use crate::models::ParamSet;

pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,

    // Shared handles, fixed at construction
    params: Vec<(String, Var)>,

    m: HashMap<String, Tensor>,
    v: HashMap<String, Tensor>,

    // Step counter
    step: usize,
}

impl Adam {
    /// Standard Adam (0.9, 0.999, 1e-8, no weight decay) over the parameters
    /// of `groups`, concatenated in order.
    pub fn new(learning_rate: f64, groups: &[&ParamSet]) -> Self {
        let params = groups
            .iter()
            .flat_map(|group| {
                group
                    .named()
                    .iter()
                    .map(|(name, var)| (group.qualified_name(name), var.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            params,
            m: HashMap::new(),
            v: HashMap::new(),
            step: 0,
        }
    }

    pub fn get_step(&self) -> usize {
        self.step
    }

    /// Qualified names of the parameters this optimizer updates, in order
    pub fn param_names(&self) -> Vec<&str> {
        self.params.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// One optimization step using the gradients buffered in `groups`.
    ///
    /// Only parameters owned by this optimizer are touched; a parameter with
    /// no buffered gradient is skipped.
    pub fn step(&mut self, groups: &[&ParamSet]) -> Result<()> {
        self.step += 1;

        let params = self.params.clone();
        for (name, param) in &params {
            let grad = groups.iter().find_map(|g| g.gradients().get(name));
            if let Some(grad) = grad {
                self.update(name, param, grad)?;
            }
        }
        Ok(())
    }

    /// Update a single parameter
    fn update(&mut self, name: &str, param: &Var, grad: &Tensor) -> Result<()> {
        let grad = grad.detach().to_dtype(DType::F32)?;
        let current = param.as_tensor().detach();

        let m = match self.m.get(name) {
            Some(m) => m.clone(),
            None => Tensor::zeros_like(&grad)?,
        };
        let v = match self.v.get(name) {
            Some(v) => v.clone(),
            None => Tensor::zeros_like(&grad)?,
        };

        // Biased first and second moment estimates
        let m_new = (m.affine(self.beta1, 0.0)? + grad.affine(1.0 - self.beta1, 0.0)?)?;
        let v_new = (v.affine(self.beta2, 0.0)? + grad.sqr()?.affine(1.0 - self.beta2, 0.0)?)?;

        let t = self.step.max(1) as i32;
        let m_hat = m_new.affine(1.0 / (1.0 - self.beta1.powi(t)), 0.0)?;
        let v_hat = v_new.affine(1.0 / (1.0 - self.beta2.powi(t)), 0.0)?;

        let update = (m_hat / v_hat.sqrt()?.affine(1.0, self.eps)?)?;
        let update = update.to_dtype(param.dtype())?;
        let new_value = (current - update.affine(self.learning_rate, 0.0)?)?;
        param.set(&new_value)?;

        self.m.insert(name.to_string(), m_new);
        self.v.insert(name.to_string(), v_new);
        Ok(())
    }
}
