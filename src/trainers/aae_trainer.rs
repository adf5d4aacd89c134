//! Adversarial autoencoder training loop
//!
//! Each iteration runs two optimization phases on the same triplet:
//! 1. The discriminator learns to tell content codes of nearby frames
//!    (same utterance) from content codes paired across speakers.
//! 2. The style encoder, content encoder and decoder learn to reconstruct
//!    `X_{t+k}` from `(Es(X_t), Ec(X_{t+k}))` while keeping style codes
//!    stable within an utterance and making the discriminator output 0.5.
//!
//! Losses are recorded under `iteration + 1`. A checkpoint generation is
//! written every `save_every` iterations, starting at iteration 0.

use anyhow::Result;
use candle_core::{Device, Module, Tensor};
use log::{debug, info};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::adam::Adam;
use super::checkpoint::CheckpointManager;
use super::losses::{
    clamp_probability, discriminator_loss, encoder_adversarial_loss, reconstruction_loss, scalar,
    style_similarity_loss,
};
use super::metrics::{LossBundle, MetricsSink};
use super::progress::ProgressReporter;
use super::training_helpers::clip_grad_norm;
use super::triplet_loader::{SampleStream, SampleTriplet};
use super::{Hps, ModelConfig};
use crate::error::TrainError;
use crate::models::{FrameEncoder, ModuleTag, PairDiscriminator, ParamSet, Trainable};

#[derive(Debug, Clone)]
pub struct TrainerOptions {
    pub hps: Hps,
    /// Stop the discriminator loss from reaching the content encoder
    pub detach_content_codes: bool,
    pub prob_clamp: Option<f64>,
    pub save_every: usize,
    pub save_on_interrupt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    /// Ran up to the configured iteration count
    Completed { iterations: usize },
    /// Stopped by the interrupt flag after finishing `iteration`
    Interrupted { iteration: usize },
}

/// Losses of the encoder/decoder phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderLosses {
    pub l_rec: f32,
    pub l_sim: f32,
    pub l_adv_e: f32,
}

pub struct AaeTrainer<S: SampleStream> {
    es: FrameEncoder,
    ec: FrameEncoder,
    dec: FrameEncoder,
    dis: PairDiscriminator,

    // Es + Ec + Dec
    opt_e: Adam,
    opt_d: Adam,

    stream: S,
    checkpoints: Option<CheckpointManager>,
    metrics: Box<dyn MetricsSink>,
    progress: ProgressReporter,
    options: TrainerOptions,
    stop: Option<Arc<AtomicBool>>,
    last_saved: Option<usize>,
}

impl<S: SampleStream> AaeTrainer<S> {
    pub fn new(
        model: &ModelConfig,
        options: TrainerOptions,
        stream: S,
        checkpoints: Option<CheckpointManager>,
        metrics: Box<dyn MetricsSink>,
        device: &Device,
    ) -> Result<Self> {
        if stream.feature_dim() != model.feature_dim {
            return Err(TrainError::config(format!(
                "sample stream yields feature_dim {}, model expects {}",
                stream.feature_dim(),
                model.feature_dim
            ))
            .into());
        }
        if options.save_every == 0 {
            return Err(TrainError::config("save_every must be at least 1").into());
        }

        let (f, c, h) = (model.feature_dim, model.code_dim, model.hidden_dim);
        let es = FrameEncoder::new(ModuleTag::Es, f, h, c, device)?;
        let ec = FrameEncoder::new(ModuleTag::Ec, f, h, c, device)?;
        let dec = FrameEncoder::new(ModuleTag::Dec, 2 * c, h, f, device)?;
        let dis = PairDiscriminator::new(c, h, device)?;

        let opt_e = Adam::new(options.hps.lr, &[es.params(), ec.params(), dec.params()]);
        let opt_d = Adam::new(options.hps.lr, &[dis.params()]);

        let total = es.params().num_elements()
            + ec.params().num_elements()
            + dec.params().num_elements()
            + dis.params().num_elements();
        info!(
            "Built networks: feature_dim={}, code_dim={}, hidden_dim={}, {} parameters",
            f, c, h, total
        );

        let progress = ProgressReporter::new(options.hps.iterations);
        Ok(Self {
            es,
            ec,
            dec,
            dis,
            opt_e,
            opt_d,
            stream,
            checkpoints,
            metrics,
            progress,
            options,
            stop: None,
            last_saved: None,
        })
    }

    /// Checked between iterations; when set, the loop stops after the
    /// current iteration.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn options(&self) -> &TrainerOptions {
        &self.options
    }

    pub fn es(&self) -> &FrameEncoder {
        &self.es
    }

    pub fn ec(&self) -> &FrameEncoder {
        &self.ec
    }

    pub fn dec(&self) -> &FrameEncoder {
        &self.dec
    }

    pub fn dis(&self) -> &PairDiscriminator {
        &self.dis
    }

    pub fn checkpoints(&self) -> Option<&CheckpointManager> {
        self.checkpoints.as_ref()
    }

    fn modules(&self) -> [&ParamSet; 4] {
        [self.es.params(), self.ec.params(), self.dec.params(), self.dis.params()]
    }

    /// Load generation `iteration` from `dir` and return the iteration to
    /// continue from. Optimizer moments start fresh.
    pub fn resume_from(&mut self, dir: &Path, iteration: usize) -> Result<usize> {
        CheckpointManager::load(dir, iteration, self.modules())?;
        if let Some(manager) = self.checkpoints.as_mut() {
            let adopted = manager.adopt_existing(iteration + 1)?;
            debug!("Adopted {} existing checkpoint generations", adopted);
        }
        self.last_saved = Some(iteration);
        info!("Resuming after iteration {}", iteration);
        Ok(iteration + 1)
    }

    /// Run iterations `start..hps.iterations`
    pub fn train(&mut self, start: usize) -> Result<TrainOutcome> {
        let end = self.options.hps.iterations;
        info!(
            "Training iterations {}..{} (lr={}, alpha={}, beta={}, max_grad_norm={}, detach_content_codes={})",
            start,
            end,
            self.options.hps.lr,
            self.options.hps.alpha,
            self.options.hps.beta,
            self.options.hps.max_grad_norm,
            self.options.detach_content_codes
        );

        for iteration in start..end {
            self.train_iteration(iteration)?;

            if self.stop_requested() {
                self.progress.finish();
                if self.options.save_on_interrupt && self.last_saved != Some(iteration) {
                    self.save_checkpoint(iteration)?;
                }
                info!("Interrupted after iteration {}", iteration);
                return Ok(TrainOutcome::Interrupted { iteration });
            }
        }

        self.progress.finish();
        let iterations = end.saturating_sub(start);
        info!("Training complete: {} iterations", iterations);
        Ok(TrainOutcome::Completed { iterations })
    }

    /// One full iteration: draw, discriminator step, encoder step, record,
    /// maybe checkpoint.
    pub fn train_iteration(&mut self, iteration: usize) -> Result<LossBundle> {
        let triplet = self.stream.next_triplet()?;

        let l_adv_c = self.discriminator_step(&triplet, iteration)?;
        let enc = self.encoder_step(&triplet, iteration)?;
        let losses = LossBundle {
            l_rec: enc.l_rec,
            l_sim: enc.l_sim,
            l_adv_c,
            l_adv_e: enc.l_adv_e,
        };

        losses.record_into(self.metrics.as_mut(), iteration + 1);
        self.progress.update(iteration, &losses);

        if iteration % self.options.save_every == 0 {
            self.save_checkpoint(iteration)?;
        }
        Ok(losses)
    }

    /// Update the discriminator on `beta * L_adv_C`. Returns the unweighted
    /// loss.
    pub fn discriminator_step(&mut self, triplet: &SampleTriplet, iteration: usize) -> Result<f32> {
        let mut ec_t = self.ec.forward(&triplet.x_t)?;
        let mut ec_tk = self.ec.forward(&triplet.x_tk)?;
        let mut ec_j = self.ec.forward(&triplet.x_j)?;
        if self.options.detach_content_codes {
            ec_t = ec_t.detach();
            ec_tk = ec_tk.detach();
            ec_j = ec_j.detach();
        }

        let p_same = self.probability(&ec_t, &ec_tk)?;
        let p_diff = self.probability(&ec_t, &ec_j)?;
        let l_adv_c = discriminator_loss(&p_same, &p_diff)?;
        let value = ensure_finite(scalar(&l_adv_c)?, iteration, "L_adv_C")?;

        self.dis.zero_grad();
        let grads = l_adv_c.affine(self.options.hps.beta, 0.0)?.backward()?;
        self.dis.params_mut().accumulate(&grads)?;
        if !self.options.detach_content_codes {
            // Cleared again before the encoder step uses them
            self.ec.params_mut().accumulate(&grads)?;
        }

        let norm = clip_grad_norm(&mut [self.dis.params_mut()], self.options.hps.max_grad_norm)?;
        ensure_finite_norm(norm, iteration, "Dis")?;
        self.opt_d.step(&[self.dis.params()])?;
        debug!("iteration {}: discriminator grad norm {:.4}", iteration, norm);

        Ok(value)
    }

    /// Update Es, Ec and Dec on `L_rec + alpha * L_sim + beta * L_adv_E`
    pub fn encoder_step(&mut self, triplet: &SampleTriplet, iteration: usize) -> Result<EncoderLosses> {
        let es_t = self.es.forward(&triplet.x_t)?;
        let es_tk = self.es.forward(&triplet.x_tk)?;
        let ec_t = self.ec.forward(&triplet.x_t)?;
        let ec_tk = self.ec.forward(&triplet.x_tk)?;

        let l_sim = style_similarity_loss(&es_t, &es_tk)?;
        let x_tilde = self.dec.forward(&Tensor::cat(&[&es_t, &ec_tk], 1)?)?;
        let l_rec = reconstruction_loss(&x_tilde, &triplet.x_tk)?;
        let p = self.probability(&ec_t, &ec_tk)?;
        let l_adv_e = encoder_adversarial_loss(&p)?;

        let losses = EncoderLosses {
            l_rec: ensure_finite(scalar(&l_rec)?, iteration, "L_rec")?,
            l_sim: ensure_finite(scalar(&l_sim)?, iteration, "L_sim")?,
            l_adv_e: ensure_finite(scalar(&l_adv_e)?, iteration, "L_adv_E")?,
        };

        let hps = &self.options.hps;
        let total = ((l_rec + l_sim.affine(hps.alpha, 0.0)?)? + l_adv_e.affine(hps.beta, 0.0)?)?;

        self.es.zero_grad();
        self.ec.zero_grad();
        self.dec.zero_grad();
        let grads = total.backward()?;
        self.es.params_mut().accumulate(&grads)?;
        self.ec.params_mut().accumulate(&grads)?;
        self.dec.params_mut().accumulate(&grads)?;

        let norm = clip_grad_norm(
            &mut [self.es.params_mut(), self.ec.params_mut(), self.dec.params_mut()],
            self.options.hps.max_grad_norm,
        )?;
        ensure_finite_norm(norm, iteration, "Es+Ec+Dec")?;
        self.opt_e
            .step(&[self.es.params(), self.ec.params(), self.dec.params()])?;
        debug!("iteration {}: encoder grad norm {:.4}", iteration, norm);

        Ok(losses)
    }

    /// Write generation `iteration` if a checkpoint directory is configured
    pub fn save_checkpoint(&mut self, iteration: usize) -> Result<()> {
        if let Some(manager) = self.checkpoints.as_mut() {
            manager.save(
                iteration,
                [self.es.params(), self.ec.params(), self.dec.params(), self.dis.params()],
            )?;
            self.last_saved = Some(iteration);
        }
        Ok(())
    }

    fn probability(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        clamp_probability(&self.dis.forward(a, b)?, self.options.prob_clamp)
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

fn ensure_finite(value: f32, iteration: usize, loss: &'static str) -> Result<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TrainError::NonFiniteLoss { iteration, loss }.into())
    }
}

// Clipping cannot rescue a NaN norm, and stepping on it poisons every parameter
fn ensure_finite_norm(norm: f64, iteration: usize, group: &'static str) -> Result<()> {
    if norm.is_finite() {
        Ok(())
    } else {
        Err(TrainError::NonFiniteGradient { iteration, group }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::metrics::NullMetricsSink;
    use crate::trainers::training_helpers::grad_norm;
    use crate::trainers::triplet_loader::SyntheticStream;
    use tempfile::TempDir;

    const FEATURES: usize = 6;

    fn options(iterations: usize) -> TrainerOptions {
        TrainerOptions {
            hps: Hps {
                lr: 1e-3,
                alpha: 1.0,
                beta: 1.0,
                max_grad_norm: 5.0,
                iterations,
            },
            detach_content_codes: false,
            prob_clamp: Some(1e-7),
            save_every: 100,
            save_on_interrupt: true,
        }
    }

    fn model() -> ModelConfig {
        ModelConfig {
            feature_dim: FEATURES,
            code_dim: 3,
            hidden_dim: 16,
        }
    }

    fn trainer(
        options: TrainerOptions,
        stream: SyntheticStream,
        checkpoints: Option<CheckpointManager>,
    ) -> AaeTrainer<SyntheticStream> {
        let total = options.hps.iterations;
        AaeTrainer::new(
            &model(),
            options,
            stream,
            checkpoints,
            Box::new(NullMetricsSink),
            &Device::Cpu,
        )
        .unwrap()
        .with_progress(ProgressReporter::hidden(total))
    }

    fn stream(seed: u64) -> SyntheticStream {
        SyntheticStream::new(FEATURES, 8, seed, &Device::Cpu)
    }

    fn values(set: &ParamSet) -> Vec<Vec<f32>> {
        set.snapshot()
            .unwrap()
            .into_iter()
            .map(|(_, t)| t.flatten_all().unwrap().to_vec1().unwrap())
            .collect()
    }

    #[test]
    fn test_discriminator_step_moves_only_discriminator() {
        let mut t = trainer(options(10), stream(1), None);
        let triplet = stream(2).next_triplet().unwrap();
        let dis_before = values(t.dis().params());
        let ec_before = values(t.ec().params());

        let loss = t.discriminator_step(&triplet, 0).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
        assert!(grad_norm(&[t.dis().params()]).unwrap() > 0.0);
        assert_ne!(values(t.dis().params()), dis_before);
        assert_eq!(values(t.ec().params()), ec_before);
    }

    #[test]
    fn test_detach_flag_controls_content_encoder_gradients() {
        let triplet = stream(3).next_triplet().unwrap();

        let mut attached = trainer(options(10), stream(1), None);
        attached.discriminator_step(&triplet, 0).unwrap();
        assert!(!attached.ec().params().gradients().is_empty());

        let mut opts = options(10);
        opts.detach_content_codes = true;
        let mut detached = trainer(opts, stream(1), None);
        detached.discriminator_step(&triplet, 0).unwrap();
        assert!(detached.ec().params().gradients().is_empty());
        assert!(!detached.dis().params().gradients().is_empty());
    }

    #[test]
    fn test_encoder_step_clips_joint_group() {
        let mut opts = options(10);
        opts.hps.max_grad_norm = 1e-3;
        let mut t = trainer(opts, stream(1), None);
        let triplet = stream(4).next_triplet().unwrap();
        let dis_before = values(t.dis().params());

        t.encoder_step(&triplet, 0).unwrap();
        let norm = grad_norm(&[t.es().params(), t.ec().params(), t.dec().params()]).unwrap();
        assert!(norm <= 1e-3 + 1e-6, "norm {} above threshold", norm);
        assert_eq!(values(t.dis().params()), dis_before);
    }

    #[test]
    fn test_style_loss_vanishes_on_identical_pairs() {
        let mut t = trainer(options(20), stream(1).with_identical_pairs(true), None);
        for iteration in 0..20 {
            let losses = t.train_iteration(iteration).unwrap();
            assert!(losses.is_finite());
            assert!(losses.l_sim < 1e-6, "L_sim={} at {}", losses.l_sim, iteration);
        }
    }

    #[test]
    fn test_checkpoint_cadence_without_final_save() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(25);
        opts.save_every = 10;
        let manager = CheckpointManager::new(dir.path(), 10).unwrap();
        let mut t = trainer(opts, stream(1), Some(manager));

        assert_eq!(t.train(0).unwrap(), TrainOutcome::Completed { iterations: 25 });
        let kept: Vec<usize> = t.checkpoints().unwrap().kept().map(|r| r.iteration).collect();
        assert_eq!(kept, vec![0, 10, 20]);
        assert_eq!(CheckpointManager::latest_on_disk(dir.path()).unwrap(), Some(20));
    }

    #[test]
    fn test_interrupt_writes_final_checkpoint() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 10).unwrap();
        let stop = Arc::new(AtomicBool::new(true));
        let mut t = trainer(options(100), stream(1), Some(manager)).with_stop_flag(stop);

        assert_eq!(t.train(3).unwrap(), TrainOutcome::Interrupted { iteration: 3 });
        assert_eq!(CheckpointManager::latest_on_disk(dir.path()).unwrap(), Some(3));
    }

    #[test]
    fn test_interrupt_does_not_duplicate_scheduled_save() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 10).unwrap();
        let stop = Arc::new(AtomicBool::new(true));
        let mut t = trainer(options(100), stream(1), Some(manager)).with_stop_flag(stop);

        assert_eq!(t.train(0).unwrap(), TrainOutcome::Interrupted { iteration: 0 });
        assert_eq!(t.checkpoints().unwrap().kept().count(), 1);
    }

    #[test]
    fn test_resume_restores_parameters() {
        let dir = TempDir::new().unwrap();
        let mut first = trainer(options(5), stream(1), Some(CheckpointManager::new(dir.path(), 3).unwrap()));
        first.train(0).unwrap();

        let mut second = trainer(options(5), stream(9), Some(CheckpointManager::new(dir.path(), 3).unwrap()));
        assert_eq!(second.resume_from(dir.path(), 0).unwrap(), 1);
        assert_eq!(second.checkpoints().unwrap().kept().count(), 1);

        // first trained past iteration 0, so compare against the file rather than first
        let reference = trainer(options(5), stream(1), None);
        CheckpointManager::load(dir.path(), 0, reference.modules()).unwrap();
        assert_eq!(values(second.es().params()), values(reference.es().params()));
        assert_eq!(values(second.dis().params()), values(reference.dis().params()));
    }

    #[test]
    fn test_rejects_feature_dim_mismatch() {
        let err = AaeTrainer::new(
            &model(),
            options(1),
            SyntheticStream::new(FEATURES + 1, 4, 0, &Device::Cpu),
            None,
            Box::new(NullMetricsSink),
            &Device::Cpu,
        )
        .err()
        .unwrap();
        assert!(matches!(err.downcast_ref::<TrainError>(), Some(TrainError::Config(_))));
    }

    #[test]
    fn test_non_finite_loss_is_typed() {
        let err = ensure_finite(f32::NAN, 7, "L_rec").unwrap_err();
        match err.downcast_ref::<TrainError>() {
            Some(TrainError::NonFiniteLoss { iteration, loss }) => {
                assert_eq!(*iteration, 7);
                assert_eq!(*loss, "L_rec");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_saturated_discriminator_keeps_training_finite() {
        let mut t = trainer(options(10), stream(1), None);
        let device = Device::Cpu;
        let (_, bias) = t
            .dis()
            .params()
            .named()
            .iter()
            .find(|(name, _)| name == "out.bias")
            .unwrap();
        bias.set(&Tensor::new(&[-200f32], &device).unwrap()).unwrap();

        let triplet = stream(5).next_triplet().unwrap();
        let loss = t.discriminator_step(&triplet, 0).unwrap();
        assert!(loss.is_finite());
        for v in values(t.dis().params()) {
            assert!(v.iter().all(|x| x.is_finite()));
        }

        let losses = t.train_iteration(1).unwrap();
        assert!(losses.is_finite());
    }

    #[test]
    fn test_non_finite_gradient_norm_is_typed() {
        ensure_finite_norm(3.0, 2, "Dis").unwrap();
        let err = ensure_finite_norm(f64::NAN, 2, "Dis").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::NonFiniteGradient { iteration: 2, group: "Dis" })
        ));
    }
}
