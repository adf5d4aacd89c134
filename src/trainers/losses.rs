//! Loss terms of the adversarial autoencoder

use anyhow::Result;
use candle_core::Tensor;

/// Clamp discriminator probabilities to `[eps, 1 - eps]`.
///
/// `None` passes the tensor through unchanged, in which case a saturated
/// discriminator output produces an infinite log-loss.
pub fn clamp_probability(p: &Tensor, eps: Option<f64>) -> Result<Tensor> {
    match eps {
        Some(eps) => Ok(p.clamp(eps, 1.0 - eps)?),
        None => Ok(p.clone()),
    }
}

/// `-mean(log(p_same) + log(1 - p_diff))`
pub fn discriminator_loss(p_same: &Tensor, p_diff: &Tensor) -> Result<Tensor> {
    let log_same = p_same.log()?;
    let log_not_diff = p_diff.affine(-1.0, 1.0)?.log()?;
    Ok((log_same + log_not_diff)?.mean_all()?.neg()?)
}

/// `mean(-(0.5 * log(p) + 0.5 * log(1 - p)))`, minimal at p = 0.5
pub fn encoder_adversarial_loss(p: &Tensor) -> Result<Tensor> {
    let log_p = p.log()?.affine(0.5, 0.0)?;
    let log_not_p = p.affine(-1.0, 1.0)?.log()?.affine(0.5, 0.0)?;
    Ok((log_p + log_not_p)?.neg()?.mean_all()?)
}

/// `mean((a - b)^2)`
pub fn mean_squared(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok((a - b)?.sqr()?.mean_all()?)
}

/// Style codes of two frames from the same utterance should match
pub fn style_similarity_loss(es_t: &Tensor, es_tk: &Tensor) -> Result<Tensor> {
    mean_squared(es_t, es_tk)
}

pub fn reconstruction_loss(x_tilde: &Tensor, target: &Tensor) -> Result<Tensor> {
    mean_squared(x_tilde, target)
}

pub fn scalar(loss: &Tensor) -> Result<f32> {
    Ok(loss.to_scalar::<f32>()?)
}
