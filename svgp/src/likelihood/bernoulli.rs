//! Bernoulli likelihood for binary data.

use candle_core::Tensor;

use super::PointwiseLikelihood;
use crate::error::Result;

/// Bernoulli likelihood with logistic link: y ~ Bernoulli(sigmoid(f))
///
/// ```text
/// log p(y | f) = y * f - softplus(f),   y ∈ {0, 1}
/// ```
#[derive(Default)]
pub struct BernoulliLikelihood;

impl BernoulliLikelihood {
    pub fn new() -> Self {
        Self
    }
}

/// ln(1 + exp(x)) = max(x, 0) + ln(1 + exp(-|x|))
fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok((x.relu()? + tail)?)
}

impl PointwiseLikelihood for BernoulliLikelihood {
    fn log_density(&self, f: &Tensor, y: &Tensor) -> Result<Tensor> {
        let y_f = f.broadcast_mul(y)?;
        Ok((y_f - softplus(f)?)?)
    }

    fn conditional_moments(&self, f: &Tensor) -> Result<(Tensor, Tensor)> {
        let p = candle_nn::ops::sigmoid(f)?;
        let var = (&p * p.affine(-1.0, 1.0)?)?;
        Ok((p, var))
    }

    fn name(&self) -> &'static str {
        "bernoulli"
    }
}
