//! Poisson likelihood for count data.

use candle_core::{DType, Tensor};
use special::Gamma as SpecialGamma;

use super::PointwiseLikelihood;
use crate::error::Result;

/// Poisson likelihood: y ~ Poisson(exp(f))
///
/// ```text
/// log p(y | f) = y * f - exp(f) - ln(y!)
/// ```
///
/// ln(y!) does not depend on f but is kept so that the ELBO stays a bound
/// on the actual marginal likelihood.
#[derive(Default)]
pub struct PoissonLikelihood;

impl PoissonLikelihood {
    pub fn new() -> Self {
        Self
    }
}

/// ln(y!) = ln Γ(y + 1), elementwise; y is data so no gradient is needed
fn ln_factorial(y: &Tensor) -> Result<Tensor> {
    let vals: Vec<f64> = y
        .flatten_all()?
        .to_dtype(DType::F64)?
        .to_vec1::<f64>()?
        .into_iter()
        .map(|v| SpecialGamma::ln_gamma(v + 1.0).0)
        .collect();
    Ok(Tensor::from_vec(vals, y.shape().clone(), y.device())?.to_dtype(y.dtype())?)
}

impl PointwiseLikelihood for PoissonLikelihood {
    fn log_density(&self, f: &Tensor, y: &Tensor) -> Result<Tensor> {
        let y_f = f.broadcast_mul(y)?;
        let rate = f.exp()?;
        let log_prob = (y_f - rate)?.broadcast_sub(&ln_factorial(y)?)?;
        Ok(log_prob)
    }

    fn conditional_moments(&self, f: &Tensor) -> Result<(Tensor, Tensor)> {
        let rate = f.exp()?;
        Ok((rate.clone(), rate))
    }

    fn name(&self) -> &'static str {
        "poisson"
    }
}
