//! Gaussian likelihood for continuous data.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use super::PointwiseLikelihood;
use crate::error::{config_bail, Result};
use crate::linalg::scalar_value;

/// Gaussian likelihood: y ~ N(f, σ²)
///
/// ```text
/// log p(y | f) = -0.5 * [ln(2π) + ln σ² + (y - f)² / σ²]
/// ```
///
/// The noise variance is stored as ln σ²; built from a `VarBuilder` it is
/// trainable together with the rest of the model.
pub struct GaussianLikelihood {
    ln_noise_var: Tensor,
}

impl GaussianLikelihood {
    /// Fixed noise variance σ².
    pub fn new(noise_var: f64, dtype: DType, device: &Device) -> Result<Self> {
        check_noise(noise_var)?;
        let ln_noise_var = Tensor::new(noise_var.ln(), device)?.to_dtype(dtype)?;
        Ok(Self { ln_noise_var })
    }

    /// Learnable noise variance initialized at `init_noise_var`.
    pub fn learnable(vb: VarBuilder, init_noise_var: f64) -> Result<Self> {
        check_noise(init_noise_var)?;
        let ln_noise_var =
            vb.get_with_hints((), "ln_noise_var", candle_nn::Init::Const(init_noise_var.ln()))?;
        Ok(Self { ln_noise_var })
    }

    /// σ² as a scalar tensor
    pub fn noise_var_tensor(&self) -> Result<Tensor> {
        Ok(self.ln_noise_var.exp()?)
    }

    pub fn noise_variance(&self) -> Result<f64> {
        scalar_value(&self.noise_var_tensor()?)
    }

    /// Closed-form E_{f ~ N(μ, v)}[log N(y | f, σ²)], per datum
    ///
    /// ```text
    /// -0.5 * [ln(2π) + ln σ² + ((y - μ)² + v) / σ²]
    /// ```
    ///
    /// * `y`, `mean`, `var` - shape (N,)
    pub fn expected_log_density(&self, y: &Tensor, mean: &Tensor, var: &Tensor) -> Result<Tensor> {
        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        let noise_var = self.noise_var_tensor()?;

        let sq_err = (y - mean)?.sqr()?;
        let scaled = (sq_err + var)?.broadcast_div(&noise_var)?;
        let log_prob = (scaled.broadcast_add(&self.ln_noise_var)? + ln_2pi)?;
        Ok((log_prob * (-0.5))?)
    }
}

fn check_noise(noise_var: f64) -> Result<()> {
    if !(noise_var > 0.0 && noise_var.is_finite()) {
        config_bail!("Gaussian noise variance must be positive, got {}", noise_var);
    }
    Ok(())
}

impl PointwiseLikelihood for GaussianLikelihood {
    fn log_density(&self, f: &Tensor, y: &Tensor) -> Result<Tensor> {
        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        let noise_var = self.noise_var_tensor()?;

        let sq_err = f.broadcast_sub(y)?.sqr()?;
        let scaled = sq_err.broadcast_div(&noise_var)?;
        let log_prob = (scaled.broadcast_add(&self.ln_noise_var)? + ln_2pi)?;
        Ok((log_prob * (-0.5))?)
    }

    fn conditional_moments(&self, f: &Tensor) -> Result<(Tensor, Tensor)> {
        let var = f.ones_like()?.broadcast_mul(&self.noise_var_tensor()?)?;
        Ok((f.clone(), var))
    }

    fn name(&self) -> &'static str {
        "gaussian"
    }
}
