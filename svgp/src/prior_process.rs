//! Prior Gaussian process evaluated at finite sets of inputs.
//!
//! Kernels live outside the inference core; the core only needs the
//! prior mean, the cross-covariance between two input sets, and the
//! jittered covariance at one input set. `SquaredExponentialGp` is the
//! stock implementation used by the CLI and the tests.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::error::{config_bail, Result};
use crate::linalg::{eye, scalar_value};

/// Evaluation contract of a prior process f ~ GP(μ, k).
///
/// Inputs are matrices `(N, D)`, one row per location.
pub trait PriorProcess {
    /// Prior mean μ(x), shape `(N,)`
    fn mean(&self, x: &Tensor) -> Result<Tensor>;

    /// Cross-covariance k(a, b), shape `(Na, Nb)`
    fn cross_covariance(&self, a: &Tensor, b: &Tensor) -> Result<Tensor>;

    /// Marginal variances k(x_i, x_i), shape `(N,)`
    fn covariance_diag(&self, x: &Tensor) -> Result<Tensor> {
        crate::linalg::diag(&self.cross_covariance(x, x)?)
    }

    /// Prior mean and covariance at `x`, with `jitter` added to the diagonal.
    fn evaluate_prior(&self, x: &Tensor, jitter: f64) -> Result<(Tensor, Tensor)> {
        let mean = self.mean(x)?;
        let cov = self.cross_covariance(x, x)?;
        if jitter == 0.0 {
            return Ok((mean, cov));
        }
        let n = cov.dim(0)?;
        let cov = (cov + (eye(n, x.dtype(), x.device())? * jitter)?)?;
        Ok((mean, cov))
    }
}

/// GP with squared exponential kernel
///
/// ```text
/// k(a, b) = σ² exp(-‖a - b‖² / (2ℓ²))
/// ```
///
/// σ² and ℓ are stored on the log scale. When built from a `VarBuilder`
/// backed by a `VarMap` they are trainable; an optional constant mean can
/// be attached the same way.
pub struct SquaredExponentialGp {
    ln_variance: Tensor,
    ln_lengthscale: Tensor,
    constant_mean: Option<Tensor>,
}

impl SquaredExponentialGp {
    /// Learnable kernel hyperparameters.
    ///
    /// * `vb` - VarBuilder for the trainable parameters
    /// * `variance` - initial signal variance σ²
    /// * `lengthscale` - initial lengthscale ℓ
    pub fn new(vb: VarBuilder, variance: f64, lengthscale: f64) -> Result<Self> {
        check_positive(variance, lengthscale)?;
        let ln_variance =
            vb.get_with_hints((), "ln_variance", candle_nn::Init::Const(variance.ln()))?;
        let ln_lengthscale =
            vb.get_with_hints((), "ln_lengthscale", candle_nn::Init::Const(lengthscale.ln()))?;
        Ok(Self {
            ln_variance,
            ln_lengthscale,
            constant_mean: None,
        })
    }

    /// Fixed (non-learnable) hyperparameters.
    pub fn fixed(variance: f64, lengthscale: f64, dtype: DType, device: &Device) -> Result<Self> {
        check_positive(variance, lengthscale)?;
        Ok(Self {
            ln_variance: Tensor::new(variance.ln(), device)?.to_dtype(dtype)?,
            ln_lengthscale: Tensor::new(lengthscale.ln(), device)?.to_dtype(dtype)?,
            constant_mean: None,
        })
    }

    /// Attach a learnable constant mean function μ(x) = c.
    pub fn with_constant_mean(mut self, vb: VarBuilder, init: f64) -> Result<Self> {
        let c = vb.get_with_hints((), "constant_mean", candle_nn::Init::Const(init))?;
        self.constant_mean = Some(c);
        Ok(self)
    }

    /// σ² as a scalar tensor
    pub fn variance_tensor(&self) -> Result<Tensor> {
        Ok(self.ln_variance.exp()?)
    }

    /// ℓ as a scalar tensor
    pub fn lengthscale_tensor(&self) -> Result<Tensor> {
        Ok(self.ln_lengthscale.exp()?)
    }

    pub fn variance(&self) -> Result<f64> {
        scalar_value(&self.variance_tensor()?)
    }

    pub fn lengthscale(&self) -> Result<f64> {
        scalar_value(&self.lengthscale_tensor()?)
    }

    pub fn constant_mean(&self) -> Result<Option<f64>> {
        self.constant_mean.as_ref().map(scalar_value).transpose()
    }
}

fn check_positive(variance: f64, lengthscale: f64) -> Result<()> {
    if !(variance > 0.0 && variance.is_finite()) {
        config_bail!("kernel variance must be positive, got {}", variance);
    }
    if !(lengthscale > 0.0 && lengthscale.is_finite()) {
        config_bail!("kernel lengthscale must be positive, got {}", lengthscale);
    }
    Ok(())
}

/// Pairwise squared distances `‖a_i - b_j‖²`, clamped at zero
fn squared_distances(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let a_sq = a.sqr()?.sum_keepdim(1)?; // Na x 1
    let b_sq = b.sqr()?.sum_keepdim(1)?.t()?; // 1 x Nb
    let ab = a.matmul(&b.t()?.contiguous()?)?; // Na x Nb
    let d2 = a_sq.broadcast_add(&b_sq)?.sub(&(ab * 2.0)?)?;
    Ok(d2.relu()?)
}

impl PriorProcess for SquaredExponentialGp {
    fn mean(&self, x: &Tensor) -> Result<Tensor> {
        let n = x.dim(0)?;
        let zeros = Tensor::zeros(n, x.dtype(), x.device())?;
        match &self.constant_mean {
            Some(c) => Ok(zeros.broadcast_add(c)?),
            None => Ok(zeros),
        }
    }

    fn cross_covariance(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let (_, da) = a.dims2()?;
        let (_, db) = b.dims2()?;
        if da != db {
            config_bail!("input dimensions differ: {} vs {}", da, db);
        }
        let ell = self.lengthscale_tensor()?;
        let a_scaled = a.broadcast_div(&ell)?;
        let b_scaled = b.broadcast_div(&ell)?;
        let d2 = squared_distances(&a_scaled, &b_scaled)?;
        Ok((d2 * (-0.5))?.broadcast_add(&self.ln_variance)?.exp()?)
    }

    fn covariance_diag(&self, x: &Tensor) -> Result<Tensor> {
        let n = x.dim(0)?;
        let ones = Tensor::ones(n, x.dtype(), x.device())?;
        Ok(ones.broadcast_mul(&self.variance_tensor()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_nn::VarMap;

    #[test]
    fn test_cross_covariance_values() -> Result<()> {
        let device = Device::Cpu;
        let gp = SquaredExponentialGp::fixed(2.0, 0.5, DType::F64, &device)?;

        let a = Tensor::from_vec(vec![0.0f64, 1.0], (2, 1), &device)?;
        let b = Tensor::from_vec(vec![0.0f64, 0.5, 2.0], (3, 1), &device)?;
        let k = gp.cross_covariance(&a, &b)?.to_vec2::<f64>()?;

        let expected = |d: f64| 2.0 * (-0.5 * d * d / 0.25).exp();
        assert_eq!(k.len(), 2);
        assert_abs_diff_eq!(k[0][0], expected(0.0), epsilon = 1e-12);
        assert_abs_diff_eq!(k[0][1], expected(0.5), epsilon = 1e-12);
        assert_abs_diff_eq!(k[1][2], expected(1.0), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_evaluate_prior_adds_jitter() -> Result<()> {
        let device = Device::Cpu;
        let gp = SquaredExponentialGp::fixed(1.0, 1.0, DType::F64, &device)?;
        let x = Tensor::from_vec(vec![0.0f64, 0.1, 0.2, 3.0, 3.1, 3.2], (3, 2), &device)?;

        let (mean, cov) = gp.evaluate_prior(&x, 1e-3)?;
        assert_eq!(mean.dims(), &[3]);
        let cov = cov.to_vec2::<f64>()?;
        let diag = gp.covariance_diag(&x)?.to_vec1::<f64>()?;
        for i in 0..3 {
            assert_abs_diff_eq!(cov[i][i], diag[i] + 1e-3, epsilon = 1e-12);
            for j in 0..3 {
                assert_abs_diff_eq!(cov[i][j], cov[j][i], epsilon = 1e-14);
            }
        }
        Ok(())
    }

    #[test]
    fn test_learnable_hyperparameters() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        let gp = SquaredExponentialGp::new(vb.pp("kernel"), 1.5, 0.3)?
            .with_constant_mean(vb.pp("mean"), 0.25)?;

        assert_eq!(varmap.all_vars().len(), 3);
        assert_abs_diff_eq!(gp.variance()?, 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(gp.lengthscale()?, 0.3, epsilon = 1e-12);

        let x = Tensor::zeros((4, 1), DType::F64, &device)?;
        let mu = gp.mean(&x)?.to_vec1::<f64>()?;
        assert!(mu.iter().all(|&m| (m - 0.25).abs() < 1e-12));
        Ok(())
    }

    #[test]
    fn test_rejects_bad_hyperparameters() {
        let device = Device::Cpu;
        assert!(SquaredExponentialGp::fixed(-1.0, 1.0, DType::F64, &device).is_err());
        assert!(SquaredExponentialGp::fixed(1.0, 0.0, DType::F64, &device).is_err());
    }
}
