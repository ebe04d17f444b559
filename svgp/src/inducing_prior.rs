use candle_core::Tensor;
use log::debug;

use crate::error::{config_bail, Result, SvgpError};
use crate::linalg::cholesky;
use crate::prior_process::PriorProcess;
use crate::variational::FactoredGaussian;

/// p(u): the GP prior marginal at the inducing locations z,
///
/// ```text
/// p(u) = N(μ_z, K_zz + jitter·I),   K_zz + jitter·I = L_zz L_zzᵀ
/// ```
///
/// Only the Cholesky factor is kept. It is rebuilt from the current
/// kernel and inducing points on every evaluation, never cached.
pub struct InducingPrior {
    mean: Tensor,
    chol: Tensor,
    jitter: f64,
}

impl InducingPrior {
    /// Evaluate the prior at `inducing` (M x D) and factorize.
    ///
    /// * `prior` - prior process providing mean and covariance
    /// * `inducing` - inducing locations z
    /// * `jitter` - positive diagonal term for positive-definiteness
    pub fn new<P: PriorProcess + ?Sized>(prior: &P, inducing: &Tensor, jitter: f64) -> Result<Self> {
        if !(jitter > 0.0 && jitter.is_finite()) {
            config_bail!("jitter must be positive, got {}", jitter);
        }

        let (mean, cov) = prior.evaluate_prior(inducing, jitter)?;

        let chol = cholesky(&cov).map_err(|e| match e {
            SvgpError::Numerical(msg) => SvgpError::Numerical(format!(
                "inducing prior covariance with jitter {}: {}",
                jitter, msg
            )),
            other => other,
        })?;

        debug!(
            "inducing prior: {} points, jitter {:e}",
            chol.dim(0)?,
            jitter
        );

        Ok(Self { mean, chol, jitter })
    }

    /// Number of inducing points M
    pub fn num_inducing(&self) -> usize {
        self.mean.dims1().unwrap_or(0)
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// K_zz + jitter·I reassembled from its factor
    pub fn covariance(&self) -> Result<Tensor> {
        Ok(self.chol.matmul(&self.chol.t()?.contiguous()?)?)
    }
}

impl FactoredGaussian for InducingPrior {
    fn mean(&self) -> &Tensor {
        &self.mean
    }

    fn scale_tril(&self) -> &Tensor {
        &self.chol
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior_process::SquaredExponentialGp;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};

    #[test]
    fn test_factor_matches_jittered_covariance() -> Result<()> {
        let device = Device::Cpu;
        let gp = SquaredExponentialGp::fixed(1.0, 0.4, DType::F64, &device)?;
        let z = Tensor::from_vec(vec![-1.0f64, -0.5, 0.0, 0.5, 1.0], (5, 1), &device)?;

        let prior = InducingPrior::new(&gp, &z, 1e-6)?;
        assert_eq!(prior.num_inducing(), 5);

        let (_, expected) = gp.evaluate_prior(&z, 1e-6)?;
        let expected = expected.to_vec2::<f64>()?;
        let rebuilt = prior.covariance()?.to_vec2::<f64>()?;
        for i in 0..5 {
            for j in 0..5 {
                assert_abs_diff_eq!(rebuilt[i][j], expected[i][j], epsilon = 1e-12);
            }
        }
        Ok(())
    }

    #[test]
    fn test_non_positive_jitter_is_config_error() -> Result<()> {
        let device = Device::Cpu;
        let gp = SquaredExponentialGp::fixed(1.0, 1.0, DType::F64, &device)?;
        let z = Tensor::from_vec(vec![0.0f64, 1.0], (2, 1), &device)?;
        assert!(matches!(
            InducingPrior::new(&gp, &z, 0.0),
            Err(SvgpError::Config(_))
        ));
        assert!(matches!(
            InducingPrior::new(&gp, &z, -1e-6),
            Err(SvgpError::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_duplicate_inducing_points_need_jitter() -> Result<()> {
        let device = Device::Cpu;
        let gp = SquaredExponentialGp::fixed(1.0, 1.0, DType::F64, &device)?;
        // duplicated locations make K_zz exactly singular
        let z = Tensor::from_vec(vec![0.3f64, 0.3, 0.3], (3, 1), &device)?;

        assert!(matches!(
            InducingPrior::new(&gp, &z, 1e-300),
            Err(SvgpError::Numerical(_))
        ));
        assert!(InducingPrior::new(&gp, &z, 1e-4).is_ok());
        Ok(())
    }
}
