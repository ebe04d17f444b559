use candle_core::Tensor;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{config_bail, Result};
use crate::linalg::{log_diag_sum, solve_lower, tril};

/// Multivariate normal N(μ, L Lᵀ) described by its mean and lower
/// Cholesky factor.
pub trait FactoredGaussian {
    /// Mean vector, shape (M,)
    fn mean(&self) -> &Tensor;

    /// Lower-triangular square root of the covariance, shape (M, M)
    fn scale_tril(&self) -> &Tensor;

    /// Dimension M
    fn dim(&self) -> usize {
        self.mean().dims1().unwrap_or(0)
    }
}

/// q(u) = N(m, S Sᵀ), the variational distribution over inducing values.
///
/// The square root S is lower triangular and only enters through
/// triangular solves and products. Its diagonal has to stay away from
/// zero; that is checked wherever `ln|S|` is needed.
pub struct VariationalPosterior {
    mean: Tensor,
    sqrt_cov: Tensor,
}

impl VariationalPosterior {
    /// Wrap (m, S).
    ///
    /// * `mean` - m, shape (M,)
    /// * `sqrt_cov` - square matrix (M, M); entries above the diagonal are
    ///   ignored
    pub fn new(mean: &Tensor, sqrt_cov: &Tensor) -> Result<Self> {
        let m = match mean.dims() {
            [m] => *m,
            dims => config_bail!("variational mean must be a vector, got shape {:?}", dims),
        };
        match sqrt_cov.dims() {
            [r, c] if *r == m && *c == m => {}
            dims => config_bail!(
                "variational square root must be {} x {}, got shape {:?}",
                m,
                m,
                dims
            ),
        }
        Ok(Self {
            mean: mean.clone(),
            sqrt_cov: tril(sqrt_cov)?,
        })
    }

    /// Dense covariance S Sᵀ
    pub fn covariance(&self) -> Result<Tensor> {
        Ok(self
            .sqrt_cov
            .matmul(&self.sqrt_cov.t()?.contiguous()?)?)
    }

    /// Marginal variances diag(S Sᵀ) without forming the full matrix
    pub fn variance(&self) -> Result<Tensor> {
        Ok(self.sqrt_cov.sqr()?.sum(1)?)
    }

    /// log q(u) for each row of `u`
    ///
    /// * `u` - points, shape (S, M)
    ///
    /// # Returns
    /// Log densities, shape (S,)
    pub fn log_density(&self, u: &Tensor) -> Result<Tensor> {
        let m = self.dim();
        let ln_2pi = (2.0 * std::f64::consts::PI).ln();

        let resid = u.broadcast_sub(&self.mean)?.t()?.contiguous()?; // M x S
        let white = solve_lower(&self.sqrt_cov, &resid)?;
        let maha = white.sqr()?.sum(0)?; // S

        let half_logdet = log_diag_sum(&self.sqrt_cov)?;
        let log_prob = ((maha + (m as f64) * ln_2pi)? * (-0.5))?;
        Ok(log_prob.broadcast_sub(&half_logdet)?)
    }

    /// Draw `num_samples` reparameterized samples u = m + S ε.
    ///
    /// ε comes from the caller's generator so repeated calls with the same
    /// seed reproduce the same draws. Gradients flow to m and S.
    ///
    /// # Returns
    /// Samples, shape (num_samples, M)
    pub fn sample<R: Rng + ?Sized>(&self, num_samples: usize, rng: &mut R) -> Result<Tensor> {
        let m = self.dim();
        let eps: Vec<f64> = (0..num_samples * m)
            .map(|_| StandardNormal.sample(&mut *rng))
            .collect();
        let eps = Tensor::from_vec(eps, (num_samples, m), self.mean.device())?
            .to_dtype(self.mean.dtype())?;
        let scaled = eps.matmul(&self.sqrt_cov.t()?.contiguous()?)?;
        Ok(scaled.broadcast_add(&self.mean)?)
    }
}

impl FactoredGaussian for VariationalPosterior {
    fn mean(&self) -> &Tensor {
        &self.mean
    }

    fn scale_tril(&self) -> &Tensor {
        &self.sqrt_cov
    }
}
