//! Approximate posterior process q(f) for prediction.
//!
//! Prediction uses the same conditioning as the ELBO, with q(u) in
//! place of p(u) as the distribution over inducing values.

use candle_core::Tensor;

use crate::conditional::{conditional_full, conditional_marginals};
use crate::config::{PosteriorOutput, SvgpConfig};
use crate::error::{config_bail, Result};
use crate::inducing_prior::InducingPrior;
use crate::likelihood::{Likelihood, PointwiseLikelihood};
use crate::linalg::eye;
use crate::prior_process::PriorProcess;
use crate::quadrature::{gauss_hermite_points, QuadratureStrategy};
use crate::variational::VariationalPosterior;

/// Gauss-Hermite order for observation moments when the training
/// quadrature is not Gauss-Hermite
const OBSERVATION_GH_POINTS: usize = 20;

/// Mean vector (N,) and covariance matrix (N, N)
pub struct PredictiveDistribution {
    pub mean: Tensor,
    pub cov: Tensor,
}

/// Means and variances only, both (N,)
pub struct PredictiveMarginals {
    pub mean: Tensor,
    pub var: Tensor,
}

/// Snapshot of p(u) and q(u) at the current parameters, borrowing the
/// rest from the model.
pub struct ApproxPosterior<'a, P: ?Sized> {
    prior: &'a P,
    inducing: &'a Tensor,
    p_u: InducingPrior,
    q_u: VariationalPosterior,
    likelihood: &'a Likelihood,
    output: PosteriorOutput,
    gh_points: usize,
}

impl<'a, P: PriorProcess + ?Sized> ApproxPosterior<'a, P> {
    pub fn new(
        prior: &'a P,
        inducing: &'a Tensor,
        p_u: InducingPrior,
        q_u: VariationalPosterior,
        likelihood: &'a Likelihood,
        config: &SvgpConfig,
    ) -> Result<Self> {
        let gh_points = match config.quadrature {
            QuadratureStrategy::GaussHermite { num_points } if num_points > 0 => num_points,
            _ => OBSERVATION_GH_POINTS,
        };
        Ok(Self {
            prior,
            inducing,
            p_u,
            q_u,
            likelihood,
            output: config.posterior_output,
            gh_points,
        })
    }

    pub fn output(&self) -> PosteriorOutput {
        self.output
    }

    /// Latent f at `x` (N, D): mean and full covariance
    pub fn predict(&self, x: &Tensor) -> Result<PredictiveDistribution> {
        let (mean, cov) = conditional_full(self.prior, self.inducing, &self.p_u, &self.q_u, x)?;
        Ok(PredictiveDistribution { mean, cov })
    }

    /// Latent f at `x` (N, D): marginal means and variances
    pub fn predict_latent_marginals(&self, x: &Tensor) -> Result<PredictiveMarginals> {
        let (mean, var) =
            conditional_marginals(self.prior, self.inducing, &self.p_u, &self.q_u, x)?;
        Ok(PredictiveMarginals { mean, var })
    }

    /// Latent covariance plus σ² on the diagonal. Gaussian likelihood only.
    pub fn predict_with_noise(&self, x: &Tensor) -> Result<PredictiveDistribution> {
        let Some(gaussian) = self.likelihood.as_gaussian() else {
            config_bail!(
                "observation noise is only defined for a Gaussian likelihood, got {}",
                self.likelihood.name()
            );
        };

        let PredictiveDistribution { mean, cov } = self.predict(x)?;
        let n = mean.dims1()?;
        let noise = eye(n, cov.dtype(), cov.device())?.broadcast_mul(&gaussian.noise_var_tensor()?)?;
        Ok(PredictiveDistribution {
            mean,
            cov: (cov + noise)?,
        })
    }

    /// Marginal moments of y at `x`.
    ///
    /// Gaussian: (μ, σ_f² + σ²). Otherwise the conditional moments of
    /// y | f are integrated against each latent marginal by Gauss-Hermite
    /// quadrature:
    ///
    /// ```text
    /// E[y]   = E_f[ E[y|f] ]
    /// Var[y] = E_f[ Var[y|f] ] + E_f[ E[y|f]² ] - E[y]²
    /// ```
    pub fn predict_observations(&self, x: &Tensor) -> Result<PredictiveMarginals> {
        let latent = self.predict_latent_marginals(x)?;

        if let Some(gaussian) = self.likelihood.as_gaussian() {
            let var = latent.var.broadcast_add(&gaussian.noise_var_tensor()?)?;
            return Ok(PredictiveMarginals {
                mean: latent.mean,
                var,
            });
        }

        let (f, weights) = gauss_hermite_points(&latent.mean, &latent.var, self.gh_points)?;
        let (cond_mean, cond_var) = self.likelihood.conditional_moments(&f)?;

        let mean = cond_mean.matmul(&weights)?.squeeze(1)?;
        let second = cond_mean.sqr()?.matmul(&weights)?.squeeze(1)?;
        let spread = cond_var.matmul(&weights)?.squeeze(1)?;
        let var = ((spread + second)? - mean.sqr()?)?;

        Ok(PredictiveMarginals { mean, var })
    }

    /// Predictive distribution in the requested mode.
    ///
    /// For a non-Gaussian likelihood the observation covariance is the
    /// diagonal of moment-matched marginals.
    pub fn predict_as(&self, x: &Tensor, output: PosteriorOutput) -> Result<PredictiveDistribution> {
        match output {
            PosteriorOutput::Latent => self.predict(x),
            PosteriorOutput::Observation if self.likelihood.is_gaussian() => {
                self.predict_with_noise(x)
            }
            PosteriorOutput::Observation => {
                let PredictiveMarginals { mean, var } = self.predict_observations(x)?;
                let n = mean.dims1()?;
                let cov = eye(n, var.dtype(), var.device())?.broadcast_mul(&var.unsqueeze(0)?)?;
                Ok(PredictiveDistribution { mean, cov })
            }
        }
    }

    /// `predict_as` in the configured mode
    pub fn predict_configured(&self, x: &Tensor) -> Result<PredictiveDistribution> {
        self.predict_as(x, self.output)
    }

    /// Marginals in the configured mode
    pub fn predict_marginals(&self, x: &Tensor) -> Result<PredictiveMarginals> {
        match self.output {
            PosteriorOutput::Latent => self.predict_latent_marginals(x),
            PosteriorOutput::Observation => self.predict_observations(x),
        }
    }
}
