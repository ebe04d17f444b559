use candle_core::{Tensor, Var};
use log::info;

use crate::config::SvgpConfig;
use crate::error::{config_bail, Result};
use crate::inducing_prior::InducingPrior;
use crate::kl::kl_divergence;
use crate::likelihood::{Likelihood, PointwiseLikelihood};
use crate::linalg::{diag, diag_embed, strict_tril, tril};
use crate::posterior::ApproxPosterior;
use crate::prior_process::PriorProcess;
use crate::variational::{FactoredGaussian, VariationalPosterior};

/// Square root S of the variational covariance.
#[derive(Clone)]
enum SqrtFactor {
    /// S as given; only the lower triangle is used
    Dense(Tensor),
    /// S = strict_tril(lower) + diag(exp(ln_diag)), positive diagonal
    /// whatever values the optimizer writes into the storage
    LogDiagonal { lower: Tensor, ln_diag: Tensor },
}

/// Parameters owned by the model besides the kernel and likelihood:
/// inducing locations z and the variational (m, S) of q(u) = N(m, S Sᵀ).
///
/// The tensors may be backed by `Var`s; an optimizer step updates the
/// storage and every derived quantity is recomputed from it on the next
/// evaluation.
#[derive(Clone)]
pub struct SvgpParams {
    /// z, shape (M, D)
    pub inducing: Tensor,
    /// m, shape (M,)
    pub q_mean: Tensor,
    q_sqrt: SqrtFactor,
}

impl SvgpParams {
    /// Trainable parameters starting from q(u) = N(0, I) at `z_init`.
    ///
    /// # Returns
    /// The parameter record and the `Var`s to hand to an optimizer
    pub fn trainable(z_init: &Tensor) -> Result<(Self, Vec<Var>)> {
        let (m, _) = z_init.dims2()?;
        let (dtype, device) = (z_init.dtype(), z_init.device());
        Self::log_diagonal_vars(
            z_init,
            &Tensor::zeros(m, dtype, device)?,
            &Tensor::zeros((m, m), dtype, device)?,
            &Tensor::zeros(m, dtype, device)?,
        )
    }

    /// Trainable parameters starting from q(u) = p(u) at `z_init`:
    /// m = μ_z and S = L_zz, so the KL term starts at zero.
    ///
    /// # Returns
    /// The parameter record and the `Var`s to hand to an optimizer
    pub fn from_prior<P: PriorProcess + ?Sized>(
        prior: &P,
        z_init: &Tensor,
        jitter: f64,
    ) -> Result<(Self, Vec<Var>)> {
        let p_u = InducingPrior::new(prior, z_init, jitter)?;
        let chol = p_u.scale_tril().detach();
        Self::log_diagonal_vars(
            &z_init.detach(),
            &p_u.mean().detach(),
            &strict_tril(&chol)?,
            &diag(&chol)?.log()?,
        )
    }

    fn log_diagonal_vars(
        z: &Tensor,
        mean: &Tensor,
        lower: &Tensor,
        ln_diag: &Tensor,
    ) -> Result<(Self, Vec<Var>)> {
        let inducing = Var::from_tensor(z)?;
        let q_mean = Var::from_tensor(mean)?;
        let lower = Var::from_tensor(lower)?;
        let ln_diag = Var::from_tensor(ln_diag)?;

        let params = Self {
            inducing: inducing.as_tensor().clone(),
            q_mean: q_mean.as_tensor().clone(),
            q_sqrt: SqrtFactor::LogDiagonal {
                lower: lower.as_tensor().clone(),
                ln_diag: ln_diag.as_tensor().clone(),
            },
        };
        params.check_shapes()?;
        Ok((params, vec![inducing, q_mean, lower, ln_diag]))
    }

    /// Fixed parameter record; shapes are checked.
    pub fn from_tensors(inducing: Tensor, q_mean: Tensor, q_sqrt: Tensor) -> Result<Self> {
        let params = Self {
            inducing,
            q_mean,
            q_sqrt: SqrtFactor::Dense(q_sqrt),
        };
        params.check_shapes()?;
        Ok(params)
    }

    /// Number of inducing points M
    pub fn num_inducing(&self) -> Result<usize> {
        Ok(self.inducing.dim(0)?)
    }

    /// Current S, lower triangular
    pub fn q_sqrt(&self) -> Result<Tensor> {
        match &self.q_sqrt {
            SqrtFactor::Dense(s) => tril(s),
            SqrtFactor::LogDiagonal { lower, ln_diag } => {
                Ok((strict_tril(lower)? + diag_embed(&ln_diag.exp()?)?)?)
            }
        }
    }

    fn check_shapes(&self) -> Result<()> {
        let m = match self.inducing.dims() {
            [m, _] => *m,
            dims => config_bail!("inducing points must be a matrix, got shape {:?}", dims),
        };
        match self.q_mean.dims() {
            [k] if *k == m => {}
            dims => config_bail!(
                "variational mean has shape {:?} for {} inducing points",
                dims,
                m
            ),
        }
        let sqrt_dims = match &self.q_sqrt {
            SqrtFactor::Dense(s) => s.dims(),
            SqrtFactor::LogDiagonal { lower, ln_diag } => match ln_diag.dims() {
                [k] if *k == m => lower.dims(),
                dims => config_bail!(
                    "variational log-diagonal has shape {:?} for {} inducing points",
                    dims,
                    m
                ),
            },
        };
        match sqrt_dims {
            [r, c] if *r == m && *c == m => {}
            dims => config_bail!(
                "variational square root has shape {:?} for {} inducing points",
                dims,
                m
            ),
        }
        Ok(())
    }
}

/// Sparse variational GP: prior process, inducing parameters,
/// likelihood and fixed settings.
///
/// p(u) and q(u) are derived views rebuilt on every call.
pub struct SvgpModel<P> {
    prior: P,
    params: SvgpParams,
    likelihood: Likelihood,
    config: SvgpConfig,
}

impl<P: PriorProcess> SvgpModel<P> {
    /// Validates the configuration against the likelihood and the
    /// parameter shapes against each other.
    pub fn new(
        prior: P,
        params: SvgpParams,
        likelihood: Likelihood,
        config: SvgpConfig,
    ) -> Result<Self> {
        config.validate(&likelihood)?;
        params.check_shapes()?;

        info!(
            "SVGP: {} inducing points, {} likelihood, {:?}, jitter {:e}",
            params.num_inducing()?,
            likelihood.name(),
            config.quadrature,
            config.jitter
        );

        Ok(Self {
            prior,
            params,
            likelihood,
            config,
        })
    }

    pub fn prior(&self) -> &P {
        &self.prior
    }

    pub fn params(&self) -> &SvgpParams {
        &self.params
    }

    pub fn likelihood(&self) -> &Likelihood {
        &self.likelihood
    }

    pub fn config(&self) -> &SvgpConfig {
        &self.config
    }

    /// p(u) at the current inducing points and kernel
    pub fn inducing_prior(&self) -> Result<InducingPrior> {
        InducingPrior::new(&self.prior, &self.params.inducing, self.config.jitter)
    }

    /// q(u) from the current (m, S)
    pub fn variational_posterior(&self) -> Result<VariationalPosterior> {
        VariationalPosterior::new(&self.params.q_mean, &self.params.q_sqrt()?)
    }

    /// KL(q(u) ‖ p(u)), scalar
    pub fn kl(&self) -> Result<Tensor> {
        kl_divergence(&self.variational_posterior()?, &self.inducing_prior()?)
    }

    /// Approximate posterior process for prediction
    pub fn posterior(&self) -> Result<ApproxPosterior<'_, P>> {
        ApproxPosterior::new(
            &self.prior,
            &self.params.inducing,
            self.inducing_prior()?,
            self.variational_posterior()?,
            &self.likelihood,
            &self.config,
        )
    }
}
