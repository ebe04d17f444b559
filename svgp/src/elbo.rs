//! Evidence lower bound for the sparse variational GP.
//!
//! ```text
//! ELBO = (N / |B|) Σ_{i ∈ B} E_q(f_i)[log p(y_i | f_i)] - KL(q(u) ‖ p(u))
//! ```
//!
//! Only the likelihood term is rescaled; the KL term is a full-data
//! quantity. The optimizer minimizes `loss = -ELBO`.

use candle_core::Tensor;
use log::trace;
use rand::Rng;

use crate::conditional::conditional_marginals;
use crate::error::{config_bail, numerical_bail, Result};
use crate::kl::kl_divergence;
use crate::linalg::scalar_value;
use crate::model::SvgpModel;
use crate::prior_process::PriorProcess;

/// Batch inputs and targets together with the full data size.
pub struct Minibatch {
    x: Tensor,
    y: Tensor,
    n_data: usize,
}

impl Minibatch {
    /// * `x` - inputs, shape (B, D)
    /// * `y` - targets, shape (B,) or (B, 1)
    /// * `n_data` - size of the full data set, at least B
    pub fn new(x: Tensor, y: Tensor, n_data: usize) -> Result<Self> {
        let (n_batch, _) = x.dims2()?;
        let y = match y.dims() {
            [n] if *n == n_batch => y,
            [n, 1] if *n == n_batch => y.squeeze(1)?,
            dims => config_bail!("targets of shape {:?} for {} inputs", dims, n_batch),
        };
        if n_batch == 0 {
            config_bail!("empty minibatch");
        }
        if n_data < n_batch {
            config_bail!("n_data = {} is smaller than the batch ({})", n_data, n_batch);
        }
        Ok(Self { x, y, n_data })
    }

    /// The whole data set as one batch, scale 1
    pub fn full(x: Tensor, y: Tensor) -> Result<Self> {
        let n = x.dim(0)?;
        Self::new(x, y, n)
    }

    pub fn x(&self) -> &Tensor {
        &self.x
    }

    pub fn y(&self) -> &Tensor {
        &self.y
    }

    pub fn n_data(&self) -> usize {
        self.n_data
    }

    pub fn len(&self) -> usize {
        self.y.dims1().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// n_data / |batch|
    pub fn scale(&self) -> f64 {
        if self.n_data == self.len() {
            1.0
        } else {
            self.n_data as f64 / self.len() as f64
        }
    }
}

/// ELBO and its two terms, all scalar tensors on the autodiff graph
pub struct ElboTerms {
    /// Expected log-likelihood already multiplied by the batch scale
    pub expected_log_lik: Tensor,
    pub kl: Tensor,
    pub elbo: Tensor,
}

impl ElboTerms {
    pub fn loss(&self) -> Result<Tensor> {
        Ok(self.elbo.neg()?)
    }
}

impl<P: PriorProcess> SvgpModel<P> {
    /// Evaluate the ELBO on a minibatch.
    ///
    /// `rng` is only consumed by Monte Carlo quadrature.
    ///
    /// Fails with a numerical error if the inducing prior cannot be
    /// factorized or if any conditional marginal variance is not
    /// strictly positive.
    pub fn elbo<R: Rng + ?Sized>(&self, batch: &Minibatch, rng: &mut R) -> Result<ElboTerms> {
        let params = self.params();
        let p_u = self.inducing_prior()?;
        let q_u = self.variational_posterior()?;

        let (mean, var) = conditional_marginals(self.prior(), &params.inducing, &p_u, &q_u, batch.x())?;

        let min_var = scalar_value(&var.min(0)?)?;
        if !(min_var > 0.0) {
            numerical_bail!(
                "conditional marginal variance {} is not positive ({} inputs, jitter {:e})",
                min_var,
                batch.len(),
                p_u.jitter()
            );
        }

        let ell = self.config().quadrature.expected_log_likelihood(
            self.likelihood(),
            batch.y(),
            &mean,
            &var,
            rng,
        )?;
        let expected_log_lik = (ell * batch.scale())?;

        let kl = kl_divergence(&q_u, &p_u)?;
        let elbo = (&expected_log_lik - &kl)?;

        trace!(
            "elbo {:.4} = ell {:.4} - kl {:.4}",
            scalar_value(&elbo)?,
            scalar_value(&expected_log_lik)?,
            scalar_value(&kl)?
        );

        Ok(ElboTerms {
            expected_log_lik,
            kl,
            elbo,
        })
    }

    /// -ELBO, the quantity handed to the optimizer
    pub fn loss<R: Rng + ?Sized>(&self, batch: &Minibatch, rng: &mut R) -> Result<Tensor> {
        self.elbo(batch, rng)?.loss()
    }
}

/// Negative ELBO for (x, y) drawn from a data set of `n_data` points.
///
/// # Arguments
/// * `model` - SVGP model; its parameters carry the gradients
/// * `x` - batch inputs (B, D)
/// * `y` - batch targets (B,)
/// * `n_data` - full data size
/// * `rng` - random source for Monte Carlo quadrature
///
/// # Returns
/// Scalar loss to minimize
pub fn svgp_loss<P, R>(
    model: &SvgpModel<P>,
    x: &Tensor,
    y: &Tensor,
    n_data: usize,
    rng: &mut R,
) -> Result<Tensor>
where
    P: PriorProcess,
    R: Rng + ?Sized,
{
    let batch = Minibatch::new(x.clone(), y.clone(), n_data)?;
    model.loss(&batch, rng)
}
