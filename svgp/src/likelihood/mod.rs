//! Observation models p(y | f).
//!
//! The inference core only needs pointwise log-densities (and, for
//! predictions on the data scale, the conditional moments of y given f).
//! `Likelihood` tags the Gaussian case so that closed-form expectations
//! can be enabled for it and rejected for everything else.

mod bernoulli;
mod gaussian;
mod poisson;

pub use bernoulli::BernoulliLikelihood;
pub use gaussian::GaussianLikelihood;
pub use poisson::PoissonLikelihood;

use candle_core::Tensor;

use crate::error::Result;

/// Pointwise likelihood evaluator.
///
/// Gradients flow through `f` (and through any learnable parameter the
/// likelihood holds); y is data.
pub trait PointwiseLikelihood {
    /// log p(y | f), elementwise
    ///
    /// # Arguments
    /// * `f` - latent values, shape (N, Q) for Q evaluation points per datum
    /// * `y` - observations, shape (N, 1)
    ///
    /// # Returns
    /// Log densities, shape (N, Q)
    fn log_density(&self, f: &Tensor, y: &Tensor) -> Result<Tensor>;

    /// Conditional moments (E[y | f], Var[y | f]), each shaped like `f`
    fn conditional_moments(&self, f: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Likelihood attached to a model.
///
/// Only the `Gaussian` arm supports analytic expected log-likelihoods.
pub enum Likelihood {
    Gaussian(GaussianLikelihood),
    Generic(Box<dyn PointwiseLikelihood>),
}

impl Likelihood {
    pub fn generic<L: PointwiseLikelihood + 'static>(likelihood: L) -> Self {
        Self::Generic(Box::new(likelihood))
    }

    pub fn as_gaussian(&self) -> Option<&GaussianLikelihood> {
        match self {
            Self::Gaussian(g) => Some(g),
            Self::Generic(_) => None,
        }
    }

    pub fn is_gaussian(&self) -> bool {
        self.as_gaussian().is_some()
    }

    fn inner(&self) -> &dyn PointwiseLikelihood {
        match self {
            Self::Gaussian(g) => g as &dyn PointwiseLikelihood,
            Self::Generic(l) => l.as_ref(),
        }
    }
}

impl PointwiseLikelihood for Likelihood {
    fn log_density(&self, f: &Tensor, y: &Tensor) -> Result<Tensor> {
        self.inner().log_density(f, y)
    }

    fn conditional_moments(&self, f: &Tensor) -> Result<(Tensor, Tensor)> {
        self.inner().conditional_moments(f)
    }

    fn name(&self) -> &'static str {
        self.inner().name()
    }
}

impl From<GaussianLikelihood> for Likelihood {
    fn from(g: GaussianLikelihood) -> Self {
        Self::Gaussian(g)
    }
}

impl From<BernoulliLikelihood> for Likelihood {
    fn from(l: BernoulliLikelihood) -> Self {
        Self::generic(l)
    }
}

impl From<PoissonLikelihood> for Likelihood {
    fn from(l: PoissonLikelihood) -> Self {
        Self::generic(l)
    }
}
