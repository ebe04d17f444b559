//! Expected log-likelihood under Gaussian marginals.
//!
//! For each datum i with marginal f_i ~ N(μ_i, σ_i²) we need
//! E[log p(y_i | f_i)]. Three interchangeable estimators are offered:
//!
//! - `Analytic`: closed form, Gaussian likelihood only
//! - `GaussHermite`: deterministic quadrature, f = μ + √2 σ x_k with
//!   weights w_k / √π
//! - `MonteCarlo`: reparameterized draws f = μ + σ ε from a generator
//!   owned by the caller
//!
//! Gauss-Hermite rules are computed once per order (Golub-Welsch) and
//! shared process-wide; a rule is never modified after insertion.

use std::f64::consts::{PI, SQRT_2};
use std::sync::{Arc, OnceLock};

use candle_core::Tensor;
use dashmap::DashMap;
use log::debug;
use nalgebra::{DMatrix, SymmetricEigen};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{config_bail, Result};
use crate::likelihood::{Likelihood, PointwiseLikelihood};

/// Nodes and weights for ∫ exp(-x²) g(x) dx ≈ Σ_k w_k g(x_k)
#[derive(Debug, Clone)]
pub struct GaussHermiteRule {
    pub nodes: Vec<f64>,
    pub weights: Vec<f64>,
}

impl GaussHermiteRule {
    /// Golub-Welsch: the nodes are the eigenvalues of the symmetric
    /// tridiagonal Jacobi matrix of the Hermite polynomials (zero
    /// diagonal, off-diagonal √(k/2)); the weights are √π times the
    /// squared first components of the eigenvectors.
    fn compute(n: usize) -> Self {
        let mut jacobi = DMatrix::<f64>::zeros(n, n);
        for k in 1..n {
            let b = (k as f64 / 2.0).sqrt();
            jacobi[(k - 1, k)] = b;
            jacobi[(k, k - 1)] = b;
        }

        let eig = SymmetricEigen::new(jacobi);
        let mut pairs: Vec<(f64, f64)> = (0..n)
            .map(|i| (eig.eigenvalues[i], PI.sqrt() * eig.eigenvectors[(0, i)].powi(2)))
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let (nodes, weights) = pairs.into_iter().unzip();
        Self { nodes, weights }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Weights divided by √π, i.e. for expectations under N(0, ½)
    pub fn normalized_weights(&self) -> Vec<f64> {
        let norm = PI.sqrt();
        self.weights.iter().map(|w| w / norm).collect()
    }
}

static GAUSS_HERMITE_RULES: OnceLock<DashMap<usize, Arc<GaussHermiteRule>>> = OnceLock::new();

/// Gauss-Hermite rule of order `n`, computed on first use.
///
/// Two threads racing on a new order may both compute it; the first
/// insertion wins and both get the same shared rule.
pub fn gauss_hermite_rule(n: usize) -> Result<Arc<GaussHermiteRule>> {
    if n == 0 {
        config_bail!("Gauss-Hermite quadrature needs at least one node");
    }

    let rules = GAUSS_HERMITE_RULES.get_or_init(DashMap::new);
    if let Some(rule) = rules.get(&n) {
        return Ok(rule.value().clone());
    }

    debug!("computing {}-point Gauss-Hermite rule", n);
    let rule = Arc::new(GaussHermiteRule::compute(n));
    Ok(rules.entry(n).or_insert(rule).value().clone())
}

/// Latent evaluation points and weights for Gauss-Hermite expectations
///
/// # Returns
/// `(f, w)` with f = μ + √2 σ x_k of shape (N, Q) and normalized
/// weights of shape (Q, 1), so that `g(f).matmul(w)` is E[g(f)] per datum
pub(crate) fn gauss_hermite_points(mean: &Tensor, var: &Tensor, n: usize) -> Result<(Tensor, Tensor)> {
    let rule = gauss_hermite_rule(n)?;
    let (dtype, device) = (mean.dtype(), mean.device());

    let nodes = Tensor::from_vec(rule.nodes.clone(), (1, n), device)?.to_dtype(dtype)?;
    let weights = Tensor::from_vec(rule.normalized_weights(), (n, 1), device)?.to_dtype(dtype)?;

    let scale = (var.sqrt()? * SQRT_2)?.unsqueeze(1)?; // N x 1
    let f = scale
        .broadcast_mul(&nodes)?
        .broadcast_add(&mean.unsqueeze(1)?)?; // N x Q
    Ok((f, weights))
}

/// How E[log p(y_i | f_i)] is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuadratureStrategy {
    /// Closed form; requires a Gaussian likelihood
    Analytic,
    /// Deterministic quadrature with `num_points` nodes
    GaussHermite { num_points: usize },
    /// Average over `num_samples` reparameterized draws per datum.
    /// Carries sampling noise by construction.
    MonteCarlo { num_samples: usize },
}

impl Default for QuadratureStrategy {
    fn default() -> Self {
        Self::GaussHermite { num_points: 20 }
    }
}

impl QuadratureStrategy {
    /// Check that this strategy can be used with `likelihood`.
    pub fn validate(&self, likelihood: &Likelihood) -> Result<()> {
        match self {
            Self::Analytic if !likelihood.is_gaussian() => {
                config_bail!(
                    "analytic quadrature requires a Gaussian likelihood, got {}",
                    likelihood.name()
                )
            }
            Self::GaussHermite { num_points: 0 } => {
                config_bail!("Gauss-Hermite quadrature needs at least one node")
            }
            Self::MonteCarlo { num_samples: 0 } => {
                config_bail!("Monte Carlo quadrature needs at least one sample")
            }
            _ => Ok(()),
        }
    }

    /// E[log p(y_i | f_i)] for each datum
    ///
    /// # Arguments
    /// * `likelihood` - observation model
    /// * `y` - targets, shape (N,)
    /// * `mean` - marginal means μ_i, shape (N,)
    /// * `var` - marginal variances σ_i², shape (N,), all positive
    /// * `rng` - random source; only touched by `MonteCarlo`
    ///
    /// # Returns
    /// Per-datum expectations, shape (N,)
    pub fn pointwise_expectations<R: Rng + ?Sized>(
        &self,
        likelihood: &Likelihood,
        y: &Tensor,
        mean: &Tensor,
        var: &Tensor,
        rng: &mut R,
    ) -> Result<Tensor> {
        self.validate(likelihood)?;

        match *self {
            Self::Analytic => match likelihood.as_gaussian() {
                Some(gaussian) => gaussian.expected_log_density(y, mean, var),
                None => config_bail!("analytic quadrature requires a Gaussian likelihood"),
            },
            Self::GaussHermite { num_points } => {
                let (f, weights) = gauss_hermite_points(mean, var, num_points)?;
                let log_prob = likelihood.log_density(&f, &y.unsqueeze(1)?)?; // N x Q
                Ok(log_prob.matmul(&weights)?.squeeze(1)?)
            }
            Self::MonteCarlo { num_samples } => {
                let n = mean.dims1()?;
                let eps: Vec<f64> = (0..n * num_samples)
                    .map(|_| StandardNormal.sample(&mut *rng))
                    .collect();
                let eps = Tensor::from_vec(eps, (n, num_samples), mean.device())?
                    .to_dtype(mean.dtype())?;

                let f = eps
                    .broadcast_mul(&var.sqrt()?.unsqueeze(1)?)?
                    .broadcast_add(&mean.unsqueeze(1)?)?; // N x S
                let log_prob = likelihood.log_density(&f, &y.unsqueeze(1)?)?;
                Ok(log_prob.mean(1)?)
            }
        }
    }

    /// Σ_i E[log p(y_i | f_i)] over the batch (summed, not averaged)
    pub fn expected_log_likelihood<R: Rng + ?Sized>(
        &self,
        likelihood: &Likelihood,
        y: &Tensor,
        mean: &Tensor,
        var: &Tensor,
        rng: &mut R,
    ) -> Result<Tensor> {
        Ok(self
            .pointwise_expectations(likelihood, y, mean, var, rng)?
            .sum_all()?)
    }
}
