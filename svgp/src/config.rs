use serde::{Deserialize, Serialize};

use crate::error::{config_bail, Result};
use crate::likelihood::Likelihood;
use crate::quadrature::QuadratureStrategy;

/// What `ApproxPosterior::predict_as` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PosteriorOutput {
    /// Distribution of the latent function f
    #[default]
    Latent,
    /// Distribution of the observations y: the latent covariance plus
    /// noise for a Gaussian likelihood, moment-matched marginals otherwise
    Observation,
}

/// Settings fixed at model construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvgpConfig {
    /// Added to the diagonal of K_zz; must be > 0
    pub jitter: f64,
    pub quadrature: QuadratureStrategy,
    pub posterior_output: PosteriorOutput,
}

impl Default for SvgpConfig {
    fn default() -> Self {
        Self {
            jitter: 1e-6,
            quadrature: QuadratureStrategy::default(),
            posterior_output: PosteriorOutput::default(),
        }
    }
}

impl SvgpConfig {
    pub fn validate(&self, likelihood: &Likelihood) -> Result<()> {
        if !(self.jitter > 0.0 && self.jitter.is_finite()) {
            config_bail!("jitter must be positive, got {}", self.jitter);
        }
        self.quadrature.validate(likelihood)
    }
}

/// Optimization settings for the training driver
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub num_iters: usize,
    pub seed: u64,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            batch_size: 100,
            num_iters: 1000,
            seed: 42,
            verbose: false,
            show_progress: true,
        }
    }
}
