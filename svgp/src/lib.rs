pub mod cli;
pub mod conditional;
pub mod config;
pub mod elbo;
pub mod error;
pub mod inducing_prior;
pub mod kl;
pub mod likelihood;
pub mod linalg;
pub mod model;
pub mod posterior;
pub mod prior_process;
pub mod quadrature;
pub mod variational;

pub use config::{PosteriorOutput, SvgpConfig, TrainConfig};
pub use elbo::{svgp_loss, ElboTerms, Minibatch};
pub use error::{Result, SvgpError};
pub use inducing_prior::InducingPrior;
pub use kl::kl_divergence;
pub use likelihood::{
    BernoulliLikelihood, GaussianLikelihood, Likelihood, PoissonLikelihood, PointwiseLikelihood,
};
pub use model::{SvgpModel, SvgpParams};
pub use posterior::{ApproxPosterior, PredictiveDistribution, PredictiveMarginals};
pub use prior_process::{PriorProcess, SquaredExponentialGp};
pub use quadrature::{gauss_hermite_rule, GaussHermiteRule, QuadratureStrategy};
pub use variational::{FactoredGaussian, VariationalPosterior};

pub use candle_core;
pub use candle_nn;
