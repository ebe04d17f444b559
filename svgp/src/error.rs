use thiserror::Error;

/// Errors surfaced by the ELBO and posterior computations.
///
/// Nothing is retried internally. A deterministic numerical failure
/// fails again with the same inputs, so the caller has to change the
/// jitter, the parameterization or the step size.
#[derive(Debug, Error)]
pub enum SvgpError {
    /// Invalid model setup: dimension mismatch, analytic quadrature with
    /// a non-Gaussian likelihood, non-positive jitter, ...
    #[error("configuration error: {0}")]
    Config(String),

    /// Cholesky failure or a non-positive marginal variance.
    #[error("numerical error: {0}")]
    Numerical(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, SvgpError>;

macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::SvgpError::Config(format!($($arg)*)))
    };
}

macro_rules! numerical_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::SvgpError::Numerical(format!($($arg)*)))
    };
}

pub(crate) use config_bail;
pub(crate) use numerical_bail;
