use candle_core::Tensor;

use crate::error::{config_bail, Result};
use crate::linalg::{log_diag_sum, solve_lower};
use crate::variational::FactoredGaussian;

/// KL(q ‖ p) between two multivariate normals given by Cholesky factors
///
/// ```text
/// KL = ½ [ ‖L_p⁻¹ L_q‖²_F + ‖L_p⁻¹ (μ_p − m_q)‖² − M
///          + 2 (Σ ln diag L_p − Σ ln diag L_q) ]
/// ```
///
/// Both inverses are triangular solves against L_p. Fails with a
/// numerical error if either factor has a non-positive diagonal entry.
///
/// # Returns
/// Scalar tensor, ≥ 0 up to rounding
pub fn kl_divergence<Q, P>(q: &Q, p: &P) -> Result<Tensor>
where
    Q: FactoredGaussian + ?Sized,
    P: FactoredGaussian + ?Sized,
{
    let m = q.dim();
    if p.dim() != m {
        config_bail!("KL between {}- and {}-dimensional Gaussians", m, p.dim());
    }

    let l_p = p.scale_tril();
    let l_q = q.scale_tril();

    // checked first so a bad factor never reaches the solves
    let half_logdet_p = log_diag_sum(l_p)?;
    let half_logdet_q = log_diag_sum(l_q)?;

    let trace_term = solve_lower(l_p, l_q)?.sqr()?.sum_all()?;

    let diff = (p.mean() - q.mean())?.unsqueeze(1)?; // M x 1
    let maha_term = solve_lower(l_p, &diff)?.sqr()?.sum_all()?;

    let logdet_term = ((half_logdet_p - half_logdet_q)? * 2.0)?;

    let total = ((trace_term + maha_term)? + logdet_term)?;
    Ok(((total - m as f64)? * 0.5)?)
}
