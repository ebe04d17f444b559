//! Conditioning q(u) onto arbitrary inputs.
//!
//! With p(u) = N(μ_z, L Lᵀ) and q(u) = N(m, S Sᵀ), the induced
//! distribution of f at inputs x is Gaussian with
//!
//! ```text
//! A   = L⁻¹ K_zx              (M x N)
//! B   = L⁻ᵀ A                 (M x N)
//! μ   = μ_x + Bᵀ (m - μ_z)
//! Σ   = K_xx - Aᵀ A + (Sᵀ B)ᵀ (Sᵀ B)
//! ```
//!
//! Both the ELBO and the predictive posterior go through here.

use candle_core::Tensor;

use crate::error::{config_bail, Result};
use crate::inducing_prior::InducingPrior;
use crate::linalg::{solve_lower, solve_lower_transpose};
use crate::prior_process::PriorProcess;
use crate::variational::{FactoredGaussian, VariationalPosterior};

/// Shared pieces of the conditional at a set of inputs
struct Projection {
    mean: Tensor,
    a_x: Tensor,
    s_b: Tensor,
}

fn project<P>(
    prior: &P,
    inducing: &Tensor,
    p_u: &InducingPrior,
    q_u: &VariationalPosterior,
    x: &Tensor,
) -> Result<Projection>
where
    P: PriorProcess + ?Sized,
{
    let m = p_u.num_inducing();
    if q_u.dim() != m {
        config_bail!(
            "variational posterior has {} dimensions, inducing prior has {}",
            q_u.dim(),
            m
        );
    }
    if inducing.dim(0)? != m {
        config_bail!("{} inducing locations for {} inducing values", inducing.dim(0)?, m);
    }
    let (_, d_x) = x.dims2()?;
    let (_, d_z) = inducing.dims2()?;
    if d_x != d_z {
        config_bail!("inputs have {} columns, inducing points have {}", d_x, d_z);
    }

    let l_zz = p_u.scale_tril();
    let k_zx = prior.cross_covariance(inducing, x)?; // M x N

    let a_x = solve_lower(l_zz, &k_zx)?;
    let b_x = solve_lower_transpose(l_zz, &a_x)?;

    let delta = (q_u.mean() - p_u.mean())?.unsqueeze(0)?; // 1 x M
    let mean = (prior.mean(x)? + delta.matmul(&b_x)?.squeeze(0)?)?;

    let s_t = q_u.scale_tril().t()?.contiguous()?;
    let s_b = s_t.matmul(&b_x)?; // M x N

    Ok(Projection { mean, a_x, s_b })
}

/// Marginal mean and variance of q(f_i) at each row of `x`
///
/// # Returns
/// `(mean, var)`, both `(N,)`. Variances are not clamped.
pub fn conditional_marginals<P>(
    prior: &P,
    inducing: &Tensor,
    p_u: &InducingPrior,
    q_u: &VariationalPosterior,
    x: &Tensor,
) -> Result<(Tensor, Tensor)>
where
    P: PriorProcess + ?Sized,
{
    let proj = project(prior, inducing, p_u, q_u, x)?;

    let k_xx = prior.covariance_diag(x)?;
    let explained = proj.a_x.sqr()?.sum(0)?;
    let added = proj.s_b.sqr()?.sum(0)?;
    let var = ((k_xx - explained)? + added)?;

    Ok((proj.mean, var))
}

/// Mean `(N,)` and full covariance `(N, N)` of q(f) at `x`
pub fn conditional_full<P>(
    prior: &P,
    inducing: &Tensor,
    p_u: &InducingPrior,
    q_u: &VariationalPosterior,
    x: &Tensor,
) -> Result<(Tensor, Tensor)>
where
    P: PriorProcess + ?Sized,
{
    let proj = project(prior, inducing, p_u, q_u, x)?;

    let k_xx = prior.cross_covariance(x, x)?;
    let a_t = proj.a_x.t()?.contiguous()?;
    let sb_t = proj.s_b.t()?.contiguous()?;
    let cov = ((k_xx - a_t.matmul(&proj.a_x)?)? + sb_t.matmul(&proj.s_b)?)?;

    Ok((proj.mean, cov))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{diag, eye};
    use crate::prior_process::SquaredExponentialGp;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use nalgebra::{DMatrix, DVector};

    fn column(vals: &[f64]) -> Result<Tensor> {
        Ok(Tensor::from_vec(vals.to_vec(), (vals.len(), 1), &Device::Cpu)?)
    }

    fn setup() -> Result<(SquaredExponentialGp, Tensor, InducingPrior, VariationalPosterior)> {
        let device = Device::Cpu;
        let gp = SquaredExponentialGp::fixed(1.3, 0.7, DType::F64, &device)?;
        let z = column(&[-1.0, -0.2, 0.5, 1.1])?;
        let p_u = InducingPrior::new(&gp, &z, 1e-6)?;
        let m = Tensor::from_vec(vec![0.3f64, -0.5, 0.8, 0.1], 4, &device)?;
        let s = Tensor::from_vec(
            vec![
                0.6f64, 0.0, 0.0, 0.0, //
                0.1, 0.4, 0.0, 0.0, //
                -0.2, 0.05, 0.7, 0.0, //
                0.0, 0.3, -0.1, 0.5,
            ],
            (4, 4),
            &device,
        )?;
        let q_u = VariationalPosterior::new(&m, &s)?;
        Ok((gp, z, p_u, q_u))
    }

    fn dense(t: &Tensor) -> Result<DMatrix<f64>> {
        let (r, c) = t.dims2()?;
        Ok(DMatrix::from_row_slice(r, c, &t.flatten_all()?.to_vec1::<f64>()?))
    }

    #[test]
    fn test_matches_dense_reference() -> Result<()> {
        let (gp, z, p_u, q_u) = setup()?;
        let x = column(&[-1.5, -0.4, 0.0, 0.9, 2.0])?;

        let (mean, cov) = conditional_full(&gp, &z, &p_u, &q_u, &x)?;

        let k_zz = dense(&p_u.covariance()?)?;
        let k_zx = dense(&gp.cross_covariance(&z, &x)?)?;
        let k_xx = dense(&gp.cross_covariance(&x, &x)?)?;
        let s_cov = dense(&q_u.covariance()?)?;
        let m = DVector::from_vec(q_u.mean().to_vec1::<f64>()?);

        let k_inv = k_zz.clone().try_inverse().ok_or_else(|| {
            crate::SvgpError::Numerical("reference inverse failed".into())
        })?;
        let proj = &k_inv * &k_zx; // M x N
        let expected_mean = proj.transpose() * &m;
        let expected_cov =
            &k_xx - k_zx.transpose() * &proj + proj.transpose() * &s_cov * &proj;

        let mean = mean.to_vec1::<f64>()?;
        let cov = dense(&cov)?;
        for i in 0..5 {
            assert_abs_diff_eq!(mean[i], expected_mean[i], epsilon = 1e-6);
            for j in 0..5 {
                assert_abs_diff_eq!(cov[(i, j)], expected_cov[(i, j)], epsilon = 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn test_marginals_are_the_diagonal() -> Result<()> {
        let (gp, z, p_u, q_u) = setup()?;
        let x = column(&[-0.7, 0.3, 1.6])?;

        let (mean_full, cov) = conditional_full(&gp, &z, &p_u, &q_u, &x)?;
        let (mean, var) = conditional_marginals(&gp, &z, &p_u, &q_u, &x)?;

        let full_var = diag(&cov)?.to_vec1::<f64>()?;
        let var = var.to_vec1::<f64>()?;
        let mean_full = mean_full.to_vec1::<f64>()?;
        let mean = mean.to_vec1::<f64>()?;
        for i in 0..3 {
            assert_abs_diff_eq!(var[i], full_var[i], epsilon = 1e-10);
            assert_abs_diff_eq!(mean[i], mean_full[i], epsilon = 1e-12);
            assert!(var[i] > 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_prior_q_recovers_prior() -> Result<()> {
        // q(u) = p(u) means conditioning changes nothing
        let device = Device::Cpu;
        let gp = SquaredExponentialGp::fixed(0.8, 0.5, DType::F64, &device)?;
        let z = column(&[-1.0, 0.0, 1.0])?;
        let p_u = InducingPrior::new(&gp, &z, 1e-6)?;
        let q_u = VariationalPosterior::new(p_u.mean(), p_u.scale_tril())?;

        let x = column(&[-0.5, 0.25, 3.0])?;
        let (mean, var) = conditional_marginals(&gp, &z, &p_u, &q_u, &x)?;
        for (mu, v) in mean.to_vec1::<f64>()?.iter().zip(var.to_vec1::<f64>()?) {
            assert_abs_diff_eq!(*mu, 0.0, epsilon = 1e-10);
            assert_abs_diff_eq!(v, 0.8, epsilon = 1e-8);
        }
        Ok(())
    }

    #[test]
    fn test_dimension_mismatch_is_config_error() -> Result<()> {
        let (gp, z, p_u, _) = setup()?;
        let device = Device::Cpu;
        let q_small = VariationalPosterior::new(
            &Tensor::zeros(3, DType::F64, &device)?,
            &eye(3, DType::F64, &device)?,
        )?;
        let x = column(&[0.0])?;
        assert!(matches!(
            conditional_marginals(&gp, &z, &p_u, &q_small, &x),
            Err(crate::SvgpError::Config(_))
        ));
        Ok(())
    }
}
