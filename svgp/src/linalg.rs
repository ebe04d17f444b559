//! Dense linear algebra written with differentiable tensor ops.
//!
//! candle ships no Cholesky factorization or triangular solver, so the
//! routines here are assembled from `narrow`, `matmul` and `cat`. Every
//! output stays on the autograd tape. Nothing is ever inverted.

use candle_core::{DType, Device, Tensor};

use crate::error::{numerical_bail, Result, SvgpError};

/// Identity matrix `I_n`
pub fn eye(n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f64; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Ok(Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)?)
}

/// Constant mask with ones on and below the diagonal
fn lower_mask(n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f64; n * n];
    for i in 0..n {
        for j in 0..=i {
            data[i * n + j] = 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)?)
}

/// Column mask `(n, 1)` keeping rows `j..n`
fn rows_from(n: usize, j: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let data: Vec<f64> = (0..n).map(|i| if i >= j { 1.0 } else { 0.0 }).collect();
    Ok(Tensor::from_vec(data, (n, 1), device)?.to_dtype(dtype)?)
}

/// Lower triangle of a square matrix, upper part zeroed.
pub fn tril(a: &Tensor) -> Result<Tensor> {
    let n = square_dim(a)?;
    let mask = lower_mask(n, a.dtype(), a.device())?;
    Ok((a * mask)?)
}

/// Entries strictly below the diagonal, everything else zeroed.
pub fn strict_tril(a: &Tensor) -> Result<Tensor> {
    let n = square_dim(a)?;
    let mask = (lower_mask(n, a.dtype(), a.device())? - eye(n, a.dtype(), a.device())?)?;
    Ok((a * mask)?)
}

/// Square matrix with `v` `(n,)` on the diagonal
pub fn diag_embed(v: &Tensor) -> Result<Tensor> {
    let n = v.dims1()?;
    let id = eye(n, v.dtype(), v.device())?;
    Ok(id.broadcast_mul(&v.unsqueeze(0)?)?)
}

/// Diagonal of a square matrix as a vector `(n,)`
pub fn diag(a: &Tensor) -> Result<Tensor> {
    let n = square_dim(a)?;
    let id = eye(n, a.dtype(), a.device())?;
    Ok((a * id)?.sum(1)?)
}

/// `Σ_i ln L_ii` for a triangular factor with a positive diagonal.
///
/// Fails with a numerical error if any diagonal entry is not positive,
/// since the factor then does not describe a valid covariance.
pub fn log_diag_sum(l: &Tensor) -> Result<Tensor> {
    let d = diag(l)?;
    let smallest = scalar_value(&d.min(0)?)?;
    if !(smallest > 0.0) {
        numerical_bail!(
            "triangular factor has a non-positive diagonal entry ({})",
            smallest
        );
    }
    Ok(d.log()?.sum_all()?)
}

/// Read a one-element tensor back as `f64`.
pub fn scalar_value(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?)
}

fn shape_error(msg: String) -> SvgpError {
    SvgpError::Candle(candle_core::Error::Msg(msg))
}

fn square_dim(a: &Tensor) -> Result<usize> {
    let (n, m) = a.dims2()?;
    if n != m {
        return Err(shape_error(format!("expected a square matrix, got {} x {}", n, m)));
    }
    Ok(n)
}

/// Lower Cholesky factor `L` with `L Lᵀ = A`.
///
/// Column `j` is `(A[:, j] - L[:, :j] L[j, :j]ᵀ) / sqrt(pivot_j)` with the
/// rows above `j` masked out. A pivot that is not strictly positive means
/// `A` is not numerically positive definite.
pub fn cholesky(a: &Tensor) -> Result<Tensor> {
    let n = square_dim(a)?;
    let (dtype, device) = (a.dtype(), a.device());

    let mut cols: Vec<Tensor> = Vec::with_capacity(n);

    for j in 0..n {
        let a_j = a.narrow(1, j, 1)?; // n x 1

        let resid_j = if j == 0 {
            a_j
        } else {
            let l_prev = Tensor::cat(&cols, 1)?; // n x j
            let l_row = l_prev.narrow(0, j, 1)?.t()?.contiguous()?; // j x 1
            (a_j - l_prev.matmul(&l_row)?)?
        };

        let pivot = resid_j.narrow(0, j, 1)?; // 1 x 1
        let pivot_value = scalar_value(&pivot)?;
        if !(pivot_value > 0.0) || !pivot_value.is_finite() {
            numerical_bail!(
                "matrix is not positive definite: pivot {} at column {} of {}",
                pivot_value,
                j,
                n
            );
        }

        let col_j = resid_j
            .broadcast_div(&pivot.sqrt()?)?
            .mul(&rows_from(n, j, dtype, device)?)?;
        cols.push(col_j);
    }

    Ok(Tensor::cat(&cols, 1)?)
}

/// Solve `L X = B` by forward substitution.
///
/// * `l` - lower-triangular `(n, n)`
/// * `b` - right-hand side `(n, k)`
pub fn solve_lower(l: &Tensor, b: &Tensor) -> Result<Tensor> {
    let n = square_dim(l)?;
    let (nb, _) = b.dims2()?;
    if nb != n {
        return Err(shape_error(format!(
            "solve_lower: {} rows against a {} x {} factor",
            nb, n, n
        )));
    }

    let mut rows: Vec<Tensor> = Vec::with_capacity(n);

    for i in 0..n {
        let b_i = b.narrow(0, i, 1)?; // 1 x k
        let l_ii = l.narrow(0, i, 1)?.narrow(1, i, 1)?; // 1 x 1

        let resid_i = if i == 0 {
            b_i
        } else {
            let l_row = l.narrow(0, i, 1)?.narrow(1, 0, i)?.contiguous()?; // 1 x i
            let x_prev = Tensor::cat(&rows, 0)?; // i x k
            (b_i - l_row.matmul(&x_prev)?)?
        };

        rows.push(resid_i.broadcast_div(&l_ii)?);
    }

    Ok(Tensor::cat(&rows, 0)?)
}

/// Solve `Lᵀ X = B` by back substitution, reading `Lᵀ` off the columns
/// of `L` so the transpose is never formed.
///
/// * `l` - lower-triangular `(n, n)`
/// * `b` - right-hand side `(n, k)`
pub fn solve_lower_transpose(l: &Tensor, b: &Tensor) -> Result<Tensor> {
    let n = square_dim(l)?;
    let (nb, _) = b.dims2()?;
    if nb != n {
        return Err(shape_error(format!(
            "solve_lower_transpose: {} rows against a {} x {} factor",
            nb, n, n
        )));
    }

    // rows[0] always holds x_i for the current smallest i solved so far
    let mut rows: Vec<Tensor> = Vec::with_capacity(n);

    for i in (0..n).rev() {
        let b_i = b.narrow(0, i, 1)?;
        let l_ii = l.narrow(0, i, 1)?.narrow(1, i, 1)?;

        let resid_i = if i == n - 1 {
            b_i
        } else {
            let below = n - i - 1;
            let l_col = l
                .narrow(1, i, 1)?
                .narrow(0, i + 1, below)?
                .t()?
                .contiguous()?; // 1 x below
            let x_next = Tensor::cat(&rows, 0)?; // below x k
            (b_i - l_col.matmul(&x_next)?)?
        };

        rows.insert(0, resid_i.broadcast_div(&l_ii)?);
    }

    Ok(Tensor::cat(&rows, 0)?)
}
