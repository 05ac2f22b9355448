//! The per-window low-rank fit primitive.
//!
//! [`WindowFit`] is the collaborator contract: given one sub-model's
//! reshaped observation matrix it returns the retained-rank factorization,
//! the forecast recurrence coefficients and the quality scores. The core
//! only requires the primitive to be deterministic for a given observation
//! stream and configuration.
//!
//! [`SvdFit`] is the reference implementation: a truncated SVD with optional
//! soft singular-value thresholding, recurrence coefficients from a
//! least-squares fit of the last matrix row against the others on the
//! denoised matrix.

use ndarray::{Array1, Array2, ArrayView2, s};
use ndarray_linalg::{LeastSquaresSvd, SVD};
use thiserror::Error;

/// Output of one window fit.
#[derive(Debug, Clone)]
pub struct WindowFactors {
    /// Row factors, `N x k`.
    pub u: Array2<f64>,
    /// Retained singular values, length `k`.
    pub s: Array1<f64>,
    /// Column factors, `M x k`.
    pub v: Array2<f64>,
    /// Order-`N-1` linear recurrence coefficients for forecasting.
    pub weights: Array1<f64>,
    pub imputation_score: f64,
    pub forecast_score: f64,
}

pub trait WindowFit {
    /// Factorize one sub-model window. `matrix` is the `N x M` column-major
    /// reshape of the window's raw observations (`M` may be smaller than the
    /// full window for the open sub-model).
    fn fit(
        &self,
        matrix: ArrayView2<'_, f64>,
        rank: usize,
        soft_threshold: bool,
    ) -> Result<WindowFactors, FitError>;
}

/// Truncated-SVD reference implementation of [`WindowFit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SvdFit;

impl WindowFit for SvdFit {
    fn fit(
        &self,
        matrix: ArrayView2<'_, f64>,
        rank: usize,
        soft_threshold: bool,
    ) -> Result<WindowFactors, FitError> {
        let (n, m) = matrix.dim();
        if n < 2 || m < 1 {
            return Err(FitError::DegenerateWindow { rows: n, cols: m });
        }
        let (u_full, s_full, vt_full) = matrix.svd(true, true)?;
        let u_full = u_full.ok_or(FitError::MissingFactor)?;
        let vt_full = vt_full.ok_or(FitError::MissingFactor)?;

        let k = rank.min(s_full.len());
        let mut sk = s_full.slice(s![..k]).to_owned();
        if soft_threshold && s_full.len() > k {
            // Shrink retained values by the first discarded one.
            let tau = s_full[k];
            sk.mapv_inplace(|x| (x - tau).max(0.0));
        }
        let uk = u_full.slice(s![.., ..k]).to_owned();
        let vk = vt_full.slice(s![..k, ..]).t().to_owned();

        // Denoised window, used both for scoring and for the recurrence fit.
        let denoised = (&uk * &sk).dot(&vk.t());

        let design = denoised.slice(s![..n - 1, ..]).t().to_owned();
        let target = denoised.row(n - 1).to_owned();
        let weights = design.least_squares(&target)?.solution;

        let imputation_score = relative_score(&(&denoised - &matrix), matrix.view());
        let residual = &design.dot(&weights) - &target;
        let forecast_score = relative_score_1d(&residual, &target);

        Ok(WindowFactors {
            u: uk,
            s: sk,
            v: vk,
            weights,
            imputation_score,
            forecast_score,
        })
    }
}

fn relative_score(residual: &Array2<f64>, reference: ArrayView2<'_, f64>) -> f64 {
    let ref_norm = reference.mapv(|x| x * x).sum().sqrt();
    if ref_norm == 0.0 {
        return 1.0;
    }
    let err = residual.mapv(|x| x * x).sum().sqrt();
    1.0 - err / ref_norm
}

fn relative_score_1d(residual: &Array1<f64>, reference: &Array1<f64>) -> f64 {
    let ref_norm = reference.mapv(|x| x * x).sum().sqrt();
    if ref_norm == 0.0 {
        return 1.0;
    }
    let err = residual.mapv(|x| x * x).sum().sqrt();
    1.0 - err / ref_norm
}

#[derive(Error, Debug)]
pub enum FitError {
    #[error("window matrix of {rows} x {cols} cannot be factorized")]
    DegenerateWindow { rows: usize, cols: usize },
    #[error("SVD did not return the requested factors")]
    MissingFactor,
    #[error("window reshape failed: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("linear algebra failure: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}
