//! # Query-time reconstruction engine
//!
//! Stateless logic that maps a requested offset range onto the stored
//! sub-model factorizations, stitches overlapping reconstructions together,
//! and extends beyond ingested history with an autoregressive recurrence.
//!
//! The engine is written against the [`FactorSource`] abstraction so the
//! same blending code serves two callers: the public query surface reading
//! persisted factor tables (possibly in a different process from the
//! ingester), and the ingestion path reconstructing recent means from the
//! in-memory chain for variance residuals.
//!
//! Blending rule: every sub-model covering an offset contributes its
//! reconstruction at weight 0.5; offsets with exactly one contribution
//! (the edges of the chain, or overlap with a partner whose factorization
//! has not reached that offset yet) are doubled, so the total weight at
//! every offset is exactly 1.

use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::config::CoeffWindow;
use crate::storage::{IndexMeta, SeriesCounters, Storage, StorageError, SubmodelMeta};
use crate::timemap::{TimeMapError, TimeMapper};
use crate::uncertainty::{self, UncertaintyError, UqMethod};

/// Factor rows needed to reconstruct part of one sub-model: the full `U`
/// factor, the singular values, and the `V` rows for a contiguous column
/// range starting at `first_col`.
#[derive(Debug, Clone)]
pub struct FactorSlice {
    pub u: Array2<f64>,
    pub s: Array1<f64>,
    pub v: Array2<f64>,
    pub first_col: usize,
}

/// Read access to one model series' factorizations.
pub trait FactorSource {
    /// Highest `modelno` in the chain, or `None` for an untrained series.
    fn last_model(&self) -> Option<usize>;
    /// Sub-model stride `T/2`.
    fn stride(&self) -> usize;
    fn meta(&self, modelno: usize) -> Result<SubmodelMeta, QueryError>;
    /// `cols` is an inclusive sub-model-local column range.
    fn factors(&self, modelno: usize, cols: (usize, usize)) -> Result<FactorSlice, QueryError>;
}

/// Sub-model owning offset `t`: the earlier of the (up to) two windows
/// covering it.
fn model_of(t: usize, stride: usize, last: usize) -> usize {
    ((t / stride).max(1) - 1).min(last)
}

/// Blended reconstruction of offsets `t1 ..= t2` inside ingested history.
pub fn impute_range<F: FactorSource>(
    src: &F,
    t1: usize,
    t2: usize,
) -> Result<Vec<f64>, QueryError> {
    let last = src.last_model().ok_or(QueryError::NotTrained)?;
    let stride = src.stride();
    let m1 = model_of(t1, stride, last);
    let m2 = model_of(t2, stride, last);

    let len = t2 - t1 + 1;
    let mut out = vec![0.0; len];
    let mut contributions = vec![0u32; len];

    for m in m1..=(m2 + 1).min(last) {
        let meta = src.meta(m)?;
        if meta.filled_cols == 0 {
            continue;
        }
        let lo = t1.max(meta.start);
        let hi = t2.min(meta.covered_end() - 1);
        if lo > hi {
            continue;
        }
        let col_lo = (lo - meta.start) / meta.rows;
        let col_hi = (hi - meta.start) / meta.rows;
        let f = src.factors(m, (col_lo, col_hi))?;
        for t in lo..=hi {
            let local = t - meta.start;
            let row = local % meta.rows;
            let col = local / meta.rows - f.first_col;
            let mut value = 0.0;
            for j in 0..f.s.len() {
                value += f.u[[row, j]] * f.s[j] * f.v[[col, j]];
            }
            out[t - t1] += 0.5 * value;
            contributions[t - t1] += 1;
        }
    }

    for (i, &n) in contributions.iter().enumerate() {
        match n {
            0 => return Err(QueryError::Uncovered { offset: t1 + i }),
            1 => out[i] *= 2.0,
            _ => {}
        }
    }
    Ok(out)
}

/// Autoregressive forecast of offsets `t1 ..= t2`, anchored at the series'
/// `m_update_index` and seeded with imputed history.
pub fn forecast_range<F: FactorSource>(
    src: &F,
    coeffs: &[f64],
    anchor: usize,
    t1: usize,
    t2: usize,
) -> Result<Vec<f64>, QueryError> {
    let no_coeff = coeffs.len();
    if no_coeff == 0 {
        return Err(QueryError::NotTrained);
    }
    if anchor < no_coeff {
        return Err(QueryError::InsufficientHistory {
            needed: no_coeff,
            available: anchor,
        });
    }
    let mut buf = impute_range(src, anchor - no_coeff, anchor - 1)?;
    buf.resize(no_coeff + (t2 - anchor + 1), 0.0);
    for i in 0..=(t2 - anchor) {
        let window = &buf[i..i + no_coeff];
        buf[i + no_coeff] = coeffs
            .iter()
            .zip(window)
            .map(|(c, x)| c * x)
            .sum();
    }
    Ok(buf[buf.len() - (t2 - t1 + 1)..].to_vec())
}

/// Impute, forecast, or both, depending on where `[t1, t2]` falls relative
/// to the series' own imputation/forecast boundary.
pub(crate) fn series_values<F, C>(
    src: &F,
    anchor: usize,
    t1: usize,
    t2: usize,
    coeffs: C,
) -> Result<Vec<f64>, QueryError>
where
    F: FactorSource,
    C: FnOnce() -> Result<Vec<f64>, QueryError>,
{
    if anchor == 0 {
        return Err(QueryError::NotTrained);
    }
    if t1 > anchor - 1 {
        forecast_range(src, &coeffs()?, anchor, t1, t2)
    } else if t2 <= anchor - 1 {
        impute_range(src, t1, t2)
    } else {
        let mut values = impute_range(src, t1, anchor - 1)?;
        values.extend(forecast_range(src, &coeffs()?, anchor, anchor, t2)?);
        Ok(values)
    }
}

/// [`FactorSource`] over the persisted factor tables of one model series.
pub struct StoredSeries<'a, S: Storage> {
    storage: &'a S,
    series: String,
    stride: usize,
    last: Option<usize>,
    coeff_window: CoeffWindow,
}

impl<'a, S: Storage> StoredSeries<'a, S> {
    pub fn new(
        storage: &'a S,
        series: String,
        counters: &SeriesCounters,
        coeff_window: CoeffWindow,
    ) -> Self {
        StoredSeries {
            storage,
            series,
            stride: counters.rows * counters.cols / 2,
            last: counters.submodels.checked_sub(1),
            coeff_window,
        }
    }

    fn averaged_coefficients(&self) -> Result<Vec<f64>, QueryError> {
        Ok(self
            .storage
            .averaged_coefficients(&self.series, self.coeff_window)?)
    }
}

impl<S: Storage> FactorSource for StoredSeries<'_, S> {
    fn last_model(&self) -> Option<usize> {
        self.last
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn meta(&self, modelno: usize) -> Result<SubmodelMeta, QueryError> {
        Ok(self.storage.model_meta(&self.series, modelno)?)
    }

    fn factors(&self, modelno: usize, cols: (usize, usize)) -> Result<FactorSlice, QueryError> {
        let meta = self.storage.model_meta(&self.series, modelno)?;
        let mut u_rows = self
            .storage
            .row_factors(&self.series, (modelno, modelno), (0, meta.rows - 1))?;
        let s_rows = self
            .storage
            .singular_values(&self.series, (modelno, modelno))?;
        let mut v_rows = self
            .storage
            .col_factors(&self.series, (modelno, modelno), cols)?;

        let s_row = s_rows
            .into_iter()
            .next()
            .ok_or(QueryError::IncompleteFactors { modelno })?;
        let k = s_row.values.len();
        let ncols = cols.1 - cols.0 + 1;
        if u_rows.len() != meta.rows || v_rows.len() != ncols {
            // A persist may be mid-flight; the torn window is documented
            // behavior, surfaced as an explicit error rather than garbage.
            return Err(QueryError::IncompleteFactors { modelno });
        }
        u_rows.sort_by_key(|r| r.row);
        v_rows.sort_by_key(|r| r.col);

        let mut u = Array2::zeros((meta.rows, k));
        for (i, r) in u_rows.iter().enumerate() {
            for j in 0..k.min(r.values.len()) {
                u[[i, j]] = r.values[j];
            }
        }
        let mut v = Array2::zeros((ncols, k));
        for (i, r) in v_rows.iter().enumerate() {
            for j in 0..k.min(r.values.len()) {
                v[[i, j]] = r.values[j];
            }
        }
        Ok(FactorSlice {
            u,
            s: Array1::from_vec(s_row.values),
            v,
            first_col: cols.0,
        })
    }
}

/// Options of the public query surface.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    /// Return a confidence band alongside the estimate.
    pub uq: bool,
    pub method: UqMethod,
    /// Confidence level in percent, `0 < c < 100`.
    pub confidence: f64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            uq: true,
            method: UqMethod::Gaussian,
            confidence: 95.0,
        }
    }
}

/// A single predicted point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub value: f64,
    pub deviation: Option<f64>,
}

/// A predicted range.
#[derive(Debug, Clone, PartialEq)]
pub struct RangePrediction {
    pub values: Vec<f64>,
    pub deviations: Option<Vec<f64>>,
}

fn read_meta<S: Storage>(storage: &S, index_name: &str) -> Result<IndexMeta, QueryError> {
    storage.read_index_meta(index_name).map_err(|e| match e {
        StorageError::MissingIndex(name) => QueryError::UnknownIndex(name),
        other => QueryError::Storage(other),
    })
}

/// Predicted value (and optional deviation) at time `t`.
pub fn get_prediction<S: Storage>(
    storage: &S,
    index_name: &str,
    t: i64,
    options: &QueryOptions,
) -> Result<Prediction, QueryError> {
    let range = get_prediction_range(storage, index_name, t, t, options)?;
    let value = range.values[0];
    let deviation = range.deviations.map(|d| d[0]);
    Ok(Prediction { value, deviation })
}

/// Predicted values (and optional deviations) for every canonical offset in
/// `[t1, t2]`.
pub fn get_prediction_range<S: Storage>(
    storage: &S,
    index_name: &str,
    t1: i64,
    t2: i64,
    options: &QueryOptions,
) -> Result<RangePrediction, QueryError> {
    let meta = read_meta(storage, index_name)?;
    let mapper = TimeMapper::new(meta.start_time, meta.agg_interval);
    let o1 = mapper.offset(t1)?;
    let o2 = mapper.offset(t2)?;
    if o2 < o1 {
        return Err(QueryError::InvalidRange { t1, t2 });
    }

    // Caller-input validation happens before any factor reads.
    let alpha = if options.uq {
        Some(uncertainty::alpha(options.method, options.confidence)?)
    } else {
        None
    };

    if meta.mean.submodels == 0 {
        return Err(QueryError::NotTrained);
    }
    let mean_src = StoredSeries::new(
        storage,
        index_name.to_string(),
        &meta.mean,
        meta.coeff_window,
    );
    let values = series_values(&mean_src, meta.mean.m_update_index, o1, o2, || {
        mean_src.averaged_coefficients()
    })?;

    let deviations = match alpha {
        None => None,
        Some(alpha) => {
            let var_counters = meta
                .variance
                .as_ref()
                .filter(|c| meta.rank_var > 0 && c.submodels > 0)
                .ok_or_else(|| QueryError::UncertaintyUnavailable(index_name.to_string()))?;
            let var_src = StoredSeries::new(
                storage,
                format!("{index_name}_variance"),
                var_counters,
                meta.coeff_window,
            );
            let estimates = series_values(&var_src, var_counters.m_update_index, o1, o2, || {
                var_src.averaged_coefficients()
            })?;
            Some(uncertainty::deviations(
                &values,
                &estimates,
                meta.direct_var,
                alpha,
            ))
        }
    };

    Ok(RangePrediction { values, deviations })
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("no predictive index named '{0}'")]
    UnknownIndex(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Time(#[from] TimeMapError),
    #[error("invalid query range: t2 ({t2}) precedes t1 ({t1})")]
    InvalidRange { t1: i64, t2: i64 },
    #[error("the index has not been trained yet (not enough observations)")]
    NotTrained,
    #[error("index '{0}' was built without a variance model series; query with uq disabled")]
    UncertaintyUnavailable(String),
    #[error(transparent)]
    Uncertainty(#[from] UncertaintyError),
    #[error("forecasting needs {needed} finalized observations, only {available} available")]
    InsufficientHistory { needed: usize, available: usize },
    #[error("offset {offset} is not covered by any sub-model factorization")]
    Uncovered { offset: usize },
    #[error("sub-model {modelno} does not exist in this chain")]
    MissingSubmodel { modelno: usize },
    #[error("sub-model {modelno} has incomplete factor rows (possibly a write in flight)")]
    IncompleteFactors { modelno: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowShape;
    use crate::series::{ModelSeries, Submodel};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};

    /// Chain of rank-1 sub-models that all reconstruct the constant 1.0,
    /// shape 2 x 4 (window 8, stride 4).
    fn ones_chain(submodels: usize, last_filled: usize) -> ModelSeries {
        let shape = WindowShape::resolve(8, Some(2), 4).unwrap();
        let mut series = ModelSeries::new("ones", 1, shape, 1, 0.5, false);
        for m in 0..submodels {
            let filled = if m + 1 == submodels { last_filled } else { 4 };
            series.models.push(Submodel {
                start: m * 4,
                rows: 2,
                cols: 4,
                filled_cols: filled,
                u: Array2::ones((2, 1)),
                s: Array1::ones(1),
                v: Array2::ones((filled, 1)),
                weights: Array1::ones(1),
                imputation_score: 1.0,
                forecast_score: 1.0,
                times_updated: 0,
                times_reconstructed: 1,
                dirty: false,
            });
        }
        series
    }

    #[test]
    fn blend_weights_sum_to_one_everywhere() {
        let chain = ones_chain(3, 4);
        // Offsets 0..=3 and 12..=15 are covered once (edges), the rest twice.
        let values = impute_range(&chain, 0, 15).unwrap();
        for v in values {
            assert_abs_diff_eq!(v, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn partial_last_submodel_still_blends_to_one() {
        // Last sub-model has only 2 of 4 columns fitted (covers 8..=11).
        let chain = ones_chain(3, 2);
        let values = impute_range(&chain, 0, 11).unwrap();
        for v in values {
            assert_abs_diff_eq!(v, 1.0, epsilon = 1e-12);
        }
        // Beyond every factorization: explicit error, not silence.
        assert!(matches!(
            impute_range(&chain, 0, 12),
            Err(QueryError::Uncovered { offset: 12 })
        ));
    }

    #[test]
    fn unhydrated_partner_is_compensated_by_doubling() {
        let mut chain = ones_chain(3, 4);
        // Strip sub-model 1's factors, as after a reload.
        chain.models[1].u = Array2::zeros((0, 0));
        chain.models[1].v = Array2::zeros((0, 0));
        let values = impute_range(&chain, 0, 7).unwrap();
        for v in values {
            assert_abs_diff_eq!(v, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn forecast_recurrence_extends_the_series() {
        let chain = ones_chain(3, 4);
        // Order-1 recurrence x[t] = x[t-1] continues the constant.
        let values = forecast_range(&chain, &[1.0], 16, 18, 20).unwrap();
        assert_eq!(values.len(), 3);
        for v in values {
            assert_abs_diff_eq!(v, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn forecast_needs_enough_finalized_history() {
        let chain = ones_chain(1, 4);
        assert!(matches!(
            forecast_range(&chain, &[0.5, 0.5, 0.0], 2, 2, 4),
            Err(QueryError::InsufficientHistory { needed: 3, available: 2 })
        ));
    }

    #[test]
    fn mixed_dispatch_concatenates_impute_and_forecast() {
        let chain = ones_chain(3, 4);
        let anchor = 16;
        let values =
            series_values(&chain, anchor, 10, 20, || Ok(vec![1.0])).unwrap();
        assert_eq!(values.len(), 11);
        for v in values {
            assert_abs_diff_eq!(v, 1.0, epsilon = 1e-12);
        }
    }
}
