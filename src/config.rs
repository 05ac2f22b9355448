//! Index configuration and window-geometry resolution.
//!
//! An [`IndexConfig`] describes everything needed to (re)build a predictive
//! index: the source relation and columns, the ranks and window lengths of
//! the two model series, the ingestion policy knobs, and the time mapping
//! parameters. Validation resolves the raw window length `T` into a concrete
//! `N x M` matrix geometry whose `T/2` stride lands on whole columns.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Aggregation applied when bucketing raw observations into canonical
/// offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggMethod {
    Average,
    Sum,
    Min,
    Max,
}

/// How many trailing sub-models' recurrence coefficients are averaged when
/// forecasting.
///
/// The persisted coefficient view precomputes a small set of depths on every
/// write; other depths are computed on demand by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoeffWindow {
    /// Average over every sub-model in the chain.
    All,
    /// Average over the `n` most recent sub-models.
    Last(usize),
}

impl Default for CoeffWindow {
    fn default() -> Self {
        CoeffWindow::Last(10)
    }
}

/// Depths precomputed by [`crate::storage::Storage::refresh_coefficient_view`].
pub const COEFF_VIEW_DEPTHS: [usize; 3] = [10, 20, 100];

/// Full description of a predictive index over one source column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Name under which the index and its backing tables are registered.
    pub index_name: String,
    /// Source relation holding the raw time series.
    pub relation: String,
    /// Column of `relation` holding the tracked value.
    pub value_column: String,
    /// Column of `relation` holding the timestamp / integer time index.
    pub time_column: String,
    /// Retained rank of the mean model series.
    pub rank: usize,
    /// Retained rank of the variance model series; 0 disables uncertainty.
    pub rank_var: usize,
    /// Window length `T` of each mean sub-model (raw observations).
    pub window: usize,
    /// Window length of each variance sub-model; defaults to `window`.
    pub window_var: Option<usize>,
    /// Minimum number of observations before any fitting happens (`T0`).
    pub min_points: usize,
    /// Fraction of `T` worth of new observations that triggers an
    /// incremental refit of the open sub-model (`gamma`).
    pub update_fraction: f64,
    /// Explicit row count `L` of each sub-model matrix, when set.
    pub rows: Option<usize>,
    /// Column-to-row ratio used to derive the row count when `rows` is not
    /// set.
    pub col_to_row_ratio: usize,
    /// Soft singular-value thresholding in the fit primitive.
    pub soft_threshold: bool,
    /// Aggregation method applied when bucketing raw observations.
    pub aggregation: AggMethod,
    /// Aggregation interval (time units per canonical offset).
    pub agg_interval: f64,
    /// Canonical start time; resolved from the source minimum when absent.
    pub start_time: Option<i64>,
    /// Variance series trains on squared residuals (`true`) or on squared
    /// raw observations, recovering the variance at query time (`false`).
    pub direct_var: bool,
    /// Forecast coefficient averaging policy.
    #[serde(default)]
    pub coeff_window: CoeffWindow,
}

impl IndexConfig {
    /// A config with the original system's defaults, tracking
    /// `relation.value_column` over `relation.time_column`.
    pub fn new(index_name: &str, relation: &str, value_column: &str, time_column: &str) -> Self {
        IndexConfig {
            index_name: index_name.to_string(),
            relation: relation.to_string(),
            value_column: value_column.to_string(),
            time_column: time_column.to_string(),
            rank: 3,
            rank_var: 1,
            window: 100_000,
            window_var: None,
            min_points: 1000,
            update_fraction: 0.2,
            rows: None,
            col_to_row_ratio: 10,
            soft_threshold: false,
            aggregation: AggMethod::Average,
            agg_interval: 1.0,
            start_time: None,
            direct_var: true,
            coeff_window: CoeffWindow::default(),
        }
    }

    /// Resolve the mean-series matrix geometry.
    pub fn geometry(&self) -> Result<WindowShape, ConfigError> {
        WindowShape::resolve(self.window, self.rows, self.col_to_row_ratio)
    }

    /// Resolve the variance-series matrix geometry.
    pub fn geometry_var(&self) -> Result<WindowShape, ConfigError> {
        let t = self.window_var.unwrap_or(self.window);
        WindowShape::resolve(t, self.rows, self.col_to_row_ratio)
    }

    /// Check every cross-field constraint that does not require storage
    /// access.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rank == 0 {
            return Err(ConfigError::ZeroRank);
        }
        if !(self.update_fraction > 0.0 && self.update_fraction < 1.0) {
            return Err(ConfigError::BadUpdateFraction(self.update_fraction));
        }
        // Sub-unit intervals cannot be strictly inverted over an integer
        // time domain.
        if self.agg_interval < 1.0 {
            return Err(ConfigError::BadInterval(self.agg_interval));
        }
        let shape = self.geometry()?;
        if self.rank >= shape.rows {
            return Err(ConfigError::RankTooLarge {
                rank: self.rank,
                rows: shape.rows,
            });
        }
        if self.rank_var > 0 {
            let shape_var = self.geometry_var()?;
            if self.rank_var >= shape_var.rows {
                return Err(ConfigError::RankTooLarge {
                    rank: self.rank_var,
                    rows: shape_var.rows,
                });
            }
        }
        Ok(())
    }
}

/// Concrete matrix geometry of one model series: `rows x cols` reshaped
/// windows of `window = rows * cols` raw observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowShape {
    pub rows: usize,
    pub cols: usize,
}

impl WindowShape {
    /// Derive `N` and `M` from the requested window length. The window is
    /// rounded down to `N * M` when not divisible, and `M` is forced even so
    /// the `T/2` sub-model stride aligns with whole columns.
    pub fn resolve(
        window: usize,
        rows: Option<usize>,
        col_to_row_ratio: usize,
    ) -> Result<Self, ConfigError> {
        if window < 4 {
            return Err(ConfigError::WindowTooSmall(window));
        }
        let n = match rows {
            Some(n) => n,
            None => {
                if col_to_row_ratio == 0 {
                    return Err(ConfigError::ZeroRatio);
                }
                let n = ((window as f64 / col_to_row_ratio as f64).sqrt()).round() as usize;
                n.max(2)
            }
        };
        if n < 2 {
            return Err(ConfigError::TooFewRows(n));
        }
        let mut m = window / n;
        if m % 2 != 0 {
            m -= 1;
        }
        if m < 2 {
            return Err(ConfigError::WindowTooSmall(window));
        }
        if n * m != window {
            log::debug!(
                "window {} is not an even multiple of {} rows; using effective window {}",
                window,
                n,
                n * m
            );
        }
        Ok(WindowShape { rows: n, cols: m })
    }

    /// Effective window length `T = N * M`.
    pub fn window(&self) -> usize {
        self.rows * self.cols
    }

    /// Sub-model stride `T / 2`.
    pub fn stride(&self) -> usize {
        self.window() / 2
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("rank must be at least 1")]
    ZeroRank,
    #[error("retained rank {rank} must be smaller than the {rows} matrix rows")]
    RankTooLarge { rank: usize, rows: usize },
    #[error("update fraction (gamma) must lie in (0, 1), got {0}")]
    BadUpdateFraction(f64),
    #[error("aggregation interval must be at least one time unit, got {0}")]
    BadInterval(f64),
    #[error("window length {0} is too small to reshape into an overlapping matrix")]
    WindowTooSmall(usize),
    #[error("column-to-row ratio must be at least 1")]
    ZeroRatio,
    #[error("sub-model matrices need at least 2 rows, got {0}")]
    TooFewRows(usize),
}
