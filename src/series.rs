//! Sub-model chains: overlapping-window ingestion and counters.
//!
//! A [`ModelSeries`] owns an append-only chain of [`Submodel`]s, each a
//! low-rank factorization of a `rows x cols` reshaped window of the raw
//! series. Consecutive windows overlap by half: sub-model `m` starts at
//! offset `m * T/2`. Ingestion is chunked to `T/2` boundaries so the raw
//! tail buffer always covers every window still being fitted.
//!
//! Counters are mutated only here, through [`ModelSeries::ingest`], and hold
//! the invariant `recon_index <= m_update_index <= time_series_index`.

use itertools::{Itertools, MinMaxResult};
use ndarray::{Array1, Array2, ShapeBuilder, s};

use crate::config::WindowShape;
use crate::fit::{FitError, WindowFit};
use crate::reconstruct::{FactorSlice, FactorSource, QueryError};
use crate::storage::{SeriesCounters, SubmodelMeta};

/// One overlapping-window low-rank factorization unit.
#[derive(Debug, Clone)]
pub struct Submodel {
    /// Raw offset of the window's first observation.
    pub start: usize,
    /// Matrix rows `N`.
    pub rows: usize,
    /// Matrix column capacity `M`.
    pub cols: usize,
    /// Columns covered by the current factorization.
    pub filled_cols: usize,
    /// Row factors (`rows x k`); empty when not hydrated in memory.
    pub u: Array2<f64>,
    /// Retained singular values.
    pub s: Array1<f64>,
    /// Column factors (`filled_cols x k`); empty when not hydrated.
    pub v: Array2<f64>,
    /// Order-`rows - 1` recurrence coefficients.
    pub weights: Array1<f64>,
    pub imputation_score: f64,
    pub forecast_score: f64,
    pub times_updated: u32,
    pub times_reconstructed: u32,
    /// Changed since last persisted write.
    pub dirty: bool,
}

impl Submodel {
    fn open(start: usize, rows: usize, cols: usize) -> Self {
        Submodel {
            start,
            rows,
            cols,
            filled_cols: 0,
            u: Array2::zeros((0, 0)),
            s: Array1::zeros(0),
            v: Array2::zeros((0, 0)),
            weights: Array1::zeros(0),
            imputation_score: 0.0,
            forecast_score: 0.0,
            times_updated: 0,
            times_reconstructed: 0,
            dirty: false,
        }
    }

    fn from_meta(meta: &SubmodelMeta) -> Self {
        let mut sm = Submodel::open(meta.start, meta.rows, meta.cols);
        sm.filled_cols = meta.filled_cols;
        sm.times_updated = meta.times_updated;
        sm.times_reconstructed = meta.times_reconstructed;
        sm.imputation_score = meta.imputation_score;
        sm.forecast_score = meta.forecast_score;
        sm
    }

    /// A complete sub-model has had its one full-window factorization and is
    /// immutable from then on.
    pub fn complete(&self) -> bool {
        self.filled_cols == self.cols && self.times_reconstructed > 0
    }

    /// Factors present in memory (reloaded chains hydrate only the last
    /// sub-model).
    pub fn hydrated(&self) -> bool {
        self.v.nrows() > 0
    }

    pub fn meta(&self, modelno: usize) -> SubmodelMeta {
        SubmodelMeta {
            modelno,
            rows: self.rows,
            cols: self.cols,
            filled_cols: self.filled_cols,
            start: self.start,
            times_updated: self.times_updated,
            times_reconstructed: self.times_reconstructed,
            imputation_score: self.imputation_score,
            forecast_score: self.forecast_score,
        }
    }
}

/// Ordered chain of sub-models for one signal (mean or variance).
#[derive(Debug)]
pub struct ModelSeries {
    /// Table prefix under which this series persists.
    pub name: String,
    pub rank: usize,
    pub shape: WindowShape,
    pub min_points: usize,
    pub update_fraction: f64,
    pub soft_threshold: bool,
    time_series_index: usize,
    m_update_index: usize,
    recon_index: usize,
    pub models: Vec<Submodel>,
    tail: Vec<f64>,
}

impl ModelSeries {
    pub fn new(
        name: &str,
        rank: usize,
        shape: WindowShape,
        min_points: usize,
        update_fraction: f64,
        soft_threshold: bool,
    ) -> Self {
        ModelSeries {
            name: name.to_string(),
            rank,
            shape,
            min_points,
            update_fraction,
            soft_threshold,
            time_series_index: 0,
            m_update_index: 0,
            recon_index: 0,
            models: Vec::new(),
            tail: Vec::new(),
        }
    }

    /// Rebuild a series from persisted counters and sub-model metadata.
    /// Factors stay unhydrated; callers hydrate the last sub-model.
    pub fn restore(
        name: &str,
        rank: usize,
        shape: WindowShape,
        min_points: usize,
        update_fraction: f64,
        soft_threshold: bool,
        counters: &SeriesCounters,
        metas: &[SubmodelMeta],
    ) -> Self {
        let mut series = ModelSeries::new(
            name,
            rank,
            shape,
            min_points,
            update_fraction,
            soft_threshold,
        );
        series.time_series_index = counters.time_series_index;
        series.m_update_index = counters.m_update_index;
        series.recon_index = counters.recon_index;
        series.models = metas.iter().map(Submodel::from_meta).collect();
        series
    }

    /// Count of raw observations ingested so far.
    pub fn time_series_index(&self) -> usize {
        self.time_series_index
    }

    /// Boundary between the imputation and forecast regimes.
    pub fn m_update_index(&self) -> usize {
        self.m_update_index
    }

    /// Observations covered by the most recent full refactorization.
    pub fn recon_index(&self) -> usize {
        self.recon_index
    }

    /// The retained raw tail (at most one window's worth).
    pub fn tail(&self) -> &[f64] {
        &self.tail
    }

    /// Install a recovered tail buffer (reload path).
    pub fn set_tail(&mut self, mut tail: Vec<f64>) {
        let window = self.shape.window();
        if tail.len() > window {
            tail.drain(..tail.len() - window);
        }
        self.tail = tail;
    }

    /// Counters plus aggregate quality scores for the metadata record.
    pub fn counters(&self) -> SeriesCounters {
        let fitted: Vec<&Submodel> = self.models.iter().filter(|m| m.filled_cols > 0).collect();
        let mean_of = |f: fn(&Submodel) -> f64| {
            if fitted.is_empty() {
                0.0
            } else {
                fitted.iter().map(|m| f(m)).sum::<f64>() / fitted.len() as f64
            }
        };
        SeriesCounters {
            time_series_index: self.time_series_index,
            m_update_index: self.m_update_index,
            recon_index: self.recon_index,
            rows: self.shape.rows,
            cols: self.shape.cols,
            submodels: self.models.len(),
            imputation_score: mean_of(|m| m.imputation_score),
            forecast_score: mean_of(|m| m.forecast_score),
        }
    }

    /// Install hydrated factors on one sub-model (reload path; does not mark
    /// it dirty).
    pub fn hydrate(
        &mut self,
        modelno: usize,
        u: Array2<f64>,
        s: Array1<f64>,
        v: Array2<f64>,
        weights: Array1<f64>,
    ) {
        if let Some(sm) = self.models.get_mut(modelno) {
            sm.u = u;
            sm.s = s;
            sm.v = v;
            sm.weights = weights;
        }
    }

    /// Range of sub-model numbers touched since the last persisted write.
    pub fn dirty_range(&self) -> Option<(usize, usize)> {
        match self.models.iter().positions(|m| m.dirty).minmax() {
            MinMaxResult::NoElements => None,
            MinMaxResult::OneElement(i) => Some((i, i)),
            MinMaxResult::MinMax(first, last) => Some((first, last)),
        }
    }

    pub fn clear_dirty(&mut self) {
        for m in &mut self.models {
            m.dirty = false;
        }
    }

    /// Feed new raw observations through the fit primitive.
    ///
    /// Observations are consumed in chunks aligned to `T/2` boundaries so
    /// that whenever a window completes, the tail buffer still holds all of
    /// its raw data.
    pub fn ingest<F: WindowFit>(&mut self, obs: &[f64], fit: &F) -> Result<(), FitError> {
        let half = self.shape.stride();
        let mut i = 0;
        while i < obs.len() {
            let room = half - (self.time_series_index % half);
            let n = room.min(obs.len() - i);
            self.push_tail(&obs[i..i + n]);
            self.time_series_index += n;
            i += n;
            self.fit_pass(fit)?;
        }
        debug_assert!(
            self.recon_index <= self.m_update_index
                && self.m_update_index <= self.time_series_index
        );
        Ok(())
    }

    fn push_tail(&mut self, obs: &[f64]) {
        self.tail.extend_from_slice(obs);
        let window = self.shape.window();
        if self.tail.len() > window {
            let excess = self.tail.len() - window;
            self.tail.drain(..excess);
        }
    }

    fn fit_pass<F: WindowFit>(&mut self, fit: &F) -> Result<(), FitError> {
        if self.time_series_index < self.min_points {
            return Ok(());
        }
        let half = self.shape.stride();
        let window = self.shape.window();
        let rows = self.shape.rows;

        let expected = (self.time_series_index - 1) / half + 1;
        while self.models.len() < expected {
            let start = self.models.len() * half;
            log::debug!(
                "series {}: opening sub-model {} at offset {}",
                self.name,
                self.models.len(),
                start
            );
            self.models
                .push(Submodel::open(start, rows, self.shape.cols));
        }

        let tail_start = self.time_series_index - self.tail.len();
        let gamma_points =
            ((self.update_fraction * window as f64).ceil() as usize).max(1);
        let last = self.models.len() - 1;

        for m in 0..self.models.len() {
            let (start, filled_cols, complete) = {
                let sm = &self.models[m];
                (sm.start, sm.filled_cols, sm.complete())
            };
            if complete {
                continue;
            }
            let avail = (self.time_series_index - start).min(window);
            let (cols_to_fit, full) = if avail == window {
                (self.shape.cols, true)
            } else if m == last {
                let full_cols = avail / rows;
                if full_cols == filled_cols || full_cols == 0 {
                    continue;
                }
                let new_points = (full_cols - filled_cols) * rows;
                if filled_cols > 0 && new_points < gamma_points {
                    continue;
                }
                (full_cols, false)
            } else {
                continue;
            };

            if start < tail_start {
                log::warn!(
                    "series {}: raw tail no longer covers sub-model {} (start {}, tail from {}); skipping fit",
                    self.name,
                    m,
                    start,
                    tail_start
                );
                continue;
            }
            let lo = start - tail_start;
            let len = rows * cols_to_fit;
            let matrix = Array2::from_shape_vec(
                (rows, cols_to_fit).f(),
                self.tail[lo..lo + len].to_vec(),
            )?;
            let factors = fit.fit(matrix.view(), self.rank, self.soft_threshold)?;

            let sm = &mut self.models[m];
            sm.u = factors.u;
            sm.s = factors.s;
            sm.v = factors.v;
            sm.weights = factors.weights;
            sm.imputation_score = factors.imputation_score;
            sm.forecast_score = factors.forecast_score;
            sm.filled_cols = cols_to_fit;
            sm.dirty = true;
            if full {
                sm.times_reconstructed += 1;
                self.recon_index = self.recon_index.max(start + window);
            } else {
                sm.times_updated += 1;
            }
            self.m_update_index = self.m_update_index.max(start + rows * cols_to_fit);
        }
        Ok(())
    }
}

/// Serve the reconstruction engine straight from the in-memory chain (used
/// for the variance residual path during ingestion). Unhydrated sub-models
/// report zero coverage; the blend rule doubles their overlap partner.
impl FactorSource for ModelSeries {
    fn last_model(&self) -> Option<usize> {
        self.models.len().checked_sub(1)
    }

    fn stride(&self) -> usize {
        self.shape.stride()
    }

    fn meta(&self, modelno: usize) -> Result<SubmodelMeta, QueryError> {
        let sm = self
            .models
            .get(modelno)
            .ok_or(QueryError::MissingSubmodel { modelno })?;
        let mut meta = sm.meta(modelno);
        if !sm.hydrated() {
            meta.filled_cols = 0;
        }
        Ok(meta)
    }

    fn factors(&self, modelno: usize, cols: (usize, usize)) -> Result<FactorSlice, QueryError> {
        let sm = self
            .models
            .get(modelno)
            .ok_or(QueryError::MissingSubmodel { modelno })?;
        if cols.1 >= sm.v.nrows() {
            return Err(QueryError::IncompleteFactors { modelno });
        }
        Ok(FactorSlice {
            u: sm.u.clone(),
            s: sm.s.clone(),
            v: sm.v.slice(s![cols.0..=cols.1, ..]).to_owned(),
            first_col: cols.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::SvdFit;

    fn sine(n: usize) -> Vec<f64> {
        let w = 2.0 * std::f64::consts::PI / 37.0;
        (0..n).map(|t| (w * t as f64).sin()).collect()
    }

    fn series() -> ModelSeries {
        let shape = WindowShape::resolve(100, Some(10), 10).unwrap();
        ModelSeries::new("ix", 2, shape, 10, 0.2, false)
    }

    #[test]
    fn counters_hold_invariant_through_ingestion() {
        let mut s = series();
        let data = sine(250);
        // Feed in awkward batch sizes.
        for chunk in data.chunks(37) {
            s.ingest(chunk, &SvdFit).unwrap();
            assert!(s.recon_index() <= s.m_update_index());
            assert!(s.m_update_index() <= s.time_series_index());
        }
        assert_eq!(s.time_series_index(), 250);
        // Sub-models start every 50 offsets: 0, 50, 100, 150, 200.
        assert_eq!(s.models.len(), 5);
        // Sub-model 3 ([150, 250)) completed; 4 is partially fitted.
        assert_eq!(s.recon_index(), 250);
        assert_eq!(s.m_update_index(), 250);
        assert_eq!(s.models[4].filled_cols, 5);
        assert!(s.models[4].times_updated >= 1);
    }

    #[test]
    fn nothing_is_fitted_below_min_points() {
        let mut s = series();
        s.ingest(&sine(9), &SvdFit).unwrap();
        assert_eq!(s.time_series_index(), 9);
        assert_eq!(s.m_update_index(), 0);
        assert!(s.models.is_empty());

        s.ingest(&sine(1), &SvdFit).unwrap();
        assert_eq!(s.m_update_index(), 10);
    }

    #[test]
    fn tail_is_capped_at_one_window() {
        let mut s = series();
        s.ingest(&sine(350), &SvdFit).unwrap();
        assert_eq!(s.tail().len(), 100);
        // Tail holds offsets [250, 350).
        let data = sine(350);
        assert_eq!(s.tail()[0], data[250]);
    }

    #[test]
    fn dirty_range_tracks_touched_submodels() {
        let mut s = series();
        s.ingest(&sine(250), &SvdFit).unwrap();
        assert_eq!(s.dirty_range(), Some((0, 4)));
        s.clear_dirty();
        assert_eq!(s.dirty_range(), None);

        // 20 more points cross the gamma threshold for sub-model 4 and open
        // sub-model 5 at offset 250.
        let more: Vec<f64> = sine(270)[250..].to_vec();
        s.ingest(&more, &SvdFit).unwrap();
        assert_eq!(s.models.len(), 6);
        assert_eq!(s.dirty_range(), Some((4, 5)));
    }

    #[test]
    fn completed_submodels_are_immutable() {
        let mut s = series();
        s.ingest(&sine(250), &SvdFit).unwrap();
        let recons: Vec<u32> = s.models.iter().map(|m| m.times_reconstructed).collect();
        assert_eq!(recons[..4], [1, 1, 1, 1]);
        s.clear_dirty();
        s.ingest(&sine(10), &SvdFit).unwrap();
        for m in 0..4 {
            assert_eq!(s.models[m].times_reconstructed, 1);
            assert!(!s.models[m].dirty);
        }
    }
}
