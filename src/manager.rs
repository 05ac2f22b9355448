//! # Index lifecycle
//!
//! [`PredictiveIndex`] owns the two model series (mean and variance) and
//! drives their lifecycle against a [`Storage`] backend: initial `create`
//! over existing history, trigger-driven incremental `update`s, persistence
//! of dirty sub-models, `reload` in a fresh process, and best-effort
//! `delete`.
//!
//! Concurrency contract: at most one `update` per index at a time (the host
//! serializes); queries may run concurrently and can observe a torn
//! sub-model while a persist is mid-flight. That window is accepted
//! soft-state behavior, the index is fully rebuildable from the source
//! relation.

use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, IndexConfig, WindowShape};
use crate::fit::{FitError, SvdFit, WindowFit};
use crate::reconstruct::{FactorSource, QueryError, StoredSeries, impute_range};
use crate::series::ModelSeries;
use crate::storage::{
    Coefficient, ColFactor, IndexMeta, RegistryEntry, RowFactor, SingularValues, Storage,
    StorageError, SubmodelMeta, TimeBound,
};
use crate::timemap::{TimeMapError, TimeMapper};

/// Distinguishes the initial table-creating write from incremental
/// delete-then-reinsert writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    Create,
    Update,
}

/// A predictive index over one tracked column: identity, configuration, and
/// the two sub-model chains.
#[derive(Debug)]
pub struct PredictiveIndex<F: WindowFit = SvdFit> {
    config: IndexConfig,
    start_time: i64,
    mapper: TimeMapper,
    mean: ModelSeries,
    variance: Option<ModelSeries>,
    fit: F,
    cache_dir: Option<PathBuf>,
}

impl<F: WindowFit> PredictiveIndex<F> {
    pub fn name(&self) -> &str {
        &self.config.index_name
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn mean(&self) -> &ModelSeries {
        &self.mean
    }

    pub fn variance(&self) -> Option<&ModelSeries> {
        self.variance.as_ref()
    }

    fn variance_series_name(index_name: &str) -> String {
        format!("{index_name}_variance")
    }

    /// Build the index over everything currently in the source relation,
    /// persist it, and install the change-notification trigger.
    pub fn create<S: Storage>(
        storage: &mut S,
        mut config: IndexConfig,
        fit: F,
        cache_dir: Option<PathBuf>,
    ) -> Result<Self, IndexError> {
        config.validate()?;
        let start_time = match config.start_time {
            Some(t) => t,
            None => storage
                .time_bound(&config.relation, &config.time_column, TimeBound::Min)?
                .ok_or_else(|| IndexError::EmptySource(config.relation.clone()))?,
        };
        config.start_time = Some(start_time);

        let shape = config.geometry()?;
        let mean = ModelSeries::new(
            &config.index_name,
            config.rank,
            shape,
            config.min_points,
            config.update_fraction,
            config.soft_threshold,
        );
        let variance = if config.rank_var > 0 {
            Some(ModelSeries::new(
                &Self::variance_series_name(&config.index_name),
                config.rank_var,
                config.geometry_var()?,
                config.min_points,
                config.update_fraction,
                config.soft_threshold,
            ))
        } else {
            None
        };

        let mapper = TimeMapper::new(start_time, config.agg_interval);
        let mut index = PredictiveIndex {
            config,
            start_time,
            mapper,
            mean,
            variance,
            fit,
            cache_dir,
        };

        let end = storage.time_bound(
            &index.config.relation,
            &index.config.time_column,
            TimeBound::Max,
        )?;
        if let Some(end) = end {
            let o2 = index.mapper.offset(end)?;
            let obs = index.pull_range(storage, 0, o2)?;
            if !obs.is_empty() {
                index.update_model(&obs)?;
                index.persist(storage, PersistMode::Create)?;
            }
        }

        // Reinstall rather than stack triggers when recreating an index.
        storage.remove_trigger(&index.config.relation)?;
        storage.install_trigger(&index.config.relation, &index.config.index_name)?;
        log::info!(
            "created predictive index '{}' over {} observations ({} sub-models)",
            index.name(),
            index.mean.time_series_index(),
            index.mean.models.len()
        );
        Ok(index)
    }

    /// Ingest observations strictly newer than the last seen offset and
    /// persist the touched sub-models. Returns `false` (and does nothing)
    /// when no new observations exist, so re-invocation is idempotent.
    pub fn update<S: Storage>(&mut self, storage: &mut S) -> Result<bool, IndexError> {
        let Some(end) = storage.time_bound(
            &self.config.relation,
            &self.config.time_column,
            TimeBound::Max,
        )?
        else {
            return Ok(false);
        };
        let o_end = self.mapper.offset(end)?;
        let seen = self.mean.time_series_index();
        if o_end < seen {
            log::debug!("index '{}': no offsets beyond {}", self.name(), seen);
            return Ok(false);
        }
        let obs = self.pull_range(storage, seen, o_end)?;
        if obs.is_empty() {
            return Ok(false);
        }
        self.update_model(&obs)?;
        self.persist(storage, PersistMode::Update)?;
        Ok(true)
    }

    /// Aggregated observations for `from ..= to`, stopping short at the
    /// first empty bucket. Offsets must stay contiguous, so everything at
    /// and beyond a gap is deferred until the gap is backfilled; an
    /// ingestion pass keeps making progress over the prefix instead of
    /// failing on every retry.
    fn pull_range<S: Storage>(
        &self,
        storage: &S,
        from: usize,
        to: usize,
    ) -> Result<Vec<f64>, IndexError> {
        match storage.series_range(
            &self.config.relation,
            &self.config.value_column,
            &self.config.time_column,
            (from, to),
            self.config.aggregation,
            self.config.agg_interval,
            self.start_time,
        ) {
            Ok(obs) => Ok(obs),
            Err(StorageError::MissingObservations { offset }) => {
                log::warn!(
                    "index '{}': no observations aggregate into offset {}; ingesting up to the gap",
                    self.name(),
                    offset
                );
                if offset == from {
                    return Ok(Vec::new());
                }
                Ok(storage.series_range(
                    &self.config.relation,
                    &self.config.value_column,
                    &self.config.time_column,
                    (from, offset - 1),
                    self.config.aggregation,
                    self.config.agg_interval,
                    self.start_time,
                )?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Feed new observations to the mean chain, then derive and feed the
    /// variance chain.
    pub fn update_model(&mut self, obs: &[f64]) -> Result<(), IndexError> {
        // The variance chain trails the mean chain; keep the raw slack
        // between them before the mean tail slides.
        let lag_buffer = match (&self.variance, self.config.direct_var) {
            (Some(var), true) => {
                let lag = self.mean.time_series_index() - var.time_series_index();
                let tail = self.mean.tail();
                let take = lag.min(tail.len());
                if take < lag {
                    log::warn!(
                        "index '{}': variance lag {} exceeds the retained tail of {} points",
                        self.name(),
                        lag,
                        tail.len()
                    );
                }
                Some(tail[tail.len() - take..].to_vec())
            }
            _ => None,
        };

        self.mean.ingest(obs, &self.fit)?;

        if let Some(var) = self.variance.as_mut() {
            if self.config.direct_var {
                let from = var.time_series_index();
                let to = self.mean.m_update_index();
                if to > from {
                    let means = impute_range(&self.mean, from, to - 1)?;
                    let mut aligned = lag_buffer.unwrap_or_default();
                    aligned.extend_from_slice(obs);
                    let n = means.len().min(aligned.len());
                    let residuals: Vec<f64> = aligned[..n]
                        .iter()
                        .zip(&means[..n])
                        .map(|(x, m)| (x - m) * (x - m))
                        .collect();
                    var.ingest(&residuals, &self.fit)?;
                }
            } else {
                let squared: Vec<f64> = obs.iter().map(|x| x * x).collect();
                var.ingest(&squared, &self.fit)?;
            }
        }
        Ok(())
    }

    /// Write every dirty sub-model, refresh the coefficient view, and
    /// rewrite the metadata and registry records.
    pub fn persist<S: Storage>(
        &mut self,
        storage: &mut S,
        mode: PersistMode,
    ) -> Result<(), IndexError> {
        write_series(storage, &mut self.mean, mode)?;
        if let Some(var) = self.variance.as_mut() {
            write_series(storage, var, mode)?;
        }

        let meta = self.index_meta();
        storage.write_index_meta(&self.config.index_name, &meta)?;
        storage.register_index(&RegistryEntry {
            index_name: self.config.index_name.clone(),
            relation: self.config.relation.clone(),
            value_column: self.config.value_column.clone(),
            time_column: self.config.time_column.clone(),
            uq: self.variance.is_some(),
            agg_interval: self.config.agg_interval,
            initial_time: self.start_time,
            last_time: self.mapper.time(self.mean.time_series_index()),
        })?;

        self.write_tail_cache();
        Ok(())
    }

    fn index_meta(&self) -> IndexMeta {
        IndexMeta {
            relation: self.config.relation.clone(),
            value_column: self.config.value_column.clone(),
            time_column: self.config.time_column.clone(),
            rank: self.config.rank,
            rank_var: self.config.rank_var,
            min_points: self.config.min_points,
            update_fraction: self.config.update_fraction,
            soft_threshold: self.config.soft_threshold,
            aggregation: self.config.aggregation,
            agg_interval: self.config.agg_interval,
            start_time: self.start_time,
            direct_var: self.config.direct_var,
            coeff_window: self.config.coeff_window,
            mean: self.mean.counters(),
            variance: self.variance.as_ref().map(|v| v.counters()),
        }
    }

    // --- ephemeral tail cache -------------------------------------------

    fn cache_path(dir: &Path, index_name: &str, suffix: &str) -> PathBuf {
        dir.join(format!("{index_name}_{suffix}.toml"))
    }

    /// Best effort only; a failed write costs one backend re-query on the
    /// next reload.
    fn write_tail_cache(&self) {
        let Some(dir) = &self.cache_dir else { return };
        let mut artifacts = vec![("ts", self.mean.tail().to_vec())];
        if let Some(var) = &self.variance {
            artifacts.push(("var", var.tail().to_vec()));
        }
        for (suffix, values) in artifacts {
            let path = Self::cache_path(dir, &self.config.index_name, suffix);
            let cache = TailCache { values };
            match toml::to_string(&cache) {
                Ok(body) => {
                    if let Err(e) = fs::write(&path, body) {
                        log::warn!("could not write tail cache {}: {}", path.display(), e);
                    }
                }
                Err(e) => log::warn!("could not serialize tail cache: {}", e),
            }
        }
    }

    fn read_tail_cache(dir: &Path, index_name: &str, suffix: &str) -> Option<Vec<f64>> {
        let path = Self::cache_path(dir, index_name, suffix);
        let body = fs::read_to_string(&path).ok()?;
        // Single use: the cache is only trusted immediately after a persist.
        let _ = fs::remove_file(&path);
        match toml::from_str::<TailCache>(&body) {
            Ok(cache) => Some(cache.values),
            Err(e) => {
                log::warn!("ignoring unreadable tail cache {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Rebuild an index from its persisted state. Only the last sub-model's
    /// factors are hydrated; older sub-models are served from storage at
    /// query time.
    pub fn reload<S: Storage>(
        storage: &S,
        index_name: &str,
        fit: F,
        cache_dir: Option<PathBuf>,
    ) -> Result<Self, IndexError> {
        let meta = storage.read_index_meta(index_name).map_err(|e| match e {
            StorageError::MissingIndex(name) => IndexError::UnknownIndex(name),
            other => IndexError::Storage(other),
        })?;

        let shape = WindowShape {
            rows: meta.mean.rows,
            cols: meta.mean.cols,
        };
        let config = IndexConfig {
            index_name: index_name.to_string(),
            relation: meta.relation.clone(),
            value_column: meta.value_column.clone(),
            time_column: meta.time_column.clone(),
            rank: meta.rank,
            rank_var: meta.rank_var,
            window: shape.window(),
            window_var: meta.variance.as_ref().map(|c| c.rows * c.cols),
            min_points: meta.min_points,
            update_fraction: meta.update_fraction,
            rows: Some(meta.mean.rows),
            col_to_row_ratio: (meta.mean.cols / meta.mean.rows).max(1),
            soft_threshold: meta.soft_threshold,
            aggregation: meta.aggregation,
            agg_interval: meta.agg_interval,
            start_time: Some(meta.start_time),
            direct_var: meta.direct_var,
            coeff_window: meta.coeff_window,
        };

        let mut mean = ModelSeries::restore(
            index_name,
            meta.rank,
            shape,
            meta.min_points,
            meta.update_fraction,
            meta.soft_threshold,
            &meta.mean,
            &storage.all_model_meta(index_name)?,
        );
        hydrate_last(storage, &mut mean, &meta, index_name, &meta.mean)?;

        let variance = match &meta.variance {
            Some(counters) if meta.rank_var > 0 => {
                let name = Self::variance_series_name(index_name);
                let var_shape = WindowShape {
                    rows: counters.rows,
                    cols: counters.cols,
                };
                let mut var = ModelSeries::restore(
                    &name,
                    meta.rank_var,
                    var_shape,
                    meta.min_points,
                    meta.update_fraction,
                    meta.soft_threshold,
                    counters,
                    &storage.all_model_meta(&name)?,
                );
                hydrate_last(storage, &mut var, &meta, &name, counters)?;
                Some(var)
            }
            _ => None,
        };

        let mapper = TimeMapper::new(meta.start_time, meta.agg_interval);
        let mut index = PredictiveIndex {
            start_time: meta.start_time,
            mapper,
            mean,
            variance,
            fit,
            cache_dir,
            config,
        };
        index.restore_tails(storage, &meta);
        log::info!(
            "reloaded predictive index '{}' ({} observations seen)",
            index.name(),
            index.mean.time_series_index()
        );
        Ok(index)
    }

    /// Restore the raw tail buffers from the ephemeral cache, falling back
    /// to backend re-queries. The fallback is a safety net and must never
    /// fail the reload; on error the tails simply start empty.
    fn restore_tails<S: Storage>(&mut self, storage: &S, meta: &IndexMeta) {
        let window = self.mean.shape.window();
        let tsi = self.mean.time_series_index();
        let cached = self
            .cache_dir
            .as_deref()
            .and_then(|dir| Self::read_tail_cache(dir, &self.config.index_name, "ts"));
        let tail = match cached {
            Some(t) => t,
            None if tsi == 0 => Vec::new(),
            None => {
                let from = tsi.saturating_sub(window);
                match storage.series_range(
                    &self.config.relation,
                    &self.config.value_column,
                    &self.config.time_column,
                    (from, tsi - 1),
                    self.config.aggregation,
                    self.config.agg_interval,
                    self.start_time,
                ) {
                    Ok(t) => t,
                    Err(e) => {
                        log::warn!(
                            "index '{}': could not recover the raw tail from storage: {}",
                            self.name(),
                            e
                        );
                        Vec::new()
                    }
                }
            }
        };
        self.mean.set_tail(tail);

        if let Some(var) = self.variance.as_mut() {
            let cached = self
                .cache_dir
                .as_deref()
                .and_then(|dir| Self::read_tail_cache(dir, &self.config.index_name, "var"));
            let tail = match cached {
                Some(t) => t,
                None => match recover_variance_tail(storage, &self.config, meta, var) {
                    Ok(t) => t,
                    Err(e) => {
                        log::warn!(
                            "index '{}': could not recover the variance tail: {}",
                            self.config.index_name,
                            e
                        );
                        Vec::new()
                    }
                },
            };
            var.set_tail(tail);
        }
    }

    /// Drop every backing table, registry entry, trigger, and cache file of
    /// `index_name`. Tolerates arbitrary partial state.
    pub fn delete<S: Storage>(
        storage: &mut S,
        index_name: &str,
        cache_dir: Option<&Path>,
    ) -> Result<(), IndexError> {
        let relation = storage
            .read_index_meta(index_name)
            .ok()
            .map(|m| m.relation)
            .or_else(|| {
                storage.registry().ok().and_then(|entries| {
                    entries
                        .into_iter()
                        .find(|e| e.index_name == index_name)
                        .map(|e| e.relation)
                })
            });

        storage.drop_series_tables(index_name)?;
        storage.drop_series_tables(&Self::variance_series_name(index_name))?;
        storage.drop_index_meta(index_name)?;
        storage.deregister_index(index_name)?;
        if let Some(relation) = relation {
            storage.remove_trigger(&relation)?;
        }
        if let Some(dir) = cache_dir {
            for suffix in ["ts", "var"] {
                let _ = fs::remove_file(Self::cache_path(dir, index_name, suffix));
            }
        }
        log::info!("deleted predictive index '{}'", index_name);
        Ok(())
    }
}

/// On-disk form of the ephemeral raw-tail cache.
#[derive(Serialize, Deserialize)]
struct TailCache {
    values: Vec<f64>,
}

fn write_series<S: Storage>(
    storage: &mut S,
    series: &mut ModelSeries,
    mode: PersistMode,
) -> Result<(), StorageError> {
    if mode == PersistMode::Create {
        storage.create_series_tables(&series.name)?;
    }
    let dirty: Vec<usize> = series.models.iter().positions(|m| m.dirty).collect();
    if dirty.is_empty() {
        return Ok(());
    }
    if mode == PersistMode::Update {
        // Clear each dirty sub-model individually. The dirty set can have
        // holes (a sub-model below the refit threshold between a completing
        // one and a newly opened one), and a clean sub-model's rows must
        // survive the rewrite.
        for &m in &dirty {
            match storage.clear_model_range(&series.name, m, m) {
                // The index may have been created before any data existed.
                Err(StorageError::MissingSeries(_)) => {
                    storage.create_series_tables(&series.name)?;
                    break;
                }
                other => other?,
            }
        }
    }

    let mut u_rows: Vec<RowFactor> = Vec::new();
    let mut v_rows: Vec<ColFactor> = Vec::new();
    let mut s_rows: Vec<SingularValues> = Vec::new();
    let mut c_rows: Vec<Coefficient> = Vec::new();
    let mut m_rows: Vec<SubmodelMeta> = Vec::new();
    for &m in &dirty {
        let sm = &series.models[m];
        for r in 0..sm.u.nrows() {
            u_rows.push(RowFactor {
                modelno: m,
                row: r,
                values: sm.u.row(r).to_vec(),
            });
        }
        for c in 0..sm.v.nrows() {
            v_rows.push(ColFactor {
                modelno: m,
                col: c,
                values: sm.v.row(c).to_vec(),
            });
        }
        s_rows.push(SingularValues {
            modelno: m,
            values: sm.s.to_vec(),
        });
        for (pos, w) in sm.weights.iter().enumerate() {
            c_rows.push(Coefficient {
                modelno: m,
                pos,
                value: *w,
            });
        }
        m_rows.push(sm.meta(m));
    }

    storage.insert_row_factors(&series.name, &u_rows)?;
    storage.insert_col_factors(&series.name, &v_rows)?;
    storage.insert_singular_values(&series.name, &s_rows)?;
    storage.insert_coefficients(&series.name, &c_rows)?;
    storage.insert_model_meta(&series.name, &m_rows)?;
    storage.refresh_coefficient_view(&series.name)?;
    series.clear_dirty();
    log::debug!("series {}: persisted sub-models {:?}", series.name, dirty);
    Ok(())
}

/// Pull the last sub-model's factors into memory so ingestion can resume.
fn hydrate_last<S: Storage>(
    storage: &S,
    series: &mut ModelSeries,
    meta: &IndexMeta,
    series_name: &str,
    counters: &crate::storage::SeriesCounters,
) -> Result<(), IndexError> {
    let Some(last) = series.models.len().checked_sub(1) else {
        return Ok(());
    };
    let filled = series.models[last].filled_cols;
    if filled == 0 {
        return Ok(());
    }
    let source = StoredSeries::new(storage, series_name.to_string(), counters, meta.coeff_window);
    let slice = source.factors(last, (0, filled - 1))?;
    let mut coeffs = storage.coefficients(series_name, (last, last))?;
    coeffs.sort_by_key(|c| c.pos);
    let weights = Array1::from_iter(coeffs.iter().map(|c| c.value));
    series.hydrate(last, slice.u, slice.s, slice.v, weights);
    Ok(())
}

/// Variance tail when the cache file is gone: squared residuals (direct
/// mode) or squared raw observations (second-moment mode) over the
/// variance chain's trailing window.
fn recover_variance_tail<S: Storage>(
    storage: &S,
    config: &IndexConfig,
    meta: &IndexMeta,
    var: &ModelSeries,
) -> Result<Vec<f64>, IndexError> {
    let vtsi = var.time_series_index();
    if vtsi == 0 {
        return Ok(Vec::new());
    }
    let from = vtsi.saturating_sub(var.shape.window());
    let raw = storage.series_range(
        &config.relation,
        &config.value_column,
        &config.time_column,
        (from, vtsi - 1),
        config.aggregation,
        config.agg_interval,
        meta.start_time,
    )?;
    if !config.direct_var {
        return Ok(raw.iter().map(|x| x * x).collect());
    }
    let mean_src = StoredSeries::new(
        storage,
        config.index_name.clone(),
        &meta.mean,
        meta.coeff_window,
    );
    let means = impute_range(&mean_src, from, vtsi - 1)?;
    Ok(raw
        .iter()
        .zip(&means)
        .map(|(x, m)| (x - m) * (x - m))
        .collect())
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Time(#[from] TimeMapError),
    #[error("no predictive index named '{0}'")]
    UnknownIndex(String),
    #[error("source relation '{0}' has no observations; cannot resolve a start time")]
    EmptySource(String),
}
