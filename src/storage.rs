//! # Storage contract and reference backend
//!
//! The core never issues backend-specific syntax. Everything it needs from a
//! persistence engine is captured by the [`Storage`] trait: raw-series range
//! queries with aggregation, the five factor tables of each model series
//! (row factors, column factors, singular values, recurrence coefficients
//! with a rolling-average view, and sub-model metadata), the top-level index
//! metadata record, the index registry, and change-notification triggers.
//!
//! Row and column factor coordinates are sub-model-local: a `ColFactor` with
//! `col = 3` is the fourth column of that sub-model's matrix, regardless of
//! where the sub-model's window starts in the raw series.
//!
//! [`MemoryStorage`] is the in-process reference implementation used by the
//! test suite and by hosts that do not need durability.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AggMethod, COEFF_VIEW_DEPTHS, CoeffWindow};
use crate::timemap::TimeMapper;

/// One row of a sub-model's `U` factor (`values.len() == k`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFactor {
    pub modelno: usize,
    /// Row index within the sub-model matrix, `0..N`.
    pub row: usize,
    pub values: Vec<f64>,
}

/// One row of a sub-model's `V` factor (`values.len() == k`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColFactor {
    pub modelno: usize,
    /// Column index within the sub-model matrix, `0..filled_cols`.
    pub col: usize,
    pub values: Vec<f64>,
}

/// Retained singular values of one sub-model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingularValues {
    pub modelno: usize,
    pub values: Vec<f64>,
}

/// One recurrence coefficient of one sub-model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub modelno: usize,
    pub pos: usize,
    pub value: f64,
}

/// Persisted per-sub-model metadata row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmodelMeta {
    pub modelno: usize,
    /// Matrix rows `N`.
    pub rows: usize,
    /// Matrix column capacity `M`.
    pub cols: usize,
    /// Columns covered by the current factorization, `<= cols`.
    pub filled_cols: usize,
    /// Raw offset of the first observation in the window.
    pub start: usize,
    pub times_updated: u32,
    pub times_reconstructed: u32,
    pub imputation_score: f64,
    pub forecast_score: f64,
}

impl SubmodelMeta {
    /// Raw offsets covered by the current factorization:
    /// `[start, start + rows * filled_cols)`.
    pub fn covered_end(&self) -> usize {
        self.start + self.rows * self.filled_cols
    }
}

/// Counters and aggregate scores of one model series, as persisted in the
/// index metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesCounters {
    /// Raw observations ingested so far.
    pub time_series_index: usize,
    /// Boundary between the imputation and forecast regimes.
    pub m_update_index: usize,
    /// Observations covered by the most recent full refactorization.
    pub recon_index: usize,
    pub rows: usize,
    pub cols: usize,
    pub submodels: usize,
    pub imputation_score: f64,
    pub forecast_score: f64,
}

/// Top-level metadata record: full configuration plus both series' counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub relation: String,
    pub value_column: String,
    pub time_column: String,
    pub rank: usize,
    pub rank_var: usize,
    pub min_points: usize,
    pub update_fraction: f64,
    pub soft_threshold: bool,
    pub aggregation: AggMethod,
    pub agg_interval: f64,
    pub start_time: i64,
    pub direct_var: bool,
    pub coeff_window: CoeffWindow,
    pub mean: SeriesCounters,
    pub variance: Option<SeriesCounters>,
}

/// Registry row supporting index discovery and deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub index_name: String,
    pub relation: String,
    pub value_column: String,
    pub time_column: String,
    pub uq: bool,
    pub agg_interval: f64,
    pub initial_time: i64,
    pub last_time: i64,
}

/// Which end of the time column to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBound {
    Min,
    Max,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("relation '{0}' does not exist")]
    MissingRelation(String),
    #[error("relation '{relation}' has no column '{column}'")]
    MissingColumn { relation: String, column: String },
    #[error("no predictive index named '{0}'")]
    MissingIndex(String),
    #[error("model series '{0}' has no backing tables")]
    MissingSeries(String),
    #[error("model series '{series}' has no sub-model {modelno}")]
    MissingSubmodel { series: String, modelno: usize },
    #[error("no observations aggregate into offset {offset}")]
    MissingObservations { offset: usize },
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Backend-agnostic persistence contract.
///
/// All write operations that target a `modelno` range follow a
/// delete-then-reinsert discipline; the two steps are not required to be
/// atomic with respect to concurrent readers (soft-state index, see the
/// crate docs on the torn-read window).
pub trait Storage {
    // --- raw series ---

    /// Smallest or largest time value present in `relation.time_column`, or
    /// `None` when the relation is empty.
    fn time_bound(
        &self,
        relation: &str,
        time_column: &str,
        bound: TimeBound,
    ) -> Result<Option<i64>, StorageError>;

    /// Aggregated observations for the contiguous canonical offsets
    /// `offsets.0 ..= offsets.1`. A bucket with no observations is reported
    /// as [`StorageError::MissingObservations`] for the lowest such offset.
    fn series_range(
        &self,
        relation: &str,
        value_column: &str,
        time_column: &str,
        offsets: (usize, usize),
        aggregation: AggMethod,
        interval: f64,
        start_time: i64,
    ) -> Result<Vec<f64>, StorageError>;

    // --- factor tables, one set per model series ---

    fn create_series_tables(&mut self, series: &str) -> Result<(), StorageError>;

    /// Idempotent: absent tables are not an error.
    fn drop_series_tables(&mut self, series: &str) -> Result<(), StorageError>;

    /// Delete all five tables' rows with `modelno` in `first ..= last`.
    fn clear_model_range(
        &mut self,
        series: &str,
        first: usize,
        last: usize,
    ) -> Result<(), StorageError>;

    fn insert_row_factors(&mut self, series: &str, rows: &[RowFactor])
    -> Result<(), StorageError>;
    fn insert_col_factors(&mut self, series: &str, rows: &[ColFactor])
    -> Result<(), StorageError>;
    fn insert_singular_values(
        &mut self,
        series: &str,
        rows: &[SingularValues],
    ) -> Result<(), StorageError>;
    fn insert_coefficients(
        &mut self,
        series: &str,
        rows: &[Coefficient],
    ) -> Result<(), StorageError>;
    fn insert_model_meta(
        &mut self,
        series: &str,
        rows: &[SubmodelMeta],
    ) -> Result<(), StorageError>;

    /// Recompute the rolling-average coefficient view for the depths in
    /// [`COEFF_VIEW_DEPTHS`].
    fn refresh_coefficient_view(&mut self, series: &str) -> Result<(), StorageError>;

    fn row_factors(
        &self,
        series: &str,
        models: (usize, usize),
        rows: (usize, usize),
    ) -> Result<Vec<RowFactor>, StorageError>;
    fn col_factors(
        &self,
        series: &str,
        models: (usize, usize),
        cols: (usize, usize),
    ) -> Result<Vec<ColFactor>, StorageError>;
    fn singular_values(
        &self,
        series: &str,
        models: (usize, usize),
    ) -> Result<Vec<SingularValues>, StorageError>;
    fn coefficients(
        &self,
        series: &str,
        models: (usize, usize),
    ) -> Result<Vec<Coefficient>, StorageError>;

    /// Position-wise average of the recurrence coefficients over the chosen
    /// trailing depth.
    fn averaged_coefficients(
        &self,
        series: &str,
        window: CoeffWindow,
    ) -> Result<Vec<f64>, StorageError>;

    fn model_meta(&self, series: &str, modelno: usize) -> Result<SubmodelMeta, StorageError>;
    fn all_model_meta(&self, series: &str) -> Result<Vec<SubmodelMeta>, StorageError>;

    // --- index metadata, registry, triggers ---

    fn write_index_meta(&mut self, name: &str, meta: &IndexMeta) -> Result<(), StorageError>;
    fn read_index_meta(&self, name: &str) -> Result<IndexMeta, StorageError>;
    /// Idempotent.
    fn drop_index_meta(&mut self, name: &str) -> Result<(), StorageError>;

    fn register_index(&mut self, entry: &RegistryEntry) -> Result<(), StorageError>;
    /// Idempotent.
    fn deregister_index(&mut self, name: &str) -> Result<(), StorageError>;
    fn registry(&self) -> Result<Vec<RegistryEntry>, StorageError>;

    /// Route future inserts on `relation` to the named index's `update`.
    fn install_trigger(&mut self, relation: &str, index_name: &str) -> Result<(), StorageError>;
    /// Idempotent.
    fn remove_trigger(&mut self, relation: &str) -> Result<(), StorageError>;
}

// ---------------------------------------------------------------------------
// In-memory reference backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SeriesTables {
    u: Vec<RowFactor>,
    v: Vec<ColFactor>,
    s: Vec<SingularValues>,
    c: Vec<Coefficient>,
    m: Vec<SubmodelMeta>,
    c_view: HashMap<usize, Vec<f64>>,
}

#[derive(Debug)]
struct Relation {
    time_column: String,
    value_column: String,
    rows: Vec<(i64, f64)>,
}

/// In-process [`Storage`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    relations: HashMap<String, Relation>,
    series: HashMap<String, SeriesTables>,
    meta: HashMap<String, IndexMeta>,
    registered: HashMap<String, RegistryEntry>,
    triggers: HashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    /// Create a raw source relation.
    pub fn create_relation(&mut self, name: &str, time_column: &str, value_column: &str) {
        self.relations.insert(
            name.to_string(),
            Relation {
                time_column: time_column.to_string(),
                value_column: value_column.to_string(),
                rows: Vec::new(),
            },
        );
    }

    /// Append raw observations. Returns the name of the index whose trigger
    /// fired, if one is installed; the host is expected to call `update` on
    /// it.
    pub fn insert_observations(
        &mut self,
        relation: &str,
        rows: &[(i64, f64)],
    ) -> Result<Option<String>, StorageError> {
        let rel = self
            .relations
            .get_mut(relation)
            .ok_or_else(|| StorageError::MissingRelation(relation.to_string()))?;
        rel.rows.extend_from_slice(rows);
        rel.rows.sort_by_key(|&(t, _)| t);
        Ok(self.triggers.get(relation).cloned())
    }

    fn relation(&self, name: &str) -> Result<&Relation, StorageError> {
        self.relations
            .get(name)
            .ok_or_else(|| StorageError::MissingRelation(name.to_string()))
    }

    fn tables(&self, series: &str) -> Result<&SeriesTables, StorageError> {
        self.series
            .get(series)
            .ok_or_else(|| StorageError::MissingSeries(series.to_string()))
    }

    fn tables_mut(&mut self, series: &str) -> Result<&mut SeriesTables, StorageError> {
        self.series
            .get_mut(series)
            .ok_or_else(|| StorageError::MissingSeries(series.to_string()))
    }

    fn averaged(c: &[Coefficient], depth: Option<usize>) -> Vec<f64> {
        let Some(last) = c.iter().map(|r| r.modelno).max() else {
            return Vec::new();
        };
        let first = match depth {
            Some(d) => (last + 1).saturating_sub(d),
            None => 0,
        };
        let width = c
            .iter()
            .filter(|r| r.modelno >= first)
            .map(|r| r.pos + 1)
            .max()
            .unwrap_or(0);
        let mut sums = vec![0.0; width];
        let mut counts = vec![0usize; width];
        for r in c.iter().filter(|r| r.modelno >= first) {
            sums[r.pos] += r.value;
            counts[r.pos] += 1;
        }
        sums.iter()
            .zip(&counts)
            .map(|(s, &n)| if n > 0 { s / n as f64 } else { 0.0 })
            .collect()
    }
}

impl Storage for MemoryStorage {
    fn time_bound(
        &self,
        relation: &str,
        time_column: &str,
        bound: TimeBound,
    ) -> Result<Option<i64>, StorageError> {
        let rel = self.relation(relation)?;
        if rel.time_column != time_column {
            return Err(StorageError::MissingColumn {
                relation: relation.to_string(),
                column: time_column.to_string(),
            });
        }
        let times = rel.rows.iter().map(|&(t, _)| t);
        Ok(match bound {
            TimeBound::Min => times.min(),
            TimeBound::Max => times.max(),
        })
    }

    fn series_range(
        &self,
        relation: &str,
        value_column: &str,
        time_column: &str,
        offsets: (usize, usize),
        aggregation: AggMethod,
        interval: f64,
        start_time: i64,
    ) -> Result<Vec<f64>, StorageError> {
        let rel = self.relation(relation)?;
        if rel.time_column != time_column {
            return Err(StorageError::MissingColumn {
                relation: relation.to_string(),
                column: time_column.to_string(),
            });
        }
        if rel.value_column != value_column {
            return Err(StorageError::MissingColumn {
                relation: relation.to_string(),
                column: value_column.to_string(),
            });
        }
        let (o1, o2) = offsets;
        let mapper = TimeMapper::new(start_time, interval);
        let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); o2 - o1 + 1];
        for &(t, v) in &rel.rows {
            let Ok(o) = mapper.offset(t) else { continue };
            if o >= o1 && o <= o2 {
                buckets[o - o1].push(v);
            }
        }
        buckets
            .iter()
            .enumerate()
            .map(|(i, b)| {
                if b.is_empty() {
                    return Err(StorageError::MissingObservations { offset: o1 + i });
                }
                Ok(match aggregation {
                    AggMethod::Average => b.iter().sum::<f64>() / b.len() as f64,
                    AggMethod::Sum => b.iter().sum(),
                    AggMethod::Min => b.iter().cloned().fold(f64::INFINITY, f64::min),
                    AggMethod::Max => b.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                })
            })
            .collect()
    }

    fn create_series_tables(&mut self, series: &str) -> Result<(), StorageError> {
        self.series
            .insert(series.to_string(), SeriesTables::default());
        Ok(())
    }

    fn drop_series_tables(&mut self, series: &str) -> Result<(), StorageError> {
        self.series.remove(series);
        Ok(())
    }

    fn clear_model_range(
        &mut self,
        series: &str,
        first: usize,
        last: usize,
    ) -> Result<(), StorageError> {
        let t = self.tables_mut(series)?;
        let keep = |m: usize| m < first || m > last;
        t.u.retain(|r| keep(r.modelno));
        t.v.retain(|r| keep(r.modelno));
        t.s.retain(|r| keep(r.modelno));
        t.c.retain(|r| keep(r.modelno));
        t.m.retain(|r| keep(r.modelno));
        Ok(())
    }

    fn insert_row_factors(
        &mut self,
        series: &str,
        rows: &[RowFactor],
    ) -> Result<(), StorageError> {
        self.tables_mut(series)?.u.extend_from_slice(rows);
        Ok(())
    }

    fn insert_col_factors(
        &mut self,
        series: &str,
        rows: &[ColFactor],
    ) -> Result<(), StorageError> {
        self.tables_mut(series)?.v.extend_from_slice(rows);
        Ok(())
    }

    fn insert_singular_values(
        &mut self,
        series: &str,
        rows: &[SingularValues],
    ) -> Result<(), StorageError> {
        self.tables_mut(series)?.s.extend_from_slice(rows);
        Ok(())
    }

    fn insert_coefficients(
        &mut self,
        series: &str,
        rows: &[Coefficient],
    ) -> Result<(), StorageError> {
        self.tables_mut(series)?.c.extend_from_slice(rows);
        Ok(())
    }

    fn insert_model_meta(
        &mut self,
        series: &str,
        rows: &[SubmodelMeta],
    ) -> Result<(), StorageError> {
        let t = self.tables_mut(series)?;
        t.m.extend_from_slice(rows);
        t.m.sort_by_key(|r| r.modelno);
        Ok(())
    }

    fn refresh_coefficient_view(&mut self, series: &str) -> Result<(), StorageError> {
        let t = self.tables_mut(series)?;
        let view: HashMap<usize, Vec<f64>> = COEFF_VIEW_DEPTHS
            .iter()
            .map(|&d| (d, Self::averaged(&t.c, Some(d))))
            .collect();
        t.c_view = view;
        Ok(())
    }

    fn row_factors(
        &self,
        series: &str,
        models: (usize, usize),
        rows: (usize, usize),
    ) -> Result<Vec<RowFactor>, StorageError> {
        let t = self.tables(series)?;
        Ok(t.u
            .iter()
            .filter(|r| {
                r.modelno >= models.0 && r.modelno <= models.1 && r.row >= rows.0 && r.row <= rows.1
            })
            .cloned()
            .collect())
    }

    fn col_factors(
        &self,
        series: &str,
        models: (usize, usize),
        cols: (usize, usize),
    ) -> Result<Vec<ColFactor>, StorageError> {
        let t = self.tables(series)?;
        Ok(t.v
            .iter()
            .filter(|r| {
                r.modelno >= models.0 && r.modelno <= models.1 && r.col >= cols.0 && r.col <= cols.1
            })
            .cloned()
            .collect())
    }

    fn singular_values(
        &self,
        series: &str,
        models: (usize, usize),
    ) -> Result<Vec<SingularValues>, StorageError> {
        let t = self.tables(series)?;
        Ok(t.s
            .iter()
            .filter(|r| r.modelno >= models.0 && r.modelno <= models.1)
            .cloned()
            .collect())
    }

    fn coefficients(
        &self,
        series: &str,
        models: (usize, usize),
    ) -> Result<Vec<Coefficient>, StorageError> {
        let t = self.tables(series)?;
        Ok(t.c
            .iter()
            .filter(|r| r.modelno >= models.0 && r.modelno <= models.1)
            .cloned()
            .collect())
    }

    fn averaged_coefficients(
        &self,
        series: &str,
        window: CoeffWindow,
    ) -> Result<Vec<f64>, StorageError> {
        let t = self.tables(series)?;
        Ok(match window {
            CoeffWindow::All => Self::averaged(&t.c, None),
            CoeffWindow::Last(n) => match t.c_view.get(&n) {
                Some(v) => v.clone(),
                None => Self::averaged(&t.c, Some(n)),
            },
        })
    }

    fn model_meta(&self, series: &str, modelno: usize) -> Result<SubmodelMeta, StorageError> {
        self.tables(series)?
            .m
            .iter()
            .find(|r| r.modelno == modelno)
            .cloned()
            .ok_or_else(|| StorageError::MissingSubmodel {
                series: series.to_string(),
                modelno,
            })
    }

    fn all_model_meta(&self, series: &str) -> Result<Vec<SubmodelMeta>, StorageError> {
        Ok(self.tables(series)?.m.clone())
    }

    fn write_index_meta(&mut self, name: &str, meta: &IndexMeta) -> Result<(), StorageError> {
        self.meta.insert(name.to_string(), meta.clone());
        Ok(())
    }

    fn read_index_meta(&self, name: &str) -> Result<IndexMeta, StorageError> {
        self.meta
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::MissingIndex(name.to_string()))
    }

    fn drop_index_meta(&mut self, name: &str) -> Result<(), StorageError> {
        self.meta.remove(name);
        Ok(())
    }

    fn register_index(&mut self, entry: &RegistryEntry) -> Result<(), StorageError> {
        self.registered
            .insert(entry.index_name.clone(), entry.clone());
        Ok(())
    }

    fn deregister_index(&mut self, name: &str) -> Result<(), StorageError> {
        self.registered.remove(name);
        Ok(())
    }

    fn registry(&self) -> Result<Vec<RegistryEntry>, StorageError> {
        let mut entries: Vec<RegistryEntry> = self.registered.values().cloned().collect();
        entries.sort_by(|a, b| a.index_name.cmp(&b.index_name));
        Ok(entries)
    }

    fn install_trigger(&mut self, relation: &str, index_name: &str) -> Result<(), StorageError> {
        if !self.relations.contains_key(relation) {
            return Err(StorageError::MissingRelation(relation.to_string()));
        }
        self.triggers
            .insert(relation.to_string(), index_name.to_string());
        Ok(())
    }

    fn remove_trigger(&mut self, relation: &str) -> Result<(), StorageError> {
        self.triggers.remove(relation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn filled() -> MemoryStorage {
        let mut db = MemoryStorage::new();
        db.create_relation("meter", "ts", "load");
        db.insert_observations("meter", &[(0, 1.0), (1, 2.0), (2, 3.0), (3, 4.0)])
            .unwrap();
        db
    }

    #[test]
    fn series_range_aggregates_buckets() {
        let db = filled();
        let vals = db
            .series_range("meter", "load", "ts", (0, 1), AggMethod::Average, 2.0, 0)
            .unwrap();
        assert_abs_diff_eq!(vals[0], 1.5);
        assert_abs_diff_eq!(vals[1], 3.5);

        let vals = db
            .series_range("meter", "load", "ts", (0, 1), AggMethod::Max, 2.0, 0)
            .unwrap();
        assert_abs_diff_eq!(vals[1], 4.0);
    }

    #[test]
    fn series_range_rejects_unknown_columns() {
        let db = filled();
        assert!(matches!(
            db.series_range("meter", "nope", "ts", (0, 0), AggMethod::Average, 1.0, 0),
            Err(StorageError::MissingColumn { .. })
        ));
        assert!(matches!(
            db.time_bound("gone", "ts", TimeBound::Min),
            Err(StorageError::MissingRelation(_))
        ));
    }

    #[test]
    fn empty_bucket_is_an_error() {
        let mut db = MemoryStorage::new();
        db.create_relation("meter", "ts", "load");
        db.insert_observations("meter", &[(0, 1.0), (5, 2.0)]).unwrap();
        assert!(matches!(
            db.series_range("meter", "load", "ts", (0, 5), AggMethod::Average, 1.0, 0),
            Err(StorageError::MissingObservations { offset: 1 })
        ));
    }

    #[test]
    fn coefficient_view_averages_trailing_models() {
        let mut db = MemoryStorage::new();
        db.create_series_tables("ix").unwrap();
        let mut rows = Vec::new();
        for m in 0..30 {
            rows.push(Coefficient {
                modelno: m,
                pos: 0,
                value: m as f64,
            });
        }
        db.insert_coefficients("ix", &rows).unwrap();
        db.refresh_coefficient_view("ix").unwrap();

        // Last 10 models are 20..=29.
        let avg = db
            .averaged_coefficients("ix", CoeffWindow::Last(10))
            .unwrap();
        assert_abs_diff_eq!(avg[0], 24.5);

        let avg = db.averaged_coefficients("ix", CoeffWindow::All).unwrap();
        assert_abs_diff_eq!(avg[0], 14.5);
    }

    #[test]
    fn clear_model_range_is_a_range_delete() {
        let mut db = MemoryStorage::new();
        db.create_series_tables("ix").unwrap();
        let metas: Vec<SubmodelMeta> = (0..4)
            .map(|m| SubmodelMeta {
                modelno: m,
                rows: 2,
                cols: 2,
                filled_cols: 2,
                start: m * 2,
                times_updated: 0,
                times_reconstructed: 1,
                imputation_score: 1.0,
                forecast_score: 1.0,
            })
            .collect();
        db.insert_model_meta("ix", &metas).unwrap();
        db.clear_model_range("ix", 1, 2).unwrap();
        let left = db.all_model_meta("ix").unwrap();
        assert_eq!(
            left.iter().map(|m| m.modelno).collect::<Vec<_>>(),
            vec![0, 3]
        );
    }

    #[test]
    fn trigger_routes_inserts_to_index() {
        let mut db = filled();
        db.install_trigger("meter", "ix_meter").unwrap();
        let fired = db.insert_observations("meter", &[(4, 5.0)]).unwrap();
        assert_eq!(fired.as_deref(), Some("ix_meter"));
        db.remove_trigger("meter").unwrap();
        assert_eq!(db.insert_observations("meter", &[(5, 6.0)]).unwrap(), None);
    }
}
