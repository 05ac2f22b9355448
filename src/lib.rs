#![deny(dead_code)]
#![deny(unused_imports)]
//! # pindex
//!
//! An incremental, persisted predictive index over an append-only time
//! series. The index maintains a chain of 50%-overlapping low-rank
//! factorizations (one chain for the mean signal, one for the variance
//! signal) and answers point and range queries without rescanning raw
//! history: imputation inside already ingested history, autoregressive
//! forecasts beyond it, and an optional calibrated confidence band.
//!
//! The crate is organized around three abstract collaborators:
//! - [`storage::Storage`]: the persistence backend contract,
//! - [`fit::WindowFit`]: the per-window factorization primitive,
//! - [`timemap::TimeMapper`]: timestamp-to-offset bookkeeping.
//!
//! [`manager::PredictiveIndex`] drives the ingestion lifecycle, and
//! [`reconstruct::get_prediction`] / [`reconstruct::get_prediction_range`]
//! are the query surface.

pub mod config;
pub mod fit;
pub mod manager;
pub mod reconstruct;
pub mod series;
pub mod storage;
pub mod timemap;
pub mod uncertainty;
