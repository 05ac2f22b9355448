//! End-to-end lifecycle tests against the in-memory backend: create over
//! existing history, query inside and beyond it, trigger-driven updates,
//! reload in a fresh handle, and deletion.

use approx::assert_abs_diff_eq;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use pindex::config::IndexConfig;
use pindex::fit::SvdFit;
use pindex::manager::PredictiveIndex;
use pindex::reconstruct::{QueryError, QueryOptions, get_prediction, get_prediction_range};
use pindex::storage::{MemoryStorage, Storage};
use pindex::uncertainty::UqMethod;

const W: f64 = 2.0 * std::f64::consts::PI / 37.0;

fn signal(t: i64) -> f64 {
    (W * t as f64).sin()
}

fn seeded_storage(points: i64) -> MemoryStorage {
    let mut db = MemoryStorage::new();
    db.create_relation("sensor", "ts", "reading");
    let rows: Vec<(i64, f64)> = (0..points).map(|t| (t, signal(t))).collect();
    db.insert_observations("sensor", &rows).unwrap();
    db
}

fn config() -> IndexConfig {
    let mut cfg = IndexConfig::new("ix_sensor", "sensor", "reading", "ts");
    cfg.window = 100;
    cfg.rows = Some(10);
    cfg.rank = 2;
    cfg.rank_var = 1;
    cfg.min_points = 10;
    cfg.update_fraction = 0.2;
    cfg
}

#[test]
fn create_then_impute_and_forecast() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut db = seeded_storage(250);
    let index = PredictiveIndex::create(&mut db, config(), SvdFit, None).unwrap();
    assert_eq!(index.mean().time_series_index(), 250);
    assert_eq!(index.mean().m_update_index(), 250);

    // A sinusoid is exactly rank 2, so imputation inside ingested history
    // reproduces it to numerical precision.
    let p = get_prediction(&db, "ix_sensor", 50, &QueryOptions::default()).unwrap();
    assert_abs_diff_eq!(p.value, signal(50), epsilon = 1e-6);
    let dev = p.deviation.unwrap();
    assert!(dev.is_finite() && dev >= 0.0);
    // The series is noise-free; the band collapses.
    assert!(dev < 1e-3);

    // A range straddling the boundary: imputed up to offset 249, forecast
    // through the recurrence beyond it.
    let r = get_prediction_range(&db, "ix_sensor", 240, 259, &QueryOptions::default()).unwrap();
    assert_eq!(r.values.len(), 20);
    for (i, v) in r.values.iter().enumerate() {
        let tol = if i < 10 { 1e-6 } else { 1e-3 };
        assert_abs_diff_eq!(*v, signal(240 + i as i64), epsilon = tol);
    }
    let devs = r.deviations.unwrap();
    assert!(devs.iter().all(|d| d.is_finite() && *d >= 0.0));
}

#[test]
fn trigger_routes_new_rows_and_update_is_idempotent() {
    let mut db = seeded_storage(250);
    let mut index = PredictiveIndex::create(&mut db, config(), SvdFit, None).unwrap();

    let rows: Vec<(i64, f64)> = (250..300).map(|t| (t, signal(t))).collect();
    let fired = db.insert_observations("sensor", &rows).unwrap();
    assert_eq!(fired.as_deref(), Some("ix_sensor"));

    assert!(index.update(&mut db).unwrap());
    assert_eq!(index.mean().time_series_index(), 300);
    // Nothing new: the second call must not touch the model.
    assert!(!index.update(&mut db).unwrap());

    let p = get_prediction(&db, "ix_sensor", 310, &QueryOptions::default()).unwrap();
    assert_abs_diff_eq!(p.value, signal(310), epsilon = 1e-3);
}

#[test]
fn update_preserves_interior_submodels_below_the_refit_threshold() {
    let mut db = seeded_storage(240);
    let mut cfg = config();
    cfg.update_fraction = 0.3;
    let mut index = PredictiveIndex::create(&mut db, cfg, SvdFit, None).unwrap();
    assert_eq!(index.mean().models[4].filled_cols, 4);

    // In this batch sub-model 3 completes and 5 opens, while 4 accrues only
    // 20 new points, below the 30-point refit threshold.
    let rows: Vec<(i64, f64)> = (240..265).map(|t| (t, signal(t))).collect();
    db.insert_observations("sensor", &rows).unwrap();
    assert!(index.update(&mut db).unwrap());

    // Sub-model 4 was not rewritten; its persisted rows must survive the
    // persist of its dirty neighbours.
    let meta = db.model_meta("ix_sensor", 4).unwrap();
    assert_eq!(meta.filled_cols, 4);
    let p = get_prediction(&db, "ix_sensor", 235, &QueryOptions::default()).unwrap();
    assert_abs_diff_eq!(p.value, signal(235), epsilon = 1e-6);
}

#[test]
fn update_ingests_up_to_a_source_gap() {
    let mut db = seeded_storage(250);
    let mut index = PredictiveIndex::create(&mut db, config(), SvdFit, None).unwrap();

    // Rows beyond offset 250 arrive while 250 itself never does.
    let rows: Vec<(i64, f64)> = (251..300).map(|t| (t, signal(t))).collect();
    db.insert_observations("sensor", &rows).unwrap();
    assert!(!index.update(&mut db).unwrap());
    assert_eq!(index.mean().time_series_index(), 250);

    // Backfilling the gap unblocks everything behind it.
    db.insert_observations("sensor", &[(250, signal(250))])
        .unwrap();
    assert!(index.update(&mut db).unwrap());
    assert_eq!(index.mean().time_series_index(), 300);
}

#[test]
fn interior_gap_defers_later_offsets() {
    let mut db = seeded_storage(250);
    let mut index = PredictiveIndex::create(&mut db, config(), SvdFit, None).unwrap();

    let rows: Vec<(i64, f64)> = (250..280)
        .filter(|&t| t != 260)
        .map(|t| (t, signal(t)))
        .collect();
    db.insert_observations("sensor", &rows).unwrap();

    // The contiguous prefix before the gap is ingested.
    assert!(index.update(&mut db).unwrap());
    assert_eq!(index.mean().time_series_index(), 260);
    // Retrying without backfill is a clean no-op, not an error.
    assert!(!index.update(&mut db).unwrap());
    assert_eq!(index.mean().time_series_index(), 260);
}

#[test]
fn reload_resumes_ingestion_and_queries() {
    let cache = tempfile::tempdir().unwrap();
    let mut db = seeded_storage(250);
    let (u0, s0, v0, w0) = {
        let index = PredictiveIndex::create(
            &mut db,
            config(),
            SvdFit,
            Some(cache.path().to_path_buf()),
        )
        .unwrap();
        assert_eq!(index.mean().models.len(), 5);
        let sm = &index.mean().models[4];
        (sm.u.clone(), sm.s.clone(), sm.v.clone(), sm.weights.clone())
    };

    let mut reloaded =
        PredictiveIndex::reload(&db, "ix_sensor", SvdFit, Some(cache.path().to_path_buf()))
            .unwrap();
    assert_eq!(reloaded.mean().time_series_index(), 250);
    assert_eq!(reloaded.mean().m_update_index(), 250);
    assert_eq!(reloaded.mean().recon_index(), 250);
    assert_eq!(reloaded.mean().models.len(), 5);
    assert_eq!(reloaded.config().rank, 2);
    // The raw tail came back through the ephemeral cache.
    assert_eq!(reloaded.mean().tail().len(), 100);
    assert_abs_diff_eq!(reloaded.mean().tail()[0], signal(150), epsilon = 1e-12);

    // The hydrated last sub-model carries the same factorization that was
    // persisted.
    let sm = &reloaded.mean().models[4];
    assert_eq!(sm.u.dim(), u0.dim());
    assert_eq!(sm.v.dim(), v0.dim());
    assert_eq!(sm.s.len(), s0.len());
    assert_eq!(sm.weights.len(), w0.len());
    for (a, b) in sm.u.iter().zip(u0.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }
    for (a, b) in sm.s.iter().zip(s0.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }
    for (a, b) in sm.v.iter().zip(v0.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }
    for (a, b) in sm.weights.iter().zip(w0.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }

    // Queries read storage and are unaffected by which handle is live.
    let p = get_prediction(&db, "ix_sensor", 123, &QueryOptions::default()).unwrap();
    assert_abs_diff_eq!(p.value, signal(123), epsilon = 1e-6);

    // The reloaded handle keeps ingesting where the old one stopped.
    let rows: Vec<(i64, f64)> = (250..300).map(|t| (t, signal(t))).collect();
    db.insert_observations("sensor", &rows).unwrap();
    assert!(reloaded.update(&mut db).unwrap());
    assert_eq!(reloaded.mean().time_series_index(), 300);

    let p = get_prediction(&db, "ix_sensor", 305, &QueryOptions::default()).unwrap();
    assert_abs_diff_eq!(p.value, signal(305), epsilon = 1e-3);
}

#[test]
fn reload_without_cache_recovers_tails_from_storage() {
    let mut db = seeded_storage(250);
    PredictiveIndex::create(&mut db, config(), SvdFit, None).unwrap();

    let reloaded = PredictiveIndex::reload(&db, "ix_sensor", SvdFit, None).unwrap();
    assert_eq!(reloaded.mean().tail().len(), 100);
    assert_abs_diff_eq!(reloaded.mean().tail()[99], signal(249), epsilon = 1e-12);
    let var = reloaded.variance().unwrap();
    assert_eq!(var.tail().len(), 100);
    // Squared residuals of a noise-free series stay near zero.
    assert!(var.tail().iter().all(|&v| v >= 0.0 && v < 1e-6));
}

#[test]
fn delete_removes_tables_registry_and_trigger() {
    let mut db = seeded_storage(250);
    PredictiveIndex::create(&mut db, config(), SvdFit, None).unwrap();
    assert_eq!(db.registry().unwrap().len(), 1);

    PredictiveIndex::<SvdFit>::delete(&mut db, "ix_sensor", None).unwrap();
    assert!(db.registry().unwrap().is_empty());
    assert!(matches!(
        get_prediction(&db, "ix_sensor", 10, &QueryOptions::default()),
        Err(QueryError::UnknownIndex(_))
    ));
    // No trigger fires for future inserts.
    let fired = db.insert_observations("sensor", &[(300, 0.0)]).unwrap();
    assert_eq!(fired, None);

    // Deleting again stays a no-op.
    PredictiveIndex::<SvdFit>::delete(&mut db, "ix_sensor", None).unwrap();
}

#[test]
fn sparse_history_trains_nothing() {
    let mut db = seeded_storage(5);
    let index = PredictiveIndex::create(&mut db, config(), SvdFit, None).unwrap();
    assert_eq!(index.mean().time_series_index(), 5);
    assert!(index.mean().models.is_empty());
    assert!(matches!(
        get_prediction(&db, "ix_sensor", 2, &QueryOptions::default()),
        Err(QueryError::NotTrained)
    ));
}

#[test]
fn query_input_validation_precedes_model_access() {
    let mut db = seeded_storage(250);
    PredictiveIndex::create(&mut db, config(), SvdFit, None).unwrap();

    let bad_confidence = QueryOptions {
        confidence: 150.0,
        ..QueryOptions::default()
    };
    assert!(matches!(
        get_prediction(&db, "ix_sensor", 50, &bad_confidence),
        Err(QueryError::Uncertainty(_))
    ));

    assert!(matches!(
        get_prediction_range(&db, "ix_sensor", 60, 50, &QueryOptions::default()),
        Err(QueryError::InvalidRange { .. })
    ));
}

#[test]
fn uncertainty_requires_a_variance_series() {
    let mut db = seeded_storage(250);
    let mut cfg = config();
    cfg.rank_var = 0;
    PredictiveIndex::create(&mut db, cfg, SvdFit, None).unwrap();

    assert!(matches!(
        get_prediction(&db, "ix_sensor", 50, &QueryOptions::default()),
        Err(QueryError::UncertaintyUnavailable(_))
    ));

    // The same index answers fine with the band disabled.
    let opts = QueryOptions {
        uq: false,
        ..QueryOptions::default()
    };
    let p = get_prediction(&db, "ix_sensor", 50, &opts).unwrap();
    assert_abs_diff_eq!(p.value, signal(50), epsilon = 1e-6);
    assert!(p.deviation.is_none());
}

#[test]
fn noisy_series_is_denoised_and_banded() {
    let mut rng = StdRng::seed_from_u64(7);
    let noise = Normal::new(0.0, 0.1).unwrap();
    let mut db = MemoryStorage::new();
    db.create_relation("sensor", "ts", "reading");
    let rows: Vec<(i64, f64)> = (0..500)
        .map(|t| (t, signal(t) + noise.sample(&mut rng)))
        .collect();
    db.insert_observations("sensor", &rows).unwrap();

    PredictiveIndex::create(&mut db, config(), SvdFit, None).unwrap();

    // The rank-2 truncation denoises; the estimate tracks the clean signal
    // well within the noise scale.
    let p = get_prediction(&db, "ix_sensor", 250, &QueryOptions::default()).unwrap();
    assert!((p.value - signal(250)).abs() < 0.5);

    // The 95% Gaussian band reflects the injected noise, roughly
    // 1.96 * 0.1 wide.
    let dev = p.deviation.unwrap();
    assert!(dev > 0.02 && dev < 1.0, "deviation {dev} out of scale");
}

#[test]
fn chebyshev_band_dominates_gaussian() {
    let mut db = seeded_storage(250);
    PredictiveIndex::create(&mut db, config(), SvdFit, None).unwrap();

    let gauss = get_prediction(&db, "ix_sensor", 50, &QueryOptions::default()).unwrap();
    let cheb = get_prediction(
        &db,
        "ix_sensor",
        50,
        &QueryOptions {
            method: UqMethod::Chebyshev,
            ..QueryOptions::default()
        },
    )
    .unwrap();
    // At 95% the Chebyshev multiplier (4.47) exceeds the Gaussian one (1.96).
    assert!(cheb.deviation.unwrap() >= gauss.deviation.unwrap());
}
