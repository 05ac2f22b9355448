//! Confidence bands from the mean and variance model series.

use statrs::distribution::{ContinuousCDF, Normal};
use std::str::FromStr;
use thiserror::Error;

/// Tail-bound method used to turn a confidence level into a multiplier on
/// the estimated standard deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UqMethod {
    #[default]
    Gaussian,
    Chebyshev,
}

impl FromStr for UqMethod {
    type Err = UncertaintyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Gaussian" => Ok(UqMethod::Gaussian),
            "Chebyshev" => Ok(UqMethod::Chebyshev),
            other => Err(UncertaintyError::UnknownMethod(other.to_string())),
        }
    }
}

/// Multiplier `alpha` such that `mean ± alpha * sqrt(variance)` covers the
/// requested confidence level `c` (percent, `0 < c < 100`).
pub fn alpha(method: UqMethod, c: f64) -> Result<f64, UncertaintyError> {
    if !(c > 0.0 && c < 100.0) {
        return Err(UncertaintyError::BadConfidence(c));
    }
    match method {
        UqMethod::Chebyshev => Ok(1.0 / (1.0 - c / 100.0).sqrt()),
        UqMethod::Gaussian => {
            let normal =
                Normal::new(0.0, 1.0).map_err(|_| UncertaintyError::GaussianUnavailable)?;
            Ok(normal.inverse_cdf(0.5 + c / 200.0))
        }
    }
}

/// Variance at one offset, given the variance-series estimate and the mean.
///
/// In second-moment mode the series models `E[x^2]` and the variance is
/// `E[x^2] - mean^2`. Either way, negative estimates are clamped to zero (a
/// numeric guard, not an error).
pub fn variance(estimate: f64, mean: f64, direct: bool) -> f64 {
    let v = if direct {
        estimate
    } else {
        estimate - mean * mean
    };
    v.max(0.0)
}

/// Deviation band over a range: `alpha * sqrt(variance)` per offset.
pub fn deviations(means: &[f64], estimates: &[f64], direct: bool, alpha: f64) -> Vec<f64> {
    means
        .iter()
        .zip(estimates)
        .map(|(&m, &e)| alpha * variance(e, m, direct).sqrt())
        .collect()
}

#[derive(Error, Debug)]
pub enum UncertaintyError {
    #[error("confidence level must lie in (0, 100), got {0}")]
    BadConfidence(f64),
    #[error("unrecognized uncertainty method '{0}'; available: \"Gaussian\", \"Chebyshev\"")]
    UnknownMethod(String),
    #[error("the Gaussian reference distribution could not be constructed")]
    GaussianUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn gaussian_alpha_matches_known_quantiles() {
        assert_abs_diff_eq!(alpha(UqMethod::Gaussian, 95.0).unwrap(), 1.959964, epsilon = 1e-4);
        assert_abs_diff_eq!(alpha(UqMethod::Gaussian, 99.0).unwrap(), 2.575829, epsilon = 1e-4);
    }

    #[test]
    fn chebyshev_alpha_is_closed_form() {
        let a = alpha(UqMethod::Chebyshev, 95.0).unwrap();
        assert_abs_diff_eq!(a, 1.0 / 0.05_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        for c in [150.0, 100.0, 0.0, -5.0] {
            assert!(matches!(
                alpha(UqMethod::Gaussian, c),
                Err(UncertaintyError::BadConfidence(_))
            ));
        }
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!(matches!(
            "Unknown".parse::<UqMethod>(),
            Err(UncertaintyError::UnknownMethod(_))
        ));
        assert_eq!("Chebyshev".parse::<UqMethod>().unwrap(), UqMethod::Chebyshev);
    }

    #[test]
    fn negative_variance_clamps_to_zero() {
        assert_eq!(variance(-0.3, 0.0, true), 0.0);
        // Second moment smaller than squared mean.
        assert_eq!(variance(1.0, 2.0, false), 0.0);
        let d = deviations(&[2.0, 0.0], &[1.0, 4.0], false, 2.0);
        assert_eq!(d[0], 0.0);
        assert_abs_diff_eq!(d[1], 4.0);
    }
}
