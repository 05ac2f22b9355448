//! Linear mapping between caller time values and canonical offsets.

use thiserror::Error;

/// Bidirectional mapping between a time value (integer offset or epoch-like
/// timestamp) and the canonical integer offset of the series, parameterized
/// by the index start time and the aggregation interval.
///
/// The pair is a strict inverse over the offset domain
/// (`offset(time(x)) == x`) for any interval of at least one time unit:
/// `time` maps an offset to the earliest integer time of its bucket.
/// Sub-unit intervals collapse distinct offsets onto the same integer time
/// and are rejected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeMapper {
    start_time: i64,
    interval: f64,
}

impl TimeMapper {
    pub fn new(start_time: i64, interval: f64) -> Self {
        TimeMapper {
            start_time,
            interval,
        }
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Canonical offset of time value `t`. Times before the index start are
    /// a caller error.
    pub fn offset(&self, t: i64) -> Result<usize, TimeMapError> {
        let delta = t - self.start_time;
        if delta < 0 {
            return Err(TimeMapError::BeforeStart {
                t,
                start_time: self.start_time,
            });
        }
        Ok((delta as f64 / self.interval).floor() as usize)
    }

    /// Earliest integer time value falling into canonical offset `offset`.
    pub fn time(&self, offset: usize) -> i64 {
        self.start_time + (offset as f64 * self.interval).ceil() as i64
    }
}

#[derive(Error, Debug)]
pub enum TimeMapError {
    #[error("time {t} precedes the index start time {start_time}")]
    BeforeStart { t: i64, start_time: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_interval_is_identity_shift() {
        let map = TimeMapper::new(100, 1.0);
        assert_eq!(map.offset(100).unwrap(), 0);
        assert_eq!(map.offset(173).unwrap(), 73);
        assert_eq!(map.time(73), 173);
    }

    #[test]
    fn strict_inverse_over_offset_domain() {
        // Fractional intervals above one time unit invert strictly too.
        for interval in [1.0, 1.3, 2.5, 5.0, 60.0] {
            let map = TimeMapper::new(1_600_000_000, interval);
            for offset in 0..500 {
                assert_eq!(map.offset(map.time(offset)).unwrap(), offset);
            }
        }
    }

    #[test]
    fn rejects_times_before_start() {
        let map = TimeMapper::new(50, 1.0);
        assert!(matches!(
            map.offset(49),
            Err(TimeMapError::BeforeStart { .. })
        ));
    }
}
