// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backpressure between data preparation and indexing.
//!
//! L1 can produce batches much faster than L2 can submit them (L2 is bounded by
//! API latency and quotas). Before reading new jobs, L1 measures the `batches`
//! backlog for the indexing group and picks a tier. Jobs are never dropped: a
//! paused L1 simply stops reading, and jobs wait in the stream.
//!
//! # Example
//!
//! ```
//! use indexing_pipeline::BackpressureLevel;
//!
//! let level = BackpressureLevel::from_backlog(100, 1_000);
//! assert_eq!(level, BackpressureLevel::Normal);
//! assert!(level.should_read());
//!
//! let level = BackpressureLevel::from_backlog(950, 1_000);
//! assert_eq!(level, BackpressureLevel::Throttle);
//! assert_eq!(level.read_count(10), 1);
//!
//! let level = BackpressureLevel::from_backlog(1_000, 1_000);
//! assert_eq!(level, BackpressureLevel::Pause);
//! assert!(!level.should_read());
//! ```

/// Backpressure level based on the batches backlog.
///
/// - **Normal** (< 70% of threshold): read at full rate
/// - **Warn** (70-90%): read at full rate, log
/// - **Throttle** (90-100%): read one job at a time
/// - **Pause** (≥ threshold): stop reading until the backlog drains
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackpressureLevel {
    Normal = 0,
    Warn = 1,
    Throttle = 2,
    Pause = 3,
}

impl BackpressureLevel {
    /// Calculate level from a backlog and threshold. A zero threshold disables
    /// backpressure.
    #[must_use]
    pub fn from_backlog(backlog: u64, threshold: u64) -> Self {
        if threshold == 0 {
            return Self::Normal;
        }
        Self::from_pressure(backlog as f64 / threshold as f64)
    }

    /// Calculate level from a pressure ratio (1.0 = at threshold)
    #[must_use]
    pub fn from_pressure(pressure: f64) -> Self {
        match pressure {
            p if p < 0.70 => Self::Normal,
            p if p < 0.90 => Self::Warn,
            p if p < 1.00 => Self::Throttle,
            _ => Self::Pause,
        }
    }

    #[must_use]
    pub fn should_read(&self) -> bool {
        !matches!(self, Self::Pause)
    }

    /// Messages to request per read at this level.
    #[must_use]
    pub fn read_count(&self, base: usize) -> usize {
        match self {
            Self::Normal | Self::Warn => base.max(1),
            Self::Throttle => 1,
            Self::Pause => 0,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Warn => "Warning - indexing backlog growing",
            Self::Throttle => "Throttling - reading one job at a time",
            Self::Pause => "Paused - waiting for indexing backlog to drain",
        }
    }
}

impl std::fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_level_thresholds() {
        assert_eq!(BackpressureLevel::from_pressure(0.0), BackpressureLevel::Normal);
        assert_eq!(BackpressureLevel::from_pressure(0.69), BackpressureLevel::Normal);
        assert_eq!(BackpressureLevel::from_pressure(0.70), BackpressureLevel::Warn);
        assert_eq!(BackpressureLevel::from_pressure(0.89), BackpressureLevel::Warn);
        assert_eq!(BackpressureLevel::from_pressure(0.90), BackpressureLevel::Throttle);
        assert_eq!(BackpressureLevel::from_pressure(0.99), BackpressureLevel::Throttle);
        assert_eq!(BackpressureLevel::from_pressure(1.0), BackpressureLevel::Pause);
        assert_eq!(BackpressureLevel::from_pressure(7.5), BackpressureLevel::Pause);
    }

    #[test]
    fn test_zero_threshold_disables() {
        assert_eq!(BackpressureLevel::from_backlog(u64::MAX, 0), BackpressureLevel::Normal);
    }

    #[test]
    fn test_read_count_shrinks_with_pressure() {
        assert_eq!(BackpressureLevel::Normal.read_count(10), 10);
        assert_eq!(BackpressureLevel::Warn.read_count(10), 10);
        assert_eq!(BackpressureLevel::Throttle.read_count(10), 1);
        assert_eq!(BackpressureLevel::Pause.read_count(10), 0);
        assert_eq!(BackpressureLevel::Normal.read_count(0), 1);
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(BackpressureLevel::Normal < BackpressureLevel::Warn);
        assert!(BackpressureLevel::Throttle < BackpressureLevel::Pause);
        assert_eq!(format!("{}", BackpressureLevel::Pause), "Pause");
    }
}
