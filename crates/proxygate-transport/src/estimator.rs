//! Weighted sliding-window bandwidth estimator.
//!
//! Smooths point-in-time available bandwidth estimates (ABE) reported by the
//! transport's congestion control. Each sample is weighted by the number of
//! bytes it was measured over, so estimates from large transfers dominate
//! estimates from tiny ones. Samples below a minimum weight are ignored.
//!
//! Not synchronized: one estimator belongs to one tracker (a connection or a
//! path), which serializes its own calls.

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::trace;

/// Estimator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Maximum number of retained samples (default: 25).
    pub limit: usize,
    /// Samples measured over fewer bytes than this are discarded (default: 2048).
    pub min_bytes_threshold: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            limit: 25,
            min_bytes_threshold: 2048.0,
        }
    }
}

impl EstimatorConfig {
    /// Checks the window capacity and weight floor.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(TransportError::InvalidEstimatorConfig {
                reason: "limit must be positive".to_string(),
            });
        }
        if !self.min_bytes_threshold.is_finite() || self.min_bytes_threshold < 0.0 {
            return Err(TransportError::InvalidEstimatorConfig {
                reason: format!("min_bytes_threshold must be a non-negative number, got {}", self.min_bytes_threshold),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    weight: f64,
    estimate: f64,
}

/// Bounded FIFO window of `(weight, estimate)` samples with O(1) weighted mean.
#[derive(Debug, Clone)]
pub struct BandwidthEstimator {
    limit: usize,
    min_bytes_threshold: f64,
    samples: VecDeque<Sample>,
    total_weight: f64,
    weighted_sum: f64,
    evictions_since_resum: usize,
}

impl BandwidthEstimator {
    /// Creates an empty estimator from a validated config.
    pub fn new(config: &EstimatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            limit: config.limit,
            min_bytes_threshold: config.min_bytes_threshold,
            samples: VecDeque::with_capacity(config.limit),
            total_weight: 0.0,
            weighted_sum: 0.0,
            evictions_since_resum: 0,
        })
    }

    /// Records one observation of `estimate` measured over `weight_bytes`.
    ///
    /// Samples lighter than the minimum weight (or weightless), and samples
    /// with non-finite values, are dropped without touching the window.
    pub fn update(&mut self, weight_bytes: f64, estimate: f64) {
        if !weight_bytes.is_finite() || !estimate.is_finite() {
            trace!(weight_bytes, estimate, "ignoring non-finite bandwidth sample");
            return;
        }
        if weight_bytes < self.min_bytes_threshold || weight_bytes <= 0.0 {
            return;
        }

        if self.samples.len() == self.limit {
            if let Some(evicted) = self.samples.pop_front() {
                self.total_weight -= evicted.weight;
                self.weighted_sum -= evicted.weight * evicted.estimate;
                self.evictions_since_resum += 1;
            }
        }

        self.samples.push_back(Sample {
            weight: weight_bytes,
            estimate,
        });
        self.total_weight += weight_bytes;
        self.weighted_sum += weight_bytes * estimate;

        // Every sample has been replaced once since the last exact sum, so the
        // running aggregates are recomputed to shed accumulated rounding error.
        if self.evictions_since_resum >= self.limit {
            self.resum();
        }
    }

    /// Weighted mean of the retained samples, or 0 when the window is empty.
    pub fn estimate(&self) -> f64 {
        if self.samples.is_empty() || self.total_weight <= 0.0 {
            return 0.0;
        }
        self.weighted_sum / self.total_weight
    }

    /// Number of retained samples.
    pub fn size(&self) -> usize {
        self.samples.len()
    }

    /// Window capacity.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns true if no sample is retained.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sum of the weights of the retained samples.
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    fn resum(&mut self) {
        self.total_weight = self.samples.iter().map(|s| s.weight).sum();
        self.weighted_sum = self.samples.iter().map(|s| s.weight * s.estimate).sum();
        self.evictions_since_resum = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator(limit: usize, min_bytes_threshold: f64) -> BandwidthEstimator {
        BandwidthEstimator::new(&EstimatorConfig {
            limit,
            min_bytes_threshold,
        })
        .unwrap()
    }

    // kb_sent and ABE pairs as reported by BBR on a live connection
    const FIELD_DATA: &[(f64, f64)] = &[
        (1.1, 0.058688),
        (6.8, 0.29344),
        (6.7, 0.292064),
        (3.1, 0.176064),
        (6.9, 0.302416),
        (6.6, 0.302416),
        (1.2, 0.060064),
        (7.1, 0.302416),
        (7.5, 0.361104),
        (3.4, 0.175376),
        (7.8, 0.350752),
        (2.8, 0.120824),
        (5.6, 0.241656),
        (7.5, 0.36456),
        (8.1, 0.360416),
        (3.9, 0.176064),
        (4.5, 0.234064),
        (7.1, 0.302416),
        (2.0, 0.117376),
        (3.0, 0.175376),
        (2.1, 0.117376),
        (2.8, 0.120824),
        (8.0, 0.35144),
        (5.3, 0.233368),
        (1.3, 0.058688),
        (6.9, 0.29344),
        (7.1, 0.30104),
        (1.0, 0.060064),
        (2.4, 0.117376),
        (1.3, 0.060064),
        (3.8, 0.18228),
        (5.0, 0.233368),
        (1.2, 0.058688),
        (22.0, 0.637984),
        (99.0, 2.032712),
        (3.2, 0.180208),
        (21.0, 0.641432),
        (25.0, 0.644192),
        (1.7, 0.1084),
        (374.0, 6.85212),
        (22.0, 0.659384),
        (2500.0, 25.694784),
        (27.0, 0.660072),
        (11000.0, 53.7758),
        (21.0, 0.637984),
        (20.0, 0.64212),
    ];

    #[test]
    fn test_config_defaults() {
        let config = EstimatorConfig::default();
        assert_eq!(config.limit, 25);
        assert_eq!(config.min_bytes_threshold, 2048.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let zero = EstimatorConfig {
            limit: 0,
            ..EstimatorConfig::default()
        };
        assert!(BandwidthEstimator::new(&zero).is_err());

        let negative = EstimatorConfig {
            min_bytes_threshold: -1.0,
            ..EstimatorConfig::default()
        };
        assert!(negative.validate().is_err());

        let nan = EstimatorConfig {
            min_bytes_threshold: f64::NAN,
            ..EstimatorConfig::default()
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_empty_estimate_is_zero() {
        let est = estimator(25, 2048.0);
        assert_eq!(est.estimate(), 0.0);
        assert!(est.is_empty());
    }

    #[test]
    fn test_light_samples_ignored() {
        let mut est = estimator(25, 2048.0);
        for i in 0..100 {
            est.update(2047.0, i as f64);
        }
        assert_eq!(est.estimate(), 0.0);
        assert_eq!(est.size(), 0);
    }

    #[test]
    fn test_weighted_mean() {
        let mut est = estimator(25, 1.0);
        est.update(1.0, 10.0);
        est.update(3.0, 2.0);
        assert!((est.estimate() - 4.0).abs() < 1e-12);
        assert_eq!(est.total_weight(), 4.0);
    }

    #[test]
    fn test_fifo_eviction_literal_sequence() {
        let limit = 10;
        let mut est = estimator(limit, 1.0);
        for i in 0..(limit + 5) {
            est.update(1.0, i as f64);
            assert!(est.size() <= limit);
        }
        assert_eq!(est.size(), limit);
        // mean of 5..=14
        assert!((est.estimate() - 9.5).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut est = estimator(5, 100.0);
        est.update(100.0, 7.0);
        assert_eq!(est.size(), 1);
        assert_eq!(est.estimate(), 7.0);
    }

    #[test]
    fn test_non_finite_samples_ignored() {
        let mut est = estimator(5, 1.0);
        est.update(10.0, 3.0);
        est.update(f64::NAN, 1.0);
        est.update(10.0, f64::INFINITY);
        assert_eq!(est.size(), 1);
        assert_eq!(est.estimate(), 3.0);
    }

    #[test]
    fn test_field_data() {
        let limit = 25;
        let threshold = 2048.0;
        let mut est = estimator(limit, threshold);
        let mut accepted = 0usize;
        for &(kb, abe) in FIELD_DATA {
            let bytes = kb * 1024.0;
            est.update(bytes, abe);
            if bytes >= threshold {
                accepted += 1;
            }
            assert!(est.size() <= limit);
            assert_eq!(est.size(), accepted.min(limit));
            let value = est.estimate();
            assert!(value > 0.0 || accepted == 0);
        }
        // large transfers dominate the small-sample noise
        assert!(est.estimate() > 10.0);
    }

    #[test]
    fn test_aggregates_stay_exact_after_many_cycles() {
        let mut est = estimator(4, 1.0);
        for i in 0..10_000u32 {
            est.update(1.0 + (i % 7) as f64 * 1e6, 0.1 * (i % 13) as f64);
        }
        let expected_weights: f64 = (9_996..10_000u32).map(|i| 1.0 + (i % 7) as f64 * 1e6).sum();
        assert!((est.total_weight() - expected_weights).abs() < 1e-6);
    }
}
