// rejourney — session replay for mobile apps
// https://rejourney.co

//! Adaptive capture sampling.
//!
//! High-volume projects get throttled capture so replay storage stays
//! proportional to what the dashboard can usefully retain. The factor is
//! read on every capture by the scheduler (cadence) and on every append by
//! the encoder (quality), so it lives behind an atomic.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Session-count tiers; at or above a tier the factor drops.
const TIER_MEDIUM: f64 = 50.0;
const TIER_HIGH: f64 = 500.0;

const FACTOR_FULL: f32 = 1.0;
const FACTOR_MEDIUM: f32 = 0.5;
const FACTOR_LOW: f32 = 0.2;

/// Minimum JPEG quality the sampler may clamp the encoder down to.
const MIN_QUALITY: f32 = 24.0;

/// Computes the capture scale factor from recent per-project volume.
#[derive(Debug)]
pub struct AdaptiveSampler {
    factor_bits: AtomicU32,
}

impl Default for AdaptiveSampler {
    fn default() -> Self {
        Self {
            factor_bits: AtomicU32::new(FACTOR_FULL.to_bits()),
        }
    }
}

impl AdaptiveSampler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current scale factor, one of 1.0 / 0.5 / 0.2.
    pub fn factor(&self) -> f32 {
        f32::from_bits(self.factor_bits.load(Ordering::Relaxed))
    }

    /// Map the mean of the last three days' session counts to a factor.
    pub fn factor_for_volume(mean_daily_sessions: f64) -> f32 {
        if !mean_daily_sessions.is_finite() || mean_daily_sessions < TIER_MEDIUM {
            FACTOR_FULL
        } else if mean_daily_sessions < TIER_HIGH {
            FACTOR_MEDIUM
        } else {
            FACTOR_LOW
        }
    }

    /// Feed the sampler recent daily session counts (most recent last).
    /// Missing or empty data leaves capture at full quality.
    pub fn update_from_daily_counts(&self, daily_counts: &[u64]) {
        let factor = if daily_counts.is_empty() {
            FACTOR_FULL
        } else {
            let tail = &daily_counts[daily_counts.len().saturating_sub(3)..];
            let mean = tail.iter().sum::<u64>() as f64 / tail.len() as f64;
            Self::factor_for_volume(mean)
        };
        self.factor_bits.store(factor.to_bits(), Ordering::Relaxed);
        debug!("adaptive sampler factor set to {}", factor);
    }

    /// Encoder quality derived from the factor, clamped so frames stay
    /// legible even at the lowest tier.
    pub fn scaled_quality(&self, base_quality: u8) -> u8 {
        (base_quality as f32 * self.factor()).clamp(MIN_QUALITY, 100.0) as u8
    }
}
