//! Live signal sampling
//!
//! Reads instantaneous signal data off the bound stream for visualization
//! and keeps a bounded rolling history of the readings.

use crate::capture::traits::{Analyser, SignalSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of samples kept in the history
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// One reading from the sampling loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSample {
    /// Session time of the reading
    pub at_ms: f64,

    /// Scalar level for meters, 0.0..=1.0
    pub level: f32,

    /// Maximum absolute amplitude
    pub peak: f32,

    /// Root mean square of the time-domain data
    pub rms: f32,

    /// Frequency magnitudes, 0.0..=1.0
    pub frequency: Vec<f32>,

    /// Time-domain amplitudes
    pub waveform: Vec<f32>,
}

impl AnalyticsSample {
    pub fn from_snapshot(snapshot: SignalSnapshot, at_ms: f64) -> Self {
        let peak = peak(&snapshot.time_domain);
        let rms = rms(&snapshot.time_domain);
        let level = if snapshot.frequency.is_empty() {
            rms
        } else {
            mean(&snapshot.frequency)
        };

        Self {
            at_ms,
            level: level.clamp(0.0, 1.0),
            peak,
            rms,
            frequency: snapshot.frequency,
            waveform: snapshot.time_domain,
        }
    }
}

/// Take one reading. A missing snapshot is a skipped sample, not an error.
pub fn sample_once(analyser: &mut dyn Analyser, at_ms: f64) -> Option<AnalyticsSample> {
    analyser
        .snapshot()
        .map(|snapshot| AnalyticsSample::from_snapshot(snapshot, at_ms))
}

/// Maximum absolute amplitude, normalized to 0.0..=1.0
pub fn peak(samples: &[f32]) -> f32 {
    samples
        .iter()
        .map(|s| s.abs())
        .fold(0.0f32, f32::max)
        .min(1.0)
}

/// Root mean square amplitude
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

/// Fixed-capacity ring of recent samples, oldest dropped first
#[derive(Debug, Clone)]
pub struct SampleHistory {
    samples: VecDeque<AnalyticsSample>,
    capacity: usize,
}

impl SampleHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: AnalyticsSample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&AnalyticsSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Levels, oldest first
    pub fn levels(&self) -> Vec<f32> {
        self.samples.iter().map(|s| s.level).collect()
    }

    pub fn to_vec(&self) -> Vec<AnalyticsSample> {
        self.samples.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for SampleHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
