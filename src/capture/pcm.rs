//! Raw PCM plumbing for the microphone adapter
//!
//! The capture callback pushes samples into a [`RecorderTap`]; a recorder
//! thread runs [`run_emitter`] to hand them to the engine once per
//! timeslice. Nothing here touches the audio host.

use super::traits::{EventSink, NativeEvent};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// Convert signed 16-bit samples to `[-1.0, 1.0)`
pub(crate) fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / 32768.0).collect()
}

/// Bounded window over the most recent samples
#[derive(Debug)]
pub(crate) struct SampleWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SampleWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, samples: &[f32]) {
        for &sample in samples {
            if self.samples.len() >= self.capacity {
                self.samples.pop_front();
            }
            self.samples.push_back(sample);
        }
    }

    /// Up to `n` of the newest samples, oldest first
    pub(crate) fn latest(&self, n: usize) -> Vec<f32> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).copied().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Default)]
struct TapState {
    recording: bool,
    stopping: bool,
    pending: Vec<u8>,
}

/// Bytes captured for one recorder, waiting to be emitted
///
/// Samples are only accepted while recording. Bytes captured before a
/// pause stay pending and go out with the next chunk after resume, or
/// with the final flush.
#[derive(Debug, Default)]
pub(crate) struct RecorderTap {
    state: Mutex<TapState>,
    wake: Condvar,
}

impl RecorderTap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append samples as little-endian f32 bytes
    pub(crate) fn push(&self, samples: &[f32]) {
        let mut state = self.state.lock();
        if state.recording && !state.stopping {
            state
                .pending
                .extend(samples.iter().flat_map(|s| s.to_le_bytes()));
        }
    }

    pub(crate) fn set_recording(&self, recording: bool) {
        let mut state = self.state.lock();
        if !state.stopping {
            state.recording = recording;
        }
    }

    /// Stop accepting samples and wake the emitter for its final flush
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        state.recording = false;
        state.stopping = true;
        self.wake.notify_all();
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

/// Emit pending bytes every `timeslice` until the tap stops, then flush
/// what is left and report `RecorderStopped`
///
/// Nothing is emitted while paused, so the engine never sees a chunk
/// outside of recording or the stop flush.
pub(crate) fn run_emitter(tap: &RecorderTap, timeslice: Duration, events: &dyn EventSink) {
    loop {
        let mut state = tap.state.lock();
        if !state.stopping {
            tap.wake.wait_for(&mut state, timeslice);
        }

        if state.stopping {
            let last = std::mem::take(&mut state.pending);
            drop(state);
            if !last.is_empty() {
                events.emit(NativeEvent::Data(last));
            }
            events.emit(NativeEvent::RecorderStopped);
            return;
        }

        if !state.recording || state.pending.is_empty() {
            continue;
        }
        let chunk = std::mem::take(&mut state.pending);
        drop(state);
        events.emit(NativeEvent::Data(chunk));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Collector {
        events: Mutex<Vec<NativeEvent>>,
    }

    impl EventSink for Collector {
        fn emit(&self, event: NativeEvent) {
            self.events.lock().push(event);
        }
    }

    impl Collector {
        fn data_bytes(&self) -> usize {
            self.events
                .lock()
                .iter()
                .map(|e| match e {
                    NativeEvent::Data(bytes) => bytes.len(),
                    _ => 0,
                })
                .sum()
        }
    }

    #[test]
    fn test_stop_flushes_pending_bytes_before_stopped() {
        let tap = RecorderTap::new();
        let events = Collector::default();

        tap.set_recording(true);
        tap.push(&[0.5; 100]);
        tap.stop();
        run_emitter(&tap, Duration::from_secs(1), &events);

        let expected: Vec<u8> = [0.5f32; 100].iter().flat_map(|s| s.to_le_bytes()).collect();
        let events = events.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], NativeEvent::Data(expected));
        assert_eq!(events[1], NativeEvent::RecorderStopped);
    }

    #[test]
    fn test_every_byte_is_emitted_from_a_running_recorder() {
        let tap = Arc::new(RecorderTap::new());
        let events = Arc::new(Collector::default());
        tap.set_recording(true);

        let emitter = {
            let tap = tap.clone();
            let events = events.clone();
            std::thread::spawn(move || run_emitter(&tap, Duration::from_millis(5), events.as_ref()))
        };

        for _ in 0..20 {
            tap.push(&[0.25; 64]);
            std::thread::sleep(Duration::from_millis(2));
        }
        tap.stop();
        emitter.join().unwrap();

        assert_eq!(events.data_bytes(), 20 * 64 * 4);
        assert_eq!(events.events.lock().last(), Some(&NativeEvent::RecorderStopped));
        assert_eq!(tap.pending_len(), 0);
    }

    #[test]
    fn test_pause_keeps_captured_bytes_and_ignores_new_ones() {
        let tap = RecorderTap::new();
        let events = Collector::default();

        tap.set_recording(true);
        tap.push(&[0.1; 10]);
        tap.set_recording(false);
        tap.push(&[0.9; 30]);
        assert_eq!(tap.pending_len(), 40);

        tap.stop();
        run_emitter(&tap, Duration::from_millis(5), &events);
        assert_eq!(events.data_bytes(), 40);
    }

    #[test]
    fn test_paused_tap_emits_nothing_until_stop() {
        let tap = Arc::new(RecorderTap::new());
        let events = Arc::new(Collector::default());
        tap.set_recording(true);
        tap.push(&[0.3; 8]);
        tap.set_recording(false);

        let emitter = {
            let tap = tap.clone();
            let events = events.clone();
            std::thread::spawn(move || run_emitter(&tap, Duration::from_millis(2), events.as_ref()))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(events.events.lock().is_empty());

        tap.stop();
        emitter.join().unwrap();
        assert_eq!(events.data_bytes(), 32);
    }

    #[test]
    fn test_samples_before_start_and_after_stop_are_ignored() {
        let tap = RecorderTap::new();
        tap.push(&[1.0; 4]);
        assert_eq!(tap.pending_len(), 0);

        tap.stop();
        tap.set_recording(true);
        tap.push(&[1.0; 4]);
        assert_eq!(tap.pending_len(), 0);
    }

    #[test]
    fn test_i16_conversion() {
        assert_eq!(i16_to_f32(&[0, 16384, i16::MIN]), vec![0.0, 0.5, -1.0]);
        assert!(i16_to_f32(&[i16::MAX])[0] < 1.0);
    }

    #[test]
    fn test_sample_window_evicts_oldest() {
        let mut window = SampleWindow::new(4);
        assert!(window.is_empty());

        window.push(&[1.0, 2.0, 3.0]);
        window.push(&[4.0, 5.0, 6.0]);
        assert_eq!(window.latest(10), vec![3.0, 4.0, 5.0, 6.0]);
        assert_eq!(window.latest(2), vec![5.0, 6.0]);
    }
}
