//! Timed playback of snapshots.
//!
//! Pacing is behind the `Pacer` trait so the engine stays free of real
//! clocks in tests. Cancellation is observed between frames only; a frame
//! callback always runs to completion.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cancel::CancelToken;
use crate::error::{IsoError, Result};
use crate::history::{History, Snapshot};

/// Longest uninterrupted sleep of `ThreadPacer`.
const SLEEP_SLICE: Duration = Duration::from_millis(25);

pub trait Pacer {
    /// Wait up to `interval`, returning early once `cancel` fires.
    fn wait(&mut self, interval: Duration, cancel: &CancelToken);
}

/// Real-time pacer: sleeps the calling thread in short slices.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn wait(&mut self, interval: Duration, cancel: &CancelToken) {
        let deadline = Instant::now() + interval;
        while !cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Frame<'s> {
    /// Zero-based position in playback order.
    pub position: usize,
    pub total: usize,
    pub snapshot: &'s Snapshot,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplayOutcome {
    pub emitted: usize,
    pub cancelled: bool,
}

#[derive(Clone, Debug)]
pub struct Replay<'s> {
    frames: Vec<&'s Snapshot>,
    interval: Duration,
}

impl<'s> Replay<'s> {
    /// `speed` scales the base interval: 2.0 plays twice as fast.
    pub fn new(frames: Vec<&'s Snapshot>, base_interval: Duration, speed: f64) -> Result<Self> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(IsoError::InvalidArgument(format!(
                "replay speed must be a positive number, got {speed}"
            )));
        }
        let interval = Duration::try_from_secs_f64(base_interval.as_secs_f64() / speed)
            .map_err(|e| IsoError::InvalidArgument(format!("replay interval: {e}")))?;
        Ok(Self { frames, interval })
    }

    /// Frames from `from` to `to` on `branch`; reverse order when `from`
    /// comes later in the lineage.
    pub fn from_history(
        history: &'s History,
        branch: &str,
        from: u64,
        to: u64,
        base_interval: Duration,
        speed: f64,
    ) -> Result<Self> {
        let frames = history.range(branch, from, to)?;
        Self::new(frames, base_interval, speed)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn run<P, F>(&self, cancel: &CancelToken, pacer: &mut P, mut on_frame: F) -> ReplayOutcome
    where
        P: Pacer + ?Sized,
        F: FnMut(Frame<'s>),
    {
        let total = self.frames.len();
        let mut outcome = ReplayOutcome::default();
        for (position, &snapshot) in self.frames.iter().enumerate() {
            if position > 0 {
                pacer.wait(self.interval, cancel);
            }
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                return outcome;
            }
            on_frame(Frame {
                position,
                total,
                snapshot,
            });
            outcome.emitted += 1;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterState;
    use crate::history::MAIN_BRANCH;

    #[derive(Default)]
    struct RecordingPacer {
        waits: Vec<Duration>,
    }

    impl Pacer for RecordingPacer {
        fn wait(&mut self, interval: Duration, _cancel: &CancelToken) {
            self.waits.push(interval);
        }
    }

    fn history(n: usize) -> (History, Vec<u64>) {
        let mut h = History::new();
        let idx = (0..n)
            .map(|i| h.capture_at(FilterState::new(), None, i as i64))
            .collect();
        (h, idx)
    }

    #[test]
    fn test_emits_every_frame_at_scaled_interval() {
        let (h, idx) = history(3);
        let replay =
            Replay::from_history(&h, MAIN_BRANCH, idx[0], idx[2], Duration::from_millis(500), 2.0)
                .unwrap();
        let mut pacer = RecordingPacer::default();
        let mut seen = Vec::new();
        let outcome = replay.run(&CancelToken::new(), &mut pacer, |f| {
            seen.push((f.position, f.total, f.snapshot.index))
        });
        assert_eq!(outcome, ReplayOutcome { emitted: 3, cancelled: false });
        assert_eq!(seen, vec![(0, 3, idx[0]), (1, 3, idx[1]), (2, 3, idx[2])]);
        assert_eq!(pacer.waits, vec![Duration::from_millis(250); 2]);
    }

    #[test]
    fn test_reverse_replay() {
        let (h, idx) = history(3);
        let replay =
            Replay::from_history(&h, MAIN_BRANCH, idx[2], idx[0], Duration::ZERO, 1.0).unwrap();
        let mut order = Vec::new();
        replay.run(&CancelToken::new(), &mut RecordingPacer::default(), |f| {
            order.push(f.snapshot.index)
        });
        assert_eq!(order, vec![idx[2], idx[1], idx[0]]);
    }

    #[test]
    fn test_cancel_stops_between_frames() {
        let (h, idx) = history(5);
        let replay =
            Replay::from_history(&h, MAIN_BRANCH, idx[0], idx[4], Duration::ZERO, 1.0).unwrap();
        let token = CancelToken::new();
        let outcome = replay.run(&token, &mut RecordingPacer::default(), |f| {
            if f.position == 1 {
                token.cancel();
            }
        });
        assert_eq!(outcome, ReplayOutcome { emitted: 2, cancelled: true });
    }

    #[test]
    fn test_rejects_bad_speed() {
        for speed in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(Replay::new(vec![], Duration::from_millis(10), speed).is_err());
        }
    }

    #[test]
    fn test_thread_pacer_returns_on_cancel() {
        let token = CancelToken::new();
        token.cancel();
        let start = Instant::now();
        ThreadPacer.wait(Duration::from_secs(30), &token);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
