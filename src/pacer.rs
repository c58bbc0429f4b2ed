//! Frame pacer
//!
//! Once per render-loop tick, decide how many logical frames to emit so the
//! encoder timeline tracks wall-clock time at the target rate. Pure
//! scheduling over already-valid state: there are no error paths here, only
//! timing artifacts when the render loop and the target rate diverge.
//!
//! Timestamps are monotonic seconds supplied by the driver (for example
//! `Instant::elapsed().as_secs_f64()`), which keeps the math directly
//! testable with literal gap values.

use crate::logw;

/// What the driver should do with the current frame this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Ahead of schedule: push a no-data update to keep the encoder
    /// timeline continuous, and don't advance the frame counter.
    Coast,
    /// On schedule: push the current frame once.
    Emit,
    /// One interval behind: push the current frame twice. Duplication is an
    /// acknowledged inefficiency; proper catch-up would interpolate. #fixme
    EmitTwice,
    /// Two or more intervals behind: push once and jump the frame counter
    /// forward by `skipped` intervals to resynchronize.
    Resync { skipped: u64 },
}

pub struct Pacer {
    frame_rate: f32,
    start_time: f64,
    frame_count: u64,
    drop_count: u32,
    drop_warnings: u32,
}

impl Pacer {
    pub fn new(frame_rate: f32, start_time: f64) -> Self {
        Self {
            frame_rate,
            start_time,
            frame_count: 0,
            drop_count: 0,
            drop_warnings: 0,
        }
    }

    /// Frames emitted so far (monotonic within a session).
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Large-gap drop events observed so far.
    pub fn drop_count(&self) -> u32 {
        self.drop_count
    }

    /// Drop warnings surfaced so far (one per ten cumulative drops).
    pub fn drop_warnings(&self) -> u32 {
        self.drop_warnings
    }

    /// Evaluate the pacing policy for this tick. `now` must be monotonic
    /// across calls within a session.
    pub fn tick(&mut self, now: f64) -> Cadence {
        let rate = f64::from(self.frame_rate);
        let delta = 1.0 / rate;

        // The half-interval offset centers each ideal frame time within its
        // interval, so jitter around the boundary doesn't flip the decision
        // every tick.
        let ideal = self.start_time + (self.frame_count as f64 - 0.5) * delta;
        let gap = now - ideal;

        if gap < 0.0 {
            Cadence::Coast
        } else if gap < delta {
            self.frame_count += 1;
            Cadence::Emit
        } else if gap < delta * 2.0 {
            self.frame_count += 2;
            Cadence::EmitTwice
        } else {
            let skipped = (gap * rate).floor() as u64;
            self.frame_count += skipped;
            self.note_drop();
            Cadence::Resync { skipped }
        }
    }

    // Warn on every tenth cumulative drop, not on every drop, so a
    // struggling encoder doesn't flood the log.
    fn note_drop(&mut self) {
        self.drop_count += 1;
        if self.drop_count % 10 == 0 {
            self.drop_warnings += 1;
            logw!(
                "PACER",
                "significant frame dropping detected ({} drops so far); this may introduce \
                 time instability into the output. Decreasing the capture frame rate is \
                 recommended.",
                self.drop_count
            );
        }
    }
}
