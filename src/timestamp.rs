//! Media time to RTP sample-duration conversion
//!
//! Each outbound track keeps one [`TimestampTracker`]. It remembers the media
//! time of the last forwarded sample and converts the elapsed time up to the
//! next one into ticks of the track's clock.

use std::time::Duration;

use tracing::warn;

/// RTP clock of H.264 video.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// RTP clock of Opus audio.
pub const AUDIO_CLOCK_RATE: u32 = 48_000;

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct TimestampTracker {
    clock_rate: u32,
    last: Option<Duration>,
}

impl TimestampTracker {
    pub fn new(clock_rate: u32) -> TimestampTracker {
        TimestampTracker {
            clock_rate,
            last: None,
        }
    }

    pub fn video() -> TimestampTracker {
        TimestampTracker::new(VIDEO_CLOCK_RATE)
    }

    pub fn audio() -> TimestampTracker {
        TimestampTracker::new(AUDIO_CLOCK_RATE)
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Media time of the last committed sample.
    pub fn last(&self) -> Option<Duration> {
        self.last
    }

    /// Clock ticks between the last committed sample and `time`.
    ///
    /// The first sample spans 0 ticks. A time earlier than the last committed
    /// one also yields 0.
    pub fn sample_count(&self, time: Duration) -> u32 {
        let Some(last) = self.last else {
            return 0;
        };

        let Some(elapsed) = time.checked_sub(last) else {
            warn!(?time, ?last, "media time went backwards, clamping sample duration to 0");
            return 0;
        };

        let ticks = elapsed.as_nanos() * self.clock_rate as u128 / NANOS_PER_SEC;
        u32::try_from(ticks).unwrap_or(u32::MAX)
    }

    /// Records `time` as forwarded. The clock never moves backwards.
    pub fn commit(&mut self, time: Duration) {
        self.last = Some(match self.last {
            Some(last) if last > time => last,
            _ => time,
        });
    }
}
