//! Frame pacing for the render loop.

use std::time::{Duration, Instant};

/// Paces a loop to a target frequency.
///
/// The limiter keeps an absolute schedule, so a late frame does not push
/// every following deadline back. If the loop falls more than one frame
/// behind, the schedule is resynchronized to the current time.
#[derive(Debug)]
pub struct FrameLimiter {
    frame_time: Duration,
    next_deadline: Instant,
    last_tick: Instant,
}

impl FrameLimiter {
    /// Create a limiter targeting `frequency` frames per second.
    ///
    /// A frequency of zero disables pacing.
    pub fn new(frequency: f32) -> Self {
        let frame_time = if frequency > 0.0 {
            Duration::from_secs_f64(1.0 / f64::from(frequency))
        } else {
            Duration::ZERO
        };
        let now = Instant::now();
        Self {
            frame_time,
            next_deadline: now + frame_time,
            last_tick: now,
        }
    }

    /// Target duration of a single frame.
    #[inline]
    pub fn frame_time(&self) -> Duration {
        self.frame_time
    }

    /// Time left until the next frame is due, if any.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.next_deadline.checked_duration_since(now).filter(|d| !d.is_zero())
    }

    /// Advance the schedule by one frame and return the delta since the
    /// previous call.
    pub fn advance(&mut self, now: Instant) -> Duration {
        let delta = now - self.last_tick;
        self.last_tick = now;
        self.next_deadline += self.frame_time;
        if self.next_deadline + self.frame_time < now {
            self.next_deadline = now + self.frame_time;
        }
        delta
    }

    /// Sleep until the next frame is due, then advance.
    ///
    /// Returns the elapsed time since the previous frame in seconds.
    pub fn wait(&mut self) -> f32 {
        if let Some(remaining) = self.remaining(Instant::now()) {
            std::thread::sleep(remaining);
        }
        self.advance(Instant::now()).as_secs_f32()
    }
}

impl Default for FrameLimiter {
    fn default() -> Self {
        Self::new(60.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_time_from_frequency() {
        let limiter = FrameLimiter::new(50.0);
        assert_eq!(limiter.frame_time(), Duration::from_millis(20));
    }

    #[test]
    fn test_zero_frequency_disables_pacing() {
        let limiter = FrameLimiter::new(0.0);
        assert_eq!(limiter.frame_time(), Duration::ZERO);
        assert!(limiter.remaining(Instant::now()).is_none());
    }

    #[test]
    fn test_schedule_resyncs_when_far_behind() {
        let mut limiter = FrameLimiter::new(100.0);
        let late = Instant::now() + Duration::from_secs(1);
        limiter.advance(late);
        let remaining = limiter.remaining(late).unwrap();
        assert!(remaining <= limiter.frame_time());
    }
}
