use std::time::{Duration, Instant};

/// Base pause between two rendered frames.
pub const MIN_FRAME_GAP: Duration = Duration::from_millis(10);
/// Timestamp jumps larger than this restart the pacing clock.
pub const RESYNC_JUMP_MS: i64 = 1000;
/// Longest a single frame is held back.
pub const MAX_AHEAD: Duration = Duration::from_millis(100);

/// Schedules frames against their timestamps.
///
/// Each deadline is the previous deadline advanced by the timestamp delta,
/// so short hiccups are absorbed instead of accumulating. A frame that is
/// already late is shown at once and becomes the new anchor.
#[derive(Debug, Default)]
pub struct Pacer {
    last: Option<(Instant, i64)>,
}

impl Pacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long to wait before presenting a frame with these timestamps.
    pub fn delay(&mut self, pts_ms: Option<i64>, duration_ms: Option<i64>, now: Instant) -> Duration {
        let pts = pts_ms.or_else(|| Some(self.last?.1 + duration_ms?));
        let deadline = match (self.last, pts) {
            (Some((previous, previous_pts)), Some(pts))
                if (0..=RESYNC_JUMP_MS).contains(&(pts - previous_pts)) =>
            {
                previous + Duration::from_millis((pts - previous_pts) as u64)
            }
            _ => now,
        };
        let deadline = deadline.clamp(now, now + MAX_AHEAD);
        self.last = pts.map(|pts| (deadline, pts));
        deadline - now
    }
}

/// Pause after a rendered frame; shrinks as the backlog grows.
pub fn adaptive_gap(queue_depth: usize) -> Duration {
    MIN_FRAME_GAP / (queue_depth as u32 + 1)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateReport {
    pub fps: f64,
    pub latency: Duration,
}

impl RateReport {
    pub fn title(&self) -> String {
        format!(
            "Remote Desktop Client (framerate = {:.0} fps, pipeline latency = {} ms)",
            self.fps,
            self.latency.as_millis()
        )
    }
}

/// Frame rate and mean intake-to-screen latency over one-second windows.
#[derive(Debug)]
pub struct RateCounter {
    window_start: Instant,
    frames: u32,
    latency: Duration,
}

impl RateCounter {
    pub const WINDOW: Duration = Duration::from_secs(1);

    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            frames: 0,
            latency: Duration::ZERO,
        }
    }

    pub fn record(&mut self, latency: Duration, now: Instant) -> Option<RateReport> {
        self.frames += 1;
        self.latency += latency;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < Self::WINDOW {
            return None;
        }
        let report = RateReport {
            fps: self.frames as f64 / elapsed.as_secs_f64(),
            latency: self.latency / self.frames,
        };
        *self = Self::new(now);
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn first_frame_is_immediate() {
        let mut pacer = Pacer::new();
        assert_eq!(pacer.delay(Some(5000), Some(33), Instant::now()), Duration::ZERO);
    }

    #[test]
    fn steady_stream_follows_timestamps() {
        let mut pacer = Pacer::new();
        let t0 = Instant::now();
        assert_eq!(pacer.delay(Some(0), None, t0), Duration::ZERO);
        assert_eq!(pacer.delay(Some(33), None, t0), ms(33));
        assert_eq!(pacer.delay(Some(66), None, t0 + ms(33)), ms(33));
        assert_eq!(pacer.delay(Some(100), None, t0 + ms(80)), ms(20));
    }

    #[test]
    fn late_frame_is_shown_at_once() {
        let mut pacer = Pacer::new();
        let t0 = Instant::now();
        pacer.delay(Some(0), None, t0);
        assert_eq!(pacer.delay(Some(33), None, t0 + ms(50)), Duration::ZERO);
        // Re-anchored on the late frame.
        assert_eq!(pacer.delay(Some(66), None, t0 + ms(50)), ms(33));
    }

    #[test]
    fn timestamp_jumps_reset_the_clock() {
        let mut pacer = Pacer::new();
        let t0 = Instant::now();
        pacer.delay(Some(10_000), None, t0);
        assert_eq!(pacer.delay(Some(5_000), None, t0), Duration::ZERO);
        assert_eq!(pacer.delay(Some(9_000), None, t0), Duration::ZERO);
    }

    #[test]
    fn missing_timestamp_uses_duration() {
        let mut pacer = Pacer::new();
        let t0 = Instant::now();
        pacer.delay(Some(0), Some(20), t0);
        assert_eq!(pacer.delay(None, Some(20), t0), ms(20));
        assert_eq!(pacer.delay(None, None, t0), Duration::ZERO);
    }

    #[test]
    fn wait_is_capped() {
        let mut pacer = Pacer::new();
        let t0 = Instant::now();
        pacer.delay(Some(0), None, t0);
        assert_eq!(pacer.delay(Some(900), None, t0), MAX_AHEAD);
    }

    #[test]
    fn gap_shrinks_with_backlog() {
        assert_eq!(adaptive_gap(0), MIN_FRAME_GAP);
        assert_eq!(adaptive_gap(1), ms(5));
        assert!(adaptive_gap(2) < adaptive_gap(1));
    }

    #[test]
    fn rate_reported_once_per_window() {
        let t0 = Instant::now();
        let mut counter = RateCounter::new(t0);
        for i in 0..29 {
            assert!(counter.record(ms(20), t0 + ms(i * 33)).is_none());
        }
        let report = counter.record(ms(40), t0 + ms(1000)).unwrap();
        assert_eq!(report.latency, ms(20) + (ms(20) / 30));
        assert!((report.fps - 30.0).abs() < 0.01);
        assert_eq!(
            RateReport {
                fps: 30.0,
                latency: ms(12)
            }
            .title(),
            "Remote Desktop Client (framerate = 30 fps, pipeline latency = 12 ms)"
        );
        assert!(counter.record(ms(20), t0 + ms(1010)).is_none());
    }
}
