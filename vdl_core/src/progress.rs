use std::time::Instant;

/// EMA smoothing factor. 0.3 = responsive but stable.
const EMA_ALPHA: f64 = 0.3;

/// Exponentially weighted byte-rate meter fed at chunk boundaries.
///
/// Adapters record the size of every chunk they write; the meter keeps a
/// smoothed bytes/sec figure and derives an ETA from the remaining byte
/// count.
#[derive(Debug)]
pub struct SpeedMeter {
    speed: f64,
    last_update: Instant,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            speed: 0.0,
            last_update: Instant::now(),
        }
    }

    /// Record `bytes_delta` received now; returns the updated speed in
    /// bytes per second.
    pub fn record(&mut self, bytes_delta: u64) -> f64 {
        self.record_at(bytes_delta, Instant::now())
    }

    fn record_at(&mut self, bytes_delta: u64, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        if elapsed > 0.0 {
            let instant_speed = bytes_delta as f64 / elapsed;
            self.speed = EMA_ALPHA * instant_speed + (1.0 - EMA_ALPHA) * self.speed;
            self.last_update = now;
        }
        self.speed
    }

    pub fn speed_bps(&self) -> f64 {
        self.speed
    }

    /// Whole-second ETA for `remaining` bytes; `None` until the meter has
    /// seen any traffic.
    pub fn eta_seconds(&self, remaining: u64) -> Option<u64> {
        if self.speed > 0.0 {
            Some((remaining as f64 / self.speed) as u64)
        } else {
            None
        }
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentage of `done` against an optional `total`, clamped to [0, 100].
pub fn percent_of(done: u64, total: Option<u64>) -> f64 {
    match total {
        Some(total) if total > 0 => ((done as f64 / total as f64) * 100.0).clamp(0.0, 100.0),
        _ => 0.0,
    }
}
