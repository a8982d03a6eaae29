//! Tick timer with xrun detection.
//!
//! Tracks the NTP timestamps passed into `process()` and flags ticks whose
//! wall-clock delta deviates from the nominal block period by more than the
//! configured tolerance, which indicates that the audio thread was blocked
//! or the host dropped buffers.

use aoo_wire::NtpTime;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tick {
    /// First update after setup/reset.
    First,
    /// Regular tick; carries the measured delta in seconds.
    Ok(f64),
    /// The tick was late; carries the number of missed block periods.
    XRun(f64),
}

#[derive(Debug, Default, Clone)]
pub struct Timer {
    period: f64,
    tolerance: f64,
    last: Option<NtpTime>,
    elapsed: f64,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setup(&mut self, period: f64, tolerance: f64) {
        self.period = period;
        self.tolerance = tolerance;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.elapsed = 0.0;
    }

    /// Total stream time in seconds since the first tick.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    pub fn update(&mut self, t: NtpTime) -> Tick {
        let last = match self.last.replace(t) {
            Some(l) => l,
            None => return Tick::First,
        };
        let delta = t.duration_since(last);
        self.elapsed += delta;
        if self.period > 0.0 {
            let deviation = (delta - self.period) / self.period;
            if deviation > self.tolerance {
                return Tick::XRun(delta / self.period - 1.0);
            }
        }
        Tick::Ok(delta)
    }
}
