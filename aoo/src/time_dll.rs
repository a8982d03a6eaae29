//! Delay-locked loop estimating the effective sample rate of the audio
//! clock.
//!
//! Second-order feedback loop after Fons Adriaensen's "Using a DLL to
//! filter time": each audio tick feeds the elapsed system time; the loop
//! tracks the observed block period and thereby the real sample rate,
//! which drives dynamic resampling on both ends of a stream.

/// Second-order time DLL.
#[derive(Debug, Default, Clone)]
pub struct TimeDll {
    block_size: f64,
    /// loop coefficients
    b: f64,
    c: f64,
    /// predicted time of the current and next tick
    t0: f64,
    t1: f64,
    /// filtered block period
    e2: f64,
}

impl TimeDll {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize the loop at time `t` (seconds).
    pub fn setup(&mut self, sample_rate: f64, block_size: i32, bandwidth: f64, t: f64) {
        self.block_size = block_size as f64;
        let period = self.block_size / sample_rate;
        let omega = 2.0 * std::f64::consts::PI * bandwidth;
        self.b = std::f64::consts::SQRT_2 * omega;
        self.c = omega * omega;
        self.e2 = period;
        self.t0 = t;
        self.t1 = t + period;
    }

    /// Feed the observed time of the next tick (seconds).
    pub fn update(&mut self, t: f64) {
        let e = t - self.t1;
        self.t0 = self.t1;
        self.t1 += self.b * e + self.e2;
        self.e2 += self.c * e;
    }

    /// Filtered block period in seconds.
    pub fn period(&self) -> f64 {
        self.e2
    }

    /// Estimated effective sample rate.
    pub fn sample_rate(&self) -> f64 {
        self.block_size / self.e2
    }

    /// Filtered time of the current tick.
    pub fn time(&self) -> f64 {
        self.t0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f64 = 48000.0;
    const BS: i32 = 64;

    #[test]
    fn test_tracks_nominal_rate() {
        let mut dll = TimeDll::new();
        let period = BS as f64 / SR;
        dll.setup(SR, BS, 0.012, 0.0);
        for i in 1..=500 {
            dll.update(i as f64 * period);
        }
        let err = (dll.sample_rate() - SR).abs() / SR;
        assert!(err < 0.01, "rate {} off nominal", dll.sample_rate());
    }

    #[test]
    fn test_tracks_drifting_clock() {
        // clock runs 0.1% slow: ticks arrive late, effective rate is lower
        let mut dll = TimeDll::new();
        let period = BS as f64 / SR * 1.001;
        dll.setup(SR, BS, 0.012, 0.0);
        for i in 1..=5000 {
            dll.update(i as f64 * period);
        }
        let expected = SR / 1.001;
        let err = (dll.sample_rate() - expected).abs() / expected;
        assert!(err < 0.001, "rate {} expected {}", dll.sample_rate(), expected);
    }

    #[test]
    fn test_absorbs_jitter() {
        // deterministic +-20% jitter on individual ticks must not move the
        // long-term estimate
        let mut dll = TimeDll::new();
        let period = BS as f64 / SR;
        dll.setup(SR, BS, 0.012, 0.0);
        for i in 1..=5000 {
            let jitter = if i % 2 == 0 { 0.2 } else { -0.2 };
            dll.update(i as f64 * period + jitter * period);
        }
        let err = (dll.sample_rate() - SR).abs() / SR;
        assert!(err < 0.01, "rate {} off nominal", dll.sample_rate());
    }
}
