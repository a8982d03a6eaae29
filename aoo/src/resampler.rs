//! Dynamic resampler between host and stream sample rates.
//!
//! A circular buffer of interleaved samples with a dynamic read ratio. The
//! ratio follows the DLL-estimated rates, so clock drift between two
//! machines is absorbed by fractional reading instead of periodic drops.

/// Interpolation used by the fractional read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleMethod {
    /// Pick the closest input frame.
    Nearest,
    /// Two-point linear interpolation.
    Linear,
    /// Four-point Catmull-Rom interpolation.
    #[default]
    Cubic,
}

/// Headroom factor for rate fluctuations.
const SPACE: usize = 3;

#[derive(Debug, Default)]
pub struct Resampler {
    buffer: Vec<f32>,
    nchannels: usize,
    /// read position in frames (fractional)
    rdpos: f64,
    /// write position in samples
    wrpos: usize,
    /// buffered samples (fractional because of fractional reads)
    balance: f64,
    ratio: f64,
    method: ResampleMethod,
}

impl Resampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setup(
        &mut self,
        nfrom: usize,
        nto: usize,
        sr_from: i32,
        sr_to: i32,
        nchannels: usize,
        method: ResampleMethod,
    ) {
        self.nchannels = nchannels;
        self.method = method;
        let blocksize = nfrom.max(nto);
        // extra space for fluctuations
        self.buffer = vec![0.0; blocksize * nchannels * SPACE];
        let _ = (sr_from, sr_to);
        self.clear();
    }

    pub fn clear(&mut self) {
        self.ratio = 1.0;
        self.rdpos = 0.0;
        self.wrpos = 0;
        self.balance = 0.0;
        self.buffer.fill(0.0);
    }

    /// Update the conversion ratio from the current input/output rates.
    pub fn update(&mut self, sr_from: f64, sr_to: f64) {
        if sr_from == sr_to {
            self.ratio = 1.0;
        } else {
            self.ratio = sr_to / sr_from;
        }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Samples that can still be written.
    pub fn write_available(&self) -> usize {
        (self.buffer.len() as f64 - self.balance + 0.5) as usize
    }

    pub fn write(&mut self, data: &[f32]) {
        let size = self.buffer.len();
        let n = data.len();
        let end = self.wrpos + n;
        let (n1, n2) = if end > size {
            (size - self.wrpos, end - size)
        } else {
            (n, 0)
        };
        self.buffer[self.wrpos..self.wrpos + n1].copy_from_slice(&data[..n1]);
        self.buffer[..n2].copy_from_slice(&data[n1..]);
        self.wrpos += n;
        if self.wrpos >= size {
            self.wrpos -= size;
        }
        self.balance += n as f64;
    }

    /// Samples that can be read at the current ratio.
    pub fn read_available(&self) -> usize {
        (self.balance * self.ratio) as usize
    }

    pub fn read(&mut self, data: &mut [f32]) {
        let size = self.buffer.len();
        let limit = size / self.nchannels;
        let n = data.len();
        let intpos = self.rdpos as usize;
        if self.ratio != 1.0 || (self.rdpos - intpos as f64) != 0.0 {
            // fractional read
            let incr = 1.0 / self.ratio;
            debug_assert!(incr > 0.0);
            let mut i = 0;
            while i < n {
                let index = self.rdpos as usize;
                let frac = self.rdpos - index as f64;
                for j in 0..self.nchannels {
                    data[i + j] = self.interpolate(index, frac as f32, j, limit);
                }
                i += self.nchannels;
                self.rdpos += incr;
                if self.rdpos >= limit as f64 {
                    self.rdpos -= limit as f64;
                }
            }
            self.balance -= n as f64 * incr;
        } else {
            // integer positions at unity ratio: plain copy
            let pos = intpos * self.nchannels;
            let end = pos + n;
            let (n1, n2) = if end > size {
                (size - pos, end - size)
            } else {
                (n, 0)
            };
            data[..n1].copy_from_slice(&self.buffer[pos..pos + n1]);
            data[n1..].copy_from_slice(&self.buffer[..n2]);
            self.rdpos += (n / self.nchannels) as f64;
            if self.rdpos >= limit as f64 {
                self.rdpos -= limit as f64;
            }
            self.balance -= n as f64;
        }
    }

    #[inline]
    fn frame(&self, index: usize, channel: usize, limit: usize) -> f32 {
        self.buffer[(index % limit) * self.nchannels + channel]
    }

    fn interpolate(&self, index: usize, frac: f32, channel: usize, limit: usize) -> f32 {
        match self.method {
            ResampleMethod::Nearest => {
                let idx = if frac < 0.5 { index } else { index + 1 };
                self.frame(idx, channel, limit)
            }
            ResampleMethod::Linear => {
                let a = self.frame(index, channel, limit);
                let b = self.frame(index + 1, channel, limit);
                a + (b - a) * frac
            }
            ResampleMethod::Cubic => {
                let p0 = self.frame(index + limit - 1, channel, limit);
                let p1 = self.frame(index, channel, limit);
                let p2 = self.frame(index + 1, channel, limit);
                let p3 = self.frame(index + 2, channel, limit);
                let t = frac;
                p1 + 0.5
                    * t
                    * (p2 - p0
                        + t * (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3 + t * (3.0 * (p1 - p2) + p3 - p0)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unity_passthrough() {
        let mut r = Resampler::new();
        r.setup(4, 4, 48000, 48000, 2, ResampleMethod::Linear);
        let input: Vec<f32> = (0..8).map(|i| i as f32).collect();
        assert!(r.write_available() >= input.len());
        r.write(&input);
        assert_eq!(r.read_available(), 8);
        let mut out = [0.0f32; 8];
        r.read(&mut out);
        assert_eq!(&out[..], &input[..]);
    }

    #[test]
    fn test_wraparound() {
        let mut r = Resampler::new();
        r.setup(4, 4, 48000, 48000, 1, ResampleMethod::Linear);
        // write/read several times the buffer capacity
        let mut next = 0.0f32;
        for _ in 0..10 {
            let input: Vec<f32> = (0..4).map(|i| next + i as f32).collect();
            r.write(&input);
            let mut out = [0.0f32; 4];
            r.read(&mut out);
            assert_eq!(&out[..], &input[..]);
            next += 4.0;
        }
    }

    #[test]
    fn test_downsampling_halves_output() {
        let mut r = Resampler::new();
        r.setup(8, 4, 96000, 48000, 1, ResampleMethod::Linear);
        r.update(96000.0, 48000.0);
        let input: Vec<f32> = (0..16).map(|i| i as f32).collect();
        r.write(&input);
        assert_eq!(r.read_available(), 8);
        let mut out = [0.0f32; 8];
        r.read(&mut out);
        // every other input frame, linearly interpolated
        for (i, &v) in out.iter().enumerate() {
            assert!((v - (i as f32 * 2.0)).abs() < 1e-4, "sample {}: {}", i, v);
        }
    }

    #[test]
    fn test_upsampling_interpolates() {
        let mut r = Resampler::new();
        r.setup(4, 8, 48000, 96000, 1, ResampleMethod::Linear);
        r.update(48000.0, 96000.0);
        let input = [0.0f32, 1.0, 2.0, 3.0];
        r.write(&input);
        assert_eq!(r.read_available(), 8);
        let mut out = [0.0f32; 8];
        r.read(&mut out);
        assert!((out[0] - 0.0).abs() < 1e-4);
        assert!((out[1] - 0.5).abs() < 1e-4);
        assert!((out[2] - 1.0).abs() < 1e-4);
        assert!((out[3] - 1.5).abs() < 1e-4);
    }

    #[test]
    fn test_cubic_reproduces_line() {
        // Catmull-Rom is exact for linear signals
        let mut r = Resampler::new();
        r.setup(8, 8, 48000, 48000, 1, ResampleMethod::Cubic);
        r.update(48000.0, 50000.0);
        let input: Vec<f32> = (0..16).map(|i| i as f32).collect();
        r.write(&input);
        let n = r.read_available().min(8);
        let mut out = vec![0.0f32; n];
        r.read(&mut out);
        let incr = 48000.0 / 50000.0;
        // skip the first output which interpolates across the wrapped
        // (zero-initialized) tail of the ring
        for i in 1..n {
            let expected = i as f32 * incr as f32;
            assert!((out[i] - expected).abs() < 0.05, "sample {}: {} vs {}", i, out[i], expected);
        }
    }
}
