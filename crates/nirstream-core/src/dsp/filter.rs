//! Single-step IIR low-pass filter for the display copy of a channel
//!
//! First-order Butterworth section obtained with the bilinear transform:
//!
//! ```text
//! K  = tan(pi * fc / fs)
//! y[n] = b0 * x[n] + b1 * x[n-1] - a1 * y[n-1]
//! b0 = b1 = K / (1 + K),  a1 = (K - 1) / (1 + K)
//! ```
//!
//! The DC gain `(b0 + b1) / (1 + a1)` is exactly one.

use std::f64::consts::PI;

/// Default cutoff used for live chart smoothing
pub const DEFAULT_CUTOFF_HZ: f64 = 1.0;

/// Stateful first-order low-pass filter, one instance per channel
#[derive(Debug, Clone)]
pub struct LowPassFilter {
    b0: f64,
    b1: f64,
    a1: f64,
    prev_input: f64,
    prev_output: f64,
    primed: bool,
}

impl LowPassFilter {
    /// Design a filter for a cutoff frequency at the given sample rate
    ///
    /// The cutoff is clamped below Nyquist.
    ///
    /// # Example
    /// ```
    /// use nirstream_core::dsp::filter::LowPassFilter;
    ///
    /// let mut lp = LowPassFilter::new(1.0, 100.0);
    /// let y = lp.single_step(5.0);
    /// assert_eq!(y, 5.0); // first sample primes the state
    /// ```
    pub fn new(cutoff_hz: f64, sample_rate_hz: f64) -> Self {
        let nyquist = sample_rate_hz / 2.0;
        let fc = cutoff_hz.clamp(f64::EPSILON, nyquist * 0.99);
        let k = (PI * fc / sample_rate_hz).tan();
        let norm = 1.0 / (1.0 + k);

        Self::with_coefficients(k * norm, k * norm, (k - 1.0) * norm)
    }

    /// Build a filter from raw coefficients
    pub fn with_coefficients(b0: f64, b1: f64, a1: f64) -> Self {
        Self {
            b0,
            b1,
            a1,
            prev_input: 0.0,
            prev_output: 0.0,
            primed: false,
        }
    }

    /// Consume one sample and return the smoothed value
    ///
    /// The first call seeds the history with its input so the output does
    /// not ramp up from zero.
    pub fn single_step(&mut self, input: f64) -> f64 {
        if !self.primed {
            self.prev_input = input;
            self.prev_output = input;
            self.primed = true;
            return input;
        }

        let output = self.b0 * input + self.b1 * self.prev_input - self.a1 * self.prev_output;
        self.prev_input = input;
        self.prev_output = output;
        output
    }

    /// Forget the stored history
    pub fn reset(&mut self) {
        self.prev_input = 0.0;
        self.prev_output = 0.0;
        self.primed = false;
    }

    /// Coefficients as `(b0, b1, a1)`
    pub fn coefficients(&self) -> (f64, f64, f64) {
        (self.b0, self.b1, self.a1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_unity_dc_gain() {
        let lp = LowPassFilter::new(2.5, 100.0);
        let (b0, b1, a1) = lp.coefficients();
        assert_relative_eq!((b0 + b1) / (1.0 + a1), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_converges_to_constant() {
        let mut lp = LowPassFilter::new(1.0, 100.0);
        lp.single_step(0.0);
        let mut y = 0.0;
        for _ in 0..2000 {
            y = lp.single_step(42.0);
        }
        assert_relative_eq!(y, 42.0, epsilon = 1e-6);
    }

    #[test]
    fn test_attenuates_fast_oscillation() {
        let mut lp = LowPassFilter::new(1.0, 100.0);
        let mut peak: f64 = 0.0;
        for n in 0..1000 {
            let x = if n % 2 == 0 { 1.0 } else { -1.0 };
            let y = lp.single_step(x);
            if n > 500 {
                peak = peak.max(y.abs());
            }
        }
        assert!(peak < 0.1, "Nyquist-rate input should be suppressed, got {}", peak);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut lp = LowPassFilter::new(1.0, 100.0);
        lp.single_step(10.0);
        lp.single_step(20.0);
        lp.reset();
        assert_eq!(lp.single_step(3.0), 3.0);
    }
}
