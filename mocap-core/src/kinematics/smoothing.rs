//! Zero-phase Butterworth low-pass filtering
//!
//! The filter is designed as cascaded second-order sections (bilinear
//! transform of the analog prototype) and run forward then backward over an
//! odd extension of the signal, with steady-state initial conditions scaled
//! to the first sample. A constant input passes through unchanged.

use std::f64::consts::PI;

use nalgebra::Complex;
use serde::{Deserialize, Serialize};

use crate::error::KinematicsError;

const MAX_ORDER: usize = 8;

/// Low-pass smoothing parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmoothingConfig {
    /// Filter order (number of poles)
    pub order: usize,
    /// -3 dB cutoff frequency in Hz
    pub cutoff_hz: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        SmoothingConfig {
            order: 2,
            cutoff_hz: 10.0,
        }
    }
}

/// One second-order section in direct form II transposed.
///
/// `a[0]` is always 1. First-order sections have `b[2] == a[2] == 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Section {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl Section {
    fn is_first_order(&self) -> bool {
        self.b[2] == 0.0 && self.a[2] == 0.0
    }

    fn dc_gain(&self) -> f64 {
        self.b.iter().sum::<f64>() / self.a.iter().sum::<f64>()
    }

    /// State that makes the section output its DC gain for a unit step
    fn steady_state(&self) -> [f64; 2] {
        let g = self.dc_gain();
        let z2 = self.b[2] - self.a[2] * g;
        let z1 = self.b[1] - self.a[1] * g + z2;
        [z1, z2]
    }

    fn run(&self, x: &mut [f64], mut z: [f64; 2]) {
        for v in x.iter_mut() {
            let input = *v;
            let y = self.b[0] * input + z[0];
            z[0] = self.b[1] * input - self.a[1] * y + z[1];
            z[1] = self.b[2] * input - self.a[2] * y;
            *v = y;
        }
    }
}

/// Butterworth low-pass as a cascade of sections
#[derive(Debug, Clone, PartialEq)]
pub struct ButterworthFilter {
    sections: Vec<Section>,
}

impl ButterworthFilter {
    /// Design a low-pass filter for signals sampled at `sample_rate` Hz.
    pub fn lowpass(config: &SmoothingConfig, sample_rate: f64) -> Result<Self, KinematicsError> {
        if config.order == 0 || config.order > MAX_ORDER {
            return Err(KinematicsError::InvalidParameter(format!(
                "smoothing order must be between 1 and {}, got {}",
                MAX_ORDER, config.order
            )));
        }
        let nyquist = sample_rate / 2.0;
        if !(config.cutoff_hz > 0.0 && config.cutoff_hz < nyquist) {
            return Err(KinematicsError::InvalidParameter(format!(
                "smoothing cutoff must be in (0, {}) Hz, got {}",
                nyquist, config.cutoff_hz
            )));
        }

        let n = config.order;
        let fs2 = 2.0 * sample_rate;
        // Pre-warp so the digital cutoff lands where requested
        let warped = fs2 * (PI * config.cutoff_hz / sample_rate).tan();
        let to_digital = |k: usize| -> Complex<f64> {
            let theta = PI * (2 * k + n + 1) as f64 / (2 * n) as f64;
            let analog = Complex::new(warped * theta.cos(), warped * theta.sin());
            (Complex::new(fs2, 0.0) + analog) / (Complex::new(fs2, 0.0) - analog)
        };

        let mut sections = Vec::with_capacity(n.div_ceil(2));
        for k in 0..n / 2 {
            let p = to_digital(k);
            let a = [1.0, -2.0 * p.re, p.norm_sqr()];
            let gain = (a[0] + a[1] + a[2]) / 4.0;
            sections.push(Section {
                b: [gain, 2.0 * gain, gain],
                a,
            });
        }
        if n % 2 == 1 {
            let p = to_digital((n - 1) / 2).re;
            let gain = (1.0 - p) / 2.0;
            sections.push(Section {
                b: [gain, gain, 0.0],
                a: [1.0, -p, 0.0],
            });
        }

        Ok(ButterworthFilter { sections })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Samples added on each side before filtering.
    ///
    /// Input shorter than or equal to this cannot be filtered.
    pub fn padlen(&self) -> usize {
        let first_order = self.sections.iter().filter(|s| s.is_first_order()).count();
        3 * (2 * self.sections.len() + 1 - first_order)
    }

    /// Filter `x` forward and backward
    pub fn filtfilt(&self, x: &[f64]) -> Result<Vec<f64>, KinematicsError> {
        let pad = self.padlen();
        if x.len() <= pad {
            return Err(KinematicsError::InvalidWindow(format!(
                "smoothing needs more than {} samples, got {}",
                pad,
                x.len()
            )));
        }

        let mut ext = odd_extension(x, pad);
        let first = ext[0];
        self.cascade(&mut ext, first);
        ext.reverse();
        let first = ext[0];
        self.cascade(&mut ext, first);
        ext.reverse();

        Ok(ext[pad..pad + x.len()].to_vec())
    }

    fn cascade(&self, x: &mut [f64], x0: f64) {
        let mut scale = x0;
        for section in &self.sections {
            let zi = section.steady_state();
            section.run(x, [zi[0] * scale, zi[1] * scale]);
            scale *= section.dc_gain();
        }
    }
}

/// Reflect `pad` samples around each end point
fn odd_extension(x: &[f64], pad: usize) -> Vec<f64> {
    let n = x.len();
    let mut ext = Vec::with_capacity(n + 2 * pad);
    ext.extend((1..=pad).rev().map(|i| 2.0 * x[0] - x[i]));
    ext.extend_from_slice(x);
    ext.extend((1..=pad).map(|i| 2.0 * x[n - 1] - x[n - 1 - i]));
    ext
}
