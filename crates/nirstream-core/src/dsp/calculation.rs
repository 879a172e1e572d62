//! Haemoglobin and tissue oxygenation derivation
//!
//! Uses the modified Beer-Lambert law on two of the probe's LEDs (760 nm and
//! 850 nm). Intensities are dark-corrected and referenced to the first sample
//! seen by the engine, so O2Hb / HHb / THb are concentration changes in µM.
//! TOI is estimated from those changes on top of a resting tissue baseline.

use serde::{Deserialize, Serialize};

/// Cell index of the 760 nm LED reading
pub const LED_760_INDEX: usize = 1;

/// Cell index of the 850 nm LED reading
pub const LED_850_INDEX: usize = 3;

/// Cell index of the ambient (all LEDs off) reading
pub const DARK_INDEX: usize = 5;

/// Molar extinction coefficients in 1/(M*cm), `(O2Hb, HHb)`
const EXTINCTION_760: (f64, f64) = (586.0, 1548.52);
const EXTINCTION_850: (f64, f64) = (1058.0, 691.32);

/// Source-detector separation in cm
const SEPARATION_CM: f64 = 4.0;

/// Differential pathlength factor for adult head tissue
const DPF: f64 = 6.0;

/// Resting concentrations used to anchor TOI, µM
const RESTING_O2HB_UM: f64 = 35.0;
const RESTING_HHB_UM: f64 = 15.0;

/// Derived values for one sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HaemoValues {
    #[serde(rename = "O2Hb")]
    pub o2hb: f64,
    #[serde(rename = "HHb")]
    pub hhb: f64,
    #[serde(rename = "THb")]
    pub thb: f64,
    #[serde(rename = "TOI")]
    pub toi: f64,
}

/// Per-session calculation state
#[derive(Debug, Clone)]
pub struct CalculationEngine {
    elements_per_point: usize,
    /// Dark-corrected reference intensities `(760, 850)`
    reference: Option<(f64, f64)>,
}

impl CalculationEngine {
    pub fn new(elements_per_point: usize) -> Self {
        Self {
            elements_per_point,
            reference: None,
        }
    }

    /// Process a raw integer batch laid out `[point][cell]`
    pub fn process_raw_batch(&mut self, batch: &[i32], batch_size: usize) -> Vec<HaemoValues> {
        let mut point = vec![0.0; self.elements_per_point];
        batch
            .chunks_exact(self.elements_per_point)
            .take(batch_size)
            .map(|cells| {
                for (dst, &src) in point.iter_mut().zip(cells) {
                    *dst = src as f64;
                }
                self.process_point(&point)
            })
            .collect()
    }

    /// Process an already averaged batch
    pub fn process_block(&mut self, block: &[Vec<f64>]) -> Vec<HaemoValues> {
        block.iter().map(|point| self.process_point(point)).collect()
    }

    /// Derive haemoglobin values for a single point
    pub fn process_point(&mut self, cells: &[f64]) -> HaemoValues {
        let dark = cells.get(DARK_INDEX).copied().unwrap_or(0.0);
        let i760 = corrected(cells.get(LED_760_INDEX).copied().unwrap_or(0.0), dark);
        let i850 = corrected(cells.get(LED_850_INDEX).copied().unwrap_or(0.0), dark);

        let (r760, r850) = *self.reference.get_or_insert((i760, i850));

        let od760 = (r760 / i760).ln();
        let od850 = (r850 / i850).ln();
        let (d_o2hb, d_hhb) = solve_concentrations(od760, od850);

        let thb = d_o2hb + d_hhb;
        let resting_total = RESTING_O2HB_UM + RESTING_HHB_UM + thb;
        let toi = if resting_total > 0.0 {
            (100.0 * (RESTING_O2HB_UM + d_o2hb) / resting_total).clamp(0.0, 100.0)
        } else {
            0.0
        };

        HaemoValues {
            o2hb: d_o2hb,
            hhb: d_hhb,
            thb,
            toi,
        }
    }

    /// Drop the reference so the next sample becomes the new baseline
    pub fn reset(&mut self) {
        self.reference = None;
    }
}

fn corrected(raw: f64, dark: f64) -> f64 {
    (raw - dark).max(1.0)
}

/// Solve the two-wavelength Beer-Lambert system, returning µM changes
fn solve_concentrations(od760: f64, od850: f64) -> (f64, f64) {
    let path = std::f64::consts::LN_10 * SEPARATION_CM * DPF;
    let (eo1, eh1) = EXTINCTION_760;
    let (eo2, eh2) = EXTINCTION_850;
    let det = eo1 * eh2 - eh1 * eo2;

    let a = od760 / path;
    let b = od850 / path;
    let d_o2hb = (a * eh2 - eh1 * b) / det;
    let d_hhb = (eo1 * b - a * eo2) / det;

    (d_o2hb * 1e6, d_hhb * 1e6)
}

/// Fixed-window mean that emits once per window and starts over
#[derive(Debug, Clone)]
pub struct RollingAverage {
    sum: f64,
    count: usize,
    window: usize,
}

impl RollingAverage {
    pub fn new(window: usize) -> Self {
        Self {
            sum: 0.0,
            count: 0,
            window: window.max(1),
        }
    }

    /// Add a sample, returning the window mean when the window fills
    pub fn push(&mut self, value: f64) -> Option<f64> {
        self.sum += value;
        self.count += 1;
        if self.count == self.window {
            let mean = self.sum / self.window as f64;
            self.sum = 0.0;
            self.count = 0;
            Some(mean)
        } else {
            None
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }
}
