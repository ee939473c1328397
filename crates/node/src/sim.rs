//! Stateful tank temperature simulator for local development.
//!
//! Models:
//! - Temporal coherence via random walk with mean reversion toward ambient
//! - Per-reading sensor noise
//! - Occasional spikes (probe flakiness)
//! - Per-sensor calibration offsets
//! - Closed-loop heating (temperature climbs toward the setpoint while a
//!   tank is running)

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Room temperature with a slow upward drift. Moderate noise.
    Ambient,
    /// Hovers at ambient. Low noise, rare spikes.
    Stable,
    /// High noise, ~10% spike rate. Exercises chart scaling and export of
    /// outliers.
    Flaky,
    /// Starts warm, close to the heating setpoint.
    Warm,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "warm" => Self::Warm,
            _ => Self::Ambient,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ambient => write!(f, "ambient"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Warm => write!(f, "warm"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-tank state
// ---------------------------------------------------------------------------

struct ProbeState {
    /// Permanent calibration offset (°C).
    offset: f64,
    noise_sigma: f64,
}

struct TankModel {
    /// Current "true" liquid temperature (°C). Evolves each sample.
    temp: f64,
    heating: bool,
    probes: Vec<ProbeState>,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub const AMBIENT_C: f64 = 22.0;
pub const SETPOINT_C: f64 = 37.0;

const MIN_C: f64 = 0.0;
const MAX_C: f64 = 100.0;

/// Temperature readings for `tank_count` tanks with `probes_per_tank`
/// sensors each.
pub struct TankSim {
    tanks: Vec<TankModel>,

    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,

    spike_prob: f32,
    spike_sigma: f64,

    /// Fraction of the gap to the setpoint closed per sample while heating.
    heat_rate: f64,
}

impl TankSim {
    pub fn new(scenario: Scenario, tank_count: usize, probes_per_tank: usize) -> Self {
        let (drift, walk_sigma, mean_rev, noise_sigma, spike_prob, spike_sigma, start) =
            match scenario {
                Scenario::Ambient => (0.01, 0.05, 0.02, 0.05, 0.02_f32, 3.0, AMBIENT_C),
                Scenario::Stable => (0.0, 0.02, 0.05, 0.02, 0.002, 1.0, AMBIENT_C),
                Scenario::Flaky => (0.01, 0.15, 0.02, 0.3, 0.10, 6.0, AMBIENT_C),
                Scenario::Warm => (0.0, 0.05, 0.01, 0.05, 0.02, 3.0, SETPOINT_C - 3.0),
            };

        let tanks = (0..tank_count)
            .map(|_| TankModel {
                temp: start + gaussian(0.0, 0.5),
                heating: false,
                probes: (0..probes_per_tank)
                    .map(|_| ProbeState {
                        offset: gaussian(0.0, 0.2),
                        noise_sigma: noise_sigma * (1.0 + 0.2 * approx_std_normal()).max(0.3),
                    })
                    .collect(),
            })
            .collect();

        Self {
            tanks,
            drift_per_sample: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            spike_prob,
            spike_sigma,
            heat_rate: 0.08,
        }
    }

    pub fn tank_count(&self) -> usize {
        self.tanks.len()
    }

    pub fn probe_count(&self, tank: usize) -> usize {
        self.tanks.get(tank).map_or(0, |t| t.probes.len())
    }

    /// Switch the heater of tank `tank` on or off.
    pub fn set_heating(&mut self, tank: usize, on: bool) {
        if let Some(t) = self.tanks.get_mut(tank) {
            t.heating = on;
        }
    }

    /// Advance tank `tank` by one sampling tick. Call once per tick, before
    /// reading its probes.
    pub fn step(&mut self, tank: usize) {
        let Some(t) = self.tanks.get_mut(tank) else {
            return;
        };

        let target = if t.heating { SETPOINT_C } else { AMBIENT_C };
        let rate = if t.heating {
            self.heat_rate
        } else {
            self.mean_reversion
        };
        let pull = rate * (target - t.temp);
        let walk = gaussian(0.0, self.walk_sigma);

        t.temp = (t.temp + self.drift_per_sample + pull + walk).clamp(MIN_C, MAX_C);
    }

    /// Instantaneous reading of probe `probe` in tank `tank`, rounded to
    /// 0.1 °C.
    pub fn read(&self, tank: usize, probe: usize) -> f64 {
        let Some(t) = self.tanks.get(tank) else {
            return AMBIENT_C;
        };
        let Some(p) = t.probes.get(probe) else {
            return t.temp;
        };

        let noise = gaussian(0.0, p.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        let reading = (t.temp + p.offset + noise + spike).clamp(MIN_C, MAX_C);
        (reading * 10.0).round() / 10.0
    }
}

// ===========================================================================
// Tests
// ===========================================================================
