//! Stateful single-plant simulator for local development.
//!
//! Models realistic probe behaviour without hardware:
//! - Moisture random walk with mean reversion and drying drift
//! - Per-reading electronic noise and occasional spikes
//! - Closed-loop coupling: while the pump runs, soil gets wetter and the
//!   tank's measured distance grows (water level drops)

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::hw::{DistanceSensor, MoistureSensor, PumpActuator};

/// Approximate a sample from N(0,1) via Irwin-Hall: sum of 12 uniforms
/// minus 6.
fn approx_std_normal() -> f64 {
    let mut sum = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mid-range start, steady drift toward dry.  The default.
    Drying,
    /// Hovers near the centre with low noise.  Nothing should trigger.
    Stable,
    /// High noise and frequent spikes.  Exercises the agreement-retry
    /// sampling and threshold robustness.
    Flaky,
    /// Starts wet and dries very slowly.  The scheduler should mostly skip.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

struct Params {
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    spike_prob: f32,
    spike_sigma: f64,
    start_raw: f64,
}

impl Params {
    fn for_scenario(scenario: Scenario) -> Self {
        // Raw moisture units: [0, 1], higher = drier (matches the probe's
        // default calibration, dry ≈ 0.75, wet ≈ 0.29).
        let (drift, walk, rev, noise, spike_prob, spike_sigma, start) = match scenario {
            Scenario::Drying => (0.0008, 0.004, 0.02, 0.003, 0.03_f32, 0.08, 0.52),
            Scenario::Stable => (0.0001, 0.002, 0.05, 0.001, 0.005, 0.04, 0.52),
            Scenario::Flaky => (0.0005, 0.008, 0.02, 0.008, 0.10, 0.15, 0.52),
            Scenario::Wet => (0.0002, 0.003, 0.02, 0.002, 0.02, 0.06, 0.34),
        };
        Self {
            drift_per_sample: drift,
            walk_sigma: walk,
            mean_reversion: rev,
            noise_sigma: noise,
            spike_prob,
            spike_sigma,
            start_raw: start,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared plant world
// ---------------------------------------------------------------------------

struct World {
    params: Params,
    /// "True" soil moisture raw value.  Evolves on each moisture read.
    moisture_base: Mutex<f64>,
    /// Distance from the sensor to the water surface, in cm.  Grows as the
    /// tank drains.
    tank_distance_cm: Mutex<f64>,
    watering: AtomicBool,
}

/// The simulated plant: hands out probe/pump implementations sharing one
/// closed-loop world.
#[derive(Clone)]
pub struct PlantSim {
    world: Arc<World>,
}

/// Raw moisture change per read while the pump runs (toward wet = lower).
const WET_RATE: f64 = -0.01;
/// Tank distance change in cm per distance read while the pump runs.
const DRAIN_RATE_CM: f64 = 0.05;

impl PlantSim {
    pub fn new(scenario: Scenario, initial_tank_distance_cm: f64) -> Self {
        let params = Params::for_scenario(scenario);
        let start = params.start_raw;
        Self {
            world: Arc::new(World {
                params,
                moisture_base: Mutex::new(start),
                tank_distance_cm: Mutex::new(initial_tank_distance_cm),
                watering: AtomicBool::new(false),
            }),
        }
    }

    pub fn moisture_sensor(&self) -> Arc<dyn MoistureSensor> {
        Arc::new(SimMoisture {
            world: Arc::clone(&self.world),
        })
    }

    pub fn distance_sensor(&self) -> Arc<dyn DistanceSensor> {
        Arc::new(SimDistance {
            world: Arc::clone(&self.world),
        })
    }

    pub fn pump(&self) -> Arc<dyn PumpActuator> {
        Arc::new(SimPump {
            world: Arc::clone(&self.world),
        })
    }
}

struct SimMoisture {
    world: Arc<World>,
}

impl MoistureSensor for SimMoisture {
    fn read(&self) -> Result<f64> {
        let p = &self.world.params;
        let mut base = self.world.moisture_base.lock().expect("sim lock poisoned");

        let pull = p.mean_reversion * (0.5 - *base);
        let walk = gaussian(0.0, p.walk_sigma);
        let wet = if self.world.watering.load(Ordering::Relaxed) {
            WET_RATE
        } else {
            0.0
        };
        *base = (*base + p.drift_per_sample + pull + walk + wet).clamp(0.0, 1.0);

        let noise = gaussian(0.0, p.noise_sigma);
        let spike = if fastrand::f32() < p.spike_prob {
            gaussian(0.0, p.spike_sigma)
        } else {
            0.0
        };

        Ok((*base + noise + spike).clamp(0.0, 1.0))
    }
}

struct SimDistance {
    world: Arc<World>,
}

impl DistanceSensor for SimDistance {
    fn read_cm(&self) -> Result<f64> {
        let mut distance = self
            .world
            .tank_distance_cm
            .lock()
            .expect("sim lock poisoned");
        if self.world.watering.load(Ordering::Relaxed) {
            *distance += DRAIN_RATE_CM;
        }
        let noise = gaussian(0.0, 0.02);
        Ok((*distance + noise).max(0.0))
    }
}

struct SimPump {
    world: Arc<World>,
}

impl PumpActuator for SimPump {
    fn set(&self, on: bool) {
        self.world.watering.store(on, Ordering::Relaxed);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_stay_in_unit_range() {
        let sim = PlantSim::new(Scenario::Flaky, 10.0);
        let sensor = sim.moisture_sensor();
        for _ in 0..500 {
            let v = sensor.read().unwrap();
            assert!((0.0..=1.0).contains(&v), "raw out of range: {v}");
        }
    }

    #[test]
    fn temporal_coherence() {
        let sim = PlantSim::new(Scenario::Stable, 10.0);
        let sensor = sim.moisture_sensor();
        let samples: Vec<f64> = (0..100).map(|_| sensor.read().unwrap()).collect();
        let max_jump = samples
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0_f64, f64::max);
        // Stable scenario: consecutive readings stay close, rare spikes aside.
        assert!(max_jump < 0.3, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn watering_decreases_moisture_raw() {
        let sim = PlantSim::new(Scenario::Drying, 10.0);
        let sensor = sim.moisture_sensor();
        let pump = sim.pump();

        for _ in 0..20 {
            sensor.read().unwrap();
        }
        let before: f64 = (0..20).map(|_| sensor.read().unwrap()).sum::<f64>() / 20.0;

        pump.set(true);
        for _ in 0..50 {
            sensor.read().unwrap();
        }
        let after: f64 = (0..20).map(|_| sensor.read().unwrap()).sum::<f64>() / 20.0;
        pump.set(false);

        assert!(
            after < before,
            "watering should lower the raw value: before={before:.3} after={after:.3}"
        );
    }

    #[test]
    fn watering_drains_the_tank() {
        let sim = PlantSim::new(Scenario::Stable, 10.0);
        let distance = sim.distance_sensor();
        let pump = sim.pump();

        let before = distance.read_cm().unwrap();
        pump.set(true);
        for _ in 0..50 {
            distance.read_cm().unwrap();
        }
        pump.set(false);
        let after = distance.read_cm().unwrap();

        assert!(
            after > before + 1.0,
            "pumping should raise measured distance: before={before:.2} after={after:.2}"
        );
    }

    #[test]
    fn flaky_has_more_variance_than_stable() {
        fn variance(sim: &PlantSim, n: usize) -> f64 {
            let sensor = sim.moisture_sensor();
            let samples: Vec<f64> = (0..n).map(|_| sensor.read().unwrap()).collect();
            let mean = samples.iter().sum::<f64>() / n as f64;
            samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
        }

        let stable = PlantSim::new(Scenario::Stable, 10.0);
        let flaky = PlantSim::new(Scenario::Flaky, 10.0);
        assert!(variance(&flaky, 200) > variance(&stable, 200));
    }

    #[test]
    fn scenario_parsing() {
        assert_eq!(Scenario::from_str_lossy("drying"), Scenario::Drying);
        assert_eq!(Scenario::from_str_lossy("STABLE"), Scenario::Stable);
        assert_eq!(Scenario::from_str_lossy("Flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("wet"), Scenario::Wet);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Drying);
    }

    #[test]
    fn wet_scenario_starts_wetter() {
        let wet = PlantSim::new(Scenario::Wet, 10.0);
        let sensor = wet.moisture_sensor();
        let avg: f64 = (0..10).map(|_| sensor.read().unwrap()).sum::<f64>() / 10.0;
        assert!(avg < 0.45, "wet scenario should start low: {avg:.3}");
    }
}
