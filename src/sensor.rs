//! Calibrated sensor reading: moisture percentage and tank volume.
//!
//! Calibration constants are read-mostly and single-writer: only a completed
//! calibration workflow replaces them.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::hw::{DistanceSensor, MoistureSensor};

// ---------------------------------------------------------------------------
// Calibration constants
// ---------------------------------------------------------------------------

/// Two-point moisture calibration: raw values recorded with the probe in dry
/// air and fully submerged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoistureCalibration {
    pub absolute_dry: f64,
    pub absolute_wet: f64,
}

impl Default for MoistureCalibration {
    fn default() -> Self {
        // Reference values recorded from the original probe.
        Self {
            absolute_dry: 0.7518319491939423,
            absolute_wet: 0.2867611138251098,
        }
    }
}

/// Tank geometry calibration: liters per cm of water column, and the
/// distance measured with the tank empty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthCalibration {
    pub tank_volume_ratio: f64,
    pub max_height_cm: f64,
}

impl DepthCalibration {
    /// Derive from a two-point measurement: distance with the tank empty,
    /// distance with it filled to a known volume.
    pub fn from_two_point(empty_cm: f64, full_cm: f64, tank_volume_l: f64) -> Result<Self> {
        let span = empty_cm - full_cm;
        if span <= 0.0 {
            anyhow::bail!(
                "empty-tank distance ({empty_cm} cm) must exceed full-tank distance ({full_cm} cm)"
            );
        }
        Ok(Self {
            tank_volume_ratio: tank_volume_l / span,
            max_height_cm: empty_cm,
        })
    }
}

impl Default for DepthCalibration {
    fn default() -> Self {
        // 2 L tank over a 15 cm water column.
        Self {
            tank_volume_ratio: 2.0 / 15.0,
            max_height_cm: 20.0,
        }
    }
}

/// Tank volume thresholds, in liters.
#[derive(Debug, Clone, Copy)]
pub struct TankThresholds {
    pub empty_l: f64,
    pub low_l: f64,
}

impl Default for TankThresholds {
    fn default() -> Self {
        Self {
            empty_l: 0.1,
            low_l: 0.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Moisture
// ---------------------------------------------------------------------------

pub struct MoistureReader {
    sensor: Arc<dyn MoistureSensor>,
    calibration: RwLock<MoistureCalibration>,
}

impl MoistureReader {
    pub fn new(sensor: Arc<dyn MoistureSensor>, calibration: MoistureCalibration) -> Self {
        Self {
            sensor,
            calibration: RwLock::new(calibration),
        }
    }

    pub fn calibration(&self) -> MoistureCalibration {
        *self.calibration.read().expect("calibration lock poisoned")
    }

    /// Replace the calibration constants (calibration completion only).
    pub fn set_calibration(&self, calibration: MoistureCalibration) {
        *self.calibration.write().expect("calibration lock poisoned") = calibration;
    }

    /// Instantaneous raw reading, uncalibrated.
    pub fn read_raw(&self) -> Result<f64> {
        self.sensor.read().context("moisture reading unavailable")
    }

    /// Calibrated moisture percentage in `[0, 100]`.
    pub fn percentage(&self) -> Result<f64> {
        let raw = self.read_raw()?;
        Ok(self.percentage_from_raw(raw))
    }

    pub fn percentage_from_raw(&self, raw: f64) -> f64 {
        let cal = self.calibration();
        let range = cal.absolute_dry - cal.absolute_wet;
        if range == 0.0 {
            return 0.0; // degenerate calibration, range is zero
        }
        let fraction = 1.0 - (raw - cal.absolute_wet) / range;
        ((fraction * 100.0).round()).clamp(0.0, 100.0)
    }
}

// ---------------------------------------------------------------------------
// Tank depth / volume
// ---------------------------------------------------------------------------

/// Bounded retry count for the agreement sampler.
const VOLUME_SAMPLE_RETRIES: usize = 5;
/// Delay between consecutive volume samples.
const VOLUME_SAMPLE_DELAY: Duration = Duration::from_millis(100);
/// Two consecutive samples within this many liters count as agreeing.
const VOLUME_AGREE_TOLERANCE_L: f64 = 0.05;

pub struct TankReader {
    sensor: Arc<dyn DistanceSensor>,
    calibration: RwLock<DepthCalibration>,
    thresholds: TankThresholds,
}

impl TankReader {
    pub fn new(
        sensor: Arc<dyn DistanceSensor>,
        calibration: DepthCalibration,
        thresholds: TankThresholds,
    ) -> Self {
        Self {
            sensor,
            calibration: RwLock::new(calibration),
            thresholds,
        }
    }

    pub fn calibration(&self) -> DepthCalibration {
        *self.calibration.read().expect("calibration lock poisoned")
    }

    pub fn set_calibration(&self, calibration: DepthCalibration) {
        *self.calibration.write().expect("calibration lock poisoned") = calibration;
    }

    pub fn thresholds(&self) -> TankThresholds {
        self.thresholds
    }

    pub fn read_distance_cm(&self) -> Result<f64> {
        self.sensor.read_cm().context("tank depth reading unavailable")
    }

    /// Volume implied by a distance reading, clamped at zero.
    pub fn volume_from_distance(&self, distance_cm: f64) -> f64 {
        let cal = self.calibration();
        (cal.tank_volume_ratio * (cal.max_height_cm - distance_cm)).max(0.0)
    }

    /// Single-shot volume reading.
    pub fn read_volume_once(&self) -> Result<f64> {
        Ok(self.volume_from_distance(self.read_distance_cm()?))
    }

    /// Noise-tolerant volume: sample until two consecutive readings agree
    /// within a small tolerance, up to a bounded retry count; otherwise the
    /// latest sample wins.
    pub async fn current_volume(&self) -> Result<f64> {
        let mut previous = self.read_volume_once()?;
        for _ in 0..VOLUME_SAMPLE_RETRIES {
            tokio::time::sleep(VOLUME_SAMPLE_DELAY).await;
            let sample = match self.read_volume_once() {
                Ok(v) => v,
                Err(e) => {
                    warn!("volume sample failed mid-sequence: {e}");
                    return Ok(previous);
                }
            };
            if (sample - previous).abs() <= VOLUME_AGREE_TOLERANCE_L {
                return Ok(sample);
            }
            previous = sample;
        }
        Ok(previous)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.current_volume().await? < self.thresholds.empty_l)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::fixed::{FixedMoisture, ScriptedDistance};

    fn reader_with(dry: f64, wet: f64, raw: f64) -> MoistureReader {
        MoistureReader::new(
            Arc::new(FixedMoisture::new(raw)),
            MoistureCalibration {
                absolute_dry: dry,
                absolute_wet: wet,
            },
        )
    }

    // -- Moisture mapping ------------------------------------------------

    #[test]
    fn raw_at_wet_reads_100() {
        let reader = reader_with(0.8, 0.2, 0.2);
        assert_eq!(reader.percentage().unwrap(), 100.0);
    }

    #[test]
    fn raw_at_dry_reads_0() {
        let reader = reader_with(0.8, 0.2, 0.8);
        assert_eq!(reader.percentage().unwrap(), 0.0);
    }

    #[test]
    fn raw_at_midpoint_reads_50() {
        let reader = reader_with(0.8, 0.2, 0.5);
        assert_eq!(reader.percentage().unwrap(), 50.0);
    }

    #[test]
    fn out_of_range_raw_clamps() {
        let wetter_than_wet = reader_with(0.8, 0.2, 0.05);
        assert_eq!(wetter_than_wet.percentage().unwrap(), 100.0);

        let drier_than_dry = reader_with(0.8, 0.2, 0.95);
        assert_eq!(drier_than_dry.percentage().unwrap(), 0.0);
    }

    #[test]
    fn degenerate_calibration_reads_0() {
        let reader = reader_with(0.5, 0.5, 0.5);
        assert_eq!(reader.percentage().unwrap(), 0.0);
    }

    #[test]
    fn set_calibration_takes_effect() {
        let reader = reader_with(0.8, 0.2, 0.2);
        reader.set_calibration(MoistureCalibration {
            absolute_dry: 0.2,
            absolute_wet: 0.0,
        });
        // raw 0.2 is now the dry endpoint.
        assert_eq!(reader.percentage().unwrap(), 0.0);
    }

    // -- Volume calibration ----------------------------------------------

    #[test]
    fn two_point_depth_calibration() {
        // min_value=20 (empty), max_value=5 (full), tank_volume=2 → ratio 2/15.
        let cal = DepthCalibration::from_two_point(20.0, 5.0, 2.0).unwrap();
        assert!((cal.tank_volume_ratio - 2.0 / 15.0).abs() < 1e-12);
        assert_eq!(cal.max_height_cm, 20.0);
    }

    #[test]
    fn two_point_rejects_inverted_distances() {
        assert!(DepthCalibration::from_two_point(5.0, 20.0, 2.0).is_err());
        assert!(DepthCalibration::from_two_point(5.0, 5.0, 2.0).is_err());
    }

    fn tank_with(script: Vec<f64>) -> TankReader {
        TankReader::new(
            Arc::new(ScriptedDistance::new(script)),
            DepthCalibration::from_two_point(20.0, 5.0, 2.0).unwrap(),
            TankThresholds::default(),
        )
    }

    #[test]
    fn volume_at_full_distance() {
        let tank = tank_with(vec![5.0]);
        assert!((tank.read_volume_once().unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn volume_at_empty_distance_clamps_to_zero() {
        let tank = tank_with(vec![20.0]);
        assert_eq!(tank.read_volume_once().unwrap(), 0.0);

        // Beyond the empty distance is still zero, never negative.
        let tank = tank_with(vec![25.0]);
        assert_eq!(tank.read_volume_once().unwrap(), 0.0);
    }

    // -- Agreement sampler -----------------------------------------------

    #[tokio::test]
    async fn agreeing_samples_return_early() {
        // Distances 10, 10 → volumes agree immediately.
        let tank = tank_with(vec![10.0, 10.0, 99.0]);
        let v = tank.current_volume().await.unwrap();
        assert!((v - tank.volume_from_distance(10.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn disagreeing_samples_return_latest() {
        // Every sample far apart; retries exhaust and the last one wins.
        let tank = tank_with(vec![5.0, 10.0, 5.0, 10.0, 5.0, 10.0, 5.0]);
        let v = tank.current_volume().await.unwrap();
        // 1 initial + 5 retries consumed: last consumed distance is 10.0.
        assert!((v - tank.volume_from_distance(10.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sensor_fault_is_an_error_not_a_hang() {
        let tank = tank_with(vec![]);
        assert!(tank.current_volume().await.is_err());
    }

    #[tokio::test]
    async fn empty_threshold() {
        // Volume 0 → empty.
        let tank = tank_with(vec![20.0]);
        assert!(tank.is_empty().await.unwrap());

        // Volume 2.0 → not empty.
        let tank = tank_with(vec![5.0]);
        assert!(!tank.is_empty().await.unwrap());

        // Volume ≈ 0.27 L (distance 18) → low water, but still not empty.
        let tank = tank_with(vec![18.0]);
        assert!(!tank.is_empty().await.unwrap());
        assert!(tank.read_volume_once().unwrap() < tank.thresholds().low_l);
    }
}
