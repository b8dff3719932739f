//! TOML device config: identity, cache location, watering limits, tank
//! thresholds, GPIO wiring, and the simulator scenario.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::pump::{DEFAULT_MAX_RUN_SECS, DEFAULT_PUMP_CAPACITY_L_PER_S};
use crate::schedule::DEFAULT_MOISTURE_CHECK_INTERVAL;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub device: DeviceSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub watering: WateringSection,
    #[serde(default)]
    pub tank: TankSection,
    #[serde(default)]
    pub pins: PinsSection,
    #[serde(default)]
    pub sim: SimSection,
}

#[derive(Debug, Deserialize)]
pub struct DeviceSection {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
}

fn default_cache_path() -> String {
    "plantkeeper-cache.json".into()
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WateringSection {
    /// Initial flow rate until a pump calibration overrides it.
    #[serde(default = "default_pump_capacity")]
    pub pump_capacity_l_per_s: f64,
    /// Hard ceiling on a single pump run.
    #[serde(default = "default_max_run_secs")]
    pub max_run_secs: f64,
    /// Cadence of the moisture-check loop.
    #[serde(default = "default_moisture_check_secs")]
    pub moisture_check_secs: u64,
}

fn default_pump_capacity() -> f64 {
    DEFAULT_PUMP_CAPACITY_L_PER_S
}

fn default_max_run_secs() -> f64 {
    DEFAULT_MAX_RUN_SECS
}

fn default_moisture_check_secs() -> u64 {
    DEFAULT_MOISTURE_CHECK_INTERVAL.as_secs()
}

impl Default for WateringSection {
    fn default() -> Self {
        Self {
            pump_capacity_l_per_s: default_pump_capacity(),
            max_run_secs: default_max_run_secs(),
            moisture_check_secs: default_moisture_check_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TankSection {
    /// Below this many liters the tank counts as empty and watering is skipped.
    #[serde(default = "default_empty_l")]
    pub empty_l: f64,
    /// Below this many liters a low-water warning is raised.
    #[serde(default = "default_low_l")]
    pub low_l: f64,
}

fn default_empty_l() -> f64 {
    0.1
}

fn default_low_l() -> f64 {
    0.5
}

impl Default for TankSection {
    fn default() -> Self {
        Self {
            empty_l: default_empty_l(),
            low_l: default_low_l(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PinsSection {
    #[serde(default = "default_pump_pin")]
    pub pump: i64,
    /// Most relay boards switch on a low level.
    #[serde(default = "default_true")]
    pub pump_active_low: bool,
    #[serde(default = "default_trigger_pin")]
    pub trigger: i64,
    #[serde(default = "default_echo_pin")]
    pub echo: i64,
    /// MCP3008 channel wired to the moisture probe.
    #[serde(default)]
    pub adc_channel: u8,
}

fn default_pump_pin() -> i64 {
    17
}

fn default_trigger_pin() -> i64 {
    23
}

fn default_echo_pin() -> i64 {
    24
}

fn default_true() -> bool {
    true
}

impl Default for PinsSection {
    fn default() -> Self {
        Self {
            pump: default_pump_pin(),
            pump_active_low: true,
            trigger: default_trigger_pin(),
            echo: default_echo_pin(),
            adc_channel: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SimSection {
    #[serde(default = "default_scenario")]
    pub scenario: String,
    #[serde(default = "default_tank_distance")]
    pub initial_tank_distance_cm: f64,
}

fn default_scenario() -> String {
    "drying".into()
}

fn default_tank_distance() -> f64 {
    6.0
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            scenario: default_scenario(),
            initial_tank_distance_cm: default_tank_distance(),
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

const KNOWN_SCENARIOS: &[&str] = &["drying", "stable", "flaky", "wet"];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.device.id.trim().is_empty() {
            errors.push("device.id is empty".into());
        }
        if self.storage.cache_path.trim().is_empty() {
            errors.push("storage.cache_path is empty".into());
        }

        self.validate_watering(&mut errors);
        self.validate_tank(&mut errors);
        self.validate_pins(&mut errors);

        if !KNOWN_SCENARIOS.contains(&self.sim.scenario.as_str()) {
            errors.push(format!(
                "sim.scenario '{}' is unknown (allowed: {})",
                self.sim.scenario,
                KNOWN_SCENARIOS.join(", ")
            ));
        }
        if self.sim.initial_tank_distance_cm < 0.0 {
            errors.push(format!(
                "sim.initial_tank_distance_cm must not be negative, got {}",
                self.sim.initial_tank_distance_cm
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_watering(&self, errors: &mut Vec<String>) {
        let w = &self.watering;
        if w.pump_capacity_l_per_s <= 0.0 {
            errors.push(format!(
                "watering.pump_capacity_l_per_s must be positive, got {}",
                w.pump_capacity_l_per_s
            ));
        }
        if w.max_run_secs <= 0.0 {
            errors.push(format!(
                "watering.max_run_secs must be positive, got {}",
                w.max_run_secs
            ));
        }
        if w.moisture_check_secs == 0 {
            errors.push("watering.moisture_check_secs must be positive, got 0".into());
        }
    }

    fn validate_tank(&self, errors: &mut Vec<String>) {
        let t = &self.tank;
        if t.empty_l < 0.0 {
            errors.push(format!(
                "tank.empty_l must not be negative, got {}",
                t.empty_l
            ));
        }
        if t.low_l <= t.empty_l {
            errors.push(format!(
                "tank.low_l ({}) must be greater than tank.empty_l ({})",
                t.low_l, t.empty_l
            ));
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let p = &self.pins;
        let mut seen: HashSet<i64> = HashSet::new();

        for (name, pin) in [("pump", p.pump), ("trigger", p.trigger), ("echo", p.echo)] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "pins.{name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(pin) {
                errors.push(format!("pins.{name} {pin} is already used by another pin"));
            }
        }

        if p.adc_channel > 7 {
            errors.push(format!(
                "pins.adc_channel {} out of MCP3008 range [0, 7]",
                p.adc_channel
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            device: DeviceSection {
                id: "rasp-01".into(),
                name: "Kitchen ficus".into(),
            },
            storage: StorageSection::default(),
            watering: WateringSection::default(),
            tank: TankSection::default(),
            pins: PinsSection::default(),
            sim: SimSection::default(),
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_config() {
        let toml_str = r#"
[device]
id = "rasp-01"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device.id, "rasp-01");
        assert_eq!(config.watering.moisture_check_secs, 3600);
        assert_eq!(config.tank.low_l, 0.5);
        assert_eq!(config.pins.pump, 17);
        assert_eq!(config.sim.scenario, "drying");
        config.validate().unwrap();
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[device]
id = "rasp-01"
name = "Kitchen ficus"

[storage]
cache_path = "/var/lib/plantkeeper/cache.json"

[watering]
pump_capacity_l_per_s = 0.02
max_run_secs = 120
moisture_check_secs = 1800

[tank]
empty_l = 0.2
low_l = 0.6

[pins]
pump = 18
pump_active_low = false
trigger = 20
echo = 21
adc_channel = 3

[sim]
scenario = "stable"
initial_tank_distance_cm = 8.0
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.watering.max_run_secs, 120.0);
        assert_eq!(config.pins.adc_channel, 3);
        assert!(!config.pins.pump_active_low);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn empty_device_id_rejected() {
        let mut cfg = valid_config();
        cfg.device.id = "  ".into();
        assert_validation_err(&cfg, "device.id is empty");
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut cfg = valid_config();
        cfg.watering.pump_capacity_l_per_s = 0.0;
        assert_validation_err(&cfg, "pump_capacity_l_per_s must be positive");
    }

    #[test]
    fn negative_max_run_rejected() {
        let mut cfg = valid_config();
        cfg.watering.max_run_secs = -1.0;
        assert_validation_err(&cfg, "max_run_secs must be positive");
    }

    #[test]
    fn zero_moisture_check_rejected() {
        let mut cfg = valid_config();
        cfg.watering.moisture_check_secs = 0;
        assert_validation_err(&cfg, "moisture_check_secs must be positive");
    }

    #[test]
    fn low_threshold_must_exceed_empty() {
        let mut cfg = valid_config();
        cfg.tank.empty_l = 0.5;
        cfg.tank.low_l = 0.5;
        assert_validation_err(&cfg, "must be greater than tank.empty_l");
    }

    #[test]
    fn negative_empty_threshold_rejected() {
        let mut cfg = valid_config();
        cfg.tank.empty_l = -0.1;
        assert_validation_err(&cfg, "tank.empty_l must not be negative");
    }

    #[test]
    fn gpio_pin_0_rejected() {
        let mut cfg = valid_config();
        cfg.pins.pump = 0;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn gpio_pin_28_rejected() {
        let mut cfg = valid_config();
        cfg.pins.echo = 28;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn gpio_boundary_pins_accepted() {
        let mut cfg = valid_config();
        cfg.pins.pump = 2;
        cfg.pins.trigger = 27;
        cfg.pins.echo = 14;
        cfg.validate().unwrap();
    }

    #[test]
    fn duplicate_pins_rejected() {
        let mut cfg = valid_config();
        cfg.pins.trigger = 17; // same as the default pump pin
        assert_validation_err(&cfg, "already used by another pin");
    }

    #[test]
    fn adc_channel_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.pins.adc_channel = 8;
        assert_validation_err(&cfg, "out of MCP3008 range");
    }

    #[test]
    fn unknown_scenario_rejected() {
        let mut cfg = valid_config();
        cfg.sim.scenario = "monsoon".into();
        assert_validation_err(&cfg, "sim.scenario 'monsoon' is unknown");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.device.id = "".into();
        cfg.watering.max_run_secs = 0.0;
        cfg.pins.pump = 1;
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("device.id is empty"), "missing id error in: {msg}");
        assert!(msg.contains("max_run_secs"), "missing run error in: {msg}");
        assert!(
            msg.contains("not a valid BCM GPIO pin"),
            "missing gpio error in: {msg}"
        );
    }
}
