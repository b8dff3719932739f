//! Hardware capabilities: moisture probe, tank distance probe, pump switch.
//!
//! The traits are the seam between the engine and the physical world.  The
//! `gpio` feature provides real Raspberry Pi drivers via rppal; the default
//! build wires in the simulator from `sim.rs` instead.

use anyhow::Result;

/// Capacitive soil moisture probe.  Readings are a raw fraction in `[0, 1]`
/// (1.0 = the ADC's full-scale value); calibration happens in `sensor.rs`.
pub trait MoistureSensor: Send + Sync {
    fn read(&self) -> Result<f64>;
}

/// Ultrasonic distance probe pointing down into the water tank.
pub trait DistanceSensor: Send + Sync {
    fn read_cm(&self) -> Result<f64>;
}

/// The pump relay.  `set(true)` engages the pump.
pub trait PumpActuator: Send + Sync {
    fn set(&self, on: bool);
}

// ---------------------------------------------------------------------------
// Real GPIO drivers (production builds on a Raspberry Pi, via rppal)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub mod gpio {
    use super::*;
    use anyhow::{bail, Context};
    use rppal::gpio::{Gpio, InputPin, Level, OutputPin};
    use rppal::spi::{Bus, Mode, SlaveSelect, Spi};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Relay-driven pump.  Many common relay boards are active-low.
    pub struct GpioPump {
        pin: Mutex<OutputPin>,
        active_low: bool,
    }

    impl GpioPump {
        pub fn new(bcm_pin: u8, active_low: bool) -> Result<Self> {
            let gpio = Gpio::new().context("gpio init failed")?;
            let mut pin = gpio
                .get(bcm_pin)
                .with_context(|| format!("pump pin {bcm_pin} unavailable"))?
                .into_output();

            // Fail-safe: relay OFF at startup.
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            Ok(Self {
                pin: Mutex::new(pin),
                active_low,
            })
        }
    }

    impl PumpActuator for GpioPump {
        fn set(&self, on: bool) {
            let mut pin = self.pin.lock().expect("pump pin lock poisoned");
            let level_high = on != self.active_low;
            if level_high {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }
    }

    /// Waiting for an echo edge is bounded so a disconnected sensor reports
    /// "reading unavailable" instead of hanging the caller.
    const ECHO_EDGE_TIMEOUT: Duration = Duration::from_millis(60);

    /// HC-SR04 ultrasonic distance sensor: a timed round-trip pulse at the
    /// speed of sound, halved for the return leg (17150 cm/s effective).
    pub struct Hcsr04 {
        pins: Mutex<(OutputPin, InputPin)>,
    }

    impl Hcsr04 {
        pub fn new(trigger_pin: u8, echo_pin: u8) -> Result<Self> {
            let gpio = Gpio::new().context("gpio init failed")?;
            let mut trigger = gpio
                .get(trigger_pin)
                .with_context(|| format!("trigger pin {trigger_pin} unavailable"))?
                .into_output();
            let echo = gpio
                .get(echo_pin)
                .with_context(|| format!("echo pin {echo_pin} unavailable"))?
                .into_input();
            trigger.set_low();
            Ok(Self {
                pins: Mutex::new((trigger, echo)),
            })
        }

        fn wait_for_edge(echo: &InputPin, level: Level) -> Result<Instant> {
            let deadline = Instant::now() + ECHO_EDGE_TIMEOUT;
            while echo.read() != level {
                if Instant::now() >= deadline {
                    bail!("no echo edge within {:?}, reading unavailable", ECHO_EDGE_TIMEOUT);
                }
                std::hint::spin_loop();
            }
            Ok(Instant::now())
        }
    }

    impl DistanceSensor for Hcsr04 {
        fn read_cm(&self) -> Result<f64> {
            let mut pins = self.pins.lock().expect("hcsr04 lock poisoned");
            let (trigger, echo) = &mut *pins;

            trigger.set_high();
            std::thread::sleep(Duration::from_micros(10));
            trigger.set_low();

            let pulse_start = Self::wait_for_edge(echo, Level::High)?;
            let pulse_end = Self::wait_for_edge(echo, Level::Low)?;

            let pulse = pulse_end.duration_since(pulse_start).as_secs_f64();
            Ok(pulse * 17_150.0)
        }
    }

    /// MCP3008 10-bit ADC over SPI, one channel wired to the moisture probe.
    pub struct Mcp3008Moisture {
        spi: Mutex<Spi>,
        channel: u8,
    }

    impl Mcp3008Moisture {
        pub fn new(channel: u8) -> Result<Self> {
            if channel > 7 {
                bail!("mcp3008 channel {channel} out of range 0-7");
            }
            let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, 1_350_000, Mode::Mode0)
                .context("spi init failed")?;
            Ok(Self {
                spi: Mutex::new(spi),
                channel,
            })
        }
    }

    impl MoistureSensor for Mcp3008Moisture {
        fn read(&self) -> Result<f64> {
            let spi = self.spi.lock().expect("spi lock poisoned");
            // Start bit, single-ended mode + channel, one clock byte.
            let write = [0x01, (0x08 | self.channel) << 4, 0x00];
            let mut read = [0u8; 3];
            spi.transfer(&mut read, &write).context("spi transfer failed")?;
            let raw = (((read[1] & 0x03) as u16) << 8) | read[2] as u16;
            Ok(raw as f64 / 1023.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Fixed-value test doubles
// ---------------------------------------------------------------------------
