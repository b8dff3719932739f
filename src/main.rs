mod calibrate;
mod cancel;
mod config;
mod events;
mod hw;
mod program;
mod pump;
mod remote;
mod schedule;
mod sensor;
#[cfg(not(feature = "gpio"))]
mod sim;
mod store;

use anyhow::{bail, Context, Result};
use std::{env, sync::Arc, time::Duration};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use calibrate::{CalibrationStep, DepthCalibrator, MoistureCalibrator, PumpCalibrator};
use events::EventLogger;
use pump::PumpController;
use remote::{InMemoryRemote, LogNotifier, RemoteConfigStore};
use schedule::ScheduleEngine;
use sensor::{MoistureReader, TankReader, TankThresholds};
use store::{LocalCache, KEY_DEPTH_CALIBRATION, KEY_MOISTURE_CALIBRATION, KEY_PUMP_CAPACITY};

pub(crate) fn now_ts() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(device = %cfg.device.id, config = %config_path, "config loaded");

    let cache = Arc::new(LocalCache::open(&cfg.storage.cache_path));

    // ── Hardware ────────────────────────────────────────────────────
    #[cfg(feature = "gpio")]
    let (moisture_hw, distance_hw, pump_hw) = {
        let pump = hw::gpio::GpioPump::new(cfg.pins.pump as u8, cfg.pins.pump_active_low)?;
        let distance = hw::gpio::Hcsr04::new(cfg.pins.trigger as u8, cfg.pins.echo as u8)?;
        let moisture = hw::gpio::Mcp3008Moisture::new(cfg.pins.adc_channel)?;
        (
            Arc::new(moisture) as Arc<dyn hw::MoistureSensor>,
            Arc::new(distance) as Arc<dyn hw::DistanceSensor>,
            Arc::new(pump) as Arc<dyn hw::PumpActuator>,
        )
    };
    #[cfg(not(feature = "gpio"))]
    let (moisture_hw, distance_hw, pump_hw) = {
        let scenario = sim::Scenario::from_str_lossy(&cfg.sim.scenario);
        info!(%scenario, "gpio feature disabled, running the simulated plant");
        let plant = sim::PlantSim::new(scenario, cfg.sim.initial_tank_distance_cm);
        (plant.moisture_sensor(), plant.distance_sensor(), plant.pump())
    };

    // ── Readers (calibration from the cache, defaults otherwise) ────
    let moisture = Arc::new(MoistureReader::new(
        moisture_hw,
        cache.get(KEY_MOISTURE_CALIBRATION).unwrap_or_default(),
    ));
    let tank = Arc::new(TankReader::new(
        distance_hw,
        cache.get(KEY_DEPTH_CALIBRATION).unwrap_or_default(),
        TankThresholds {
            empty_l: cfg.tank.empty_l,
            low_l: cfg.tank.low_l,
        },
    ));

    // ── Services ────────────────────────────────────────────────────
    let remote = Arc::new(InMemoryRemote::default());
    let events = Arc::new(EventLogger::new(
        cfg.device.id.clone(),
        Arc::clone(&remote) as Arc<dyn RemoteConfigStore>,
        Arc::clone(&cache),
        Arc::new(LogNotifier),
    ));
    let capacity = cache
        .get::<f64>(KEY_PUMP_CAPACITY)
        .unwrap_or(cfg.watering.pump_capacity_l_per_s);
    let pump = Arc::new(PumpController::new(
        Arc::clone(&pump_hw),
        Arc::clone(&tank),
        Arc::clone(&events),
        Arc::clone(&remote) as Arc<dyn RemoteConfigStore>,
        capacity,
        cfg.watering.max_run_secs,
    ));

    // Guided calibration mode: run one workflow on the console, then exit.
    if let Ok(kind) = env::var("CALIBRATE") {
        return run_calibration(&kind, &moisture, &tank, &pump, &cache).await;
    }

    let engine = Arc::new(ScheduleEngine::new(
        Arc::clone(&remote) as Arc<dyn RemoteConfigStore>,
        Arc::clone(&cache),
        Arc::clone(&pump),
        Arc::clone(&moisture),
        Arc::clone(&events),
        Duration::from_secs(cfg.watering.moisture_check_secs),
    ));
    engine.load_initial().await;

    // ── Change feed → engine ────────────────────────────────────────
    let mut changes = remote.subscribe();
    let feed_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => feed_engine.on_remote_change(change).await,
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "change feed lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── Status log ──────────────────────────────────────────────────
    let mut status_rx = pump.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(s) => info!(
                    watering = s.is_watering,
                    elapsed_sec = s.elapsed_sec,
                    liters = s.liters_delivered,
                    "pump status"
                ),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    // ── Shutdown: stop the schedule, then force the pump off ────────
    info!("shutting down");
    pump.manual_stop().await;
    engine.stop().await;
    pump_hw.set(false);

    Ok(())
}

// ---------------------------------------------------------------------------
// Console calibration flows
// ---------------------------------------------------------------------------

async fn run_calibration(
    kind: &str,
    moisture: &Arc<MoistureReader>,
    tank: &Arc<TankReader>,
    pump: &Arc<PumpController>,
    cache: &Arc<LocalCache>,
) -> Result<()> {
    match kind {
        "moisture" => calibrate_moisture(moisture, cache).await,
        "depth" => calibrate_depth(tank, cache).await,
        "pump" => calibrate_pump(pump, cache).await,
        other => bail!("unknown CALIBRATE value '{other}' (moisture, depth or pump)"),
    }
}

async fn read_line(prompt: &str) -> Result<String> {
    println!("{prompt}");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("stdin closed")?;
    Ok(line.trim().to_string())
}

async fn wait_for_step(
    mut rx: tokio::sync::watch::Receiver<CalibrationStep>,
    step: CalibrationStep,
) -> Result<()> {
    while *rx.borrow() != step {
        rx.changed().await.context("calibration step feed closed")?;
    }
    Ok(())
}

async fn calibrate_moisture(reader: &Arc<MoistureReader>, cache: &Arc<LocalCache>) -> Result<()> {
    let calibrator = MoistureCalibrator::new(Arc::clone(reader), Arc::clone(cache));

    read_line("Hold the moisture probe in dry air, then press Enter.").await?;
    calibrator.advance().await?;
    println!("Sampling the dry endpoint...");
    wait_for_step(calibrator.subscribe(), CalibrationStep::AwaitingUserAction).await?;

    read_line("Submerge the probe in water, then press Enter.").await?;
    calibrator.advance().await?;
    println!("Sampling the wet endpoint...");
    wait_for_step(calibrator.subscribe(), CalibrationStep::Ready).await?;

    calibrator.advance().await?;
    println!("Moisture calibration saved.");
    Ok(())
}

async fn calibrate_depth(tank: &Arc<TankReader>, cache: &Arc<LocalCache>) -> Result<()> {
    let calibrator = DepthCalibrator::new(Arc::clone(tank), Arc::clone(cache));

    read_line("Empty the water tank, then press Enter.").await?;
    calibrator.advance()?;

    read_line("Fill the tank completely, then press Enter.").await?;
    calibrator.advance()?;

    let volume: f64 = read_line("Enter the tank volume in liters:")
        .await?
        .parse()
        .context("not a number")?;
    calibrator.set_target_volume(volume);

    calibrator.advance()?;
    println!("Depth calibration saved.");
    Ok(())
}

async fn calibrate_pump(pump: &Arc<PumpController>, cache: &Arc<LocalCache>) -> Result<()> {
    let calibrator = PumpCalibrator::new(Arc::clone(pump), Arc::clone(cache));

    read_line("Place the outlet in a measuring jug, then press Enter to start the pump.").await?;
    calibrator.advance().await?;

    if let Err(e) = read_line("Press Enter the moment 0.5 L has been dispensed.").await {
        calibrator.cancel().await;
        return Err(e);
    }
    calibrator.advance().await?;

    calibrator.advance().await?;
    println!("Pump capacity saved.");
    Ok(())
}
