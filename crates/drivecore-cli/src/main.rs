//! `drivecore-cli` – drivecore process entry point
//!
//! This binary is the "ignition switch" for the perception stack.  It:
//!
//! 1. Loads `~/.drivecore/config.toml`, writing defaults on first run.
//! 2. Opens the params store and clears the clear-on-start keys.
//! 3. Starts the road camera, modeld and calibrationd through the
//!    [`Launcher`].
//! 4. Intercepts **Ctrl-C** to stop every component and exit cleanly.

mod config;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use colored::Colorize;
use drivecore_hal::{CameraManager, Sensor, SyntheticCamera};
use drivecore_middleware::{EventBus, Topic, Transport};
use drivecore_params::{Params, keys};
use drivecore_runtime::{Calibrationd, Launcher, Modeld, ReplayBuilder, init_tracing};
use drivecore_types::messages::{self, CarStateMsg};
use drivecore_vision::warp::{CpuWarper, FrameWarper};
use tracing::{info, warn};

/// Frames buffered on the camera lane before modeld starts lagging.
const FRAME_LANE_CAPACITY: usize = 4;
const MESSAGE_LANE_CAPACITY: usize = 256;

fn main() {
    let telemetry = init_tracing("drivecore");
    print_banner();

    let code = match run() {
        Ok(()) => 0,
        Err(e) => {
            println!("{}: {}", "Fatal".red().bold(), e);
            1
        }
    };
    drop(telemetry);
    std::process::exit(code);
}

fn run() -> Result<(), String> {
    let cfg = config::load_or_init()?;
    println!(
        "  Config loaded from {}",
        config::config_path().display().to_string().bold()
    );
    info!(?cfg, "configuration");

    let params = Arc::new(Params::open(&cfg.params_path).map_err(|e| e.to_string())?);
    params.set_defaults().map_err(|e| e.to_string())?;
    params
        .put_str(keys::DRIVECORE_PID, &std::process::id().to_string())
        .map_err(|e| e.to_string())?;

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – initiating graceful shutdown …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let bus = EventBus::with_capacities(FRAME_LANE_CAPACITY, MESSAGE_LANE_CAPACITY);

    let mut sensors: BTreeMap<String, Box<dyn Sensor>> = BTreeMap::new();
    if cfg.sim_camera {
        sensors.insert(
            "roadCamera".to_string(),
            Box::new(CameraManager::new(
                Box::new(SyntheticCamera::road(cfg.sim_speed_mps, cfg.camera_fps)),
                bus.clone(),
                Topic::RoadCameraState,
                cfg.camera_fps,
            )),
        );
    }

    let modeld = Modeld::new(
        cfg.runner_config(),
        bus.clone(),
        Arc::clone(&params),
        Arc::new(ReplayBuilder),
        Arc::new(|| Box::new(CpuWarper::new()) as Box<dyn FrameWarper>),
    );
    let calibrationd = Calibrationd::new(bus.clone(), Arc::clone(&params));
    let mut launcher = Launcher::new(sensors, modeld, calibrationd);

    print!("\n  Loading model {} … ", cfg.model_path.display().to_string().dimmed());
    std::io::stdout().flush().ok();
    if let Err(e) = launcher.start_all() {
        println!("{}", "failed".red());
        launcher.dispose();
        return Err(e.to_string());
    }
    println!("{}", "warm".green());
    println!("  {} Press Ctrl-C to stop.\n", "drivecore running.".bold());

    let car_state = messages::encode(&CarStateMsg {
        v_ego: cfg.sim_speed_mps,
    })
    .map_err(|e| e.to_string())?;
    while !shutdown.load(Ordering::SeqCst) {
        if cfg.sim_camera {
            if let Err(e) = bus.publish_buffer(Topic::CarState, car_state.clone()) {
                warn!(error = %e, "carState publish failed");
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    launcher.dispose();
    println!("{}", "  ✓ All components stopped.".green());
    println!("{}", "  ✓ Exiting drivecore.".green());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"       __     _                              "#.bold().cyan());
    println!("{}", r#"  ____/ /____(_)   _____  _________  ________ "#.bold().cyan());
    println!("{}", r#" / __  / ___/ / | / / _ \/ ___/ __ \/ ___/ _ \"#.bold().cyan());
    println!("{}", r#"/ /_/ / /  / /| |/ /  __/ /__/ /_/ / /  /  __/"#.bold().cyan());
    println!("{}", r#"\__,_/_/  /_/ |___/\___/\___/\____/_/   \___/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "drivecore".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Real-time driving perception core");
    println!();
}
