//! # PCU Collision Guardian Binary
//!
//! Hosts the collision guardian on a fixed-period tick loop.
//!
//! # Usage
//!
//! ```bash
//! # Against the site fabric / motor controller
//! pcu_collision --prefix k1:ao:pcu --tickrate 0.5
//!
//! # Bench mode with simulated stage firmware in-process
//! pcu_collision --simulate --debug
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pcu_collision::{CollisionGuardian, GuardianOptions};
use pcu_common::axis::Axis;
use pcu_common::channel::{ChannelBus, InProcessBus};
use pcu_common::runtime;
use pcu_common::sim::SimStage;

/// PCU collision guardian.
#[derive(Parser, Debug)]
#[command(name = "pcu_collision")]
#[command(version)]
#[command(about = "Collision guardian for the PCU stage assembly")]
struct Args {
    /// Channel prefix of the PCU keyword space
    #[arg(long, default_value = "k1:ao:pcu")]
    prefix: String,

    /// Tick period in seconds
    #[arg(long, default_value_t = 0.5)]
    tickrate: f64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Run simulated stage firmware in-process (bench mode)
    #[arg(short, long)]
    simulate: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(args.debug);

    info!("PCU collision guardian v{} starting", env!("CARGO_PKG_VERSION"));

    let bus = Arc::new(InProcessBus::new());
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            info!("received shutdown signal");
            running.store(false, Ordering::SeqCst);
        })?;
    }

    let sim_thread = if args.simulate {
        info!("simulation mode enabled");
        let dt = Duration::from_millis(50);
        let mut stages: Vec<SimStage> = Axis::ALL
            .iter()
            .map(|&axis| SimStage::new(&bus, &args.prefix, axis, 5.0, dt))
            .collect();
        let running = Arc::clone(&running);
        Some(std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                for stage in &mut stages {
                    stage.tick();
                }
                std::thread::sleep(dt);
            }
        }))
    } else {
        None
    };

    let dyn_bus: Arc<dyn ChannelBus> = bus;
    let mut guardian = CollisionGuardian::new(dyn_bus, GuardianOptions::new(&args.prefix))?;

    runtime::run(&mut guardian, Duration::from_secs_f64(args.tickrate), &running);

    running.store(false, Ordering::SeqCst);
    if let Some(handle) = sim_thread {
        let _ = handle.join();
    }

    info!("PCU collision guardian shutdown complete");
    Ok(())
}

fn setup_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
