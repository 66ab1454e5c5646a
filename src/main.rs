//! Tessera - a tick-driven entity component simulation
//!
//! Headless entry point: builds the demo world and runs it for a fixed
//! number of frames on the fixed-step clock.

mod demo;
mod settings;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tessera_core::GameTiming;

use settings::SimSettings;

fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;

    info!("Starting Tessera...");

    let settings = SimSettings::load();
    let mut em = demo::build_world(settings.ecs.clone()).context("Failed to build the demo world")?;
    demo::spawn_drifters(&mut em, settings.demo.drifters).context("Failed to spawn drifters")?;

    let mut timing = GameTiming::new(settings.tick.clone());
    let tick_length = timing.config.tick_length();
    for _ in 0..settings.demo.frames {
        for _ in 0..timing.advance(settings.demo.frame_time) {
            em.tick_update(tick_length);
        }
    }

    info!(
        "Ran {} ticks ({:.2}s simulated), {} entities alive",
        timing.ticks_run,
        timing.total_time,
        em.entity_count()
    );

    em.shutdown();

    if settings.demo.save_on_exit {
        settings.save()?;
    }
    Ok(())
}
