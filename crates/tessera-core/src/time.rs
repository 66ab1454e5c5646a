//! Simulation clock for the Tessera runtime
//!
//! The simulation advances in discrete ticks. `GameTiming` converts real frame
//! deltas into a number of fixed ticks to run.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A discrete simulation tick. Tick zero is the state before the first update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GameTick(pub u64);

impl GameTick {
    pub const ZERO: GameTick = GameTick(0);

    /// The tick that follows this one.
    pub fn next(self) -> Self {
        GameTick(self.0 + 1)
    }

    /// Raw tick number.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GameTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Configuration for the simulation clock
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Maximum real delta accepted per frame, prevents a spiral of death
    pub max_frame_time: f32,
    /// How many simulated seconds pass per real second
    pub time_scale: f32,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            max_frame_time: 0.25,
            time_scale: 1.0,
        }
    }
}

impl TickConfig {
    /// Length of one tick in seconds.
    pub fn tick_length(&self) -> f32 {
        1.0 / self.tick_rate.max(1) as f32
    }
}

/// Fixed-step timing driven by real frame deltas
#[derive(Debug, Clone, Default)]
pub struct GameTiming {
    /// Configuration
    pub config: TickConfig,
    /// Simulated seconds since start
    pub total_time: f64,
    /// Number of ticks handed out so far
    pub ticks_run: u64,
    /// Whether the simulation is paused
    pub paused: bool,
    accumulator: f32,
}

impl GameTiming {
    pub fn new(config: TickConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Feed a raw frame delta and return how many ticks should run.
    pub fn advance(&mut self, raw_delta: f32) -> u32 {
        if self.paused {
            return 0;
        }

        let delta = raw_delta.clamp(0.0, self.config.max_frame_time) * self.config.time_scale;
        self.accumulator += delta;

        let step = self.config.tick_length();
        let mut ticks = 0;
        while self.accumulator >= step {
            self.accumulator -= step;
            ticks += 1;
        }
        self.ticks_run += ticks as u64;
        self.total_time += (ticks as f64) * step as f64;
        ticks
    }

    /// Fraction of a tick left over in the accumulator (0.0 to 1.0)
    pub fn interpolation(&self) -> f32 {
        self.accumulator / self.config.tick_length()
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }
}
