//! Tessera Core - Core types and utilities for the Tessera runtime
//!
//! This crate provides the foundational types shared by the runtime crates:
//! - Mathematical primitives (re-exported from glam)
//! - A 2D transform used by the default component set
//! - The simulation clock (ticks and fixed-step timing)

pub mod time;
pub mod types;

pub use glam::{Affine2, Vec2};
pub use time::{GameTick, GameTiming, TickConfig};
pub use types::Transform;
