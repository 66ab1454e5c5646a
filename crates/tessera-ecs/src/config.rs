use serde::{Deserialize, Serialize};

/// Runtime switches for the entity manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcsConfig {
    /// Finalize deferred removals at the end of every tick.
    pub cull_each_tick: bool,
    /// Drain the event queue during every tick.
    pub process_queue_each_tick: bool,
    /// Match prototype component names case-insensitively.
    pub ignore_case_component_names: bool,
}

impl Default for EcsConfig {
    fn default() -> Self {
        Self {
            cull_each_tick: true,
            process_queue_each_tick: true,
            ignore_case_component_names: false,
        }
    }
}
