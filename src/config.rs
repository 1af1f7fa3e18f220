//! Programmatic configuration: the engine takes no files, environment
//! variables, or CLI flags — the only "configuration" surface is this
//! in-process struct, optionally supplied to `Controller::with_config`.
//! Mirrors the `max_steps` runaway-loop guard `Vm::run_fiber` carries in
//! `ob_workflow`'s bytecode interpreter, reapplied here as a bound on
//! driver-context turns rather than bytecode steps.

use std::time::Duration;

/// Tunables for a single [`crate::Controller`] run. `Controller::new` uses
/// `EngineConfig::default()` implicitly.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Upper bound on driver-context turns (one `DriverEvent` handled) for
    /// a single run. If exceeded, the engine force-cancels the root rather
    /// than spin forever on a misbehaving adapter that never reports
    /// `done`. Analogous to `Vm::run_fiber`'s `max_steps`.
    pub max_scheduling_steps: usize,
    /// Fallback timeout applied to a `Group`/`Task` that declares none of
    /// its own via `with_timeout`. `None` (the default) means nodes run
    /// unbounded unless they opt in individually.
    pub default_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_scheduling_steps: 100_000,
            default_timeout: None,
        }
    }
}
