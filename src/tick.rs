use serde::{Deserialize, Serialize};

pub const SECONDS_PER_HOUR: f64 = 3600.0;

/// Immutable per-tick context handed to every subsystem.
///
/// Created once per tick by the engine; `dt` is always positive and finite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickContext {
    pub tick_index: u64,
    /// Seconds elapsed since the start of the run.
    pub time: f64,
    /// Seconds per tick.
    pub dt: f64,
}

impl TickContext {
    pub fn new(tick_index: u64, time: f64, dt: f64) -> Self {
        debug_assert!(dt.is_finite() && dt > 0.0, "tick duration {} must be positive", dt);
        Self { tick_index, time, dt }
    }

    /// Tick duration expressed in hours, for W -> Wh conversions.
    pub fn dt_hours(&self) -> f64 {
        self.dt / SECONDS_PER_HOUR
    }
}
