use super::{Subsystem, SubsystemId};
use crate::telemetry::TelemetrySink;
use crate::tick::{TickContext, SECONDS_PER_HOUR};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_CAPACITY_WH: f64 = 1000.0;
pub const DEFAULT_MAX_CHARGE_RATE_W: f64 = 200.0;
pub const DEFAULT_MAX_DISCHARGE_RATE_W: f64 = 2000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryState {
    pub charge_wh: f64,
    pub capacity_wh: f64,
    pub max_charge_rate_w: f64,
    pub max_discharge_rate_w: f64,
    pub state_of_charge: f64,
}

/// Bounded, rate-limited energy reservoir. The only component that carries
/// energy from one tick to the next.
///
/// `charge_wh` is clamped to `[0, capacity_wh]` after every mutation.
#[derive(Debug, Clone)]
pub struct Battery {
    capacity_wh: f64,
    charge_wh: f64,
    max_charge_rate_w: f64,
    max_discharge_rate_w: f64,
}

fn positive_or(value: f64, default: f64, what: &str) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        warn!("Battery {} {} is not positive, using {}", what, value, default);
        default
    }
}

/// `dt` as a usable divisor, or `None` for zero, negative or non-finite steps.
fn usable_dt(dt: f64) -> Option<f64> {
    if dt.is_finite() && dt > 0.0 {
        Some(dt)
    } else {
        warn!("Ignoring battery transfer with invalid dt {}", dt);
        None
    }
}

impl Battery {
    /// Creates a battery at half charge.
    pub fn new(capacity_wh: f64) -> Self {
        let capacity_wh = positive_or(capacity_wh, DEFAULT_CAPACITY_WH, "capacity");
        Self {
            capacity_wh,
            charge_wh: capacity_wh / 2.0,
            max_charge_rate_w: DEFAULT_MAX_CHARGE_RATE_W,
            max_discharge_rate_w: DEFAULT_MAX_DISCHARGE_RATE_W,
        }
    }

    pub fn with_rate_limits(mut self, max_charge_rate_w: f64, max_discharge_rate_w: f64) -> Self {
        self.max_charge_rate_w = positive_or(max_charge_rate_w, DEFAULT_MAX_CHARGE_RATE_W, "charge rate");
        self.max_discharge_rate_w =
            positive_or(max_discharge_rate_w, DEFAULT_MAX_DISCHARGE_RATE_W, "discharge rate");
        self
    }

    pub fn charge_wh(&self) -> f64 {
        self.charge_wh
    }

    pub fn capacity_wh(&self) -> f64 {
        self.capacity_wh
    }

    pub fn max_charge_rate_w(&self) -> f64 {
        self.max_charge_rate_w
    }

    pub fn max_discharge_rate_w(&self) -> f64 {
        self.max_discharge_rate_w
    }

    /// Power the battery could deliver over `dt` right now, before rate limits.
    pub fn max_deliverable_w(&self, dt: f64) -> f64 {
        match usable_dt(dt) {
            Some(dt) => self.charge_wh * SECONDS_PER_HOUR / dt,
            None => 0.0,
        }
    }

    /// Pulls power to support a load; returns the watts actually delivered.
    pub fn discharge(&mut self, needed_w: f64, dt: f64) -> f64 {
        if needed_w.is_nan() || needed_w <= 0.0 {
            return 0.0;
        }
        let Some(dt) = usable_dt(dt) else {
            return 0.0;
        };

        let deliverable_w = needed_w.min(self.max_discharge_rate_w);
        let max_possible_w = self.charge_wh * SECONDS_PER_HOUR / dt;
        let delivered_w = deliverable_w.min(max_possible_w).max(0.0);

        let used_wh = delivered_w * (dt / SECONDS_PER_HOUR);
        self.charge_wh = (self.charge_wh - used_wh).clamp(0.0, self.capacity_wh);

        debug_assert!(
            self.charge_wh >= 0.0 && self.charge_wh <= self.capacity_wh,
            "Battery charge {} outside [0, {}]",
            self.charge_wh,
            self.capacity_wh
        );

        delivered_w
    }

    /// Stores surplus bus power, limited by the charge rate and capacity.
    pub fn charge_from_surplus(&mut self, surplus_w: f64, dt: f64) {
        if surplus_w.is_nan() || surplus_w <= 0.0 {
            return;
        }
        let Some(dt) = usable_dt(dt) else {
            return;
        };

        let actual_w = surplus_w.min(self.max_charge_rate_w);
        let added_wh = actual_w * (dt / SECONDS_PER_HOUR);
        self.charge_wh = (self.charge_wh + added_wh).clamp(0.0, self.capacity_wh);

        debug_assert!(
            self.charge_wh >= 0.0 && self.charge_wh <= self.capacity_wh,
            "Battery charge {} outside [0, {}]",
            self.charge_wh,
            self.capacity_wh
        );
    }

    /// Reports post-settlement state. The bus performs every transfer.
    pub fn tick(&mut self, ctx: &TickContext, sink: &mut dyn TelemetrySink) {
        self.emit(ctx.tick_index, ctx.time, sink);
    }

    fn emit(&self, tick: u64, time: f64, sink: &mut dyn TelemetrySink) {
        sink.emit(
            self.id().as_str(),
            tick,
            time,
            &[
                ("status", 1.0),
                ("charge_Wh", self.charge_wh),
                ("capacity_Wh", self.capacity_wh),
            ],
        );
    }
}

impl Default for Battery {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_WH)
    }
}

impl Subsystem for Battery {
    type State = BatteryState;

    fn id(&self) -> SubsystemId {
        SubsystemId::Battery
    }

    fn initialize(&mut self, sink: &mut dyn TelemetrySink) {
        self.emit(0, 0.0, sink);
    }

    fn get_state(&self) -> Self::State {
        BatteryState {
            charge_wh: self.charge_wh,
            capacity_wh: self.capacity_wh,
            max_charge_rate_w: self.max_charge_rate_w,
            max_discharge_rate_w: self.max_discharge_rate_w,
            state_of_charge: self.charge_wh / self.capacity_wh,
        }
    }
}
