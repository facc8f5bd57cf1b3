use super::{Battery, Subsystem, SubsystemId};
use crate::telemetry::TelemetrySink;
use crate::tick::TickContext;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-tick accumulators of the bus. All reset to zero by [`PowerBus::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BusCounters {
    /// Generation not yet consumed by any load.
    pub available_w: f64,
    pub added_w: f64,
    pub requested_w: f64,
    pub granted_w: f64,
    /// Portion of `granted_w` that came out of the battery.
    pub from_battery_w: f64,
}

/// Single-tick energy router between generation, loads and storage.
///
/// The bus never carries energy across ticks: whatever generation is left
/// when [`tick`](Self::tick) runs is pushed into the attached battery and
/// the counters are cleared.
#[derive(Debug, Clone, Default)]
pub struct PowerBus {
    counters: BusCounters,
    battery: Option<Battery>,
}

impl PowerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_battery(battery: Battery) -> Self {
        Self {
            counters: BusCounters::default(),
            battery: Some(battery),
        }
    }

    pub fn attach_battery(&mut self, battery: Battery) {
        self.battery = Some(battery);
    }

    pub fn battery(&self) -> Option<&Battery> {
        self.battery.as_ref()
    }

    pub fn battery_mut(&mut self) -> Option<&mut Battery> {
        self.battery.as_mut()
    }

    pub fn available_power(&self) -> f64 {
        self.counters.available_w
    }

    pub fn counters(&self) -> BusCounters {
        self.counters
    }

    pub fn add_power(&mut self, watts: f64) {
        if !watts.is_finite() {
            warn!("PowerBus ignoring non-finite generation {}", watts);
            return;
        }
        if watts <= 0.0 {
            return;
        }
        self.counters.available_w += watts;
        self.counters.added_w += watts;
    }

    /// Serves a load. Returns the watts granted, which may be less than
    /// `requested`: partial grants are the normal shortfall outcome.
    pub fn draw_power(&mut self, requested: f64, ctx: &TickContext) -> f64 {
        if requested.is_nan() || requested <= 0.0 {
            return 0.0;
        }
        if requested.is_infinite() {
            warn!("PowerBus tick {} ignoring unbounded draw request", ctx.tick_index);
            return 0.0;
        }

        let from_bus = requested.min(self.counters.available_w);
        self.counters.available_w -= from_bus;

        let shortfall = requested - from_bus;
        let from_battery = match self.battery.as_mut() {
            Some(battery) if shortfall > 0.0 => battery.discharge(shortfall, ctx.dt),
            _ => 0.0,
        };

        self.counters.requested_w += requested;
        self.counters.granted_w += from_bus + from_battery;
        self.counters.from_battery_w += from_battery;

        debug_assert!(
            self.counters.available_w >= 0.0,
            "Bus available power {} went negative",
            self.counters.available_w
        );
        debug_assert!(
            self.counters.granted_w <= self.counters.requested_w + 1e-9,
            "Bus granted {} more than requested {}",
            self.counters.granted_w,
            self.counters.requested_w
        );

        from_bus + from_battery
    }

    /// Settles unconsumed generation into the battery, reports the tick and
    /// resets the counters. Must run after every consumer has drawn.
    pub fn tick(&mut self, ctx: &TickContext, sink: &mut dyn TelemetrySink) {
        let surplus = self.counters.available_w;
        let mut stored_w = 0.0;
        if surplus > 0.0 {
            if let Some(battery) = self.battery.as_mut() {
                let before = battery.charge_wh();
                battery.charge_from_surplus(surplus, ctx.dt);
                stored_w = (battery.charge_wh() - before) / ctx.dt_hours();
            }
        }

        self.emit(ctx.tick_index, ctx.time, stored_w, sink);
        self.counters = BusCounters::default();
    }

    fn emit(&self, tick: u64, time: f64, stored_w: f64, sink: &mut dyn TelemetrySink) {
        sink.emit(
            self.id().as_str(),
            tick,
            time,
            &[
                ("available_power", self.counters.available_w),
                ("added_power", self.counters.added_w),
                ("draw_request", self.counters.requested_w),
                ("granted", self.counters.granted_w),
                ("from_battery", self.counters.from_battery_w),
                ("surplus_stored", stored_w),
            ],
        );
    }
}

impl Subsystem for PowerBus {
    type State = BusCounters;

    fn id(&self) -> SubsystemId {
        SubsystemId::PowerBus
    }

    fn initialize(&mut self, sink: &mut dyn TelemetrySink) {
        self.counters = BusCounters::default();
        self.emit(0, 0.0, 0.0, sink);
    }

    fn get_state(&self) -> Self::State {
        self.counters
    }
}
