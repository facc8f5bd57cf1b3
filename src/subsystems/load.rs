use super::{BusLoad, GrowthMonitor, HeaterBank, PowerBus, Subsystem, SubsystemId};
use crate::telemetry::TelemetrySink;
use crate::tick::TickContext;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Constant draw, used for the housekeeping baseline served in Phase 1.
#[derive(Debug, Clone)]
pub struct FixedLoad {
    id: SubsystemId,
    power_w: f64,
    last_received_w: f64,
}

impl FixedLoad {
    pub fn new(id: SubsystemId, power_w: f64) -> Self {
        let power_w = if power_w.is_finite() && power_w >= 0.0 {
            power_w
        } else {
            warn!("{} draw {} invalid, using 0", id, power_w);
            0.0
        };
        Self {
            id,
            power_w,
            last_received_w: 0.0,
        }
    }

    pub fn housekeeping(power_w: f64) -> Self {
        Self::new(SubsystemId::Housekeeping, power_w)
    }

    pub fn power_w(&self) -> f64 {
        self.power_w
    }

    pub fn last_received_w(&self) -> f64 {
        self.last_received_w
    }
}

impl Subsystem for FixedLoad {
    type State = f64;

    fn id(&self) -> SubsystemId {
        self.id
    }

    fn get_state(&self) -> Self::State {
        self.last_received_w
    }
}

impl BusLoad for FixedLoad {
    fn tick(&mut self, ctx: &TickContext, bus: &mut PowerBus, sink: &mut dyn TelemetrySink) {
        self.last_received_w = bus.draw_power(self.power_w, ctx);
        sink.emit(
            self.id.as_str(),
            ctx.tick_index,
            ctx.time,
            &[("requested_w", self.power_w), ("received_w", self.last_received_w)],
        );
    }
}

/// Index of a load registered with the engine, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadHandle(pub usize);

/// Closed set of Phase 2 consumers. The engine dispatches on the variant
/// instead of inspecting trait objects at runtime.
#[derive(Debug, Clone)]
pub enum LoadSlot {
    Heater(HeaterBank),
    Growth(GrowthMonitor),
    Fixed(FixedLoad),
}

impl LoadSlot {
    pub fn id(&self) -> SubsystemId {
        match self {
            LoadSlot::Heater(h) => h.id(),
            LoadSlot::Growth(g) => g.id(),
            LoadSlot::Fixed(f) => f.id(),
        }
    }

    pub fn initialize(&mut self, sink: &mut dyn TelemetrySink) {
        match self {
            LoadSlot::Heater(h) => h.initialize(sink),
            LoadSlot::Growth(g) => g.initialize(sink),
            LoadSlot::Fixed(f) => f.initialize(sink),
        }
    }

    pub fn tick(&mut self, ctx: &TickContext, bus: &mut PowerBus, sink: &mut dyn TelemetrySink) {
        match self {
            LoadSlot::Heater(h) => h.tick(ctx, bus, sink),
            LoadSlot::Growth(g) => g.tick(ctx, bus, sink),
            LoadSlot::Fixed(f) => f.tick(ctx, bus, sink),
        }
    }

    pub fn shutdown(&mut self, sink: &mut dyn TelemetrySink) {
        match self {
            LoadSlot::Heater(h) => h.shutdown(sink),
            LoadSlot::Growth(g) => g.shutdown(sink),
            LoadSlot::Fixed(f) => f.shutdown(sink),
        }
    }

    pub fn as_heater(&self) -> Option<&HeaterBank> {
        match self {
            LoadSlot::Heater(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_heater_mut(&mut self) -> Option<&mut HeaterBank> {
        match self {
            LoadSlot::Heater(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_growth_mut(&mut self) -> Option<&mut GrowthMonitor> {
        match self {
            LoadSlot::Growth(g) => Some(g),
            _ => None,
        }
    }
}

impl From<HeaterBank> for LoadSlot {
    fn from(bank: HeaterBank) -> Self {
        LoadSlot::Heater(bank)
    }
}

impl From<GrowthMonitor> for LoadSlot {
    fn from(monitor: GrowthMonitor) -> Self {
        LoadSlot::Growth(monitor)
    }
}

impl From<FixedLoad> for LoadSlot {
    fn from(load: FixedLoad) -> Self {
        LoadSlot::Fixed(load)
    }
}
