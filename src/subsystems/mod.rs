pub mod battery;
pub mod bus;
pub mod growth;
pub mod heater;
pub mod load;
pub mod solar;
pub mod thermal;

pub use battery::{Battery, BatteryState};
pub use bus::{BusCounters, PowerBus};
pub use growth::{GrowthMonitor, GrowthState};
pub use heater::{ArbitrationPolicy, HeaterBank, HeaterChannel, HeaterDelivery};
pub use load::{FixedLoad, LoadHandle, LoadSlot};
pub use solar::{SolarArray, SolarState};
pub use thermal::{ThermalActuator, ThermalConstants, ThermalState};

use crate::telemetry::TelemetrySink;
use crate::tick::TickContext;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubsystemId {
    SolarArray,
    PowerBus,
    Battery,
    HeaterBank,
    EffusionCell,
    SubstrateHeater,
    GrowthMonitor,
    Housekeeping,
    SimulationEngine,
}

impl SubsystemId {
    pub fn as_str(self) -> &'static str {
        match self {
            SubsystemId::SolarArray => "SolarArray",
            SubsystemId::PowerBus => "PowerBus",
            SubsystemId::Battery => "Battery",
            SubsystemId::HeaterBank => "HeaterBank",
            SubsystemId::EffusionCell => "EffusionCell",
            SubsystemId::SubstrateHeater => "SubstrateHeater",
            SubsystemId::GrowthMonitor => "GrowthMonitor",
            SubsystemId::Housekeeping => "Housekeeping",
            SubsystemId::SimulationEngine => "SimulationEngine",
        }
    }
}

impl core::fmt::Display for SubsystemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle shared by every simulated subsystem.
pub trait Subsystem {
    type State: Clone + Serialize;

    fn id(&self) -> SubsystemId;

    fn initialize(&mut self, _sink: &mut dyn TelemetrySink) {}

    fn get_state(&self) -> Self::State;

    fn shutdown(&mut self, _sink: &mut dyn TelemetrySink) {}
}

/// A consumer that draws from the shared bus during Phase 1/2 of a tick.
pub trait BusLoad: Subsystem {
    fn tick(&mut self, ctx: &TickContext, bus: &mut PowerBus, sink: &mut dyn TelemetrySink);
}
