use crate::subsystems::{
    BusCounters, BusLoad, FixedLoad, GrowthMonitor, HeaterBank, LoadHandle, LoadSlot, PowerBus, SolarArray, Subsystem,
    SubsystemId,
};
use crate::telemetry::TelemetrySink;
use crate::tick::TickContext;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const DEFAULT_TICK_SECONDS: f64 = 60.0;

/// One system-wide row per tick, built from the counters latched before
/// the bus settled plus post-settlement storage and generator readouts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub tick: u64,
    pub time_s: f64,
    pub bus_remaining_w: f64,
    pub requested_w: f64,
    pub granted_w: f64,
    pub generated_w: f64,
    pub battery_charge_wh: f64,
    pub solar_output_w: f64,
    /// Set only on the tick in which a job was aborted.
    pub job_failed: bool,
    pub capacity_wh: f64,
    pub max_charge_rate_w: f64,
    pub max_discharge_rate_w: f64,
    pub efficiency: f64,
}

/// Fixed-order tick driver.
///
/// Generation, storage and the bus are held in typed fields; every other
/// consumer is a [`LoadSlot`] ticked in registration order.
#[derive(Debug)]
pub struct SimulationEngine {
    dt: f64,
    tick_count: u64,
    solar: SolarArray,
    bus: PowerBus,
    housekeeping: Option<FixedLoad>,
    loads: Vec<LoadSlot>,
    job_failed: bool,
    initialized: bool,
    last_snapshot: Option<SystemSnapshot>,
}

impl SimulationEngine {
    pub fn new(dt: f64, solar: SolarArray, bus: PowerBus) -> Self {
        let dt = if dt.is_finite() && dt > 0.0 {
            dt
        } else {
            warn!("Tick duration {} invalid, using {} s", dt, DEFAULT_TICK_SECONDS);
            DEFAULT_TICK_SECONDS
        };
        if bus.battery().is_none() {
            warn!("PowerBus has no battery attached; shortfalls will not be covered");
        }

        Self {
            dt,
            tick_count: 0,
            solar,
            bus,
            housekeeping: None,
            loads: Vec::new(),
            job_failed: false,
            initialized: false,
            last_snapshot: None,
        }
    }

    pub fn with_housekeeping(mut self, load: FixedLoad) -> Self {
        self.housekeeping = Some(load);
        self
    }

    /// Appends a Phase 2 consumer. Order of registration is tick order.
    pub fn register(&mut self, load: impl Into<LoadSlot>) -> LoadHandle {
        let slot = load.into();
        debug!("Registered {} as load {}", slot.id(), self.loads.len());
        self.loads.push(slot);
        LoadHandle(self.loads.len() - 1)
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Index the next call to [`tick`](Self::tick) will use.
    pub fn tick_index(&self) -> u64 {
        self.tick_count
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn solar(&self) -> &SolarArray {
        &self.solar
    }

    pub fn bus(&self) -> &PowerBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut PowerBus {
        &mut self.bus
    }

    pub fn housekeeping(&self) -> Option<&FixedLoad> {
        self.housekeeping.as_ref()
    }

    pub fn load(&self, handle: LoadHandle) -> Option<&LoadSlot> {
        self.loads.get(handle.0)
    }

    pub fn heater(&self, handle: LoadHandle) -> Option<&HeaterBank> {
        self.loads.get(handle.0).and_then(LoadSlot::as_heater)
    }

    pub fn heater_mut(&mut self, handle: LoadHandle) -> Option<&mut HeaterBank> {
        self.loads.get_mut(handle.0).and_then(LoadSlot::as_heater_mut)
    }

    pub fn growth_mut(&mut self, handle: LoadHandle) -> Option<&mut GrowthMonitor> {
        self.loads.get_mut(handle.0).and_then(LoadSlot::as_growth_mut)
    }

    pub fn last_snapshot(&self) -> Option<&SystemSnapshot> {
        self.last_snapshot.as_ref()
    }

    /// Flags the current tick as the one in which a job failed. Cleared
    /// right after the tick's snapshot is emitted.
    pub fn mark_job_failed(&mut self) {
        self.job_failed = true;
    }

    /// Initializes every subsystem and emits the tick-0 snapshot.
    pub fn initialize(&mut self, sink: &mut dyn TelemetrySink) {
        self.solar.initialize(sink);
        self.bus.initialize(sink);
        if let Some(battery) = self.bus.battery_mut() {
            battery.initialize(sink);
        }
        if let Some(load) = self.housekeeping.as_mut() {
            load.initialize(sink);
        }
        for load in &mut self.loads {
            load.initialize(sink);
        }

        self.job_failed = false;
        let ctx = TickContext::new(0, 0.0, self.dt);
        let snapshot = self.snapshot(&ctx, &BusCounters::default());
        self.emit_snapshot(&snapshot, sink);
        self.last_snapshot = Some(snapshot);

        self.tick_count = 1;
        self.initialized = true;
        info!(
            "SimulationEngine initialized: dt {} s, {} loads, housekeeping {}",
            self.dt,
            self.loads.len(),
            self.housekeeping.is_some()
        );
    }

    pub fn tick(&mut self, illumination: f64, sink: &mut dyn TelemetrySink) -> SystemSnapshot {
        self.tick_with(illumination, sink, |_, _| false)
    }

    /// Runs one tick. `evaluate` sees the settled tick before the snapshot
    /// is taken; returning `true` marks a job failure on this tick.
    pub fn tick_with<F>(&mut self, illumination: f64, sink: &mut dyn TelemetrySink, evaluate: F) -> SystemSnapshot
    where
        F: FnOnce(&TickContext, &SimulationEngine) -> bool,
    {
        if !self.initialized {
            warn!("SimulationEngine ticked before initialize; initializing now");
            self.initialize(sink);
        }

        let ctx = TickContext::new(self.tick_count, self.tick_count as f64 * self.dt, self.dt);

        // Phase 0: generation
        self.solar.tick(&ctx, illumination, &mut self.bus, sink);

        // Phase 1: housekeeping baseline
        if let Some(load) = self.housekeeping.as_mut() {
            load.tick(&ctx, &mut self.bus, sink);
        }

        // Phase 2: registered loads, each forwarding to its actuators
        for load in &mut self.loads {
            load.tick(&ctx, &mut self.bus, sink);
        }

        // Phase 3: bus.tick() resets the counters
        let latched = self.bus.counters();

        // Phase 4
        self.bus.tick(&ctx, sink);

        // Phase 5
        if let Some(battery) = self.bus.battery_mut() {
            battery.tick(&ctx, sink);
        }

        if evaluate(&ctx, self) {
            self.mark_job_failed();
        }

        // Phase 6
        let snapshot = self.snapshot(&ctx, &latched);
        self.emit_snapshot(&snapshot, sink);
        self.job_failed = false;
        self.last_snapshot = Some(snapshot.clone());
        self.tick_count += 1;

        snapshot
    }

    pub fn shutdown(&mut self, sink: &mut dyn TelemetrySink) {
        for load in &mut self.loads {
            load.shutdown(sink);
        }
        if let Some(load) = self.housekeeping.as_mut() {
            load.shutdown(sink);
        }
        sink.flush();
        info!("SimulationEngine shut down after {} ticks", self.tick_count.saturating_sub(1));
    }

    fn snapshot(&self, ctx: &TickContext, latched: &BusCounters) -> SystemSnapshot {
        let battery = self.bus.battery();
        SystemSnapshot {
            tick: ctx.tick_index,
            time_s: ctx.time,
            bus_remaining_w: latched.available_w,
            requested_w: latched.requested_w,
            granted_w: latched.granted_w,
            generated_w: latched.added_w,
            battery_charge_wh: battery.map_or(0.0, |b| b.charge_wh()),
            solar_output_w: self.solar.last_output_w(),
            job_failed: self.job_failed,
            capacity_wh: battery.map_or(0.0, |b| b.capacity_wh()),
            max_charge_rate_w: battery.map_or(0.0, |b| b.max_charge_rate_w()),
            max_discharge_rate_w: battery.map_or(0.0, |b| b.max_discharge_rate_w()),
            efficiency: self.solar.efficiency(),
        }
    }

    fn emit_snapshot(&self, s: &SystemSnapshot, sink: &mut dyn TelemetrySink) {
        sink.emit(
            SubsystemId::SimulationEngine.as_str(),
            s.tick,
            s.time_s,
            &[
                ("status", 1.0),
                ("bus", s.bus_remaining_w),
                ("battery", s.battery_charge_wh),
                ("solar", s.solar_output_w),
                ("job_failed", if s.job_failed { 1.0 } else { 0.0 }),
                ("requested", s.requested_w),
                ("granted", s.granted_w),
                ("generated", s.generated_w),
                ("capacity_Wh", s.capacity_wh),
                ("max_charge_W", s.max_charge_rate_w),
                ("max_discharge_W", s.max_discharge_rate_w),
                ("efficiency", s.efficiency),
            ],
        );
    }
}
