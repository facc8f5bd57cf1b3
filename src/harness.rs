use crate::compliance::{AbortRecord, ComplianceMonitor, ComplianceOutcome};
use crate::config::{ConfigError, HarnessConfig, RunMode};
use crate::coupling::{CouplingError, SolverCoupling};
use crate::engine::{SimulationEngine, SystemSnapshot};
use crate::exchange::{ExchangeError, LinkEnd};
use crate::jobs::{floored_flux, Job, JobLoadError, FLUX_FLOOR_CM2S};
use crate::orbit::{ConstantIllumination, IlluminationSource, OrbitModel};
use crate::scheduler::{JobScheduler, JobTransition};
use crate::subsystems::{
    Battery, FixedLoad, GrowthMonitor, HeaterBank, LoadHandle, PowerBus, SolarArray, ThermalActuator,
};
use crate::telemetry::{TelemetryError, TelemetrySink};
use crate::tick::TickContext;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{error, info, warn};

pub const FLUX_PARAM: &str = "Fwafer_cm2s";
pub const BEAM_PARAM: &str = "mbe_active";
pub const CELL_TEMPERATURE_PARAM: &str = "T_cell_K";

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("solver coupling failed: {0}")]
    Coupling(#[from] CouplingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Jobs(#[from] JobLoadError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("load {0:?} is not a heater bank")]
    NoHeater(LoadHandle),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub group: usize,
    pub ticks_run: u64,
    pub jobs_total: usize,
    pub activations: u32,
    pub aborted_jobs: Vec<usize>,
    pub coupling_advances: u64,
    pub coupling_reloads: u64,
    pub final_charge_wh: f64,
    pub final_temperature_k: f64,
    pub stopped_early: bool,
}

/// Run loop for one process group: job selection, engine tick with
/// compliance evaluation, abort handling and solver coupling.
pub struct Harness<S: TelemetrySink> {
    engine: SimulationEngine,
    heater: LoadHandle,
    growth: Option<LoadHandle>,
    scheduler: JobScheduler,
    monitor: ComplianceMonitor,
    coupling: Option<Box<dyn SolverCoupling>>,
    illumination: Box<dyn IlluminationSource + Send>,
    sink: S,
    link: Option<LinkEnd>,
    idle_heater_w: f64,
    couple_every: u64,
    solver_block: u32,
    group: usize,
    started: bool,
    running: bool,
    reload_pending: bool,
    ticks_run: u64,
    coupling_advances: u64,
    coupling_reloads: u64,
    last_received_temperature_k: Option<f64>,
}

impl<S: TelemetrySink> Harness<S> {
    pub fn new(engine: SimulationEngine, heater: LoadHandle, scheduler: JobScheduler, sink: S) -> Result<Self, HarnessError> {
        if engine.heater(heater).is_none() {
            return Err(HarnessError::NoHeater(heater));
        }
        Ok(Self {
            engine,
            heater,
            growth: None,
            scheduler,
            monitor: ComplianceMonitor::default(),
            coupling: None,
            illumination: Box::new(ConstantIllumination::default()),
            sink,
            link: None,
            idle_heater_w: 0.0,
            couple_every: crate::config::DEFAULT_COUPLE_EVERY,
            solver_block: crate::config::DEFAULT_SOLVER_BLOCK,
            group: 0,
            started: false,
            running: false,
            reload_pending: false,
            ticks_run: 0,
            coupling_advances: 0,
            coupling_reloads: 0,
            last_received_temperature_k: None,
        })
    }

    /// Builds the full subsystem set described by `config` for one group.
    pub fn from_config(
        config: &HarnessConfig,
        jobs: Vec<Job>,
        log_dir: &Path,
        group: usize,
        sink: S,
    ) -> Result<Self, HarnessError> {
        let battery = Battery::new(config.battery.capacity_wh)
            .with_rate_limits(config.battery.max_charge_rate_w, config.battery.max_discharge_rate_w);
        let solar = SolarArray::new(config.solar.efficiency, config.solar.base_input_w);
        let mut engine = SimulationEngine::new(config.dt_s, solar, PowerBus::with_battery(battery));
        if config.housekeeping_w > 0.0 {
            engine = engine.with_housekeeping(FixedLoad::housekeeping(config.housekeeping_w));
        }

        let mut bank = HeaterBank::new(config.heater_max_draw_w, ThermalActuator::effusion_cell(config.effusion))
            .with_policy(config.arbitration, config.priority);
        if let Some(constants) = config.substrate {
            bank = bank.with_substrate(ThermalActuator::substrate_heater(constants));
            bank.set_substrate_demand(config.substrate_demand_w);
        }
        let heater = engine.register(bank);

        let run_id = match group {
            0 => config.run_id(),
            g => format!("{}_g{}", config.run_id(), g),
        };
        let growth = engine.register(GrowthMonitor::new(config.growth_grid).with_output(log_dir, &run_id));

        let illumination: Box<dyn IlluminationSource + Send> = match (config.mode, config.solar.constant_illumination) {
            (_, Some(value)) => Box::new(ConstantIllumination(value)),
            (RunMode::Power, None) => Box::new(ConstantIllumination::default()),
            (_, None) => Box::new(OrbitModel::new(config.orbit)),
        };

        let mut harness = Self::new(engine, heater, JobScheduler::new(jobs), sink)?
            .with_monitor(ComplianceMonitor::new(config.compliance.clone()))
            .with_cadence(config.couple_every, config.solver_block)
            .with_idle_heater_w(config.idle_heater_w)
            .with_group(group);
        harness.illumination = illumination;
        harness.growth = Some(growth);
        Ok(harness)
    }

    pub fn with_growth(mut self, handle: LoadHandle) -> Self {
        self.growth = Some(handle);
        self
    }

    pub fn with_monitor(mut self, monitor: ComplianceMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// The coupling must already be initialized.
    pub fn with_coupling(mut self, coupling: Box<dyn SolverCoupling>) -> Self {
        self.coupling = Some(coupling);
        self
    }

    pub fn with_illumination(mut self, source: Box<dyn IlluminationSource + Send>) -> Self {
        self.illumination = source;
        self
    }

    pub fn with_link(mut self, link: LinkEnd) -> Self {
        self.link = Some(link);
        self
    }

    pub fn with_cadence(mut self, couple_every: u64, solver_block: u32) -> Self {
        self.couple_every = couple_every.max(1);
        self.solver_block = solver_block;
        self
    }

    pub fn with_idle_heater_w(mut self, watts: f64) -> Self {
        self.idle_heater_w = if watts.is_finite() { watts.max(0.0) } else { 0.0 };
        self
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn engine(&self) -> &SimulationEngine {
        &self.engine
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn monitor(&self) -> &ComplianceMonitor {
        &self.monitor
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn heater(&self) -> Option<&HeaterBank> {
        self.engine.heater(self.heater)
    }

    pub fn last_received_temperature_k(&self) -> Option<f64> {
        self.last_received_temperature_k
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) -> Result<(), HarnessError> {
        if self.started {
            return Ok(());
        }
        self.engine.initialize(&mut self.sink);
        let jobs = self.scheduler.len();
        if let Some(growth) = self.growth.and_then(|h| self.engine.growth_mut(h)) {
            growth.set_num_jobs(jobs);
        }
        if let Some(coupling) = self.coupling.as_mut() {
            coupling.set_parameter(FLUX_PARAM, FLUX_FLOOR_CM2S)?;
            coupling.set_parameter(BEAM_PARAM, 0.0)?;
        }
        self.started = true;
        self.running = true;
        info!(
            "Group {} started: {} jobs, coupling {}, every {} ticks x {} steps",
            self.group,
            jobs,
            if self.coupling.is_some() { "on" } else { "off" },
            self.couple_every,
            self.solver_block
        );
        Ok(())
    }

    /// Runs one engine tick and everything hung off it.
    pub fn step(&mut self) -> Result<SystemSnapshot, HarnessError> {
        if !self.started {
            self.start()?;
        }
        let tick = self.engine.tick_index();
        let dt = self.engine.dt();

        let transition = self.scheduler.update(tick);
        if transition.is_change() {
            self.apply_job_change(transition)?;
        }

        let demand_w = self
            .scheduler
            .active_job()
            .map_or(self.idle_heater_w, |job| job.target_heater_power_w);
        if let Some(bank) = self.engine.heater_mut(self.heater) {
            bank.set_demand(demand_w);
        }

        let ctx = TickContext::new(tick, tick as f64 * dt, dt);
        let illumination = self.illumination.illumination(&ctx);

        let heater = self.heater;
        let monitor = &mut self.monitor;
        let mut abort: Option<AbortRecord> = None;
        let snapshot = self.engine.tick_with(illumination, &mut self.sink, |ctx, engine| {
            let Some(bank) = engine.heater(heater) else {
                return false;
            };
            match monitor.evaluate(
                ctx.tick_index,
                bank.last_delivery().effusion_received_w,
                bank.effusion().temperature_k(),
            ) {
                ComplianceOutcome::Abort(record) => {
                    abort = Some(record);
                    true
                }
                _ => false,
            }
        });

        if let Some(record) = abort {
            self.handle_abort(&record)?;
        }

        if tick % self.couple_every == 0 {
            self.couple(tick)?;
        }

        if let Some(coupling) = self.coupling.as_mut() {
            coupling.tick(&ctx, &mut self.sink);
        }

        self.ticks_run += 1;
        Ok(snapshot)
    }

    fn apply_job_change(&mut self, transition: JobTransition) -> Result<(), HarnessError> {
        let dt = self.engine.dt();
        match transition {
            JobTransition::Entered(index) | JobTransition::Switched { to: index, .. } => {
                let Some(job) = self.scheduler.job(index).cloned() else {
                    return Ok(());
                };
                let Some(bank) = self.engine.heater_mut(self.heater) else {
                    return Err(HarnessError::NoHeater(self.heater));
                };
                let constants = *bank.effusion().constants();
                let target_k = job.target_temperature_k(&constants);
                bank.effusion_mut().set_target_temperature(target_k);
                self.monitor
                    .begin_job(index, job.target_heater_power_w, target_k, &constants, dt);

                if let Some(growth) = self.growth.and_then(|h| self.engine.growth_mut(h)) {
                    growth.set_beam_state(Some(index), true, job.target_flux);
                }
                self.retarget_solver(floored_flux(job.target_flux), 1.0)?;
            }
            JobTransition::Left(_) => {
                self.monitor.clear();
                self.go_idle();
                self.retarget_solver(FLUX_FLOOR_CM2S, 0.0)?;
            }
            JobTransition::Unchanged => {}
        }
        Ok(())
    }

    fn handle_abort(&mut self, record: &AbortRecord) -> Result<(), HarnessError> {
        self.scheduler.mark_aborted(record.job_index);
        if let Some(growth) = self.growth.and_then(|h| self.engine.growth_mut(h)) {
            growth.mark_job_aborted(record.job_index);
        }
        self.go_idle();
        self.retarget_solver(FLUX_FLOOR_CM2S, 0.0)
    }

    fn go_idle(&mut self) {
        if let Some(bank) = self.engine.heater_mut(self.heater) {
            let ambient_k = bank.effusion().constants().ambient_k;
            bank.effusion_mut().set_target_temperature(ambient_k);
        }
        if let Some(growth) = self.growth.and_then(|h| self.engine.growth_mut(h)) {
            growth.set_beam_state(None, false, 0.0);
        }
    }

    /// New flux/beam parameters take effect on the next coupling point.
    fn retarget_solver(&mut self, flux_cm2s: f64, beam: f64) -> Result<(), HarnessError> {
        let Some(coupling) = self.coupling.as_mut() else {
            return Ok(());
        };
        coupling.set_parameter(FLUX_PARAM, flux_cm2s)?;
        coupling.set_parameter(BEAM_PARAM, beam)?;
        coupling.mark_dirty_reload(&mut self.sink);
        self.reload_pending = true;
        Ok(())
    }

    fn couple(&mut self, tick: u64) -> Result<(), HarnessError> {
        if let Some(coupling) = self.coupling.as_mut() {
            let ran = coupling.reload_if_dirty_else_advance(self.solver_block, &mut self.sink)?;
            if self.reload_pending {
                self.coupling_reloads += 1;
                self.reload_pending = false;
            }
            if ran {
                self.coupling_advances += 1;
            }
        }
        self.exchange(tick)
    }

    fn exchange(&mut self, tick: u64) -> Result<(), HarnessError> {
        let result = match self.link.as_mut() {
            None => return Ok(()),
            Some(LinkEnd::Publisher(publisher)) => {
                let temperature_k = self
                    .engine
                    .heater(self.heater)
                    .map_or(0.0, |bank| bank.effusion().temperature_k());
                publisher.publish(temperature_k).map(|()| None)
            }
            Some(LinkEnd::Subscriber(subscriber)) => subscriber.receive().map(Some),
        };

        match result {
            Ok(Some(temperature_k)) => {
                self.last_received_temperature_k = Some(temperature_k);
                if let Some(coupling) = self.coupling.as_mut() {
                    coupling.set_parameter(CELL_TEMPERATURE_PARAM, temperature_k)?;
                }
            }
            Ok(None) => {}
            Err(ExchangeError::Disconnected) => {
                warn!("Group {} tick {}: peer group gone, exchange disabled", self.group, tick);
                self.link = None;
            }
        }
        Ok(())
    }

    /// Runs up to `nticks` ticks, checking `stop` between ticks. Always
    /// shuts down before returning, also on a fatal error.
    ///
    /// A fatal error raises `stop` before the link is dropped, so groups
    /// sharing the flag end at their next tick boundary.
    pub fn run(&mut self, nticks: u64, stop: &AtomicBool) -> Result<RunSummary, HarnessError> {
        let outcome = self.run_ticks(nticks, stop);
        if let Err(e) = &outcome {
            error!("Group {} aborted at tick {}: {}", self.group, self.engine.tick_index(), e);
            stop.store(true, Ordering::Relaxed);
        }
        self.stop();
        outcome.map(|stopped_early| self.summary(stopped_early))
    }

    fn run_ticks(&mut self, nticks: u64, stop: &AtomicBool) -> Result<bool, HarnessError> {
        self.start()?;
        for _ in 0..nticks {
            if stop.load(Ordering::Relaxed) {
                info!("Group {} stop requested after {} ticks", self.group, self.ticks_run);
                return Ok(true);
            }
            self.step()?;
        }
        Ok(false)
    }

    /// Shuts down subsystems and the coupling. Safe to call twice.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.engine.shutdown(&mut self.sink);
        if let Some(coupling) = self.coupling.as_mut() {
            coupling.shutdown(&mut self.sink);
        }
        self.sink.flush();
        self.link = None;
        self.running = false;
    }

    pub fn summary(&self, stopped_early: bool) -> RunSummary {
        let stats = self.scheduler.get_stats();
        RunSummary {
            group: self.group,
            ticks_run: self.ticks_run,
            jobs_total: self.scheduler.len(),
            activations: stats.activations,
            aborted_jobs: self.scheduler.aborted_indices(),
            coupling_advances: self.coupling_advances,
            coupling_reloads: self.coupling_reloads,
            final_charge_wh: self.engine.bus().battery().map_or(0.0, Battery::charge_wh),
            final_temperature_k: self.heater().map_or(0.0, |bank| bank.effusion().temperature_k()),
            stopped_early,
        }
    }
}
