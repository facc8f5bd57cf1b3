use crate::subsystems::ThermalConstants;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use tracing::{debug, info, warn};

pub const DEFAULT_ABORT_LIMIT: u32 = 5;
pub const DEFAULT_MIN_FLUX_FRACTION: f64 = 0.5;
pub const DEFAULT_TEMP_TOLERANCE_FRACTION: f64 = 0.95;
pub const DEFAULT_WARMUP_GATE_FRACTION: f64 = 0.9;
/// Upper bound on any computed warm-up, whatever the thermal constants say.
pub const MAX_WARMUP_TICKS: u64 = 100_000;
/// Targets this close to ambient need no warm-up.
const AMBIENT_EPSILON_K: f64 = 1.0e-6;
const MAX_ABORT_HISTORY: usize = 16;

const_assert!(DEFAULT_ABORT_LIMIT > 0);
const_assert!(MAX_WARMUP_TICKS > 0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Delivered/commanded power below this counts as an under-flux tick.
    pub min_flux_fraction: f64,
    /// Temperature/target below this counts as a temperature miss.
    pub temp_tolerance_fraction: f64,
    pub underflux_limit: u32,
    pub temp_miss_limit: u32,
    /// Fraction of the rise from ambient to target that ends warm-up.
    pub warmup_gate_fraction: f64,
    pub max_warmup_ticks: u64,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            min_flux_fraction: DEFAULT_MIN_FLUX_FRACTION,
            temp_tolerance_fraction: DEFAULT_TEMP_TOLERANCE_FRACTION,
            underflux_limit: DEFAULT_ABORT_LIMIT,
            temp_miss_limit: DEFAULT_ABORT_LIMIT,
            warmup_gate_fraction: DEFAULT_WARMUP_GATE_FRACTION,
            max_warmup_ticks: MAX_WARMUP_TICKS,
        }
    }
}

fn fraction_or(value: f64, default: f64, what: &str) -> f64 {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        value
    } else {
        warn!("Compliance {} {} outside (0, 1], using {}", what, value, default);
        default
    }
}

impl ComplianceConfig {
    pub fn sanitized(self) -> Self {
        let limit = |value: u32, what: &str| {
            if value == 0 {
                warn!("Compliance {} of 0 invalid, using {}", what, DEFAULT_ABORT_LIMIT);
                DEFAULT_ABORT_LIMIT
            } else {
                value
            }
        };
        Self {
            min_flux_fraction: fraction_or(self.min_flux_fraction, DEFAULT_MIN_FLUX_FRACTION, "min flux fraction"),
            temp_tolerance_fraction: fraction_or(
                self.temp_tolerance_fraction,
                DEFAULT_TEMP_TOLERANCE_FRACTION,
                "temperature tolerance",
            ),
            underflux_limit: limit(self.underflux_limit, "underflux limit"),
            temp_miss_limit: limit(self.temp_miss_limit, "temperature miss limit"),
            warmup_gate_fraction: fraction_or(self.warmup_gate_fraction, DEFAULT_WARMUP_GATE_FRACTION, "warm-up gate"),
            max_warmup_ticks: if self.max_warmup_ticks == 0 { MAX_WARMUP_TICKS } else { self.max_warmup_ticks },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompliancePhase {
    Idle,
    Warmup,
    Armed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortAxis {
    Flux,
    Temperature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortRecord {
    pub job_index: usize,
    pub tick: u64,
    pub axis: AbortAxis,
    pub flux_ratio: f64,
    pub temp_ratio: f64,
    pub ticks_in_job: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceState {
    pub underflux_streak: u32,
    pub temp_miss_streak: u32,
    pub ticks_in_job: u64,
    pub warmup_ticks_required: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComplianceOutcome {
    /// No job is being watched.
    Idle,
    WarmingUp { remaining: u64 },
    Nominal,
    Abort(AbortRecord),
}

/// Warm-up budget for a job, in ticks.
///
/// Solves `t = -tau * ln(1 - ratio)` for the time the RC trajectory under
/// `commanded_w` needs to cover `gate_fraction` of the rise from ambient to
/// `target_k`, then rounds up to whole ticks. Targets the trajectory can
/// never reach get `max_ticks`.
pub fn warmup_ticks(
    commanded_w: f64,
    target_k: f64,
    constants: &ThermalConstants,
    gate_fraction: f64,
    dt: f64,
    max_ticks: u64,
) -> u64 {
    if !commanded_w.is_finite() || commanded_w <= 0.0 {
        return 0;
    }
    if !dt.is_finite() || dt <= 0.0 {
        warn!("Warm-up requested with invalid dt {}, arming immediately", dt);
        return 0;
    }
    let rise_needed_k = target_k - constants.ambient_k;
    if !rise_needed_k.is_finite() || rise_needed_k <= AMBIENT_EPSILON_K {
        return 0;
    }

    let rise_available_k = constants.steady_state_k(commanded_w) - constants.ambient_k;
    let ratio = gate_fraction * rise_needed_k / rise_available_k;
    if !ratio.is_finite() || ratio >= 1.0 {
        warn!(
            "Target {:.1} K unreachable at {:.1} W (steady state {:.1} K), warm-up capped at {} ticks",
            target_k,
            commanded_w,
            constants.steady_state_k(commanded_w),
            max_ticks
        );
        return max_ticks;
    }

    let seconds = -constants.time_constant_s() * (1.0 - ratio).ln();
    let ticks = (seconds / dt).ceil();
    if !ticks.is_finite() || ticks >= max_ticks as f64 {
        max_ticks
    } else {
        ticks.max(0.0) as u64
    }
}

/// Per-job health state machine: Warmup, then Armed with two independent
/// streak counters, until the job leaves its window or is aborted.
#[derive(Debug)]
pub struct ComplianceMonitor {
    config: ComplianceConfig,
    phase: CompliancePhase,
    state: ComplianceState,
    job: Option<usize>,
    commanded_w: f64,
    target_temperature_k: f64,
    last_flux_ratio: f64,
    last_temp_ratio: f64,
    history: Vec<AbortRecord, MAX_ABORT_HISTORY>,
    total_aborts: u32,
}

impl ComplianceMonitor {
    pub fn new(config: ComplianceConfig) -> Self {
        Self {
            config: config.sanitized(),
            phase: CompliancePhase::Idle,
            state: ComplianceState::default(),
            job: None,
            commanded_w: 0.0,
            target_temperature_k: 0.0,
            last_flux_ratio: 1.0,
            last_temp_ratio: 1.0,
            history: Vec::new(),
            total_aborts: 0,
        }
    }

    pub fn config(&self) -> &ComplianceConfig {
        &self.config
    }

    pub fn phase(&self) -> CompliancePhase {
        self.phase
    }

    pub fn state(&self) -> ComplianceState {
        self.state
    }

    pub fn job(&self) -> Option<usize> {
        self.job
    }

    pub fn last_ratios(&self) -> (f64, f64) {
        (self.last_flux_ratio, self.last_temp_ratio)
    }

    pub fn abort_history(&self) -> &[AbortRecord] {
        &self.history
    }

    pub fn total_aborts(&self) -> u32 {
        self.total_aborts
    }

    /// Starts watching a newly active job with fresh counters.
    pub fn begin_job(
        &mut self,
        index: usize,
        commanded_w: f64,
        target_temperature_k: f64,
        constants: &ThermalConstants,
        dt: f64,
    ) {
        let warmup = warmup_ticks(
            commanded_w,
            target_temperature_k,
            constants,
            self.config.warmup_gate_fraction,
            dt,
            self.config.max_warmup_ticks,
        );

        self.job = Some(index);
        self.commanded_w = commanded_w;
        self.target_temperature_k = target_temperature_k;
        self.state = ComplianceState {
            warmup_ticks_required: warmup,
            ..ComplianceState::default()
        };
        self.last_flux_ratio = 1.0;
        self.last_temp_ratio = 1.0;
        self.phase = if warmup == 0 { CompliancePhase::Armed } else { CompliancePhase::Warmup };

        info!(
            "Compliance watching job {}: {:.1} W, target {:.1} K, warm-up {} ticks",
            index, commanded_w, target_temperature_k, warmup
        );
    }

    /// Stops watching; used when the active job's window closes.
    pub fn clear(&mut self) {
        self.job = None;
        self.phase = CompliancePhase::Idle;
        self.state = ComplianceState::default();
    }

    /// Scores one settled tick against the active job.
    pub fn evaluate(&mut self, tick: u64, delivered_w: f64, temperature_k: f64) -> ComplianceOutcome {
        let Some(job_index) = self.job else {
            return ComplianceOutcome::Idle;
        };
        if matches!(self.phase, CompliancePhase::Idle | CompliancePhase::Aborted) {
            return ComplianceOutcome::Idle;
        }

        self.state.ticks_in_job += 1;
        self.last_flux_ratio = ratio(delivered_w, self.commanded_w);
        self.last_temp_ratio = ratio(temperature_k, self.target_temperature_k);

        if self.phase == CompliancePhase::Warmup {
            if self.state.ticks_in_job <= self.state.warmup_ticks_required {
                self.state.underflux_streak = 0;
                self.state.temp_miss_streak = 0;
                return ComplianceOutcome::WarmingUp {
                    remaining: self.state.warmup_ticks_required - self.state.ticks_in_job,
                };
            }
            debug!("Job {} armed at tick {}", job_index, tick);
            self.phase = CompliancePhase::Armed;
        }

        if self.last_flux_ratio < self.config.min_flux_fraction {
            self.state.underflux_streak += 1;
        } else {
            self.state.underflux_streak = 0;
        }
        if self.last_temp_ratio < self.config.temp_tolerance_fraction {
            self.state.temp_miss_streak += 1;
        } else {
            self.state.temp_miss_streak = 0;
        }

        let axis = if self.state.underflux_streak >= self.config.underflux_limit {
            Some(AbortAxis::Flux)
        } else if self.state.temp_miss_streak >= self.config.temp_miss_limit {
            Some(AbortAxis::Temperature)
        } else {
            None
        };

        match axis {
            Some(axis) => ComplianceOutcome::Abort(self.abort(job_index, tick, axis)),
            None => ComplianceOutcome::Nominal,
        }
    }

    fn abort(&mut self, job_index: usize, tick: u64, axis: AbortAxis) -> AbortRecord {
        let record = AbortRecord {
            job_index,
            tick,
            axis,
            flux_ratio: self.last_flux_ratio,
            temp_ratio: self.last_temp_ratio,
            ticks_in_job: self.state.ticks_in_job,
        };
        warn!(
            "Job {} failed {:?} compliance at tick {} (flux ratio {:.3}, temp ratio {:.3})",
            job_index, axis, tick, record.flux_ratio, record.temp_ratio
        );

        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(record.clone());
        self.total_aborts += 1;

        self.phase = CompliancePhase::Aborted;
        self.state = ComplianceState::default();
        self.job = None;
        record
    }
}

impl Default for ComplianceMonitor {
    fn default() -> Self {
        Self::new(ComplianceConfig::default())
    }
}

/// `value / reference`, or 1.0 when the reference cannot fail anything.
fn ratio(value: f64, reference: f64) -> f64 {
    if !reference.is_finite() || reference <= 0.0 {
        return 1.0;
    }
    let r = value / reference;
    if r.is_finite() { r } else { 0.0 }
}
