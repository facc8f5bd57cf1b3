use super::{Subsystem, SubsystemId};
use crate::telemetry::TelemetrySink;
use crate::tick::TickContext;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_CAPACITANCE_J_PER_K: f64 = 1000.0;
pub const DEFAULT_LOSS_W_PER_K: f64 = 1.5;
pub const DEFAULT_AMBIENT_K: f64 = 300.0;

/// Fixed first-order RC constants of one thermal element.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalConstants {
    pub capacitance_j_per_k: f64,
    pub loss_w_per_k: f64,
    pub ambient_k: f64,
}

impl Default for ThermalConstants {
    fn default() -> Self {
        Self {
            capacitance_j_per_k: DEFAULT_CAPACITANCE_J_PER_K,
            loss_w_per_k: DEFAULT_LOSS_W_PER_K,
            ambient_k: DEFAULT_AMBIENT_K,
        }
    }
}

impl ThermalConstants {
    /// tau = C / h, in seconds.
    pub fn time_constant_s(&self) -> f64 {
        self.capacitance_j_per_k / self.loss_w_per_k
    }

    /// Temperature the element settles at under constant input power.
    pub fn steady_state_k(&self, power_w: f64) -> f64 {
        self.ambient_k + power_w.max(0.0) / self.loss_w_per_k
    }

    /// Replaces non-physical constants with defaults, reporting each substitution.
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        let pick = |value: f64, default: f64, what: &str| {
            if value.is_finite() && value > 0.0 {
                value
            } else {
                warn!("Thermal {} {} is not positive, using {}", what, value, default);
                default
            }
        };
        Self {
            capacitance_j_per_k: pick(self.capacitance_j_per_k, defaults.capacitance_j_per_k, "capacitance"),
            loss_w_per_k: pick(self.loss_w_per_k, defaults.loss_w_per_k, "loss coefficient"),
            ambient_k: pick(self.ambient_k, defaults.ambient_k, "ambient temperature"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalState {
    pub temperature_k: f64,
    pub target_temperature_k: f64,
    pub last_applied_w: f64,
}

/// First-order thermal RC element (effusion cell, substrate heater).
///
/// `apply_heat` is the only mutator and receives the power actually
/// delivered by the bus, so the trajectory reflects real energy rather
/// than demand. The target temperature is reported only and never feeds
/// back into the integration.
#[derive(Debug, Clone)]
pub struct ThermalActuator {
    id: SubsystemId,
    constants: ThermalConstants,
    temperature_k: f64,
    target_temperature_k: f64,
    last_applied_w: f64,
}

impl ThermalActuator {
    pub fn new(id: SubsystemId, constants: ThermalConstants) -> Self {
        let constants = constants.sanitized();
        Self {
            id,
            constants,
            temperature_k: constants.ambient_k,
            target_temperature_k: constants.ambient_k,
            last_applied_w: 0.0,
        }
    }

    pub fn effusion_cell(constants: ThermalConstants) -> Self {
        Self::new(SubsystemId::EffusionCell, constants)
    }

    pub fn substrate_heater(constants: ThermalConstants) -> Self {
        Self::new(SubsystemId::SubstrateHeater, constants)
    }

    pub fn constants(&self) -> &ThermalConstants {
        &self.constants
    }

    pub fn temperature_k(&self) -> f64 {
        self.temperature_k
    }

    pub fn target_temperature_k(&self) -> f64 {
        self.target_temperature_k
    }

    pub fn last_applied_w(&self) -> f64 {
        self.last_applied_w
    }

    pub fn set_target_temperature(&mut self, kelvin: f64) {
        if kelvin.is_finite() && kelvin >= 0.0 {
            self.target_temperature_k = kelvin;
        } else {
            warn!("{} ignoring invalid target temperature {}", self.id, kelvin);
        }
    }

    /// Integrates one step of `dT = ((P - h(T - T_env)) / C) * dt`.
    ///
    /// Negative or non-finite power and dt count as zero. The step never
    /// crosses the steady state for the applied power, so a cooling element
    /// approaches ambient monotonically.
    pub fn apply_heat(&mut self, watts: f64, dt: f64) {
        let power_w = if watts.is_finite() && watts > 0.0 { watts } else { 0.0 };
        let dt = if dt.is_finite() && dt > 0.0 { dt } else { 0.0 };
        self.last_applied_w = power_w;

        let c = &self.constants;
        let delta_k = ((power_w - c.loss_w_per_k * (self.temperature_k - c.ambient_k)) / c.capacitance_j_per_k) * dt;
        let steady_k = c.steady_state_k(power_w);
        let mut next_k = self.temperature_k + delta_k;

        // Explicit Euler overshoots once dt exceeds tau; stop at the fixed point.
        if (self.temperature_k - steady_k) * (next_k - steady_k) < 0.0 {
            debug!("{} step of {} s clamped at steady state {} K", self.id, dt, steady_k);
            next_k = steady_k;
        }

        if !next_k.is_finite() {
            warn!("{} temperature became non-finite, resetting to ambient", self.id);
            next_k = c.ambient_k;
        }
        self.temperature_k = next_k.max(0.0);
    }

    pub fn tick(&mut self, ctx: &TickContext, sink: &mut dyn TelemetrySink) {
        sink.emit(
            self.id.as_str(),
            ctx.tick_index,
            ctx.time,
            &[
                ("heatInput", self.last_applied_w),
                ("temperature", self.temperature_k),
                ("target_temperature", self.target_temperature_k),
            ],
        );
    }
}

impl Subsystem for ThermalActuator {
    type State = ThermalState;

    fn id(&self) -> SubsystemId {
        self.id
    }

    fn get_state(&self) -> Self::State {
        ThermalState {
            temperature_k: self.temperature_k,
            target_temperature_k: self.target_temperature_k,
            last_applied_w: self.last_applied_w,
        }
    }
}
