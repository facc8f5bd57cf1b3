use super::{PowerBus, Subsystem, SubsystemId};
use crate::telemetry::TelemetrySink;
use crate::tick::TickContext;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 30 % DC efficiency.
pub const DEFAULT_EFFICIENCY: f64 = 0.30;
/// Raw sunlight on the array at full illumination; ~1.7 kW electrical at default efficiency.
pub const DEFAULT_BASE_INPUT_W: f64 = 5667.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolarState {
    pub illumination: f64,
    pub solar_input_w: f64,
    pub output_w: f64,
    pub efficiency: f64,
}

/// Deployable array whose electrical output is
/// `illumination * base_input_w * efficiency`.
#[derive(Debug, Clone)]
pub struct SolarArray {
    efficiency: f64,
    base_input_w: f64,
    last_illumination: f64,
    last_output_w: f64,
}

/// Clamps an external illumination reading into `[0, 1]`; non-finite is eclipse.
pub fn sanitize_illumination(raw: f64) -> f64 {
    if !raw.is_finite() {
        warn!("Non-finite illumination {} treated as eclipse", raw);
        return 0.0;
    }
    if !(0.0..=1.0).contains(&raw) {
        warn!("Illumination {} clamped into [0, 1]", raw);
    }
    raw.clamp(0.0, 1.0)
}

impl SolarArray {
    pub fn new(efficiency: f64, base_input_w: f64) -> Self {
        let efficiency = if efficiency.is_finite() && (0.0..=1.0).contains(&efficiency) {
            efficiency
        } else {
            warn!("Solar efficiency {} outside [0, 1], using {}", efficiency, DEFAULT_EFFICIENCY);
            DEFAULT_EFFICIENCY
        };
        let base_input_w = if base_input_w.is_finite() && base_input_w >= 0.0 {
            base_input_w
        } else {
            warn!("Solar base input {} invalid, using {}", base_input_w, DEFAULT_BASE_INPUT_W);
            DEFAULT_BASE_INPUT_W
        };

        Self {
            efficiency,
            base_input_w,
            last_illumination: 0.0,
            last_output_w: 0.0,
        }
    }

    pub fn efficiency(&self) -> f64 {
        self.efficiency
    }

    pub fn base_input_w(&self) -> f64 {
        self.base_input_w
    }

    pub fn last_output_w(&self) -> f64 {
        self.last_output_w
    }

    /// Electrical output for a given illumination; no side effects.
    pub fn output_for(&self, illumination: f64) -> f64 {
        let scale = if illumination.is_finite() { illumination.clamp(0.0, 1.0) } else { 0.0 };
        scale * self.base_input_w * self.efficiency
    }

    /// Produces this tick's power and injects all of it into the bus.
    pub fn tick(
        &mut self,
        ctx: &TickContext,
        illumination: f64,
        bus: &mut PowerBus,
        sink: &mut dyn TelemetrySink,
    ) -> f64 {
        let scale = sanitize_illumination(illumination);
        let solar_input_w = self.base_input_w * scale;
        let output_w = solar_input_w * self.efficiency;

        self.last_illumination = scale;
        self.last_output_w = output_w;
        bus.add_power(output_w);

        sink.emit(
            self.id().as_str(),
            ctx.tick_index,
            ctx.time,
            &[
                ("status", 1.0),
                ("solar_scale", scale),
                ("solar_input", solar_input_w),
                ("output", output_w),
                ("efficiency", self.efficiency),
            ],
        );

        output_w
    }
}

impl Default for SolarArray {
    fn default() -> Self {
        Self::new(DEFAULT_EFFICIENCY, DEFAULT_BASE_INPUT_W)
    }
}

impl Subsystem for SolarArray {
    type State = SolarState;

    fn id(&self) -> SubsystemId {
        SubsystemId::SolarArray
    }

    fn initialize(&mut self, sink: &mut dyn TelemetrySink) {
        self.last_output_w = 0.0;
        sink.emit(
            self.id().as_str(),
            0,
            0.0,
            &[
                ("status", 1.0),
                ("solar_scale", 0.0),
                ("solar_input", 0.0),
                ("output", 0.0),
                ("efficiency", self.efficiency),
            ],
        );
    }

    fn get_state(&self) -> Self::State {
        SolarState {
            illumination: self.last_illumination,
            solar_input_w: self.base_input_w * self.last_illumination,
            output_w: self.last_output_w,
            efficiency: self.efficiency,
        }
    }
}
