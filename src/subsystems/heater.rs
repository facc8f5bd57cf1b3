use super::{BusLoad, PowerBus, Subsystem, SubsystemId, ThermalActuator};
use crate::telemetry::TelemetrySink;
use crate::tick::TickContext;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_MAX_DRAW_W: f64 = 4000.0;

/// How competing channel demands share the bank's maximum draw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationPolicy {
    /// Scale every request down to fit the ceiling, then draw the
    /// priority channel first. Keeps the demand ratio under contention.
    #[default]
    ProportionalThenPriority,
    /// Serve the priority channel up to the ceiling; the other channel
    /// gets whatever headroom is left.
    PriorityFirst,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaterChannel {
    #[default]
    Effusion,
    Substrate,
}

/// What each channel asked the bus for and what it got this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaterDelivery {
    pub effusion_requested_w: f64,
    pub effusion_received_w: f64,
    pub substrate_requested_w: f64,
    pub substrate_received_w: f64,
}

impl HeaterDelivery {
    pub fn requested_w(&self) -> f64 {
        self.effusion_requested_w + self.substrate_requested_w
    }

    pub fn received_w(&self) -> f64 {
        self.effusion_received_w + self.substrate_received_w
    }
}

/// Resistive heater load feeding the effusion cell and, optionally, the
/// substrate heater. Actuators receive the granted watts, never the demand.
#[derive(Debug, Clone)]
pub struct HeaterBank {
    max_draw_w: f64,
    effusion_demand_w: f64,
    substrate_demand_w: f64,
    priority: HeaterChannel,
    policy: ArbitrationPolicy,
    effusion: ThermalActuator,
    substrate: Option<ThermalActuator>,
    last: HeaterDelivery,
}

fn sanitize_demand(watts: f64, channel: HeaterChannel) -> f64 {
    if watts.is_finite() && watts >= 0.0 {
        watts
    } else {
        warn!("HeaterBank {:?} demand {} invalid, using 0", channel, watts);
        0.0
    }
}

impl HeaterBank {
    pub fn new(max_draw_w: f64, effusion: ThermalActuator) -> Self {
        let max_draw_w = if max_draw_w.is_finite() && max_draw_w > 0.0 {
            max_draw_w
        } else {
            warn!("HeaterBank max draw {} invalid, using {}", max_draw_w, DEFAULT_MAX_DRAW_W);
            DEFAULT_MAX_DRAW_W
        };

        Self {
            max_draw_w,
            effusion_demand_w: 0.0,
            substrate_demand_w: 0.0,
            priority: HeaterChannel::Effusion,
            policy: ArbitrationPolicy::default(),
            effusion,
            substrate: None,
            last: HeaterDelivery::default(),
        }
    }

    pub fn with_substrate(mut self, substrate: ThermalActuator) -> Self {
        self.substrate = Some(substrate);
        self
    }

    pub fn with_policy(mut self, policy: ArbitrationPolicy, priority: HeaterChannel) -> Self {
        self.policy = policy;
        self.priority = priority;
        self
    }

    pub fn max_draw_w(&self) -> f64 {
        self.max_draw_w
    }

    pub fn policy(&self) -> ArbitrationPolicy {
        self.policy
    }

    pub fn priority(&self) -> HeaterChannel {
        self.priority
    }

    pub fn set_demand(&mut self, watts: f64) {
        self.effusion_demand_w = sanitize_demand(watts, HeaterChannel::Effusion);
    }

    pub fn demand_w(&self) -> f64 {
        self.effusion_demand_w
    }

    /// Ignored (with a warning) when no substrate heater is fitted.
    pub fn set_substrate_demand(&mut self, watts: f64) {
        if self.substrate.is_none() {
            warn!("HeaterBank has no substrate heater, ignoring demand {}", watts);
            return;
        }
        self.substrate_demand_w = sanitize_demand(watts, HeaterChannel::Substrate);
    }

    pub fn effusion(&self) -> &ThermalActuator {
        &self.effusion
    }

    pub fn effusion_mut(&mut self) -> &mut ThermalActuator {
        &mut self.effusion
    }

    pub fn substrate(&self) -> Option<&ThermalActuator> {
        self.substrate.as_ref()
    }

    pub fn substrate_mut(&mut self) -> Option<&mut ThermalActuator> {
        self.substrate.as_mut()
    }

    pub fn last_delivery(&self) -> HeaterDelivery {
        self.last
    }

    /// Splits the demands into per-channel bus requests, `(effusion, substrate)`.
    /// The sum never exceeds `max_draw_w`.
    pub fn arbitrate(&self) -> (f64, f64) {
        let (priority_w, other_w) = match self.priority {
            HeaterChannel::Effusion => (self.effusion_demand_w, self.substrate_demand_w),
            HeaterChannel::Substrate => (self.substrate_demand_w, self.effusion_demand_w),
        };

        let (priority_w, other_w) = match self.policy {
            ArbitrationPolicy::ProportionalThenPriority => {
                let total = priority_w + other_w;
                if total > self.max_draw_w {
                    let scale = self.max_draw_w / total;
                    (priority_w * scale, other_w * scale)
                } else {
                    (priority_w, other_w)
                }
            }
            ArbitrationPolicy::PriorityFirst => {
                let priority_w = priority_w.min(self.max_draw_w);
                (priority_w, other_w.min(self.max_draw_w - priority_w))
            }
        };

        match self.priority {
            HeaterChannel::Effusion => (priority_w, other_w),
            HeaterChannel::Substrate => (other_w, priority_w),
        }
    }

    fn emit(&self, tick: u64, time: f64, sink: &mut dyn TelemetrySink) {
        let d = &self.last;
        sink.emit(
            self.id().as_str(),
            tick,
            time,
            &[
                ("requested_w", d.requested_w()),
                ("received_w", d.received_w()),
                ("effusion_requested_w", d.effusion_requested_w),
                ("effusion_received_w", d.effusion_received_w),
                ("substrate_requested_w", d.substrate_requested_w),
                ("substrate_received_w", d.substrate_received_w),
            ],
        );
    }
}

impl Subsystem for HeaterBank {
    type State = HeaterDelivery;

    fn id(&self) -> SubsystemId {
        SubsystemId::HeaterBank
    }

    fn get_state(&self) -> Self::State {
        self.last
    }
}

impl BusLoad for HeaterBank {
    /// Draws both channels from the bus, priority channel first, then
    /// integrates each actuator with what it was granted.
    fn tick(&mut self, ctx: &TickContext, bus: &mut PowerBus, sink: &mut dyn TelemetrySink) {
        let (effusion_req, substrate_req) = self.arbitrate();

        let (effusion_got, substrate_got) = match self.priority {
            HeaterChannel::Effusion => {
                let e = bus.draw_power(effusion_req, ctx);
                (e, bus.draw_power(substrate_req, ctx))
            }
            HeaterChannel::Substrate => {
                let s = bus.draw_power(substrate_req, ctx);
                (bus.draw_power(effusion_req, ctx), s)
            }
        };

        if effusion_got + substrate_got + 1e-9 < effusion_req + substrate_req {
            debug!(
                "HeaterBank tick {} short: granted {:.3} of {:.3} W",
                ctx.tick_index,
                effusion_got + substrate_got,
                effusion_req + substrate_req
            );
        }

        self.last = HeaterDelivery {
            effusion_requested_w: effusion_req,
            effusion_received_w: effusion_got,
            substrate_requested_w: substrate_req,
            substrate_received_w: substrate_got,
        };

        self.effusion.apply_heat(effusion_got, ctx.dt);
        if let Some(substrate) = self.substrate.as_mut() {
            substrate.apply_heat(substrate_got, ctx.dt);
        }

        self.emit(ctx.tick_index, ctx.time, sink);
        self.effusion.tick(ctx, sink);
        if let Some(substrate) = self.substrate.as_mut() {
            substrate.tick(ctx, sink);
        }
    }
}
