//! Illumination sources for the solar array.

use crate::tick::TickContext;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

pub const EARTH_RADIUS_M: f64 = 6371e3;
/// The orbit period is fixed rather than derived from altitude.
pub const ORBIT_PERIOD_S: f64 = 94.0 * 60.0;
pub const DEFAULT_ALTITUDE_M: f64 = 400e3;

/// Scalar illumination per tick, 0 = eclipse, 1 = full sun.
pub trait IlluminationSource {
    fn illumination(&mut self, ctx: &TickContext) -> f64;
}

/// Fixed illumination, used when no orbit is modelled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantIllumination(pub f64);

impl Default for ConstantIllumination {
    fn default() -> Self {
        Self(1.0)
    }
}

impl IlluminationSource for ConstantIllumination {
    fn illumination(&mut self, _ctx: &TickContext) -> f64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbitConfig {
    pub altitude_m: f64,
    pub inclination_rad: f64,
    /// Sun direction in the reference plane.
    pub sun_theta_rad: f64,
}

impl Default for OrbitConfig {
    fn default() -> Self {
        Self {
            altitude_m: DEFAULT_ALTITUDE_M,
            inclination_rad: 0.0,
            sun_theta_rad: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrbitState {
    pub t_orbit_s: f64,
    pub theta_rad: f64,
    pub position_m: [f64; 3],
    pub velocity_mps: [f64; 3],
    pub in_sun: bool,
    pub solar_scale: f64,
}

/// Circular orbit with a cosine illumination profile gated by a
/// sun-side test on the ECI position.
#[derive(Debug, Clone)]
pub struct OrbitModel {
    config: OrbitConfig,
    radius_m: f64,
    mean_motion_rad_s: f64,
}

impl OrbitModel {
    pub fn new(config: OrbitConfig) -> Self {
        Self {
            config,
            radius_m: EARTH_RADIUS_M + config.altitude_m,
            mean_motion_rad_s: TAU / ORBIT_PERIOD_S,
        }
    }

    pub fn period_s(&self) -> f64 {
        ORBIT_PERIOD_S
    }

    pub fn state_at(&self, t_s: f64) -> OrbitState {
        let theta = (self.mean_motion_rad_s * t_s).rem_euclid(TAU);
        let (st, ct) = theta.sin_cos();
        let (si, ci) = self.config.inclination_rad.sin_cos();
        let r = self.radius_m;
        let v = r * self.mean_motion_rad_s;

        // Orbital plane rotated about x by the inclination.
        let position_m = [r * ct, r * st * ci, r * st * si];
        let velocity_mps = [-v * st, v * ct * ci, v * ct * si];

        let (ss, cs) = self.config.sun_theta_rad.sin_cos();
        let in_sun = position_m[0] * cs + position_m[1] * ss > 0.0;

        let phi = TAU * (t_s.rem_euclid(ORBIT_PERIOD_S) / ORBIT_PERIOD_S);
        let solar_scale = if in_sun { 0.5 * (1.0 + phi.cos()) } else { 0.0 };

        OrbitState {
            t_orbit_s: t_s,
            theta_rad: theta,
            position_m,
            velocity_mps,
            in_sun,
            solar_scale: solar_scale.clamp(0.0, 1.0),
        }
    }
}

impl Default for OrbitModel {
    fn default() -> Self {
        Self::new(OrbitConfig::default())
    }
}

impl IlluminationSource for OrbitModel {
    fn illumination(&mut self, ctx: &TickContext) -> f64 {
        self.state_at(ctx.time).solar_scale
    }
}
