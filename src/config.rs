use crate::compliance::ComplianceConfig;
use crate::orbit::OrbitConfig;
use crate::subsystems::battery::{DEFAULT_CAPACITY_WH, DEFAULT_MAX_CHARGE_RATE_W, DEFAULT_MAX_DISCHARGE_RATE_W};
use crate::subsystems::heater::DEFAULT_MAX_DRAW_W;
use crate::subsystems::solar::{DEFAULT_BASE_INPUT_W, DEFAULT_EFFICIENCY};
use crate::subsystems::{ArbitrationPolicy, HeaterChannel, ThermalConstants};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_NTICKS: u64 = 500;
pub const DEFAULT_DT_S: f64 = 60.0;
pub const DEFAULT_COUPLE_EVERY: u64 = 10;
pub const DEFAULT_SOLVER_BLOCK: u32 = 200;
pub const DEFAULT_WAKE_DECK: &str = "in.wake_harness";
pub const DEFAULT_INPUT_DIR: &str = "input";
pub const DEFAULT_LOG_DIR: &str = "data/raw";
pub const DEFAULT_RUN_ID: &str = "norunid";
pub const DEFAULT_HOUSEKEEPING_W: f64 = 50.0;
pub const MAX_GROUPS: usize = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown run mode '{0}' (expected power, wake, dual or legacy)")]
    UnknownMode(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Power/thermal harness only, no solver.
    Power,
    Wake,
    /// Alias of `Wake`.
    #[default]
    Dual,
    /// Alias of `Wake`.
    Legacy,
}

impl RunMode {
    pub fn uses_solver(self) -> bool {
        !matches!(self, RunMode::Power)
    }
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "power" => Ok(RunMode::Power),
            "wake" => Ok(RunMode::Wake),
            "dual" => Ok(RunMode::Dual),
            "legacy" => Ok(RunMode::Legacy),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub capacity_wh: f64,
    pub max_charge_rate_w: f64,
    pub max_discharge_rate_w: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_wh: DEFAULT_CAPACITY_WH,
            max_charge_rate_w: DEFAULT_MAX_CHARGE_RATE_W,
            max_discharge_rate_w: DEFAULT_MAX_DISCHARGE_RATE_W,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolarConfig {
    pub efficiency: f64,
    pub base_input_w: f64,
    /// Fixed illumination instead of the orbit model.
    pub constant_illumination: Option<f64>,
}

impl Default for SolarConfig {
    fn default() -> Self {
        Self {
            efficiency: DEFAULT_EFFICIENCY,
            base_input_w: DEFAULT_BASE_INPUT_W,
            constant_illumination: None,
        }
    }
}

/// Everything a run needs. Every field has a documented default, so a
/// partial JSON file is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub mode: RunMode,
    pub nticks: u64,
    pub dt_s: f64,
    pub couple_every: u64,
    pub solver_block: u32,
    pub wake_deck: String,
    pub input_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub run_id: Option<String>,
    pub jobs_file: Option<PathBuf>,
    pub heater_max_draw_w: f64,
    pub housekeeping_w: f64,
    /// Heater demand while no job is active.
    pub idle_heater_w: f64,
    pub substrate_demand_w: f64,
    pub battery: BatteryConfig,
    pub solar: SolarConfig,
    pub effusion: ThermalConstants,
    /// Fits a substrate heater channel when present.
    pub substrate: Option<ThermalConstants>,
    pub compliance: ComplianceConfig,
    pub arbitration: ArbitrationPolicy,
    pub priority: HeaterChannel,
    pub orbit: OrbitConfig,
    pub growth_grid: usize,
    pub groups: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            nticks: DEFAULT_NTICKS,
            dt_s: DEFAULT_DT_S,
            couple_every: DEFAULT_COUPLE_EVERY,
            solver_block: DEFAULT_SOLVER_BLOCK,
            wake_deck: DEFAULT_WAKE_DECK.to_string(),
            input_dir: PathBuf::from(DEFAULT_INPUT_DIR),
            log_dir: None,
            run_id: None,
            jobs_file: None,
            heater_max_draw_w: DEFAULT_MAX_DRAW_W,
            housekeeping_w: DEFAULT_HOUSEKEEPING_W,
            idle_heater_w: 0.0,
            substrate_demand_w: 0.0,
            battery: BatteryConfig::default(),
            solar: SolarConfig::default(),
            effusion: ThermalConstants::default(),
            substrate: None,
            compliance: ComplianceConfig::default(),
            arbitration: ArbitrationPolicy::default(),
            priority: HeaterChannel::default(),
            orbit: OrbitConfig::default(),
            growth_grid: crate::subsystems::growth::DEFAULT_GRID_N,
            groups: 1,
        }
    }
}

fn positive_f64(value: f64, default: f64, what: &str) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        warn!("Config {} = {} invalid, using {}", what, value, default);
        default
    }
}

fn non_negative_f64(value: f64, default: f64, what: &str) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        warn!("Config {} = {} invalid, using {}", what, value, default);
        default
    }
}

fn positive_u64(value: u64, default: u64, what: &str) -> u64 {
    if value == 0 {
        warn!("Config {} = 0 invalid, using {}", what, default);
        default
    } else {
        value
    }
}

impl HarnessConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Replaces every invalid value with its default, one warning per substitution.
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        let solver_block = if self.solver_block == 0 {
            warn!("Config solver_block = 0 invalid, using {}", DEFAULT_SOLVER_BLOCK);
            DEFAULT_SOLVER_BLOCK
        } else {
            self.solver_block
        };
        let groups = if (1..=MAX_GROUPS).contains(&self.groups) {
            self.groups
        } else {
            warn!("Config groups = {} invalid, using 1", self.groups);
            1
        };
        let growth_grid = if self.growth_grid == 0 {
            warn!("Config growth_grid = 0 invalid, using {}", defaults.growth_grid);
            defaults.growth_grid
        } else {
            self.growth_grid
        };
        let wake_deck = if self.wake_deck.trim().is_empty() {
            warn!("Config wake_deck empty, using {}", DEFAULT_WAKE_DECK);
            DEFAULT_WAKE_DECK.to_string()
        } else {
            self.wake_deck
        };

        Self {
            mode: self.mode,
            nticks: positive_u64(self.nticks, DEFAULT_NTICKS, "nticks"),
            dt_s: positive_f64(self.dt_s, DEFAULT_DT_S, "dt_s"),
            couple_every: positive_u64(self.couple_every, DEFAULT_COUPLE_EVERY, "couple_every"),
            solver_block,
            wake_deck,
            input_dir: self.input_dir,
            log_dir: self.log_dir,
            run_id: self.run_id.filter(|id| !id.trim().is_empty()),
            jobs_file: self.jobs_file,
            heater_max_draw_w: positive_f64(self.heater_max_draw_w, DEFAULT_MAX_DRAW_W, "heater_max_draw_w"),
            housekeeping_w: non_negative_f64(self.housekeeping_w, DEFAULT_HOUSEKEEPING_W, "housekeeping_w"),
            idle_heater_w: non_negative_f64(self.idle_heater_w, 0.0, "idle_heater_w"),
            substrate_demand_w: non_negative_f64(self.substrate_demand_w, 0.0, "substrate_demand_w"),
            battery: BatteryConfig {
                capacity_wh: positive_f64(self.battery.capacity_wh, DEFAULT_CAPACITY_WH, "battery.capacity_wh"),
                max_charge_rate_w: positive_f64(
                    self.battery.max_charge_rate_w,
                    DEFAULT_MAX_CHARGE_RATE_W,
                    "battery.max_charge_rate_w",
                ),
                max_discharge_rate_w: positive_f64(
                    self.battery.max_discharge_rate_w,
                    DEFAULT_MAX_DISCHARGE_RATE_W,
                    "battery.max_discharge_rate_w",
                ),
            },
            solar: SolarConfig {
                efficiency: if self.solar.efficiency.is_finite() && (0.0..=1.0).contains(&self.solar.efficiency) {
                    self.solar.efficiency
                } else {
                    warn!("Config solar.efficiency = {} invalid, using {}", self.solar.efficiency, DEFAULT_EFFICIENCY);
                    DEFAULT_EFFICIENCY
                },
                base_input_w: non_negative_f64(self.solar.base_input_w, DEFAULT_BASE_INPUT_W, "solar.base_input_w"),
                constant_illumination: self.solar.constant_illumination,
            },
            effusion: self.effusion.sanitized(),
            substrate: self.substrate.map(ThermalConstants::sanitized),
            compliance: self.compliance.sanitized(),
            arbitration: self.arbitration,
            priority: self.priority,
            orbit: self.orbit,
            growth_grid,
            groups,
        }
    }

    pub fn run_id(&self) -> String {
        self.run_id_with(|key| std::env::var(key).ok())
    }

    fn run_id_with(&self, env: impl Fn(&str) -> Option<String>) -> String {
        self.run_id
            .clone()
            .or_else(|| env("RUN_ID").filter(|id| !id.is_empty()))
            .unwrap_or_else(|| DEFAULT_RUN_ID.to_string())
    }

    /// Explicit `log_dir`, else `$SF_LOG_DIR`, else `data/raw`; the run id is
    /// appended unless it is the placeholder.
    pub fn resolve_log_dir(&self) -> PathBuf {
        self.resolve_log_dir_with(|key| std::env::var(key).ok())
    }

    pub fn resolve_log_dir_with(&self, env: impl Fn(&str) -> Option<String>) -> PathBuf {
        let base = self
            .log_dir
            .clone()
            .or_else(|| env("SF_LOG_DIR").filter(|d| !d.is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));

        let run_id = self.run_id_with(&env);
        if run_id == DEFAULT_RUN_ID {
            base
        } else {
            base.join(run_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: HarnessConfig = serde_json::from_str(r#"{"mode": "power", "nticks": 20, "battery": {"capacity_wh": 500}}"#).unwrap();
        assert_eq!(config.mode, RunMode::Power);
        assert_eq!(config.nticks, 20);
        assert_eq!(config.battery.capacity_wh, 500.0);
        assert_eq!(config.battery.max_charge_rate_w, DEFAULT_MAX_CHARGE_RATE_W);
        assert_eq!(config.couple_every, DEFAULT_COUPLE_EVERY);
    }

    #[test]
    fn test_sanitized_replaces_invalid_values() {
        let config = HarnessConfig {
            nticks: 0,
            dt_s: -1.0,
            couple_every: 0,
            solver_block: 0,
            heater_max_draw_w: f64::NAN,
            groups: 7,
            ..HarnessConfig::default()
        }
        .sanitized();

        assert_eq!(config.nticks, DEFAULT_NTICKS);
        assert_eq!(config.dt_s, DEFAULT_DT_S);
        assert_eq!(config.couple_every, DEFAULT_COUPLE_EVERY);
        assert_eq!(config.solver_block, DEFAULT_SOLVER_BLOCK);
        assert_eq!(config.heater_max_draw_w, DEFAULT_MAX_DRAW_W);
        assert_eq!(config.groups, 1);
    }

    #[test]
    fn test_mode_aliases() {
        assert_eq!("DUAL".parse::<RunMode>().unwrap(), RunMode::Dual);
        assert!(RunMode::Legacy.uses_solver());
        assert!(!RunMode::Power.uses_solver());
        assert!("fusion".parse::<RunMode>().is_err());
    }

    #[test]
    fn test_log_dir_resolution() {
        let config = HarnessConfig::default();
        assert_eq!(config.resolve_log_dir_with(no_env), PathBuf::from("data/raw"));

        let env = |key: &str| match key {
            "SF_LOG_DIR" => Some("/tmp/forge".to_string()),
            "RUN_ID" => Some("r42".to_string()),
            _ => None,
        };
        assert_eq!(config.resolve_log_dir_with(env), PathBuf::from("/tmp/forge/r42"));

        let config = HarnessConfig {
            log_dir: Some(PathBuf::from("logs")),
            run_id: Some("explicit".to_string()),
            ..HarnessConfig::default()
        };
        assert_eq!(config.resolve_log_dir_with(env), PathBuf::from("logs/explicit"));
    }

    #[test]
    fn test_missing_config_file() {
        let err = HarnessConfig::from_json_file(Path::new("/nonexistent/forgebus.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
