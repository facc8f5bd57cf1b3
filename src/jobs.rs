use crate::subsystems::ThermalConstants;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Smallest flux ever handed to the solver, in cm^-2 s^-1. Zero is not a legal parameter.
pub const FLUX_FLOOR_CM2S: f64 = 1.0e8;

const FLUX_LOW_CM2S: f64 = 5.0e13;
const FLUX_HIGH_CM2S: f64 = 1.0e14;
const POWER_AT_LOW_W: f64 = 120.0;
const POWER_AT_HIGH_W: f64 = 180.0;
const MAX_MAPPED_POWER_W: f64 = 200.0;

/// Heater power needed to hold the cell at a wafer flux.
///
/// Linear between the two design points, flat outside them. No beam, no heater.
pub fn flux_to_heater_power(flux_cm2s: f64) -> f64 {
    if !flux_cm2s.is_finite() || flux_cm2s <= 0.0 {
        return 0.0;
    }
    let flux = flux_cm2s.clamp(FLUX_LOW_CM2S, FLUX_HIGH_CM2S);
    let scale = (flux - FLUX_LOW_CM2S) / (FLUX_HIGH_CM2S - FLUX_LOW_CM2S);
    (POWER_AT_LOW_W + scale * (POWER_AT_HIGH_W - POWER_AT_LOW_W)).clamp(0.0, MAX_MAPPED_POWER_W)
}

/// Flux value safe to send to the solver.
pub fn floored_flux(flux_cm2s: f64) -> f64 {
    if flux_cm2s.is_finite() && flux_cm2s > FLUX_FLOOR_CM2S {
        flux_cm2s
    } else {
        FLUX_FLOOR_CM2S
    }
}

/// One deposition job. Window bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub start_tick: u64,
    pub end_tick: u64,
    pub target_flux: f64,
    pub target_heater_power_w: f64,
    /// Explicit temperature target; `None` means the actuator's steady state.
    pub target_temperature_k: Option<f64>,
}

impl Job {
    pub fn new(start_tick: u64, end_tick: u64, target_flux: f64, target_heater_power_w: f64) -> Result<Self, &'static str> {
        if start_tick > end_tick {
            return Err("start_tick after end_tick");
        }
        if !target_flux.is_finite() || target_flux <= 0.0 {
            return Err("target_flux must be positive");
        }
        if !target_heater_power_w.is_finite() || target_heater_power_w < 0.0 {
            return Err("target_heater_power_w must be non-negative");
        }
        Ok(Self {
            start_tick,
            end_tick,
            target_flux,
            target_heater_power_w,
            target_temperature_k: None,
        })
    }

    /// Job whose heater power comes from the flux mapping.
    pub fn from_flux(start_tick: u64, end_tick: u64, target_flux: f64) -> Result<Self, &'static str> {
        Self::new(start_tick, end_tick, target_flux, flux_to_heater_power(target_flux))
    }

    pub fn with_target_temperature(mut self, kelvin: f64) -> Result<Self, &'static str> {
        if !kelvin.is_finite() || kelvin <= 0.0 {
            return Err("target_temperature_k must be positive");
        }
        self.target_temperature_k = Some(kelvin);
        Ok(self)
    }

    pub fn contains(&self, tick: u64) -> bool {
        (self.start_tick..=self.end_tick).contains(&tick)
    }

    pub fn target_temperature_k(&self, constants: &ThermalConstants) -> f64 {
        self.target_temperature_k
            .unwrap_or_else(|| constants.steady_state_k(self.target_heater_power_w))
    }
}

#[derive(Debug, Error)]
pub enum JobLoadError {
    #[error("cannot open job table {path}: {source}")]
    Open { path: PathBuf, source: csv::Error },
    #[error("job table header unreadable: {0}")]
    Header(#[source] csv::Error),
}

#[derive(Debug, Deserialize)]
struct JobRow {
    start_tick: i64,
    end_tick: i64,
    target_flux: f64,
    #[serde(default)]
    target_heater_power_w: Option<f64>,
    #[serde(default)]
    target_temperature_k: Option<f64>,
}

impl JobRow {
    fn into_job(self) -> Result<Job, &'static str> {
        let start = u64::try_from(self.start_tick).map_err(|_| "negative start_tick")?;
        let end = u64::try_from(self.end_tick).map_err(|_| "negative end_tick")?;
        let job = match self.target_heater_power_w {
            Some(power) => Job::new(start, end, self.target_flux, power)?,
            None => Job::from_flux(start, end, self.target_flux)?,
        };
        match self.target_temperature_k {
            Some(kelvin) => job.with_target_temperature(kelvin),
            None => Ok(job),
        }
    }
}

/// Reads a job table:
/// `start_tick,end_tick,target_flux[,target_heater_power_w][,target_temperature_k]`.
///
/// Lines starting with `#` are comments. Rows that fail to parse or
/// validate are skipped with a warning; only an unreadable header fails.
pub fn load_jobs<R: Read>(reader: R) -> Result<Vec<Job>, JobLoadError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .flexible(true)
        .from_reader(reader);
    csv_reader.headers().map_err(JobLoadError::Header)?;

    let mut jobs = Vec::new();
    for (line, row) in csv_reader.deserialize::<JobRow>().enumerate() {
        let row_number = line + 2;
        match row.map_err(|e| e.to_string()).and_then(|r| r.into_job().map_err(str::to_string)) {
            Ok(job) => jobs.push(job),
            Err(reason) => warn!("Skipping job table row {}: {}", row_number, reason),
        }
    }
    Ok(jobs)
}

pub fn load_jobs_from_path(path: &Path) -> Result<Vec<Job>, JobLoadError> {
    let file = std::fs::File::open(path).map_err(|e| JobLoadError::Open {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    let jobs = load_jobs(file)?;
    info!("Loaded {} jobs from {}", jobs.len(), path.display());
    Ok(jobs)
}

/// Like [`load_jobs_from_path`], but a missing or unreadable table means no jobs.
pub fn load_or_empty(path: &Path) -> Vec<Job> {
    match load_jobs_from_path(path) {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!("{}; running without jobs", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flux_mapping_design_points() {
        assert_eq!(flux_to_heater_power(5.0e13), 120.0);
        assert_eq!(flux_to_heater_power(1.0e14), 180.0);
        assert!((flux_to_heater_power(7.5e13) - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_flux_mapping_clamps_and_rejects() {
        assert_eq!(flux_to_heater_power(1.0e10), 120.0);
        assert_eq!(flux_to_heater_power(1.0e20), 180.0);
        assert_eq!(flux_to_heater_power(0.0), 0.0);
        assert_eq!(flux_to_heater_power(-5.0), 0.0);
        assert_eq!(flux_to_heater_power(f64::NAN), 0.0);
    }

    #[test]
    fn test_floored_flux() {
        assert_eq!(floored_flux(0.0), FLUX_FLOOR_CM2S);
        assert_eq!(floored_flux(f64::INFINITY), FLUX_FLOOR_CM2S);
        assert_eq!(floored_flux(7.0e13), 7.0e13);
    }

    #[test]
    fn test_job_validation() {
        assert!(Job::new(5, 4, 1e13, 100.0).is_err());
        assert!(Job::new(0, 4, 0.0, 100.0).is_err());
        assert!(Job::new(0, 4, 1e13, -1.0).is_err());
        let job = Job::new(3, 3, 1e13, 0.0).unwrap();
        assert!(job.contains(3));
        assert!(!job.contains(2));
        assert!(!job.contains(4));
    }

    #[test]
    fn test_default_target_temperature_is_steady_state() {
        let constants = ThermalConstants::default();
        let job = Job::new(0, 10, 1e14, 150.0).unwrap();
        assert!((job.target_temperature_k(&constants) - 400.0).abs() < 1e-9);

        let job = job.with_target_temperature(350.0).unwrap();
        assert_eq!(job.target_temperature_k(&constants), 350.0);
    }

    #[test]
    fn test_load_skips_bad_rows() {
        let table = "\
# schedule for run 7
start_tick, end_tick, target_flux, target_heater_power_w, target_temperature_k
0, 10, 7.5e13
20, 30, 1e14, 160
40, 35, 1e14
-1, 5, 1e14
50, 60, not_a_number
70, 80, 1e14, , 420
";
        let jobs = load_jobs(table.as_bytes()).unwrap();
        assert_eq!(jobs.len(), 3);
        assert!((jobs[0].target_heater_power_w - 150.0).abs() < 1e-9);
        assert_eq!(jobs[1].target_heater_power_w, 160.0);
        assert_eq!(jobs[2].start_tick, 70);
        assert_eq!(jobs[2].target_heater_power_w, 180.0);
        assert_eq!(jobs[2].target_temperature_k, Some(420.0));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let jobs = load_or_empty(Path::new("/nonexistent/forgebus/jobs.csv"));
        assert!(jobs.is_empty());
    }
}
