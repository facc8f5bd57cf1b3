use super::{BusLoad, PowerBus, Subsystem, SubsystemId};
use crate::telemetry::TelemetrySink;
use crate::tick::TickContext;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const DEFAULT_GRID_N: usize = 32;
pub const MONITOR_POWER_W: f64 = 5.0;
/// Wafer radius as a fraction of the grid width; keeps the disc inside the edge.
const WAFER_RADIUS_FRACTION: f64 = 0.475;

#[derive(Debug, Clone, Default)]
struct JobDose {
    dose: Vec<f64>,
    had_growth: bool,
    last_t_end_s: f64,
    aborted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrowthState {
    pub active_job: Option<usize>,
    pub beam_on: bool,
    pub flux_cm2s: f64,
    pub jobs_with_growth: usize,
    pub last_received_w: f64,
}

#[derive(Debug, Serialize)]
struct DoseRow {
    job_index: usize,
    wafer_index: usize,
    row: usize,
    col: usize,
    t_end_s: f64,
    dose_arb: f64,
    aborted: u8,
}

/// Deposition dose instrument. Integrates `flux * dt` over a circular
/// wafer mask for whichever job has the beam on.
#[derive(Debug, Clone)]
pub struct GrowthMonitor {
    grid_n: usize,
    mask: Vec<bool>,
    jobs: Vec<JobDose>,
    active_job: Option<usize>,
    beam_on: bool,
    flux_cm2s: f64,
    power_w: f64,
    last_received_w: f64,
    output: Option<PathBuf>,
}

fn wafer_mask(grid_n: usize) -> Vec<bool> {
    let centre = 0.5 * (grid_n as f64 - 1.0);
    let radius = WAFER_RADIUS_FRACTION * grid_n as f64;
    (0..grid_n * grid_n)
        .map(|idx| {
            let dy = (idx / grid_n) as f64 - centre;
            let dx = (idx % grid_n) as f64 - centre;
            dx.hypot(dy) <= radius
        })
        .collect()
}

impl GrowthMonitor {
    pub fn new(grid_n: usize) -> Self {
        let grid_n = if grid_n == 0 {
            warn!("GrowthMonitor grid size 0 invalid, using {}", DEFAULT_GRID_N);
            DEFAULT_GRID_N
        } else {
            grid_n
        };

        Self {
            grid_n,
            mask: wafer_mask(grid_n),
            jobs: Vec::new(),
            active_job: None,
            beam_on: false,
            flux_cm2s: 0.0,
            power_w: MONITOR_POWER_W,
            last_received_w: 0.0,
            output: None,
        }
    }

    /// Directs the shutdown dose table to `dir/GrowthMonitor_<run_id>.csv`.
    pub fn with_output(mut self, dir: &Path, run_id: &str) -> Self {
        self.output = Some(dir.join(format!("GrowthMonitor_{}.csv", run_id)));
        self
    }

    pub fn grid_n(&self) -> usize {
        self.grid_n
    }

    pub fn wafer_cells(&self) -> usize {
        self.mask.iter().filter(|&&inside| inside).count()
    }

    /// Resets dose storage for `n` jobs.
    pub fn set_num_jobs(&mut self, n: usize) {
        let cells = self.grid_n * self.grid_n;
        self.jobs = (0..n)
            .map(|_| JobDose {
                dose: vec![0.0; cells],
                ..JobDose::default()
            })
            .collect();
    }

    pub fn set_beam_state(&mut self, job: Option<usize>, beam_on: bool, flux_cm2s: f64) {
        self.active_job = job;
        self.beam_on = beam_on;
        self.flux_cm2s = flux_cm2s;
    }

    pub fn mark_job_aborted(&mut self, job: usize) {
        if let Some(entry) = self.jobs.get_mut(job) {
            entry.aborted = true;
        }
    }

    pub fn had_growth(&self, job: usize) -> bool {
        self.jobs.get(job).is_some_and(|j| j.had_growth)
    }

    /// Accumulated dose of one cell, or `None` outside the table.
    pub fn dose_at(&self, job: usize, row: usize, col: usize) -> Option<f64> {
        if row >= self.grid_n || col >= self.grid_n {
            return None;
        }
        self.jobs.get(job).map(|j| j.dose[row * self.grid_n + col])
    }

    pub fn is_wafer_cell(&self, row: usize, col: usize) -> bool {
        row < self.grid_n && col < self.grid_n && self.mask[row * self.grid_n + col]
    }

    fn integrate(&mut self, job: usize, dt: f64, t_now: f64) {
        let increment = self.flux_cm2s * dt;
        let Some(entry) = self.jobs.get_mut(job) else {
            return;
        };
        for (cell, inside) in entry.dose.iter_mut().zip(self.mask.iter()) {
            if *inside {
                *cell += increment;
            }
        }
        entry.had_growth = true;
        entry.last_t_end_s = t_now;
    }

    /// Writes one row per wafer cell for every job that saw growth.
    pub fn write_csv(&self, path: &Path) -> Result<usize, csv::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        let mut rows = 0;

        for (job_index, job) in self.jobs.iter().enumerate().filter(|(_, j)| j.had_growth) {
            for (idx, dose) in job.dose.iter().enumerate() {
                if !self.mask[idx] {
                    continue;
                }
                writer.serialize(DoseRow {
                    job_index,
                    wafer_index: 0,
                    row: idx / self.grid_n,
                    col: idx % self.grid_n,
                    t_end_s: job.last_t_end_s,
                    dose_arb: *dose,
                    aborted: u8::from(job.aborted),
                })?;
                rows += 1;
            }
        }

        writer.flush()?;
        Ok(rows)
    }
}

impl Default for GrowthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_GRID_N)
    }
}

impl Subsystem for GrowthMonitor {
    type State = GrowthState;

    fn id(&self) -> SubsystemId {
        SubsystemId::GrowthMonitor
    }

    fn get_state(&self) -> Self::State {
        GrowthState {
            active_job: self.active_job,
            beam_on: self.beam_on,
            flux_cm2s: self.flux_cm2s,
            jobs_with_growth: self.jobs.iter().filter(|j| j.had_growth).count(),
            last_received_w: self.last_received_w,
        }
    }

    fn shutdown(&mut self, _sink: &mut dyn TelemetrySink) {
        let Some(path) = self.output.as_ref() else {
            return;
        };
        match self.write_csv(path) {
            Ok(rows) => info!("GrowthMonitor wrote {} dose rows to {}", rows, path.display()),
            Err(e) => error!("GrowthMonitor failed to write {}: {}", path.display(), e),
        }
    }
}

impl BusLoad for GrowthMonitor {
    fn tick(&mut self, ctx: &TickContext, bus: &mut PowerBus, sink: &mut dyn TelemetrySink) {
        self.last_received_w = 0.0;
        let growing = match self.active_job {
            Some(job) => {
                self.beam_on && self.flux_cm2s.is_finite() && self.flux_cm2s > 0.0 && job < self.jobs.len()
            }
            None => false,
        };

        if growing {
            self.last_received_w = bus.draw_power(self.power_w, ctx);
            if let Some(job) = self.active_job {
                self.integrate(job, ctx.dt, ctx.time);
            }
        }

        sink.emit(
            self.id().as_str(),
            ctx.tick_index,
            ctx.time,
            &[
                ("active_job", self.active_job.map_or(-1.0, |j| j as f64)),
                ("beam_on", if growing { 1.0 } else { 0.0 }),
                ("flux_cm2s", self.flux_cm2s),
                ("power_w", self.last_received_w),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_is_centred_disc() {
        let monitor = GrowthMonitor::new(32);
        assert!(monitor.is_wafer_cell(16, 16));
        assert!(!monitor.is_wafer_cell(0, 0));
        assert!(!monitor.is_wafer_cell(31, 31));
        // Roughly pi * r^2 with r = 15.2 cells.
        let cells = monitor.wafer_cells();
        assert!(cells > 650 && cells < 800, "unexpected wafer cell count {}", cells);
    }

    #[test]
    fn test_zero_grid_falls_back_to_default() {
        let monitor = GrowthMonitor::new(0);
        assert_eq!(monitor.grid_n(), DEFAULT_GRID_N);
    }

    #[test]
    fn test_integrate_only_inside_mask() {
        let mut monitor = GrowthMonitor::new(8);
        monitor.set_num_jobs(1);
        monitor.set_beam_state(Some(0), true, 1e14);
        monitor.integrate(0, 2.0, 2.0);

        assert!(monitor.had_growth(0));
        assert_eq!(monitor.dose_at(0, 4, 4), Some(2e14));
        assert_eq!(monitor.dose_at(0, 0, 0), Some(0.0));
        assert_eq!(monitor.dose_at(0, 8, 0), None);
    }
}
