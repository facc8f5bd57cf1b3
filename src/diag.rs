//! Solver diagnostic files read back once per tick.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

pub const K_BOLTZ: f64 = 1.380649e-23;
pub const WAKE_DIAG_FILE: &str = "wake_diag.csv";
pub const SHIELD_DIAG_FILE: &str = "shield_collide.csv";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WakeDiag {
    pub step: f64,
    pub time_s: f64,
    pub temp_k: f64,
    pub density_m3: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ShieldDiag {
    pub shield_hits: f64,
    pub reemit_total: f64,
}

/// Fields of the last non-empty data row; the first line is a header.
fn last_row(path: &Path) -> Option<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| debug!("Diagnostics {} unavailable: {}", path.display(), e))
        .ok()?;

    let mut last = None;
    for record in reader.records() {
        match record {
            Ok(r) if r.iter().any(|f| !f.is_empty()) => last = Some(r),
            Ok(_) => {}
            Err(e) => debug!("Skipping unreadable row in {}: {}", path.display(), e),
        }
    }
    last.map(|r| r.iter().map(str::to_string).collect())
}

/// `step,time,temp_K,density_m3`. `None` when missing, empty or malformed.
pub fn read_wake_diag(path: &Path) -> Option<WakeDiag> {
    let row = last_row(path)?;
    if row.len() < 4 {
        return None;
    }
    let num = |i: usize| row[i].parse::<f64>().ok();
    Some(WakeDiag {
        step: num(0)?,
        time_s: num(1)?,
        temp_k: num(2)?,
        density_m3: num(3)?,
    })
}

/// `step,time,shield_hits,reemitted_total`. Unparseable counters read as zero.
pub fn read_shield_diag(path: &Path) -> Option<ShieldDiag> {
    let row = last_row(path)?;
    if row.len() < 3 {
        return None;
    }
    let num = |i: usize| row.get(i).and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
    Some(ShieldDiag {
        shield_hits: num(2),
        reemit_total: num(3),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WakeReading {
    pub temp_k: f64,
    pub density_m3: f64,
    /// Density relative to the first valid reading.
    pub n_ratio: f64,
    pub pressure_pa: f64,
}

/// Carries the last valid wake values forward across missing or
/// non-finite readings and remembers the free-stream density.
#[derive(Debug, Clone, Default)]
pub struct DiagTracker {
    last_temp_k: f64,
    last_density_m3: f64,
    n_inf_m3: f64,
}

impl DiagTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_inf_m3(&self) -> f64 {
        self.n_inf_m3
    }

    pub fn update(&mut self, diag: Option<WakeDiag>) -> WakeReading {
        if let Some(d) = diag {
            if d.temp_k.is_finite() {
                self.last_temp_k = d.temp_k;
            }
            if d.density_m3.is_finite() {
                self.last_density_m3 = d.density_m3;
            }
        }

        let temp_k = self.last_temp_k;
        let density_m3 = self.last_density_m3;
        if self.n_inf_m3 <= 0.0 && density_m3 > 0.0 {
            self.n_inf_m3 = density_m3;
        }

        WakeReading {
            temp_k,
            density_m3,
            n_ratio: if self.n_inf_m3 > 0.0 && density_m3 >= 0.0 { density_m3 / self.n_inf_m3 } else { 0.0 },
            pressure_pa: if temp_k > 0.0 && density_m3 > 0.0 { K_BOLTZ * temp_k * density_m3 } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_reads_last_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WAKE_DIAG_FILE);
        fs::write(&path, "step,time,temp_K,density_m3\n100,1e-3,250,1e18\n200,2e-3,260,2e18\n\n").unwrap();

        let diag = read_wake_diag(&path).unwrap();
        assert_eq!(diag.step, 200.0);
        assert_eq!(diag.temp_k, 260.0);
        assert_eq!(diag.density_m3, 2e18);
    }

    #[test]
    fn test_missing_or_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WAKE_DIAG_FILE);
        assert!(read_wake_diag(&path).is_none());

        fs::write(&path, "step,time,temp_K,density_m3\n").unwrap();
        assert!(read_wake_diag(&path).is_none());
    }

    #[test]
    fn test_shield_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SHIELD_DIAG_FILE);
        fs::write(&path, "step,time,shield_hits,reemitted_total\n10,0.1,42,7\n").unwrap();
        let shield = read_shield_diag(&path).unwrap();
        assert_eq!(shield.shield_hits, 42.0);
        assert_eq!(shield.reemit_total, 7.0);
    }

    #[test]
    fn test_tracker_carries_forward() {
        let mut tracker = DiagTracker::new();
        let first = tracker.update(Some(WakeDiag {
            step: 1.0,
            time_s: 0.0,
            temp_k: 300.0,
            density_m3: 1e18,
        }));
        assert_eq!(first.n_ratio, 1.0);
        assert!((first.pressure_pa - K_BOLTZ * 300.0 * 1e18).abs() < 1e-12);

        let second = tracker.update(Some(WakeDiag {
            step: 2.0,
            time_s: 0.0,
            temp_k: f64::NAN,
            density_m3: 5e17,
        }));
        assert_eq!(second.temp_k, 300.0);
        assert_eq!(second.n_ratio, 0.5);

        let third = tracker.update(None);
        assert_eq!(third, second);
    }
}
