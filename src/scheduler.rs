use crate::jobs::Job;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Change of active job between two consecutive `update` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobTransition {
    Unchanged,
    Entered(usize),
    Left(usize),
    Switched { from: usize, to: usize },
}

impl JobTransition {
    pub fn is_change(&self) -> bool {
        !matches!(self, JobTransition::Unchanged)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerStats {
    pub total_jobs: u32,
    pub activations: u32,
    pub aborted: u32,
    pub ticks_with_job: u64,
}

/// Ordered job table with first-match-wins selection.
///
/// Aborted jobs live in a side table parallel to `jobs` and are skipped
/// for the rest of the run, even if their window is still open.
#[derive(Debug)]
pub struct JobScheduler {
    jobs: Vec<Job>,
    aborted: Vec<bool>,
    active: Option<usize>,
    stats: SchedulerStats,
}

impl JobScheduler {
    pub fn new(jobs: Vec<Job>) -> Self {
        let aborted = vec![false; jobs.len()];
        let stats = SchedulerStats {
            total_jobs: jobs.len() as u32,
            ..SchedulerStats::default()
        };
        Self {
            jobs,
            aborted,
            active: None,
            stats,
        }
    }

    /// Earliest-indexed, non-aborted job whose window contains `tick`.
    pub fn select(&self, tick: u64) -> Option<usize> {
        self.jobs
            .iter()
            .enumerate()
            .position(|(i, job)| !self.aborted[i] && job.contains(tick))
    }

    /// Re-selects for `tick` and reports how the active job changed.
    pub fn update(&mut self, tick: u64) -> JobTransition {
        let next = self.select(tick);
        let transition = match (self.active, next) {
            (None, None) => JobTransition::Unchanged,
            (Some(a), Some(b)) if a == b => JobTransition::Unchanged,
            (None, Some(to)) => JobTransition::Entered(to),
            (Some(from), None) => JobTransition::Left(from),
            (Some(from), Some(to)) => JobTransition::Switched { from, to },
        };

        if let JobTransition::Entered(to) | JobTransition::Switched { to, .. } = transition {
            self.stats.activations += 1;
            let job = &self.jobs[to];
            info!(
                "Tick {}: job {} active (window {}..={}, flux {:e}, heater {:.1} W)",
                tick, to, job.start_tick, job.end_tick, job.target_flux, job.target_heater_power_w
            );
        }
        if let JobTransition::Left(from) = transition {
            info!("Tick {}: job {} window closed, idle", tick, from);
        }

        if next.is_some() {
            self.stats.ticks_with_job += 1;
        }
        self.active = next;
        transition
    }

    /// Permanently removes a job from selection. Returns `false` if it was
    /// already aborted or the index is unknown.
    pub fn mark_aborted(&mut self, index: usize) -> bool {
        match self.aborted.get_mut(index) {
            Some(flag) if !*flag => {
                *flag = true;
                self.stats.aborted += 1;
                if self.active == Some(index) {
                    self.active = None;
                }
                warn!("Job {} aborted", index);
                true
            }
            Some(_) => false,
            None => {
                warn!("Cannot abort unknown job {}", index);
                false
            }
        }
    }

    pub fn is_aborted(&self, index: usize) -> bool {
        self.aborted.get(index).copied().unwrap_or(false)
    }

    pub fn active(&self) -> Option<usize> {
        self.active
    }

    pub fn active_job(&self) -> Option<&Job> {
        self.active.map(|i| &self.jobs[i])
    }

    pub fn job(&self, index: usize) -> Option<&Job> {
        self.jobs.get(index)
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn aborted_indices(&self) -> Vec<usize> {
        self.aborted
            .iter()
            .enumerate()
            .filter_map(|(i, &a)| a.then_some(i))
            .collect()
    }

    pub fn get_stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_job(start: u64, end: u64) -> Job {
        Job::new(start, end, 1.0e14, 150.0).unwrap()
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = JobScheduler::new(vec![create_test_job(0, 5)]);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.active(), None);
        assert_eq!(scheduler.get_stats().total_jobs, 1);
    }

    #[test]
    fn test_empty_schedule_is_always_idle() {
        let mut scheduler = JobScheduler::default();
        for tick in 0..10 {
            assert_eq!(scheduler.update(tick), JobTransition::Unchanged);
        }
        assert_eq!(scheduler.active(), None);
    }

    #[test]
    fn test_overlapping_windows_prefer_lower_index() {
        let mut scheduler = JobScheduler::new(vec![create_test_job(0, 10), create_test_job(5, 15)]);

        for tick in 0..=10 {
            scheduler.update(tick);
            assert_eq!(scheduler.active(), Some(0), "tick {}", tick);
        }
        assert_eq!(scheduler.update(11), JobTransition::Switched { from: 0, to: 1 });
        for tick in 12..=15 {
            scheduler.update(tick);
            assert_eq!(scheduler.active(), Some(1));
        }
        assert_eq!(scheduler.update(16), JobTransition::Left(1));
    }

    #[test]
    fn test_abort_falls_through_to_next_job() {
        let mut scheduler = JobScheduler::new(vec![create_test_job(0, 10), create_test_job(5, 15)]);
        for tick in 0..=6 {
            scheduler.update(tick);
        }
        assert!(scheduler.mark_aborted(0));
        assert_eq!(scheduler.active(), None);
        assert_eq!(scheduler.update(7), JobTransition::Entered(1));
    }

    #[test]
    fn test_abort_is_idempotent_and_permanent() {
        let mut scheduler = JobScheduler::new(vec![create_test_job(0, 10)]);
        scheduler.update(0);
        assert!(scheduler.mark_aborted(0));
        assert!(!scheduler.mark_aborted(0));
        assert!(!scheduler.mark_aborted(7));
        assert_eq!(scheduler.get_stats().aborted, 1);

        for tick in 0..=10 {
            scheduler.update(tick);
            assert_eq!(scheduler.active(), None);
        }
        assert_eq!(scheduler.aborted_indices(), vec![0]);
    }

    #[test]
    fn test_activation_count() {
        let mut scheduler = JobScheduler::new(vec![create_test_job(2, 3), create_test_job(6, 6)]);
        let transitions: Vec<_> = (0..8).map(|t| scheduler.update(t)).filter(JobTransition::is_change).collect();
        assert_eq!(
            transitions,
            vec![
                JobTransition::Entered(0),
                JobTransition::Left(0),
                JobTransition::Entered(1),
                JobTransition::Left(1),
            ]
        );
        assert_eq!(scheduler.get_stats().activations, 2);
        assert_eq!(scheduler.get_stats().ticks_with_job, 3);
    }
}
