//! Coupling to the external rarefied-gas solver.
//!
//! The solver itself is a collaborator behind [`SolverBackend`]. The
//! [`WakeChamber`] proxy owns the stepping cadence, the parameter file and
//! the deferred "mark dirty, reload on next touch" protocol.

use crate::diag::{read_shield_diag, read_wake_diag, DiagTracker, SHIELD_DIAG_FILE, WAKE_DIAG_FILE};
use crate::telemetry::TelemetrySink;
use crate::tick::TickContext;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Solver steps per coupling point when the caller never supplies one.
pub const DEFAULT_BLOCK_STEPS: u32 = 1000;
pub const PARAMS_FILE: &str = "params.inc";

/// Fatal coupling failures. None of these are retried.
#[derive(Debug, Error)]
pub enum CouplingError {
    #[error("solver coupling used before init")]
    NotInitialized,
    #[error("solver {op} failed: {message}")]
    Backend { op: &'static str, message: String },
    #[error("cannot write solver parameters to {path}: {source}")]
    Params {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parameter {name} has non-finite value {value}")]
    InvalidParameter { name: String, value: f64 },
}

/// Raw command channel into a solver instance.
pub trait SolverBackend: Send {
    fn load_deck(&mut self, deck: &str, input_dir: &Path) -> Result<(), CouplingError>;
    fn command(&mut self, cmd: &str) -> Result<(), CouplingError>;
}

/// What the run loop needs from any external solver. All calls block.
pub trait SolverCoupling: Send {
    fn advance(&mut self, steps: u32) -> Result<(), CouplingError>;
    fn set_parameter(&mut self, name: &str, value: f64) -> Result<(), CouplingError>;
    fn mark_dirty_reload(&mut self, sink: &mut dyn TelemetrySink);
    /// Reloads from scratch if marked dirty, then advances `steps`.
    /// Returns whether anything happened.
    fn reload_if_dirty_else_advance(&mut self, steps: u32, sink: &mut dyn TelemetrySink) -> Result<bool, CouplingError>;
    fn tick(&mut self, _ctx: &TickContext, _sink: &mut dyn TelemetrySink) {}
    fn shutdown(&mut self, _sink: &mut dyn TelemetrySink) {}
}

/// Backend that records every command instead of running a solver.
/// Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingBackend {
    log: Arc<Mutex<Vec<String>>>,
    fail_on: Option<String>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any command starting with `prefix` fails.
    pub fn failing_on(prefix: &str) -> Self {
        Self {
            fail_on: Some(prefix.to_string()),
            ..Self::default()
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn record(&mut self, op: &'static str, entry: String) -> Result<(), CouplingError> {
        if self.fail_on.as_deref().is_some_and(|p| entry.starts_with(p)) {
            return Err(CouplingError::Backend {
                op,
                message: format!("injected failure on '{}'", entry),
            });
        }
        debug!("solver <- {}", entry);
        if let Ok(mut log) = self.log.lock() {
            log.push(entry);
        }
        Ok(())
    }
}

impl SolverBackend for RecordingBackend {
    fn load_deck(&mut self, deck: &str, input_dir: &Path) -> Result<(), CouplingError> {
        self.record("load_deck", format!("deck {}/{}", input_dir.display(), deck))
    }

    fn command(&mut self, cmd: &str) -> Result<(), CouplingError> {
        self.record("command", cmd.to_string())
    }
}

/// Stateful proxy for one wake solver instance.
#[derive(Debug)]
pub struct WakeChamber<B: SolverBackend> {
    backend: B,
    label: String,
    deck: String,
    input_dir: PathBuf,
    initialized: bool,
    dirty: bool,
    cum_steps: u64,
    last_run_steps: u32,
    block_steps: Option<u32>,
    event_id: u64,
    params: BTreeMap<String, f64>,
    last_logged_tick: Option<u64>,
    diag: DiagTracker,
}

impl<B: SolverBackend> WakeChamber<B> {
    pub fn new(backend: B, label: &str) -> Self {
        Self {
            backend,
            label: label.to_string(),
            deck: String::new(),
            input_dir: PathBuf::new(),
            initialized: false,
            dirty: false,
            cum_steps: 0,
            last_run_steps: 0,
            block_steps: None,
            event_id: 0,
            params: BTreeMap::new(),
            last_logged_tick: None,
            diag: DiagTracker::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn cum_steps(&self) -> u64 {
        self.cum_steps
    }

    pub fn block_steps(&self) -> u32 {
        self.block_steps.unwrap_or(DEFAULT_BLOCK_STEPS)
    }

    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn diag_dir(&self) -> PathBuf {
        self.input_dir.join("data").join("tmp")
    }

    /// Loads the deck once. Later calls are no-ops.
    pub fn init(&mut self, deck: &str, input_dir: &Path, sink: &mut dyn TelemetrySink) -> Result<(), CouplingError> {
        if self.initialized {
            return Ok(());
        }
        self.backend.load_deck(deck, input_dir)?;

        self.deck = deck.to_string();
        self.input_dir = input_dir.to_path_buf();
        self.initialized = true;
        self.dirty = false;
        self.cum_steps = 0;
        self.last_run_steps = 0;
        info!("{} online with deck {} in {}", self.label, deck, input_dir.display());
        self.log_event(sink, 1.0, 0.0, 0.0);
        Ok(())
    }

    /// Advances one block. The first positive `n_default` becomes the block size.
    pub fn step(&mut self, n_default: u32) -> Result<(), CouplingError> {
        if !self.initialized {
            return Err(CouplingError::NotInitialized);
        }
        if self.block_steps.is_none() && n_default > 0 {
            self.block_steps = Some(n_default);
        }
        self.run_steps(self.block_steps())
    }

    pub fn run_steps(&mut self, n: u32) -> Result<(), CouplingError> {
        if !self.initialized {
            return Err(CouplingError::NotInitialized);
        }
        if n == 0 {
            self.last_run_steps = 0;
            return Ok(());
        }
        self.backend.command(&format!("run {}", n))?;
        self.cum_steps += u64::from(n);
        self.last_run_steps = n;
        Ok(())
    }

    fn write_params(&self) -> Result<(), CouplingError> {
        let path = self.input_dir.join(PARAMS_FILE);
        let mut body = String::new();
        for (name, value) in &self.params {
            let _ = writeln!(body, "variable {} equal {}", name, value);
        }
        std::fs::write(&path, body).map_err(|source| CouplingError::Params { path, source })
    }

    fn log_event(&mut self, sink: &mut dyn TelemetrySink, status: f64, reload: f64, mark_reload: f64) {
        self.event_id += 1;
        sink.emit(
            &format!("{}Events", self.label),
            self.event_id,
            0.0,
            &[
                ("status", status),
                ("ran_steps", 0.0),
                ("cum_steps", self.cum_steps as f64),
                ("reload", reload),
                ("mark_reload", mark_reload),
            ],
        );
    }
}

impl<B: SolverBackend> SolverCoupling for WakeChamber<B> {
    fn advance(&mut self, steps: u32) -> Result<(), CouplingError> {
        self.step(steps)
    }

    /// Stores the value and rewrites the parameter file with every stored value.
    fn set_parameter(&mut self, name: &str, value: f64) -> Result<(), CouplingError> {
        if !self.initialized {
            return Err(CouplingError::NotInitialized);
        }
        if !value.is_finite() {
            return Err(CouplingError::InvalidParameter {
                name: name.to_string(),
                value,
            });
        }
        self.params.insert(name.to_string(), value);
        self.write_params()?;
        debug!("{} param {} = {}", self.label, name, value);
        Ok(())
    }

    fn mark_dirty_reload(&mut self, sink: &mut dyn TelemetrySink) {
        self.dirty = true;
        self.log_event(sink, 1.0, 0.0, 1.0);
    }

    fn reload_if_dirty_else_advance(&mut self, steps: u32, sink: &mut dyn TelemetrySink) -> Result<bool, CouplingError> {
        if !self.initialized {
            return Err(CouplingError::NotInitialized);
        }
        if !self.dirty {
            self.run_steps(steps)?;
            return Ok(steps > 0);
        }

        self.backend.command("clear")?;
        self.backend.load_deck(&self.deck, &self.input_dir)?;
        self.dirty = false;
        self.last_run_steps = 0;
        info!("{} reloaded deck {}", self.label, self.deck);
        self.log_event(sink, 1.0, 1.0, 0.0);

        self.run_steps(steps)?;
        Ok(true)
    }

    /// At most one diagnostics row per tick index.
    fn tick(&mut self, ctx: &TickContext, sink: &mut dyn TelemetrySink) {
        if self.last_logged_tick == Some(ctx.tick_index) {
            self.last_run_steps = 0;
            return;
        }
        self.last_logged_tick = Some(ctx.tick_index);

        let dir = self.diag_dir();
        let reading = self.diag.update(read_wake_diag(&dir.join(WAKE_DIAG_FILE)));
        let shield = read_shield_diag(&dir.join(SHIELD_DIAG_FILE)).unwrap_or_default();

        sink.emit(
            &self.label,
            ctx.tick_index,
            ctx.time,
            &[
                ("status", 1.0),
                ("ran_steps", f64::from(self.last_run_steps)),
                ("cum_steps", self.cum_steps as f64),
                ("reload", 0.0),
                ("mark_reload", 0.0),
                ("temp_K", reading.temp_k),
                ("density_m3", reading.density_m3),
                ("n_ratio", reading.n_ratio),
                ("pressure_Pa", reading.pressure_pa),
                ("shield_hits", shield.shield_hits),
                ("shield_reemit", shield.reemit_total),
            ],
        );
        self.last_run_steps = 0;
    }

    fn shutdown(&mut self, sink: &mut dyn TelemetrySink) {
        if !self.initialized {
            warn!("{} shut down before init", self.label);
        }
        self.log_event(sink, 0.0, 0.0, 0.0);
        self.initialized = false;
        self.dirty = false;
        info!("{} shut down after {} solver steps", self.label, self.cum_steps);
    }
}
