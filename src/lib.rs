//! # Forgebus
//!
//! Discrete-time power/thermal co-simulation harness for an orbital
//! molecular-beam growth experiment.
//!
//! ## Features
//!
//! - **Power chain**: solar array, first-come power bus with battery top-up, battery buffer
//! - **Thermal actuators**: first-order RC effusion cell and substrate heater behind a heater bank
//! - **Job schedule**: CSV growth jobs mapped to heater demand
//! - **Compliance**: warm-up gate and consecutive-breach abort of running jobs
//! - **Solver coupling**: stepping, deferred reload and parameter files for an external wake solver
//! - **Telemetry**: per-subsystem CSV rows, or an in-memory sink for tests
//!
//! ## Quick Start
//!
//! ```rust
//! use forgebus::engine::SimulationEngine;
//! use forgebus::subsystems::{Battery, PowerBus, SolarArray};
//! use forgebus::telemetry::MemorySink;
//!
//! let mut sink = MemorySink::new();
//! let bus = PowerBus::with_battery(Battery::new(1000.0));
//! let mut engine = SimulationEngine::new(60.0, SolarArray::default(), bus);
//!
//! engine.initialize(&mut sink);
//! let snapshot = engine.tick(1.0, &mut sink);
//! assert_eq!(snapshot.tick, 1);
//! ```
//!
//! ## Architecture
//!
//! - [`engine`] - Fixed-phase tick orchestration over the power chain
//! - [`subsystems`] - Solar, bus, battery, heaters, thermal elements, growth monitor
//! - [`scheduler`] / [`jobs`] - Job windows and their heater targets
//! - [`compliance`] - Per-job warm-up and abort decisions
//! - [`coupling`] / [`exchange`] - External solver proxy and inter-group scalar link
//! - [`harness`] - Run loop tying everything together for one process group

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod compliance;
pub mod config;
pub mod coupling;
pub mod diag;
pub mod engine;
pub mod exchange;
pub mod harness;
pub mod jobs;
pub mod orbit;
pub mod scheduler;
pub mod subsystems;
pub mod telemetry;
pub mod tick;

pub use compliance::{ComplianceConfig, ComplianceMonitor, ComplianceOutcome};
pub use config::{HarnessConfig, RunMode};
pub use coupling::{SolverCoupling, WakeChamber};
pub use engine::{SimulationEngine, SystemSnapshot};
pub use harness::{Harness, RunSummary};
pub use scheduler::JobScheduler;
pub use tick::TickContext;
