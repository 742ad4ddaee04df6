//! Workflow Execution Module
//!
//! The engine side of the crate: turning a resolved step graph into
//! scheduled work and reacting to finished calculations.
//!
//! # Architecture
//!
//! - [`orchestrator`]: wave-level engine behind the begin entry point
//! - [`task`]: per-array-task run and handle phases
//! - [`materialize`]: input materializer and restart-updater seams

pub mod materialize;
pub mod orchestrator;
pub mod task;

pub use materialize::{CopyMaterializer, GaussianRestartUpdater, InputMaterializer, InputUpdater};
pub use orchestrator::WaveOrchestrator;
