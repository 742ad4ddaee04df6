//! qcflow - Quantum Chemistry Workflow Engine
//!
//! Automates multi-stage computational-chemistry pipelines on a batch
//! cluster: a declarative step-dependency configuration becomes a
//! sequence of Slurm array-job submissions, with per-molecule and
//! per-conformer bookkeeping across retry waves.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: step configuration, directory layout, artifact
//!   naming, and wave manifests
//! - [`analysis`]: output classification, energy extraction, and
//!   conformer selection
//! - [`scheduler`]: sbatch script rendering and job submission
//! - [`execution`]: the wave orchestrator and per-task entry points
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use qcflow::execution::{CopyMaterializer, GaussianRestartUpdater, WaveOrchestrator};
//! use qcflow::scheduler::SlurmScheduler;
//! use qcflow::workflow::{StepGraph, WorkflowLayout, WorkflowParams};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let layout = WorkflowLayout::discover(Path::new("."))?;
//!     let params = WorkflowParams::load(layout.workflow_dir())?;
//!     let graph = StepGraph::load(&params.config_file, &params.config_id)?;
//!
//!     let scheduler = SlurmScheduler;
//!     let materializer = CopyMaterializer::new(true);
//!     let updater = GaussianRestartUpdater;
//!
//!     let mut orchestrator =
//!         WaveOrchestrator::new(&graph, &layout, params, &scheduler, &materializer, &updater);
//!     orchestrator.run(graph.initial_step_id(), 1, false)?;
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod error;
pub mod execution;
pub mod scheduler;
pub mod workflow;

// Re-export commonly used types
pub use error::{FlowError, Result};
pub use execution::WaveOrchestrator;
pub use scheduler::{Scheduler, SlurmScheduler};
pub use workflow::{StepGraph, WorkflowLayout, WorkflowParams};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "qcflow";
