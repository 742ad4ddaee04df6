//! Batch Scheduler Integration
//!
//! Everything that touches Slurm lives here:
//!
//! - `script`: sbatch script rendering and writing
//! - `slurm`: the `Scheduler` submission trait and its `sbatch` impl
//! - `commands`: re-entry command lines embedded in job bodies

pub mod commands;
pub mod script;
pub mod slurm;

pub use script::{DependencyType, JobId, JobScript};
pub use slurm::{Scheduler, SlurmScheduler};
