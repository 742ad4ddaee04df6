//! Output Analysis
//!
//! This module inspects calculation output files:
//!
//! - `classifier`: success/failure classification via completion markers
//! - `energy`: final energy extraction from output files
//! - `selector`: conformer completeness and lowest-energy filtering

pub mod classifier;
pub mod energy;
pub mod selector;

pub use classifier::is_complete;
pub use energy::extract_energy;
