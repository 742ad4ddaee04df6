//! Workflow Definition Module
//!
//! Everything the engine knows about a workflow before any job runs.
//!
//! # Structure
//!
//! - [`params`]: Typed step parameters and per-program tables
//! - [`graph`]: Step-dependency graph parsing and queries
//! - [`layout`]: On-disk workflow/wave directory layout
//! - [`artifact`]: Deterministic artifact naming
//! - [`manifest`]: The per-wave input manifest

pub mod artifact;
pub mod graph;
pub mod layout;
pub mod manifest;
pub mod params;

pub use artifact::ArtifactName;
pub use graph::StepGraph;
pub use layout::{WorkflowLayout, WorkflowParams};
pub use manifest::Manifest;
pub use params::{Program, StepParams};
