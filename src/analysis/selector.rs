//! Conformer Selection
//!
//! Filters a step's source artifacts according to conformer
//! completeness and the lowest-energy-representative policy.
//!
//! Both filters apply only when the predecessor step processed
//! conformers. The completeness filter is all-or-nothing per molecule:
//! a molecule advancing with a partial conformer set would bias any
//! downstream energy comparison. The reduction filter collapses each
//! molecule's conformer ensemble to its single lowest-energy member at
//! the point where the workflow stops being conformer-aware.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::Result;
use crate::workflow::artifact::ArtifactName;
use crate::workflow::params::StepParams;

/// Filters predecessor output artifacts for use as the current step's
/// sources.
///
/// `expected_counts` maps molecule keys to the conformer count of the
/// initial raw-structure population. `energy_of` extracts a scalar
/// energy from a candidate artifact; it is injected so selection logic
/// stays pure over its inputs.
///
/// Both filters are idempotent and preserve the input order of the
/// artifacts they retain.
pub fn filter<F>(
    artifacts: Vec<PathBuf>,
    step: &StepParams,
    predecessor: &StepParams,
    expected_counts: &HashMap<String, usize>,
    energy_of: F,
) -> Result<Vec<PathBuf>>
where
    F: Fn(&Path) -> Result<f64>,
{
    if !predecessor.conformers {
        return Ok(artifacts);
    }

    let mut retained = artifacts;

    if !predecessor.proceed_on_failed_conf {
        retained = drop_incomplete_molecules(retained, expected_counts);
    }

    if !step.conformers {
        retained = lowest_energy_conformers(retained, energy_of)?;
    }

    Ok(retained)
}

/// Drops every artifact of a molecule whose completed conformer count
/// does not equal the expected count.
fn drop_incomplete_molecules(
    artifacts: Vec<PathBuf>,
    expected_counts: &HashMap<String, usize>,
) -> Vec<PathBuf> {
    let mut completed: HashMap<String, usize> = HashMap::new();
    for artifact in &artifacts {
        let key = ArtifactName::from_path(artifact, true).molecule_key;
        *completed.entry(key).or_insert(0) += 1;
    }

    artifacts
        .into_iter()
        .filter(|artifact| {
            let key = ArtifactName::from_path(artifact, true).molecule_key;
            let expected = expected_counts.get(&key).copied().unwrap_or(1);
            let actual = completed.get(&key).copied().unwrap_or(0);
            if actual != expected {
                warn!(
                    "Dropping molecule '{}': {} of {} conformers completed",
                    key, actual, expected
                );
                false
            } else {
                true
            }
        })
        .collect()
}

/// Reduces each molecule to its single lowest-energy conformer.
///
/// Ties break on the conformer index, so selection is deterministic
/// for equal energies. Artifacts whose energy cannot be extracted are
/// skipped with a warning rather than failing the wave.
fn lowest_energy_conformers<F>(artifacts: Vec<PathBuf>, energy_of: F) -> Result<Vec<PathBuf>>
where
    F: Fn(&Path) -> Result<f64>,
{
    // molecule key -> (energy, conformer ordinal, position) of the
    // current minimum
    let mut minima: HashMap<String, (f64, u64, usize)> = HashMap::new();

    for (position, artifact) in artifacts.iter().enumerate() {
        let name = ArtifactName::from_path(artifact, true);
        let conformer = name.conformer.clone().unwrap_or_default();
        // Ties on energy go to the numerically lowest conformer index.
        let ordinal = conformer.parse::<u64>().unwrap_or(u64::MAX);

        let energy = match energy_of(artifact) {
            Ok(e) => e,
            Err(e) => {
                warn!(
                    "Skipping '{}': energy extraction failed: {}",
                    artifact.display(),
                    e
                );
                continue;
            }
        };

        debug!(
            "{} conformer {}: {:.6} eV",
            name.molecule_key, conformer, energy
        );

        match minima.get(&name.molecule_key) {
            Some((best_energy, best_ordinal, _))
                if (*best_energy, *best_ordinal) <= (energy, ordinal) => {}
            _ => {
                minima.insert(name.molecule_key.clone(), (energy, ordinal, position));
            }
        }
    }

    let keep: Vec<usize> = minima.values().map(|(_, _, position)| *position).collect();

    let selected: Vec<PathBuf> = artifacts
        .into_iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, artifact)| artifact)
        .collect();

    info!(
        "Selected {} lowest-energy conformers from {} molecules",
        selected.len(),
        minima.len()
    );

    Ok(selected)
}
