//! Energy Extraction
//!
//! Parses the final self-consistent-field energy out of a program
//! output artifact, in electronvolts. Used by the conformer selector
//! to pick the lowest-energy representative of a molecule.

use std::fs;
use std::path::Path;

use crate::error::{FlowError, Result};
use crate::workflow::params::Program;

/// Hartree to electronvolt conversion factor.
const HARTREE_TO_EV: f64 = 27.2113246;

/// Extracts the final energy (in eV) from a program output artifact.
///
/// For Gaussian 16 the last `SCF Done` line is used; its energy field
/// sits between the `=` sign and the `A.U.` unit tag. GAMESS output
/// extraction is not configured and fails with
/// [`FlowError::UnsupportedProgram`].
pub fn extract_energy(output: &Path, program: Program) -> Result<f64> {
    match program {
        Program::Gaussian16 => extract_gaussian_energy(output),
        Program::Gamess => Err(FlowError::UnsupportedProgram(format!(
            "energy extraction for '{}'",
            program.tag()
        ))),
    }
}

fn extract_gaussian_energy(output: &Path) -> Result<f64> {
    let content = fs::read_to_string(output)?;

    let line = content
        .lines()
        .filter(|l| l.contains("SCF Done"))
        .last()
        .ok_or_else(|| {
            FlowError::Config(format!(
                "no 'SCF Done' line found in {}",
                output.display()
            ))
        })?;

    // "SCF Done:  E(RB3LYP) =  -154.1234  A.U. after   11 cycles"
    let hartrees: f64 = line
        .split("A.U.")
        .next()
        .and_then(|head| head.split_whitespace().last())
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| {
            FlowError::Config(format!(
                "malformed 'SCF Done' line in {}: '{}'",
                output.display(),
                line.trim()
            ))
        })?;

    Ok(hartrees * HARTREE_TO_EV)
}
