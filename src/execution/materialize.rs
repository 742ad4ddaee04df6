//! Input Materialization
//!
//! Seams between the orchestrator and program-specific input writing:
//!
//! - `InputMaterializer`: places a fresh input artifact into a wave
//!   directory
//! - `InputUpdater`: rewrites a failed input for a restart attempt
//!
//! Program-specific input text generation lives outside this engine;
//! the concrete `CopyMaterializer` only relocates pre-generated
//! artifacts. `GaussianRestartUpdater` is the exception: restart
//! rewriting only touches the route line, which this engine owns.

use std::fs;
use std::path::Path;

use log::{debug, warn};

use crate::error::{FlowError, Result};
use crate::workflow::params::StepParams;

/// Places one input artifact into a wave directory.
pub trait InputMaterializer {
    /// Materializes `source` (in `source_format`) as the input file at
    /// `dest`. `reference` points at the molecule's original raw
    /// structure when a writer needs connectivity the source lacks.
    fn materialize(
        &self,
        step: &StepParams,
        dest: &Path,
        source: &Path,
        source_format: &str,
        reference: Option<&Path>,
    ) -> Result<()>;
}

/// Rewrites a failed input for retry.
pub trait InputUpdater {
    /// Inspects `failed_output` and, when the failure is retryable,
    /// writes an updated copy of `failed_input` into `dest_dir`.
    /// Returns `false` when no retry is possible; the failed artifact
    /// is then left in place untouched.
    fn update(&self, failed_input: &Path, failed_output: &Path, dest_dir: &Path) -> Result<bool>;
}

/// Materializer that copies a pre-generated input artifact into place.
pub struct CopyMaterializer {
    overwrite: bool,
}

impl CopyMaterializer {
    pub fn new(overwrite: bool) -> Self {
        Self { overwrite }
    }
}

impl InputMaterializer for CopyMaterializer {
    fn materialize(
        &self,
        _step: &StepParams,
        dest: &Path,
        source: &Path,
        _source_format: &str,
        _reference: Option<&Path>,
    ) -> Result<()> {
        if dest.exists() && !self.overwrite {
            return Err(FlowError::Config(format!(
                "refusing to overwrite existing input {}",
                dest.display()
            )));
        }

        debug!("Copying {} -> {}", source.display(), dest.display());
        fs::copy(source, dest)?;
        Ok(())
    }
}

const NORMAL_TERMINATION: &str = "Normal termination";
const ERROR_TERMINATION: &str = "Error termination";
const LINK_9999_FAILURE: &str = "Error termination request processed by link 9999.";
const CONVERGENCE_FAILURE: &str = "Convergence failure -- run terminated.";
const FORMBX_FAILURE: &str = "FormBX had a problem.";

/// Restart rewriter for Gaussian 16 calculations.
///
/// Classifies the failure from the output file and rewrites the
/// input's route line accordingly: optimizations restart from the
/// checkpoint geometry with de-duplicated `opt=(...)` options,
/// frequency jobs restart with a bare `# Restart` route, and
/// convergence or FormBX or link-9999 failures retry with
/// `recalcfc=4` forcing periodic force-constant recalculation.
pub struct GaussianRestartUpdater;

impl GaussianRestartUpdater {
    fn count_lines_containing(path: &Path, needle: &str) -> Result<usize> {
        let text = fs::read_to_string(path)?;
        Ok(text.lines().filter(|line| line.contains(needle)).count())
    }

    /// First line containing '#' is the route.
    fn route_of(input: &Path) -> Result<String> {
        let text = fs::read_to_string(input)?;
        text.lines()
            .find(|line| line.contains('#'))
            .map(|line| line.trim().to_string())
            .ok_or_else(|| {
                FlowError::Config(format!("no route line in input file {}", input.display()))
            })
    }

    fn opt_keyword(route: &str) -> Option<&str> {
        route.split(' ').find(|token| token.starts_with("opt"))
    }

    fn opt_options(keyword: &str) -> Vec<String> {
        match keyword.split_once('=') {
            Some((_, options)) => options
                .replace(['(', ')'], "")
                .split(',')
                .filter(|option| !option.is_empty())
                .map(|option| option.to_lowercase())
                .collect(),
            None => Vec::new(),
        }
    }

    /// De-duplicates options by name, keeping first occurrence.
    /// `recalcfc` supersedes `calcfc`.
    fn clean_options(mut options: Vec<String>) -> Vec<String> {
        if options.iter().any(|option| option.starts_with("recalcfc")) {
            options.retain(|option| option != "calcfc");
        }

        let mut cleaned: Vec<String> = Vec::new();
        for option in options {
            let name = option.split('=').next().unwrap_or(&option).to_string();
            if !cleaned.iter().any(|kept| kept.starts_with(&name)) {
                cleaned.push(option);
            }
        }
        cleaned
    }

    fn restart_opt_route(route: &str, extra_options: &[&str]) -> Result<String> {
        let keyword = Self::opt_keyword(route)
            .ok_or_else(|| FlowError::Config(format!("no opt keyword in route '{}'", route)))?;

        let mut options = Self::opt_options(keyword);
        options.extend(extra_options.iter().map(|option| option.to_lowercase()));
        let options = Self::clean_options(options);

        let new_keyword = if options.is_empty() {
            "opt".to_string()
        } else {
            format!("opt=({})", options.join(","))
        };

        Ok(route.replace(keyword, &new_keyword))
    }

    /// Decides the replacement route, or `None` when the failure is
    /// not retryable.
    fn new_route(route: &str, output: &Path) -> Result<Option<String>> {
        let markers = Self::count_lines_containing(output, NORMAL_TERMINATION)?;
        let has_opt = route.contains("opt");
        let has_freq = route.contains("freq");

        let incomplete = if has_opt && has_freq {
            markers < 2
        } else if has_opt || has_freq || route.contains("# Restart") {
            markers < 1
        } else {
            false
        };

        let errored = Self::count_lines_containing(output, ERROR_TERMINATION)? > 0;

        if incomplete && !errored {
            let new_route = if has_opt && has_freq && markers == 1 {
                // optimization converged, frequency job died
                "# Restart".to_string()
            } else if has_opt {
                Self::restart_opt_route(route, &[])?
            } else {
                "# Restart".to_string()
            };
            return Ok(Some(new_route));
        }

        let recoverable_error = Self::count_lines_containing(output, CONVERGENCE_FAILURE)? > 0
            || Self::count_lines_containing(output, FORMBX_FAILURE)? > 0
            || Self::count_lines_containing(output, LINK_9999_FAILURE)? > 0;

        if recoverable_error {
            return Ok(Some(Self::restart_opt_route(route, &["recalcfc=4"])?));
        }

        Ok(None)
    }
}

impl InputUpdater for GaussianRestartUpdater {
    fn update(&self, failed_input: &Path, failed_output: &Path, dest_dir: &Path) -> Result<bool> {
        if !failed_output.exists() {
            warn!(
                "No output file for {}; cannot determine restart route",
                failed_input.display()
            );
            return Ok(false);
        }

        let route = Self::route_of(failed_input)?;
        let new_route = match Self::new_route(&route, failed_output)? {
            Some(new_route) => new_route,
            None => {
                debug!("{} is not retryable", failed_input.display());
                return Ok(false);
            }
        };

        debug!("Restart route for {}: '{}'", failed_input.display(), new_route);

        let text = fs::read_to_string(failed_input)?;
        let updated: String = text
            .lines()
            .map(|line| {
                if line.trim() == route {
                    new_route.clone()
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<String>>()
            .join("\n");

        let file_name = failed_input
            .file_name()
            .ok_or_else(|| FlowError::Config(format!("bad input path {}", failed_input.display())))?;
        fs::write(dest_dir.join(file_name), updated + "\n")?;

        Ok(true)
    }
}
