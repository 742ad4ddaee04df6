//! Batch Submission Scripts
//!
//! Renders Slurm sbatch scripts:
//! - `#SBATCH` resource directives from step parameters
//! - array clauses with a simultaneous-task cap
//! - `--dependency` clauses for chained submissions
//!
//! Scripts are always written to disk before submission so a failed
//! wave can be inspected and resubmitted by hand.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::Result;
use crate::workflow::params::StepParams;

/// Scheduler-assigned job identifier.
pub type JobId = u64;

/// Slurm dependency types used between chained submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyType {
    /// Run after the referenced job reaches any terminal state.
    AfterAny,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::AfterAny => "afterany",
        }
    }
}

/// An sbatch submission script.
///
/// Built with required fields up front and optional directives layered
/// on through the builder methods, then rendered and written with
/// [`JobScript::write`].
///
/// # Example
///
/// ```rust,no_run
/// use qcflow::scheduler::script::JobScript;
///
/// let script = JobScript::new("my_workflow_opt", 90, "qcflow begin --step-id opt --wave-id 1")
///     .partition("short")
///     .array(24, 50);
/// let path = script.write(std::path::Path::new("opt.sbatch")).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct JobScript {
    job_name: String,
    nodes: u32,
    cores: Option<u32>,
    partition: Option<String>,
    /// Total wall-clock limit in minutes.
    time_minutes: u32,
    /// Array size and simultaneous-task cap.
    array: Option<(usize, u32)>,
    stdout_pattern: Option<String>,
    stderr_pattern: Option<String>,
    dependency: Option<(DependencyType, JobId)>,
    commands: String,
}

impl JobScript {
    pub fn new(job_name: &str, time_minutes: u32, commands: &str) -> Self {
        Self {
            job_name: job_name.to_string(),
            nodes: 1,
            cores: None,
            partition: None,
            time_minutes,
            array: None,
            stdout_pattern: None,
            stderr_pattern: None,
            dependency: None,
            commands: commands.to_string(),
        }
    }

    /// Builds an array-job script from a step's resource parameters.
    ///
    /// The time limit includes the step's scheduler padding so the
    /// in-script calculation timeout expires before Slurm kills the
    /// task.
    pub fn for_step(job_name: &str, step: &StepParams, array_size: usize, commands: &str) -> Self {
        Self::new(job_name, step.scheduler_timelim(), commands)
            .cores(step.nproc)
            .partition(&step.partition)
            .array(array_size, step.simul_jobs)
            .stdout_pattern("%A_%a.o")
            .stderr_pattern("%A_%a.e")
    }

    pub fn cores(mut self, cores: u32) -> Self {
        self.cores = Some(cores);
        self
    }

    pub fn partition(mut self, partition: &str) -> Self {
        self.partition = Some(partition.to_string());
        self
    }

    pub fn array(mut self, size: usize, simul_jobs: u32) -> Self {
        self.array = Some((size, simul_jobs));
        self
    }

    pub fn stdout_pattern(mut self, pattern: &str) -> Self {
        self.stdout_pattern = Some(pattern.to_string());
        self
    }

    pub fn stderr_pattern(mut self, pattern: &str) -> Self {
        self.stderr_pattern = Some(pattern.to_string());
        self
    }

    pub fn dependency(mut self, dependency_type: DependencyType, job_id: JobId) -> Self {
        self.dependency = Some((dependency_type, job_id));
        self
    }

    /// Renders the full sbatch script text.
    pub fn render(&self) -> String {
        let mut script = String::new();

        script.push_str("#!/bin/bash\n");
        let _ = writeln!(script, "#SBATCH -J {}", self.job_name);
        let _ = writeln!(script, "#SBATCH -N {}", self.nodes);

        if let Some(cores) = self.cores {
            let _ = writeln!(script, "#SBATCH -n {}", cores);
        }

        if let Some(partition) = &self.partition {
            let _ = writeln!(script, "#SBATCH -p {}", partition);
        }

        let (hours, minutes) = (self.time_minutes / 60, self.time_minutes % 60);
        let _ = writeln!(script, "#SBATCH --time={:0>2}:{:0>2}:00", hours, minutes);

        if let Some((size, simul_jobs)) = self.array {
            let _ = writeln!(script, "#SBATCH --array=1-{}%{}", size, simul_jobs);
        }

        if let Some(pattern) = &self.stdout_pattern {
            let _ = writeln!(script, "#SBATCH -o {}", pattern);
        }

        if let Some(pattern) = &self.stderr_pattern {
            let _ = writeln!(script, "#SBATCH -e {}", pattern);
        }

        if let Some((dependency_type, job_id)) = &self.dependency {
            let _ = writeln!(
                script,
                "#SBATCH --dependency={}:{}",
                dependency_type.as_str(),
                job_id
            );
        }

        script.push('\n');
        script.push_str(&self.commands);
        script.push('\n');

        script
    }

    /// Writes the rendered script to `path` and returns the path.
    pub fn write(&self, path: &Path) -> Result<PathBuf> {
        debug!("Writing job script '{}' to {}", self.job_name, path.display());
        fs::write(path, self.render())?;
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use serde_yaml::Value;

    fn step_params() -> StepParams {
        let mut raw = BTreeMap::new();
        raw.insert("program".to_string(), Value::from("gaussian16"));
        raw.insert("route".to_string(), Value::from("#p opt b3lyp/6-31G(d)"));
        raw.insert("nproc".to_string(), Value::from(8u32));
        raw.insert("timelim".to_string(), Value::from(120u32));
        raw.insert("timelim_padding".to_string(), Value::from(5u32));
        raw.insert("partition".to_string(), Value::from("long"));
        raw.insert("simul_jobs".to_string(), Value::from(20u32));
        StepParams::from_raw("opt", &raw).unwrap()
    }

    #[test]
    fn test_minimal_script_renders_required_directives() {
        let script = JobScript::new("test_job", 90, "echo hello").render();

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH -J test_job\n"));
        assert!(script.contains("#SBATCH -N 1\n"));
        assert!(script.contains("#SBATCH --time=01:30:00\n"));
        assert!(script.ends_with("echo hello\n"));
        assert!(!script.contains("--array"));
        assert!(!script.contains("--dependency"));
    }

    #[test]
    fn test_step_script_includes_array_and_resources() {
        let script = JobScript::for_step("flow_opt", &step_params(), 24, "qcflow run").render();

        assert!(script.contains("#SBATCH -n 8\n"));
        assert!(script.contains("#SBATCH -p long\n"));
        // 120 + 5 minutes of padding
        assert!(script.contains("#SBATCH --time=02:05:00\n"));
        assert!(script.contains("#SBATCH --array=1-24%20\n"));
        assert!(script.contains("#SBATCH -o %A_%a.o\n"));
        assert!(script.contains("#SBATCH -e %A_%a.e\n"));
    }

    #[test]
    fn test_dependency_clause() {
        let script = JobScript::new("submitter", 10, "qcflow begin")
            .dependency(DependencyType::AfterAny, 123456)
            .render();

        assert!(script.contains("#SBATCH --dependency=afterany:123456\n"));
    }

    #[test]
    fn test_time_formatting_pads_fields() {
        let script = JobScript::new("t", 65, "true").render();
        assert!(script.contains("--time=01:05:00"));

        let script = JobScript::new("t", 1445, "true").render();
        assert!(script.contains("--time=24:05:00"));
    }

    #[test]
    fn test_write_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.sbatch");

        let written = JobScript::new("test_job", 30, "echo hi").write(&path).unwrap();

        assert_eq!(written, path);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("#SBATCH -J test_job"));
    }
}
