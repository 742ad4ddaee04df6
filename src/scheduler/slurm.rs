//! Slurm Submission
//!
//! The `Scheduler` trait is the single seam between the orchestration
//! engine and the batch system. Production code uses `SlurmScheduler`,
//! which shells out to `sbatch`; tests inject a recording mock.

use std::path::Path;
use std::process::Command;

use log::{debug, info};

use crate::error::{FlowError, Result};
use crate::scheduler::script::JobId;

/// Submits job scripts to a batch scheduler.
pub trait Scheduler {
    /// Submits the script at `path` and returns the assigned job id.
    fn submit(&self, path: &Path) -> Result<JobId>;
}

/// Scheduler backed by the `sbatch` command.
pub struct SlurmScheduler;

impl Scheduler for SlurmScheduler {
    fn submit(&self, path: &Path) -> Result<JobId> {
        debug!("Submitting {}", path.display());

        let output = Command::new("sbatch")
            .arg(path)
            .output()
            .map_err(|e| FlowError::Submission(format!("failed to invoke sbatch: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FlowError::Submission(format!(
                "sbatch failed for {}: {}",
                path.display(),
                stderr.trim()
            )));
        }

        // sbatch reports "Submitted batch job <id>"
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = stdout
            .split_whitespace()
            .last()
            .and_then(|field| field.parse::<JobId>().ok())
            .ok_or_else(|| {
                FlowError::Submission(format!("unparseable sbatch output: '{}'", stdout.trim()))
            })?;

        info!("Submitted {} as job {}", path.display(), job_id);
        Ok(job_id)
    }
}

/// Recording scheduler for tests. Captures each submitted script's
/// path and rendered text, handing out sequential job ids.
#[cfg(test)]
pub struct MockScheduler {
    pub submissions: std::sync::Mutex<Vec<(std::path::PathBuf, String)>>,
    next_job_id: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl MockScheduler {
    pub fn new() -> Self {
        Self {
            submissions: std::sync::Mutex::new(Vec::new()),
            next_job_id: std::sync::atomic::AtomicU64::new(1000),
        }
    }

    pub fn submitted_scripts(&self) -> Vec<String> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[cfg(test)]
impl Scheduler for MockScheduler {
    fn submit(&self, path: &Path) -> Result<JobId> {
        let text = std::fs::read_to_string(path)?;
        self.submissions
            .lock()
            .unwrap()
            .push((path.to_path_buf(), text));
        Ok(self
            .next_job_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::script::JobScript;

    #[test]
    fn test_mock_scheduler_assigns_sequential_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.sbatch");
        JobScript::new("j", 10, "true").write(&path).unwrap();

        let scheduler = MockScheduler::new();
        let first = scheduler.submit(&path).unwrap();
        let second = scheduler.submit(&path).unwrap();

        assert_eq!(second, first + 1);
        assert_eq!(scheduler.submissions.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_mock_scheduler_records_script_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.sbatch");
        JobScript::new("recorded", 10, "echo run").write(&path).unwrap();

        let scheduler = MockScheduler::new();
        scheduler.submit(&path).unwrap();

        let scripts = scheduler.submitted_scripts();
        assert!(scripts[0].contains("#SBATCH -J recorded"));
        assert!(scripts[0].contains("echo run"));
    }
}
