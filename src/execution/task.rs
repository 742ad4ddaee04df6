//! Array Task Entry Points
//!
//! The two per-task phases that run inside a scheduler array job:
//!
//! - `run_array_calc`: launches the chemistry program on one input as
//!   a bounded child process
//! - `handle_array_output`: classifies the output and relocates the
//!   artifact's file family
//!
//! Tasks of the same wave run concurrently on different nodes but
//! touch disjoint artifact sets, so atomic renames are the only
//! synchronization needed.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::analysis::classifier::is_complete;
use crate::error::{FlowError, Result};
use crate::workflow::artifact::with_extension;
use crate::workflow::graph::StepGraph;
use crate::workflow::layout::{WorkflowLayout, WorkflowParams};
use crate::workflow::manifest::Manifest;

/// Scheduler environment variable naming this task's index.
pub const ARRAY_TASK_ID_VAR: &str = "SLURM_ARRAY_TASK_ID";

/// Scheduler environment variable naming the parent array job.
pub const ARRAY_JOB_ID_VAR: &str = "SLURM_ARRAY_JOB_ID";

/// Poll interval while waiting on the calculation child process.
const CHILD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Reads this task's 1-based index from the scheduler environment.
pub fn array_task_index() -> Result<usize> {
    let raw = env::var(ARRAY_TASK_ID_VAR).map_err(|_| {
        FlowError::Config(format!(
            "{} is not set; this command must run inside an array job",
            ARRAY_TASK_ID_VAR
        ))
    })?;
    raw.parse().map_err(|_| {
        FlowError::Config(format!("{} has non-numeric value '{}'", ARRAY_TASK_ID_VAR, raw))
    })
}

/// Runs one array calculation as a bounded child process.
///
/// The input is looked up through the wave manifest and the program is
/// invoked in the wave directory. A timeout is not an error: the
/// partial output is classified in the handle phase like any other
/// failure.
pub fn run_array_calc(
    graph: &StepGraph,
    layout: &WorkflowLayout,
    step_id: &str,
    wave_id: u32,
    task_index: usize,
    time_limit_minutes: u32,
) -> Result<()> {
    let step = graph.step(step_id)?;
    let wave_dir = layout.wave_dir(step_id, wave_id);

    let input_name = Manifest::new(&wave_dir).lookup(task_index)?;
    info!(
        "Task {} of wave {} '{}': running {} on {}",
        task_index,
        wave_id,
        step_id,
        step.program.command(),
        input_name
    );

    let mut child = Command::new(step.program.command())
        .arg(&input_name)
        .current_dir(&wave_dir)
        .spawn()?;

    let deadline = Instant::now() + Duration::from_secs(u64::from(time_limit_minutes) * 60);
    loop {
        if let Some(status) = child.try_wait()? {
            info!("{} exited with {}", input_name, status);
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!("{} hit the {} minute time limit", input_name, time_limit_minutes);
            child.kill()?;
            child.wait()?;
            return Ok(());
        }
        thread::sleep(CHILD_POLL_INTERVAL);
    }
}

/// Classifies one finished task's output and relocates its files.
///
/// Idempotent: re-invocation after the files have already moved finds
/// nothing left to do and returns cleanly.
pub fn handle_array_output(
    graph: &StepGraph,
    layout: &WorkflowLayout,
    workflow_params: &WorkflowParams,
    step_id: &str,
    wave_id: u32,
    task_index: usize,
) -> Result<()> {
    let step = graph.step(step_id)?;
    let wave_dir = layout.wave_dir(step_id, wave_id);

    let input_name = Manifest::new(&wave_dir).lookup(task_index)?;
    let input_path = wave_dir.join(&input_name);
    let output_path = with_extension(&input_path, step.program.output_extension());

    let stem = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&input_name)
        .to_string();

    adopt_scheduler_logs(&wave_dir, &stem);

    // A classification error must not lose the task's accounting; the
    // artifact goes to the failed bucket like any other failure.
    let completed = match is_complete(&output_path, step) {
        Ok(completed) => completed,
        Err(e) => {
            error!("Could not classify {}: {}", output_path.display(), e);
            false
        }
    };
    if completed {
        info!("{} completed", stem);

        if step.save_output {
            archive_output(layout, workflow_params, step_id, &output_path)?;
        }

        purge_scratch_files(&wave_dir, &stem, step.program.scratch_extensions());
        move_file_family(&wave_dir, &stem, &layout.completed_dir(step_id, wave_id))?;
    } else {
        info!("{} failed", stem);
        move_file_family(&wave_dir, &stem, &layout.failed_dir(step_id, wave_id))?;
    }

    Ok(())
}

/// Renames the scheduler's `<jobid>_<task>.o/.e` log files under the
/// artifact's base name. Tolerates a missing environment (manual
/// invocation) and already-renamed files.
fn adopt_scheduler_logs(wave_dir: &Path, stem: &str) {
    let (array_id, task_id) = match (env::var(ARRAY_JOB_ID_VAR), env::var(ARRAY_TASK_ID_VAR)) {
        (Ok(a), Ok(t)) => (a, t),
        _ => {
            debug!("Scheduler environment absent; keeping log file names");
            return;
        }
    };
    rename_array_files(wave_dir, &array_id, &task_id, stem);
}

fn rename_array_files(wave_dir: &Path, array_id: &str, task_id: &str, stem: &str) {
    for ext in ["o", "e"] {
        let source = wave_dir.join(format!("{}_{}.{}", array_id, task_id, ext));
        if !source.exists() {
            continue;
        }
        let dest = wave_dir.join(format!("{}.{}", stem, ext));
        if let Err(e) = fs::rename(&source, &dest) {
            warn!("Could not adopt {}: {}", source.display(), e);
        }
    }
}

/// Copies a completed output into the long-term archive, under
/// `<archive>/<config stem>/<config id>/<workflow name>/`.
fn archive_output(
    layout: &WorkflowLayout,
    workflow_params: &WorkflowParams,
    step_id: &str,
    output_path: &Path,
) -> Result<()> {
    let archive_root = match &workflow_params.archive_dir {
        Some(dir) => dir.clone(),
        None => {
            warn!("save_output set for '{}' but no archive directory configured", step_id);
            return Ok(());
        }
    };

    let config_stem = workflow_params
        .config_file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("config")
        .to_string();

    let dest_dir = archive_root
        .join(config_stem)
        .join(&workflow_params.config_id)
        .join(layout.workflow_name());
    fs::create_dir_all(&dest_dir)?;

    if let Some(file_name) = output_path.file_name() {
        fs::copy(output_path, dest_dir.join(file_name))?;
        info!("Archived {} to {}", output_path.display(), dest_dir.display());
    }
    Ok(())
}

/// Deletes scratch files sharing the artifact's stem.
fn purge_scratch_files(wave_dir: &Path, stem: &str, extensions: &[&str]) {
    for ext in extensions {
        let scratch = wave_dir.join(format!("{}.{}", stem, ext));
        if scratch.exists() {
            if let Err(e) = fs::remove_file(&scratch) {
                warn!("Could not remove scratch file {}: {}", scratch.display(), e);
            }
        }
    }
}

/// Moves every file sharing `stem` from `wave_dir` into `dest_dir`.
///
/// Tolerant of re-invocation: files that are already gone are skipped,
/// and a file already present at the destination is not moved twice.
fn move_file_family(wave_dir: &Path, stem: &str, dest_dir: &Path) -> Result<()> {
    fs::create_dir_all(dest_dir)?;

    let family: Vec<PathBuf> = fs::read_dir(wave_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(|s| s == stem)
                    .unwrap_or(false)
        })
        .collect();

    for file in family {
        let file_name = match file.file_name() {
            Some(name) => name.to_os_string(),
            None => continue,
        };
        let dest = dest_dir.join(&file_name);
        if dest.exists() {
            debug!("{} already handled", dest.display());
            continue;
        }
        fs::rename(&file, &dest)?;
        debug!("Moved {} -> {}", file.display(), dest.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const CONFIG: &str = r##"
default:
  initial_step: sp
  steps:
    sp:
      program: gaussian16
      route: "#p sp b3lyp"
      single_point: true
      save_output: true
"##;

    struct Fixture {
        _temp: tempfile::TempDir,
        graph: StepGraph,
        layout: WorkflowLayout,
        workflow_params: WorkflowParams,
        wave_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().unwrap();
        let workflow_dir = temp.path().join("wf");

        let config_path = temp.path().join(".flow_config");
        fs::write(&config_path, CONFIG).unwrap();

        let graph = StepGraph::load(&config_path, "default").unwrap();
        let layout = WorkflowLayout::new(&workflow_dir);
        let workflow_params = WorkflowParams::new(config_path, "default".into());

        let wave_dir = layout.wave_dir("sp", 1);
        fs::create_dir_all(&wave_dir).unwrap();

        Fixture {
            _temp: temp,
            graph,
            layout,
            workflow_params,
            wave_dir,
        }
    }

    fn add_task(fixture: &Fixture, stem: &str, output_content: &str) {
        fs::write(fixture.wave_dir.join(format!("{}.com", stem)), "#p sp b3lyp\n").unwrap();
        fs::write(fixture.wave_dir.join(format!("{}.log", stem)), output_content).unwrap();
        Manifest::new(&fixture.wave_dir)
            .write(&[format!("{}.com", stem)])
            .unwrap();
    }

    fn handle(fixture: &Fixture) -> Result<()> {
        handle_array_output(
            &fixture.graph,
            &fixture.layout,
            &fixture.workflow_params,
            "sp",
            1,
            1,
        )
    }

    #[test]
    fn test_completed_output_moves_family_to_completed() {
        let fx = fixture();
        add_task(&fx, "KEY-A_sp", "Normal termination\n");

        handle(&fx).unwrap();

        let completed = fx.layout.completed_dir("sp", 1);
        assert!(completed.join("KEY-A_sp.com").exists());
        assert!(completed.join("KEY-A_sp.log").exists());
        assert!(!fx.wave_dir.join("KEY-A_sp.com").exists());
    }

    #[test]
    fn test_failed_output_moves_family_to_failed() {
        let fx = fixture();
        add_task(&fx, "KEY-A_sp", "Error termination\n");

        handle(&fx).unwrap();

        let failed = fx.layout.failed_dir("sp", 1);
        assert!(failed.join("KEY-A_sp.com").exists());
        assert!(failed.join("KEY-A_sp.log").exists());
    }

    #[test]
    fn test_missing_output_counts_as_failed() {
        let fx = fixture();
        fs::write(fx.wave_dir.join("KEY-A_sp.com"), "#p sp b3lyp\n").unwrap();
        Manifest::new(&fx.wave_dir)
            .write(&["KEY-A_sp.com".to_string()])
            .unwrap();

        handle(&fx).unwrap();

        assert!(fx.layout.failed_dir("sp", 1).join("KEY-A_sp.com").exists());
    }

    #[test]
    fn test_handle_is_idempotent() {
        let fx = fixture();
        add_task(&fx, "KEY-A_sp", "Normal termination\n");

        handle(&fx).unwrap();
        // second invocation finds the files already moved
        handle(&fx).unwrap();

        assert!(fx
            .layout
            .completed_dir("sp", 1)
            .join("KEY-A_sp.log")
            .exists());
    }

    #[test]
    fn test_scratch_purged_on_completion() {
        let fx = fixture();
        add_task(&fx, "KEY-A_sp", "Normal termination\n");
        fs::write(fx.wave_dir.join("KEY-A_sp.rwf"), "scratch").unwrap();

        handle(&fx).unwrap();

        assert!(!fx.wave_dir.join("KEY-A_sp.rwf").exists());
        assert!(!fx
            .layout
            .completed_dir("sp", 1)
            .join("KEY-A_sp.rwf")
            .exists());
    }

    #[test]
    fn test_scratch_kept_on_failure() {
        let fx = fixture();
        add_task(&fx, "KEY-A_sp", "crashed\n");
        fs::write(fx.wave_dir.join("KEY-A_sp.rwf"), "scratch").unwrap();

        handle(&fx).unwrap();

        // the restarter may still need it
        assert!(fx.layout.failed_dir("sp", 1).join("KEY-A_sp.rwf").exists());
    }

    #[test]
    fn test_save_output_archives_a_copy() {
        let mut fx = fixture();
        let archive = fx._temp.path().join("archive");
        fx.workflow_params.archive_dir = Some(archive.clone());
        add_task(&fx, "KEY-A_sp", "Normal termination\n");

        handle(&fx).unwrap();

        let archived = archive
            .join(".flow_config")
            .join("default")
            .join("wf")
            .join("KEY-A_sp.log");
        assert!(archived.exists());
    }

    #[test]
    fn test_rename_array_files_adopts_logs() {
        let fx = fixture();
        fs::write(fx.wave_dir.join("987_3.o"), "stdout").unwrap();
        fs::write(fx.wave_dir.join("987_3.e"), "stderr").unwrap();

        rename_array_files(&fx.wave_dir, "987", "3", "KEY-A_sp");

        assert!(fx.wave_dir.join("KEY-A_sp.o").exists());
        assert!(fx.wave_dir.join("KEY-A_sp.e").exists());
        assert!(!fx.wave_dir.join("987_3.o").exists());
    }

    #[test]
    fn test_move_family_skips_existing_destination() {
        let fx = fixture();
        let dest = fx.wave_dir.join("done");
        fs::write(fx.wave_dir.join("KEY-A_sp.com"), "new").unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("KEY-A_sp.com"), "old").unwrap();

        move_file_family(&fx.wave_dir, "KEY-A_sp", &dest).unwrap();

        // existing destination file is left alone
        assert_eq!(fs::read_to_string(dest.join("KEY-A_sp.com")).unwrap(), "old");
    }

    #[test]
    fn test_task_index_out_of_range() {
        let fx = fixture();
        add_task(&fx, "KEY-A_sp", "Normal termination\n");

        let result = handle_array_output(
            &fx.graph,
            &fx.layout,
            &fx.workflow_params,
            "sp",
            1,
            2,
        );
        assert!(matches!(result, Err(FlowError::TaskIndexOutOfRange { .. })));
    }
}
