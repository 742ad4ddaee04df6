//! Wave Orchestration
//!
//! The central engine driving one wave of one step:
//! - restart-wave allocation when a previous wave left failures
//! - source artifact resolution (raw structures, predecessor output,
//!   or the previous wave's failed subset)
//! - conformer filtering and input materialization
//! - manifest generation and array-job submission
//! - dependent and restarter job chaining via scheduler dependencies
//!
//! Each invocation is a short-lived process; the wave directory and
//! manifest on disk are the only state shared between invocations.

use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info, warn};

use crate::analysis::energy::extract_energy;
use crate::analysis::selector;
use crate::error::{FlowError, Result};
use crate::execution::materialize::{InputMaterializer, InputUpdater};
use crate::scheduler::commands;
use crate::scheduler::script::{DependencyType, JobId, JobScript};
use crate::scheduler::Scheduler;
use crate::workflow::artifact::{with_extension, ArtifactName};
use crate::workflow::graph::StepGraph;
use crate::workflow::layout::{WorkflowLayout, WorkflowParams, RAW_STRUCTURE_EXTENSION};
use crate::workflow::manifest::Manifest;
use crate::workflow::params::StepParams;

/// Default cap on restart waves per step. Without a cap a
/// persistently failing calculation would be resubmitted forever.
pub const DEFAULT_MAX_WAVES: u32 = 5;

/// Drives the begin-step entry point for one step and wave.
pub struct WaveOrchestrator<'a> {
    graph: &'a StepGraph,
    layout: &'a WorkflowLayout,
    workflow_params: WorkflowParams,
    scheduler: &'a dyn Scheduler,
    materializer: &'a dyn InputMaterializer,
    updater: &'a dyn InputUpdater,
    max_waves: u32,
}

impl<'a> WaveOrchestrator<'a> {
    pub fn new(
        graph: &'a StepGraph,
        layout: &'a WorkflowLayout,
        workflow_params: WorkflowParams,
        scheduler: &'a dyn Scheduler,
        materializer: &'a dyn InputMaterializer,
        updater: &'a dyn InputUpdater,
    ) -> Self {
        Self {
            graph,
            layout,
            workflow_params,
            scheduler,
            materializer,
            updater,
            max_waves: DEFAULT_MAX_WAVES,
        }
    }

    pub fn set_max_waves(&mut self, max_waves: u32) {
        self.max_waves = max_waves;
    }

    /// Begins (or restarts) one wave of a step.
    ///
    /// `wave_id` is the wave the caller knows about: for a normal
    /// begin it is the wave to run, for a restart attempt it is the
    /// wave that just finished. Returns without error and without
    /// submitting anything when there is no work (nothing to restart,
    /// or no inputs materialized).
    pub fn run(&mut self, step_id: &str, wave_id: u32, attempt_restart: bool) -> Result<()> {
        let step = self.graph.step(step_id)?.clone();

        let (wave_id, restarting) = if attempt_restart {
            if !step.attempt_restart {
                warn!("Step '{}' is not configured for restarts", step_id);
                return Ok(());
            }
            match self.allocate_restart_wave(step_id, wave_id)? {
                Some(next_wave) => (next_wave, true),
                None => {
                    info!("No failed calculations in wave {} of '{}'", wave_id, step_id);
                    return Ok(());
                }
            }
        } else {
            (wave_id, false)
        };

        info!(
            "Beginning wave {} of step '{}'{}",
            wave_id,
            step_id,
            if restarting { " (restart)" } else { "" }
        );

        let wave_dir = self.create_wave_dirs(step_id, wave_id)?;

        let input_names = if restarting {
            let failed = self.failed_inputs(step_id, wave_id - 1, &step)?;
            self.update_failed_inputs(&failed, &step, &wave_dir)?
        } else {
            let sources = self.resolve_sources(step_id, wave_id, &step)?;
            self.materialize_inputs(&sources, step_id, &step, &wave_dir)?
        };

        if input_names.is_empty() {
            info!("No inputs for wave {} of '{}'; nothing to submit", wave_id, step_id);
            return Ok(());
        }

        let manifest = Manifest::new(&wave_dir);
        let array_size = manifest.write(&input_names)?;
        info!("Wrote manifest with {} entries", array_size);

        let job_id = self.submit_array_job(step_id, wave_id, &step, array_size, &wave_dir)?;

        self.queue_dependents(step_id, wave_id, job_id)?;
        self.queue_restarter(step_id, wave_id, &step, job_id)?;

        Ok(())
    }

    /// Allocates the next wave when the finished wave left failures.
    /// Returns `None` when there is nothing to restart.
    fn allocate_restart_wave(&mut self, step_id: &str, finished_wave: u32) -> Result<Option<u32>> {
        let failed_dir = self.layout.failed_dir(step_id, finished_wave);
        let has_failures = failed_dir.is_dir()
            && fs::read_dir(&failed_dir)?.filter_map(|e| e.ok()).next().is_some();

        if !has_failures {
            return Ok(None);
        }

        let next_wave = finished_wave + 1;
        if next_wave > self.workflow_params.num_waves {
            self.workflow_params.num_waves = next_wave;
            self.workflow_params.save(self.layout.workflow_dir())?;
        }

        Ok(Some(next_wave))
    }

    fn create_wave_dirs(&self, step_id: &str, wave_id: u32) -> Result<PathBuf> {
        let wave_dir = self.layout.wave_dir(step_id, wave_id);
        for subdir in self.graph.required_subdirectories(step_id)? {
            fs::create_dir_all(wave_dir.join(subdir))?;
        }
        Ok(wave_dir)
    }

    /// Resolves the source artifacts for a normal (non-restart) wave.
    fn resolve_sources(
        &self,
        step_id: &str,
        wave_id: u32,
        step: &StepParams,
    ) -> Result<Vec<PathBuf>> {
        if step_id == self.graph.initial_step_id() {
            return self.layout.raw_structures();
        }

        let predecessor_id = self.graph.previous_step(step_id)?;
        let predecessor = self.graph.step(predecessor_id)?;

        let completed_dir = self.layout.completed_dir(predecessor_id, wave_id);
        if !completed_dir.is_dir() {
            return Err(FlowError::MissingUpstreamArtifacts(completed_dir));
        }

        let mut outputs: Vec<PathBuf> = fs::read_dir(&completed_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e == predecessor.program.output_extension())
                    .unwrap_or(false)
            })
            .collect();
        outputs.sort();

        if outputs.is_empty() {
            return Err(FlowError::MissingUpstreamArtifacts(completed_dir));
        }

        let expected_counts = self.layout.expected_conformers()?;
        let program = predecessor.program;

        selector::filter(outputs, step, predecessor, &expected_counts, |path| {
            extract_energy(path, program)
        })
    }

    /// Lists the failed input artifacts of a finished wave.
    fn failed_inputs(
        &self,
        step_id: &str,
        finished_wave: u32,
        step: &StepParams,
    ) -> Result<Vec<PathBuf>> {
        let failed_dir = self.layout.failed_dir(step_id, finished_wave);
        if !failed_dir.is_dir() {
            return Err(FlowError::MissingUpstreamArtifacts(failed_dir));
        }

        let mut inputs: Vec<PathBuf> = fs::read_dir(&failed_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e == step.program.input_extension())
                    .unwrap_or(false)
            })
            .collect();
        inputs.sort();
        Ok(inputs)
    }

    /// The deterministic input filename a source artifact maps to.
    fn input_name(&self, source: &Path, step_id: &str, step: &StepParams) -> String {
        // Sources always carry a conformer field (raw structures and
        // conformer-step outputs alike); it is dropped when this step
        // does not track conformers.
        let mut name = ArtifactName::from_path(source, true);
        if !step.conformers {
            name.conformer = None;
        }
        name.input_filename(step_id, step.program.input_extension())
    }

    /// Materializes inputs for a normal wave. A failure for one
    /// molecule is logged and skipped so it cannot block the rest.
    fn materialize_inputs(
        &self,
        sources: &[PathBuf],
        step_id: &str,
        step: &StepParams,
        wave_dir: &Path,
    ) -> Result<Vec<String>> {
        let source_format = if step_id == self.graph.initial_step_id() {
            RAW_STRUCTURE_EXTENSION
        } else {
            let predecessor_id = self.graph.previous_step(step_id)?;
            self.graph.step(predecessor_id)?.program.geometry_format()
        };

        let mut input_names = Vec::new();
        for source in sources {
            let file_name = self.input_name(source, step_id, step);
            let dest = wave_dir.join(&file_name);
            let reference = self
                .layout
                .reference_structure(&ArtifactName::from_path(source, true).molecule_key);

            match self
                .materializer
                .materialize(step, &dest, source, source_format, Some(&reference))
            {
                Ok(()) => input_names.push(file_name),
                Err(e) => {
                    error!("Failed to materialize input for {}: {}", source.display(), e);
                }
            }
        }
        Ok(input_names)
    }

    /// Rewrites failed inputs into the new wave. Inputs the updater
    /// deems unrecoverable stay in the failed directory untouched.
    fn update_failed_inputs(
        &self,
        failed: &[PathBuf],
        step: &StepParams,
        wave_dir: &Path,
    ) -> Result<Vec<String>> {
        let mut input_names = Vec::new();
        for input in failed {
            let output = with_extension(input, step.program.output_extension());
            match self.updater.update(input, &output, wave_dir) {
                Ok(true) => {
                    if let Some(name) = input.file_name().and_then(|n| n.to_str()) {
                        input_names.push(name.to_string());
                    }
                }
                Ok(false) => {
                    info!("{} is not retryable; leaving in place", input.display());
                }
                Err(e) => {
                    error!("Failed to update {}: {}", input.display(), e);
                }
            }
        }
        Ok(input_names)
    }

    fn submit_array_job(
        &self,
        step_id: &str,
        wave_id: u32,
        step: &StepParams,
        array_size: usize,
        wave_dir: &Path,
    ) -> Result<JobId> {
        let job_name = format!("{}_{}", self.layout.workflow_name(), step_id);
        let body = commands::array_task_commands(step_id, wave_id, step.timelim);

        let script_path = wave_dir.join(format!("{}.sbatch", step_id));
        JobScript::for_step(&job_name, step, array_size, &body).write(&script_path)?;

        self.scheduler.submit(&script_path)
    }

    /// Queues one zero-work submitter job per dependent step, gated on
    /// the array job reaching any terminal state.
    fn queue_dependents(&self, step_id: &str, wave_id: u32, job_id: JobId) -> Result<()> {
        for dependent_id in self.graph.dependents(step_id)? {
            let step_dir = self.layout.step_dir(dependent_id);
            fs::create_dir_all(&step_dir)?;

            let job_name = format!(
                "{}_{}_submitter",
                self.layout.workflow_name(),
                dependent_id
            );
            let body = commands::begin_command(dependent_id, wave_id, false);

            let script_path = step_dir.join(format!("{}_submitter.sbatch", dependent_id));
            JobScript::new(&job_name, 10, &body)
                .stdout_pattern("/dev/null")
                .stderr_pattern("/dev/null")
                .dependency(DependencyType::AfterAny, job_id)
                .write(&script_path)?;

            let dependent_job = self.scheduler.submit(&script_path)?;
            info!(
                "Queued dependent '{}' as job {} after job {}",
                dependent_id, dependent_job, job_id
            );
        }
        Ok(())
    }

    /// Queues the restarter job that re-enters this step with
    /// `--attempt-restart` once the array job finishes.
    fn queue_restarter(
        &self,
        step_id: &str,
        wave_id: u32,
        step: &StepParams,
        job_id: JobId,
    ) -> Result<()> {
        if !step.attempt_restart {
            return Ok(());
        }
        if wave_id >= self.max_waves {
            warn!(
                "Wave {} of '{}' reached the restart cap ({}); not queueing a restarter",
                wave_id, step_id, self.max_waves
            );
            return Ok(());
        }

        let job_name = format!("{}_{}_restarter", self.layout.workflow_name(), step_id);
        let body = commands::begin_command(step_id, wave_id, true);

        let script_path = self
            .layout
            .step_dir(step_id)
            .join(format!("{}_restarter.sbatch", step_id));
        JobScript::new(&job_name, 10, &body)
            .stdout_pattern("/dev/null")
            .stderr_pattern("/dev/null")
            .dependency(DependencyType::AfterAny, job_id)
            .write(&script_path)?;

        let restarter_job = self.scheduler.submit(&script_path)?;
        info!(
            "Queued restarter for '{}' as job {} after job {}",
            step_id, restarter_job, job_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::materialize::{CopyMaterializer, GaussianRestartUpdater};
    use crate::scheduler::slurm::MockScheduler;
    use tempfile::tempdir;

    const CONFIG: &str = r##"
default:
  initial_step: A
  steps:
    A:
      program: gaussian16
      route: "#p opt b3lyp/6-31G(d)"
      opt: true
      conformers: true
      proceed_on_failed_conf: false
      attempt_restart: true
      dependents: [B]
    B:
      program: gaussian16
      route: "#p sp b3lyp/6-31G(d)"
      single_point: true
"##;

    struct Fixture {
        _temp: tempfile::TempDir,
        graph: StepGraph,
        layout: WorkflowLayout,
        workflow_params: WorkflowParams,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().unwrap();
        let workflow_dir = temp.path().join("my_workflow");
        fs::create_dir_all(workflow_dir.join("unopt_pdbs")).unwrap();

        let config_path = temp.path().join(".flow_config");
        fs::write(&config_path, CONFIG).unwrap();

        let graph = StepGraph::load(&config_path, "default").unwrap();
        let layout = WorkflowLayout::new(&workflow_dir);
        let workflow_params = WorkflowParams::new(config_path, "default".into());
        workflow_params.save(&workflow_dir).unwrap();

        Fixture {
            _temp: temp,
            graph,
            layout,
            workflow_params,
        }
    }

    fn orchestrator<'a>(
        fixture: &'a Fixture,
        scheduler: &'a MockScheduler,
        materializer: &'a CopyMaterializer,
        updater: &'a GaussianRestartUpdater,
    ) -> WaveOrchestrator<'a> {
        WaveOrchestrator::new(
            &fixture.graph,
            &fixture.layout,
            fixture.workflow_params.clone(),
            scheduler,
            materializer,
            updater,
        )
    }

    fn add_raw_structures(fixture: &Fixture, key: &str, conformers: usize) {
        let unopt = fixture.layout.unopt_structures_dir();
        for i in 0..conformers {
            fs::write(unopt.join(format!("{}_{}.pdb", key, i)), "ATOM\n").unwrap();
        }
    }

    /// Writes a completed output for step A. The energy is in
    /// hartrees; only the relative ordering matters.
    fn add_completed_output(fixture: &Fixture, key: &str, conformer: usize, energy: f64) {
        let completed = fixture.layout.completed_dir("A", 1);
        fs::create_dir_all(&completed).unwrap();
        let content = format!(
            "SCF Done:  E(RB3LYP) =  {:.9}     A.U. after   10 cycles\nNormal termination\n",
            energy
        );
        fs::write(
            completed.join(format!("{}_A_{}.log", key, conformer)),
            content,
        )
        .unwrap();
    }

    #[test]
    fn test_initial_step_materializes_raw_structures() {
        let fx = fixture();
        add_raw_structures(&fx, "KEY-A", 3);

        let scheduler = MockScheduler::new();
        let materializer = CopyMaterializer::new(false);
        let updater = GaussianRestartUpdater;
        let mut orch = orchestrator(&fx, &scheduler, &materializer, &updater);

        orch.run("A", 1, false).unwrap();

        let manifest = Manifest::new(&fx.layout.wave_dir("A", 1));
        assert_eq!(
            manifest.entries().unwrap(),
            vec!["KEY-A_A_0.com", "KEY-A_A_1.com", "KEY-A_A_2.com"]
        );
        for name in manifest.entries().unwrap() {
            assert!(fx.layout.wave_dir("A", 1).join(name).exists());
        }
    }

    #[test]
    fn test_array_dependent_and_restarter_submissions() {
        let fx = fixture();
        add_raw_structures(&fx, "KEY-A", 2);

        let scheduler = MockScheduler::new();
        let materializer = CopyMaterializer::new(false);
        let updater = GaussianRestartUpdater;
        let mut orch = orchestrator(&fx, &scheduler, &materializer, &updater);

        orch.run("A", 1, false).unwrap();

        let scripts = scheduler.submitted_scripts();
        assert_eq!(scripts.len(), 3);

        // array job with chained run and handle commands
        assert!(scripts[0].contains("#SBATCH --array=1-2%50"));
        assert!(scripts[0].contains("qcflow run --step-id \"A\" --wave-id 1 --time 1440"));
        assert!(scripts[0].contains("qcflow handle --step-id \"A\" --wave-id 1"));

        // dependent submitter gated on the array job
        assert!(scripts[1].contains("#SBATCH --dependency=afterany:1000"));
        assert!(scripts[1].contains("qcflow begin --step-id \"B\" --wave-id 1"));

        // restarter re-enters this step
        assert!(scripts[2].contains("#SBATCH --dependency=afterany:1000"));
        assert!(scripts[2].contains("qcflow begin --step-id \"A\" --wave-id 1 --attempt-restart"));
    }

    #[test]
    fn test_later_step_selects_lowest_energy_conformer() {
        let fx = fixture();
        add_raw_structures(&fx, "MOLKEY", 3);
        add_completed_output(&fx, "MOLKEY", 0, 4.0);
        add_completed_output(&fx, "MOLKEY", 1, 1.5);
        add_completed_output(&fx, "MOLKEY", 2, 7.0);

        let scheduler = MockScheduler::new();
        let materializer = CopyMaterializer::new(false);
        let updater = GaussianRestartUpdater;
        let mut orch = orchestrator(&fx, &scheduler, &materializer, &updater);

        orch.run("B", 1, false).unwrap();

        let manifest = Manifest::new(&fx.layout.wave_dir("B", 1));
        assert_eq!(manifest.entries().unwrap(), vec!["MOLKEY_B.com"]);

        // the materialized input came from conformer 1
        let input = fs::read_to_string(fx.layout.wave_dir("B", 1).join("MOLKEY_B.com")).unwrap();
        assert!(input.contains("1.500000000"));
    }

    #[test]
    fn test_missing_predecessor_output_is_fatal() {
        let fx = fixture();

        let scheduler = MockScheduler::new();
        let materializer = CopyMaterializer::new(false);
        let updater = GaussianRestartUpdater;
        let mut orch = orchestrator(&fx, &scheduler, &materializer, &updater);

        let result = orch.run("B", 1, false);
        assert!(matches!(result, Err(FlowError::MissingUpstreamArtifacts(_))));
        assert!(scheduler.submitted_scripts().is_empty());
    }

    #[test]
    fn test_empty_predecessor_output_is_fatal() {
        let fx = fixture();
        fs::create_dir_all(fx.layout.completed_dir("A", 1)).unwrap();

        let scheduler = MockScheduler::new();
        let materializer = CopyMaterializer::new(false);
        let updater = GaussianRestartUpdater;
        let mut orch = orchestrator(&fx, &scheduler, &materializer, &updater);

        let result = orch.run("B", 1, false);
        assert!(matches!(result, Err(FlowError::MissingUpstreamArtifacts(_))));
        assert!(scheduler.submitted_scripts().is_empty());
        assert!(!fx.layout.manifest_path("B", 1).exists());
    }

    #[test]
    fn test_all_molecules_dropped_short_circuits_without_submission() {
        let fx = fixture();
        add_raw_structures(&fx, "MOLKEY", 3);
        // Only one of three conformers finished; the molecule is dropped
        // wholesale and nothing is left to submit.
        add_completed_output(&fx, "MOLKEY", 0, 4.0);

        let scheduler = MockScheduler::new();
        let materializer = CopyMaterializer::new(false);
        let updater = GaussianRestartUpdater;
        let mut orch = orchestrator(&fx, &scheduler, &materializer, &updater);

        orch.run("B", 1, false).unwrap();

        assert!(scheduler.submitted_scripts().is_empty());
        assert!(!fx.layout.manifest_path("B", 1).exists());
    }

    #[test]
    fn test_restart_with_no_failures_is_a_noop() {
        let fx = fixture();
        fs::create_dir_all(fx.layout.failed_dir("A", 1)).unwrap();

        let scheduler = MockScheduler::new();
        let materializer = CopyMaterializer::new(false);
        let updater = GaussianRestartUpdater;
        let mut orch = orchestrator(&fx, &scheduler, &materializer, &updater);

        orch.run("A", 1, true).unwrap();

        assert!(scheduler.submitted_scripts().is_empty());
        let reloaded = WorkflowParams::load(fx.layout.workflow_dir()).unwrap();
        assert_eq!(reloaded.num_waves, 1);
    }

    #[test]
    fn test_restart_allocates_next_wave_and_persists_counter() {
        let fx = fixture();
        add_raw_structures(&fx, "KEY-A", 1);

        // Wave 1 left one retryable failure behind.
        let failed = fx.layout.failed_dir("A", 1);
        fs::create_dir_all(&failed).unwrap();
        fs::write(failed.join("KEY-A_A_0.com"), "#p opt b3lyp\n\nt\n\n0 1\n").unwrap();
        fs::write(failed.join("KEY-A_A_0.log"), "SCF Done: died\n").unwrap();

        let scheduler = MockScheduler::new();
        let materializer = CopyMaterializer::new(false);
        let updater = GaussianRestartUpdater;
        let mut orch = orchestrator(&fx, &scheduler, &materializer, &updater);

        orch.run("A", 1, true).unwrap();

        // wave 2 holds the rewritten input and its manifest
        let manifest = Manifest::new(&fx.layout.wave_dir("A", 2));
        assert_eq!(manifest.entries().unwrap(), vec!["KEY-A_A_0.com"]);
        assert!(fx.layout.wave_dir("A", 2).join("KEY-A_A_0.com").exists());

        let reloaded = WorkflowParams::load(fx.layout.workflow_dir()).unwrap();
        assert_eq!(reloaded.num_waves, 2);

        // the array job targets wave 2
        let scripts = scheduler.submitted_scripts();
        assert!(scripts[0].contains("qcflow run --step-id \"A\" --wave-id 2"));
    }

    #[test]
    fn test_unretryable_failure_stays_in_failed_dir() {
        let fx = fixture();

        let failed = fx.layout.failed_dir("A", 1);
        fs::create_dir_all(&failed).unwrap();
        fs::write(failed.join("KEY-A_A_0.com"), "#p opt b3lyp\n\nt\n\n0 1\n").unwrap();
        fs::write(
            failed.join("KEY-A_A_0.log"),
            "Error termination via Lnk1e in /g16/l301.exe\n",
        )
        .unwrap();

        let scheduler = MockScheduler::new();
        let materializer = CopyMaterializer::new(false);
        let updater = GaussianRestartUpdater;
        let mut orch = orchestrator(&fx, &scheduler, &materializer, &updater);

        orch.run("A", 1, true).unwrap();

        // nothing materialized, nothing submitted, artifact untouched
        assert!(scheduler.submitted_scripts().is_empty());
        assert!(failed.join("KEY-A_A_0.com").exists());
    }

    #[test]
    fn test_restart_cap_suppresses_restarter_job() {
        let fx = fixture();
        add_raw_structures(&fx, "KEY-A", 1);

        let scheduler = MockScheduler::new();
        let materializer = CopyMaterializer::new(false);
        let updater = GaussianRestartUpdater;
        let mut orch = orchestrator(&fx, &scheduler, &materializer, &updater);
        orch.set_max_waves(1);

        orch.run("A", 1, false).unwrap();

        let scripts = scheduler.submitted_scripts();
        // array job and dependent submitter only
        assert_eq!(scripts.len(), 2);
        assert!(!scripts.iter().any(|s| s.contains("--attempt-restart")));
    }
}
