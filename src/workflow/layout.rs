//! Workflow Directory Layout
//!
//! Path arithmetic for a workflow directory tree and persistence of
//! the workflow-wide parameter record.
//!
//! A workflow root looks like:
//!
//! ```text
//! my_workflow/
//!   .workflow_params          # config source, config ID, wave counter
//!   unopt_pdbs/               # raw per-conformer structures: {key}_{i}.pdb
//!   opt/
//!     wave_1_calcs/
//!       input_files.txt       # the wave manifest
//!       completed/
//!       failed/
//!   sp/
//!     ...
//! ```
//!
//! The filesystem is the sole synchronization medium between the
//! short-lived engine processes; everything the engine knows about a
//! wave is derived from this layout.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::workflow::artifact::molecule_key;

/// Well-known name of the workflow parameter record.
pub const WORKFLOW_PARAMS_FILENAME: &str = ".workflow_params";

/// Directory holding the raw, unoptimized per-conformer structures.
pub const UNOPT_STRUCTURES_DIR: &str = "unopt_pdbs";

/// File extension of raw structure files.
pub const RAW_STRUCTURE_EXTENSION: &str = "pdb";

/// Workflow-wide parameter record, stored as JSON at the workflow root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowParams {
    /// Path to the step configuration file
    pub config_file: PathBuf,
    /// Configuration ID within that file
    pub config_id: String,
    /// Highest wave number allocated so far, workflow-wide
    pub num_waves: u32,
    /// Optional long-term archive directory for saved outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<PathBuf>,
    /// Creation timestamp
    pub created: DateTime<Utc>,
}

impl WorkflowParams {
    /// Creates a fresh record for a new workflow.
    pub fn new(config_file: PathBuf, config_id: String) -> Self {
        Self {
            config_file,
            config_id,
            num_waves: 1,
            archive_dir: None,
            created: Utc::now(),
        }
    }

    /// Loads the record from a workflow root.
    pub fn load(workflow_dir: &Path) -> Result<Self> {
        let path = workflow_dir.join(WORKFLOW_PARAMS_FILENAME);
        let content = fs::read_to_string(&path)?;
        let params: WorkflowParams = serde_json::from_str(&content).map_err(|e| {
            FlowError::Config(format!(
                "failed to parse workflow parameters '{}': {}",
                path.display(),
                e
            ))
        })?;
        debug!("Loaded workflow parameters from {}", path.display());
        Ok(params)
    }

    /// Saves the record to a workflow root.
    pub fn save(&self, workflow_dir: &Path) -> Result<()> {
        let path = workflow_dir.join(WORKFLOW_PARAMS_FILENAME);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| FlowError::Config(format!("failed to serialize parameters: {}", e)))?;
        fs::write(&path, json)?;
        info!("Saved workflow parameters to {}", path.display());
        Ok(())
    }
}

/// Searches upwards from `start_dir` for a directory containing
/// `filename` and returns the path to the found file.
pub fn upsearch(filename: &str, start_dir: &Path) -> Result<PathBuf> {
    let mut dir = start_dir.canonicalize()?;

    loop {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            return Err(FlowError::Config(format!(
                "'{}' not found in '{}' or any parent directory; \
                 run this command inside a workflow directory",
                filename,
                start_dir.display()
            )));
        }
    }
}

/// Path arithmetic for one workflow directory tree.
#[derive(Debug, Clone)]
pub struct WorkflowLayout {
    workflow_dir: PathBuf,
}

impl WorkflowLayout {
    /// Wraps an existing workflow root.
    pub fn new(workflow_dir: impl Into<PathBuf>) -> Self {
        Self {
            workflow_dir: workflow_dir.into(),
        }
    }

    /// Locates the enclosing workflow by searching upwards for the
    /// parameter record.
    pub fn discover(start_dir: &Path) -> Result<Self> {
        let params_file = upsearch(WORKFLOW_PARAMS_FILENAME, start_dir)?;
        let workflow_dir = params_file
            .parent()
            .expect("parameter record has a parent directory")
            .to_path_buf();
        Ok(Self::new(workflow_dir))
    }

    /// The workflow root directory.
    pub fn workflow_dir(&self) -> &Path {
        &self.workflow_dir
    }

    /// Name of the workflow (the root directory name).
    pub fn workflow_name(&self) -> &str {
        self.workflow_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workflow")
    }

    /// Directory of raw unoptimized structures.
    pub fn unopt_structures_dir(&self) -> PathBuf {
        self.workflow_dir.join(UNOPT_STRUCTURES_DIR)
    }

    /// Reference structure for a molecule: the first raw conformer.
    pub fn reference_structure(&self, molecule_key: &str) -> PathBuf {
        self.unopt_structures_dir()
            .join(format!("{}_0.{}", molecule_key, RAW_STRUCTURE_EXTENSION))
    }

    /// Top-level directory of one step.
    pub fn step_dir(&self, step_id: &str) -> PathBuf {
        self.workflow_dir.join(step_id)
    }

    /// Working directory of one wave of a step.
    pub fn wave_dir(&self, step_id: &str, wave_id: u32) -> PathBuf {
        self.step_dir(step_id)
            .join(format!("wave_{}_calcs", wave_id))
    }

    /// The `completed` subdirectory of a wave.
    pub fn completed_dir(&self, step_id: &str, wave_id: u32) -> PathBuf {
        self.wave_dir(step_id, wave_id).join("completed")
    }

    /// The `failed` subdirectory of a wave.
    pub fn failed_dir(&self, step_id: &str, wave_id: u32) -> PathBuf {
        self.wave_dir(step_id, wave_id).join("failed")
    }

    /// Path of a wave's manifest file.
    pub fn manifest_path(&self, step_id: &str, wave_id: u32) -> PathBuf {
        self.wave_dir(step_id, wave_id)
            .join(crate::workflow::manifest::MANIFEST_FILENAME)
    }

    /// Lists the raw structure files of the workflow.
    pub fn raw_structures(&self) -> Result<Vec<PathBuf>> {
        let dir = self.unopt_structures_dir();
        if !dir.is_dir() {
            return Err(FlowError::MissingUpstreamArtifacts(dir));
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e == RAW_STRUCTURE_EXTENSION)
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Expected conformer count per molecule key, derived from the raw
    /// structure population: `{key}_{i}.pdb` files are counted per key.
    pub fn expected_conformers(&self) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        for file in self.raw_structures()? {
            *counts.entry(molecule_key(&file)).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_params_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let params = WorkflowParams::new(PathBuf::from("/conf/.flow_config"), "default".into());
        params.save(temp_dir.path()).unwrap();

        let loaded = WorkflowParams::load(temp_dir.path()).unwrap();
        assert_eq!(loaded.config_id, "default");
        assert_eq!(loaded.num_waves, 1);
        assert!(loaded.archive_dir.is_none());
    }

    #[test]
    fn test_params_load_missing() {
        let temp_dir = tempdir().unwrap();
        assert!(WorkflowParams::load(temp_dir.path()).is_err());
    }

    #[test]
    fn test_upsearch_finds_in_parent() {
        let temp_dir = tempdir().unwrap();
        let nested = temp_dir.path().join("opt").join("wave_1_calcs");
        fs::create_dir_all(&nested).unwrap();
        fs::write(temp_dir.path().join(WORKFLOW_PARAMS_FILENAME), "{}").unwrap();

        let found = upsearch(WORKFLOW_PARAMS_FILENAME, &nested).unwrap();
        assert_eq!(
            found.canonicalize().unwrap(),
            temp_dir
                .path()
                .join(WORKFLOW_PARAMS_FILENAME)
                .canonicalize()
                .unwrap()
        );
    }

    #[test]
    fn test_upsearch_not_found() {
        let temp_dir = tempdir().unwrap();
        let result = upsearch(".does_not_exist", temp_dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_discover_from_nested_dir() {
        let temp_dir = tempdir().unwrap();
        let nested = temp_dir.path().join("opt");
        fs::create_dir_all(&nested).unwrap();
        let params = WorkflowParams::new(PathBuf::from("cfg"), "default".into());
        params.save(temp_dir.path()).unwrap();

        let layout = WorkflowLayout::discover(&nested).unwrap();
        assert_eq!(
            layout.workflow_dir().canonicalize().unwrap(),
            temp_dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_wave_paths() {
        let layout = WorkflowLayout::new("/wf");
        assert_eq!(
            layout.wave_dir("opt", 2),
            PathBuf::from("/wf/opt/wave_2_calcs")
        );
        assert_eq!(
            layout.completed_dir("opt", 2),
            PathBuf::from("/wf/opt/wave_2_calcs/completed")
        );
        assert_eq!(
            layout.failed_dir("opt", 2),
            PathBuf::from("/wf/opt/wave_2_calcs/failed")
        );
    }

    #[test]
    fn test_reference_structure_path() {
        let layout = WorkflowLayout::new("/wf");
        assert_eq!(
            layout.reference_structure("KEY-A"),
            PathBuf::from("/wf/unopt_pdbs/KEY-A_0.pdb")
        );
    }

    #[test]
    fn test_raw_structures_missing_dir() {
        let temp_dir = tempdir().unwrap();
        let layout = WorkflowLayout::new(temp_dir.path());
        assert!(matches!(
            layout.raw_structures(),
            Err(FlowError::MissingUpstreamArtifacts(_))
        ));
    }

    #[test]
    fn test_expected_conformers_counted_per_key() {
        let temp_dir = tempdir().unwrap();
        let layout = WorkflowLayout::new(temp_dir.path());
        let unopt = layout.unopt_structures_dir();
        fs::create_dir_all(&unopt).unwrap();

        for name in ["KEY-A_0.pdb", "KEY-A_1.pdb", "KEY-A_2.pdb", "KEY-B_0.pdb"] {
            fs::write(unopt.join(name), "").unwrap();
        }
        // A non-structure file is ignored
        fs::write(unopt.join("notes.txt"), "").unwrap();

        let counts = layout.expected_conformers().unwrap();
        assert_eq!(counts["KEY-A"], 3);
        assert_eq!(counts["KEY-B"], 1);
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_raw_structures_sorted() {
        let temp_dir = tempdir().unwrap();
        let layout = WorkflowLayout::new(temp_dir.path());
        let unopt = layout.unopt_structures_dir();
        fs::create_dir_all(&unopt).unwrap();
        for name in ["KEY-B_0.pdb", "KEY-A_1.pdb", "KEY-A_0.pdb"] {
            fs::write(unopt.join(name), "").unwrap();
        }

        let files: Vec<String> = layout
            .raw_structures()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(files, vec!["KEY-A_0.pdb", "KEY-A_1.pdb", "KEY-B_0.pdb"]);
    }
}
