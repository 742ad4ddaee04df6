//! Wave Manifest
//!
//! The ordered list of input artifact filenames that fixes the
//! array-task-index to artifact mapping for one wave.
//!
//! The manifest is generated once per wave, before the array job is
//! submitted, and is immutable afterwards: its line order *is* the
//! 1-based task-index mapping. Filenames are sorted lexicographically
//! so the same input set always produces a byte-identical manifest,
//! regardless of materialization order. The file is written to a
//! temporary sibling and renamed into place so concurrent readers
//! never observe a partial manifest.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{FlowError, Result};

/// Well-known manifest filename inside a wave directory.
pub const MANIFEST_FILENAME: &str = "input_files.txt";

/// A wave's input manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
}

impl Manifest {
    /// Wraps the manifest location inside a wave directory.
    pub fn new(wave_dir: &Path) -> Self {
        Self {
            path: wave_dir.join(MANIFEST_FILENAME),
        }
    }

    /// Path of the manifest file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the manifest from a set of input filenames.
    ///
    /// Filenames are sorted lexicographically; one per line, with a
    /// trailing newline. Returns the number of entries, which is the
    /// array size of the wave's job.
    pub fn write(&self, filenames: &[String]) -> Result<usize> {
        let mut sorted: Vec<&String> = filenames.iter().collect();
        sorted.sort();

        let mut content = String::new();
        for name in &sorted {
            content.push_str(name);
            content.push('\n');
        }

        // Rename into place so a partially written manifest is never
        // visible to array tasks.
        let tmp_path = self.path.with_extension("txt.tmp");
        fs::write(&tmp_path, &content)?;
        fs::rename(&tmp_path, &self.path)?;

        info!(
            "Wrote manifest with {} entries to {}",
            sorted.len(),
            self.path.display()
        );

        Ok(sorted.len())
    }

    /// Looks up the input filename for a 1-based array task index.
    pub fn lookup(&self, task_index: usize) -> Result<String> {
        let entries = self.entries()?;

        if task_index == 0 || task_index > entries.len() {
            return Err(FlowError::TaskIndexOutOfRange {
                index: task_index,
                manifest: self.path.clone(),
            });
        }

        let name = entries[task_index - 1].clone();
        debug!("Task {} maps to input '{}'", task_index, name);
        Ok(name)
    }

    /// All manifest entries, in task-index order.
    pub fn entries(&self) -> Result<Vec<String>> {
        let content = fs::read_to_string(&self.path)?;
        Ok(content
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Number of entries, which equals the wave's array size.
    pub fn len(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }
}
