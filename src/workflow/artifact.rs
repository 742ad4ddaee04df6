//! Artifact Naming
//!
//! Deterministic naming of per-molecule input artifacts and parsing of
//! the `{key}_{step}[_{conformer}]` stem convention.
//!
//! The molecule key is a content-derived structural hash (an InChIKey
//! in practice) and never contains the separator character; the
//! conformer index, when present, is the final field of the stem.

use std::path::{Path, PathBuf};

use crate::workflow::params::RESERVED_SEPARATOR;

/// Parsed identity of a molecule artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    /// Content-derived stable molecule identifier
    pub molecule_key: String,
    /// Conformer index, when the owning step has conformers
    pub conformer: Option<String>,
}

impl ArtifactName {
    /// Parses an artifact file stem.
    ///
    /// The first separator-delimited field is the molecule key; when
    /// `has_conformers` is set the final field is the conformer index.
    pub fn parse(stem: &str, has_conformers: bool) -> Self {
        let fields: Vec<&str> = stem.split(RESERVED_SEPARATOR).collect();
        let molecule_key = fields[0].to_string();

        let conformer = if has_conformers && fields.len() > 1 {
            Some(fields[fields.len() - 1].to_string())
        } else {
            None
        };

        Self {
            molecule_key,
            conformer,
        }
    }

    /// Parses the stem of an artifact path.
    pub fn from_path(path: &Path, has_conformers: bool) -> Self {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        Self::parse(stem, has_conformers)
    }

    /// The deterministic input filename for this artifact in the given
    /// step: `{key}_{step}_{conformer}.{ext}` with conformers,
    /// `{key}_{step}.{ext}` without.
    pub fn input_filename(&self, step_id: &str, extension: &str) -> String {
        match &self.conformer {
            Some(conf) => format!(
                "{}{sep}{}{sep}{}.{}",
                self.molecule_key,
                step_id,
                conf,
                extension,
                sep = RESERVED_SEPARATOR
            ),
            None => format!(
                "{}{sep}{}.{}",
                self.molecule_key,
                step_id,
                extension,
                sep = RESERVED_SEPARATOR
            ),
        }
    }
}

/// Returns the molecule key of an artifact path (the stem's first
/// separator-delimited field).
pub fn molecule_key(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .split(RESERVED_SEPARATOR)
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Replaces a path's extension, yielding the program output artifact
/// that corresponds to an input artifact.
pub fn with_extension(path: &Path, extension: &str) -> PathBuf {
    path.with_extension(extension)
}
