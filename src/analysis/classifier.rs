//! Output Classification
//!
//! Decides whether a finished job's output artifact represents a
//! completed or a failed calculation.
//!
//! Each supported program prints a success marker once per finished
//! job phase. The expected marker count follows from the step's
//! calculation flags: an optimization and a frequency analysis each
//! terminate once, so a combined opt+freq job must terminate exactly
//! twice. A crashed or timed-out job leaves fewer markers (usually
//! zero) and is classified as failed. Classification only reads the
//! artifact; it never mutates anything.

use std::fs;
use std::path::Path;

use log::debug;

use crate::error::Result;
use crate::workflow::params::StepParams;

/// Counts non-overlapping occurrences of `marker` in the file at
/// `path`. A missing file counts as zero occurrences: an absent output
/// is indistinguishable from a crash before any output was written.
pub fn count_marker(path: &Path, marker: &str) -> usize {
    match fs::read_to_string(path) {
        Ok(content) => content.matches(marker).count(),
        Err(_) => 0,
    }
}

/// Number of success markers a completed calculation must print.
pub fn expected_marker_count(params: &StepParams) -> usize {
    if params.opt || params.freq {
        usize::from(params.opt) + usize::from(params.freq)
    } else {
        // single-point and bare runs terminate exactly once
        1
    }
}

/// Returns true when the output artifact represents a successfully
/// completed calculation for the given step.
pub fn is_complete(output: &Path, params: &StepParams) -> Result<bool> {
    let marker = params.program.success_marker();
    let actual = count_marker(output, marker);
    let expected = expected_marker_count(params);

    debug!(
        "{}: {} of {} success markers",
        output.display(),
        actual,
        expected
    );

    Ok(actual == expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use serde_yaml::Value;
    use tempfile::tempdir;

    fn gaussian_params(opt: bool, freq: bool, single_point: bool) -> StepParams {
        let mut raw = BTreeMap::new();
        raw.insert("program".to_string(), Value::from("gaussian16"));
        raw.insert("route".to_string(), Value::from("#p pm7"));
        raw.insert("opt".to_string(), Value::Bool(opt));
        raw.insert("freq".to_string(), Value::Bool(freq));
        raw.insert("single_point".to_string(), Value::Bool(single_point));
        StepParams::from_raw("test", &raw).unwrap()
    }

    fn write_output(dir: &Path, markers: usize) -> std::path::PathBuf {
        let path = dir.join("KEY-A_test.log");
        let mut content = String::from("begin\n");
        for i in 0..markers {
            content.push_str(&format!("Normal termination of Gaussian 16 part {}\n", i));
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_opt_freq_requires_exactly_two_markers() {
        let temp_dir = tempdir().unwrap();
        let params = gaussian_params(true, true, false);

        let two = write_output(temp_dir.path(), 2);
        assert!(is_complete(&two, &params).unwrap());

        let one = write_output(temp_dir.path(), 1);
        assert!(!is_complete(&one, &params).unwrap());

        let three = write_output(temp_dir.path(), 3);
        assert!(!is_complete(&three, &params).unwrap());
    }

    #[test]
    fn test_single_point_requires_one_marker() {
        let temp_dir = tempdir().unwrap();
        let params = gaussian_params(false, false, true);

        let one = write_output(temp_dir.path(), 1);
        assert!(is_complete(&one, &params).unwrap());

        let zero = write_output(temp_dir.path(), 0);
        assert!(!is_complete(&zero, &params).unwrap());
    }

    #[test]
    fn test_zero_markers_is_failed() {
        let temp_dir = tempdir().unwrap();
        let params = gaussian_params(true, false, false);

        let zero = write_output(temp_dir.path(), 0);
        assert!(!is_complete(&zero, &params).unwrap());
    }

    #[test]
    fn test_missing_output_is_failed() {
        let temp_dir = tempdir().unwrap();
        let params = gaussian_params(true, false, false);

        let missing = temp_dir.path().join("never_written.log");
        assert!(!is_complete(&missing, &params).unwrap());
    }

    #[test]
    fn test_expected_count_table() {
        assert_eq!(expected_marker_count(&gaussian_params(true, true, false)), 2);
        assert_eq!(expected_marker_count(&gaussian_params(true, false, false)), 1);
        assert_eq!(expected_marker_count(&gaussian_params(false, true, false)), 1);
        assert_eq!(expected_marker_count(&gaussian_params(false, false, true)), 1);
        assert_eq!(expected_marker_count(&gaussian_params(false, false, false)), 1);
    }

    #[test]
    fn test_gamess_marker() {
        let temp_dir = tempdir().unwrap();

        let mut raw = BTreeMap::new();
        raw.insert("program".to_string(), Value::from("gamess"));
        raw.insert("gbasis".to_string(), Value::from("N31"));
        raw.insert("opt".to_string(), Value::Bool(true));
        let params = StepParams::from_raw("test", &raw).unwrap();

        let path = temp_dir.path().join("KEY-A_test.o");
        fs::write(&path, "EXECUTION OF GAMESS TERMINATED NORMALLY\n").unwrap();
        assert!(is_complete(&path, &params).unwrap());
    }
}
