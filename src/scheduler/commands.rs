//! Re-entry Commands
//!
//! Builds the command lines embedded in job scripts. Each command
//! re-enters this engine through the CLI with the step and wave
//! identifiers baked in; the array-task index comes from the
//! scheduler's environment at run time.

/// Command that runs one array calculation for a step.
pub fn run_command(step_id: &str, wave_id: u32, time_minutes: u32) -> String {
    format!(
        "qcflow run --step-id \"{}\" --wave-id {} --time {}",
        step_id, wave_id, time_minutes
    )
}

/// Command that handles one finished array calculation's output.
pub fn handle_command(step_id: &str, wave_id: u32) -> String {
    format!("qcflow handle --step-id \"{}\" --wave-id {}", step_id, wave_id)
}

/// Command that begins a workflow step, optionally as a restart
/// attempt.
pub fn begin_command(step_id: &str, wave_id: u32, attempt_restart: bool) -> String {
    if attempt_restart {
        format!(
            "qcflow begin --step-id \"{}\" --wave-id {} --attempt-restart",
            step_id, wave_id
        )
    } else {
        format!("qcflow begin --step-id \"{}\" --wave-id {}", step_id, wave_id)
    }
}

/// The full array-task body: run the calculation, then handle its
/// output in the same task.
pub fn array_task_commands(step_id: &str, wave_id: u32, time_minutes: u32) -> String {
    format!(
        "{}\n{}",
        run_command(step_id, wave_id, time_minutes),
        handle_command(step_id, wave_id)
    )
}
