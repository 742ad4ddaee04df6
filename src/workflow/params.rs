//! Step Parameters
//!
//! Typed step parameters and the per-program lookup tables used across
//! the engine: file extensions, executable commands, success markers,
//! and scratch-file extensions.
//!
//! Step parameters arrive as a free-form mapping in the configuration
//! file and are validated into a [`StepParams`] struct at load time,
//! with missing optional values filled from the default tables
//! (general defaults first, then program-specific overrides).

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{FlowError, Result};

/// Separator character used in artifact filenames to delimit the
/// molecule key, step ID, and conformer index. Step IDs must not
/// contain it.
pub const RESERVED_SEPARATOR: char = '_';

/// External quantum-chemistry programs a step can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Program {
    Gaussian16,
    Gamess,
}

impl Program {
    /// Parses a configuration program tag.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "gaussian16" => Ok(Program::Gaussian16),
            "gamess" => Ok(Program::Gamess),
            other => Err(FlowError::UnsupportedProgram(other.to_string())),
        }
    }

    /// The configuration tag for this program.
    pub fn tag(&self) -> &'static str {
        match self {
            Program::Gaussian16 => "gaussian16",
            Program::Gamess => "gamess",
        }
    }

    /// Input file extension for generated artifacts.
    pub fn input_extension(&self) -> &'static str {
        match self {
            Program::Gaussian16 => "com",
            Program::Gamess => "inp",
        }
    }

    /// Output file extension produced by the program.
    pub fn output_extension(&self) -> &'static str {
        match self {
            Program::Gaussian16 => "log",
            Program::Gamess => "o",
        }
    }

    /// Geometry format of the program's output, as understood by the
    /// external conversion library.
    pub fn geometry_format(&self) -> &'static str {
        match self {
            Program::Gaussian16 => "log",
            Program::Gamess => "gam",
        }
    }

    /// Executable invoked to run a calculation.
    pub fn command(&self) -> &'static str {
        match self {
            Program::Gaussian16 => "g16",
            Program::Gamess => "rungms",
        }
    }

    /// Marker string printed once per successfully finished job phase.
    pub fn success_marker(&self) -> &'static str {
        match self {
            Program::Gaussian16 => "Normal termination",
            Program::Gamess => "TERMINATED NORMALLY",
        }
    }

    /// Extensions of scratch files purged after a completed calculation.
    pub fn scratch_extensions(&self) -> &'static [&'static str] {
        match self {
            Program::Gaussian16 => &["rwf"],
            Program::Gamess => &["dat", "trj"],
        }
    }
}

/// Fully-resolved parameters for one workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepParams {
    /// External program this step invokes
    pub program: Program,

    /// Geometry optimization requested
    pub opt: bool,
    /// Frequency analysis requested
    pub freq: bool,
    /// Single-point energy calculation
    pub single_point: bool,
    /// Step processes one artifact per conformer
    pub conformers: bool,
    /// Molecules with failed conformers still advance
    pub proceed_on_failed_conf: bool,
    /// Failed calculations are retried in a restart wave
    pub attempt_restart: bool,
    /// Completed outputs are archived to long-term storage
    pub save_output: bool,

    /// Processor count per array task
    pub nproc: u32,
    /// Memory in GB per array task
    pub memory: u32,
    /// Time limit in minutes
    pub timelim: u32,
    /// Extra scheduler minutes beyond the program time limit
    pub timelim_padding: u32,
    /// Scheduler partition
    pub partition: String,
    /// Maximum simultaneously running array tasks
    pub simul_jobs: u32,

    /// Charge offset added to the molecule's derived charge
    pub charge: i32,
    /// Spin multiplicity
    pub multiplicity: u32,

    /// Gaussian route line (required for gaussian16)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// GAMESS basis set (required for gamess)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gbasis: Option<String>,

    /// IDs of steps that run after this one, in configuration order
    #[serde(default)]
    pub dependents: Vec<String>,
}

/// General defaults applied to every step before program overrides.
static GENERAL_DEFAULTS: Lazy<BTreeMap<&'static str, Value>> = Lazy::new(|| {
    let mut m = BTreeMap::new();
    m.insert("opt", Value::Bool(false));
    m.insert("freq", Value::Bool(false));
    m.insert("single_point", Value::Bool(false));
    m.insert("conformers", Value::Bool(false));
    m.insert("proceed_on_failed_conf", Value::Bool(true));
    m.insert("attempt_restart", Value::Bool(false));
    m.insert("save_output", Value::Bool(false));
    m.insert("nproc", Value::from(14u32));
    m.insert("memory", Value::from(12u32));
    m.insert("timelim", Value::from(1440u32));
    m.insert("timelim_padding", Value::from(5u32));
    m.insert("partition", Value::from("short"));
    m.insert("simul_jobs", Value::from(50u32));
    m.insert("charge", Value::from(0i32));
    m.insert("multiplicity", Value::from(1u32));
    m
});

/// Program-specific default overrides.
fn program_defaults(program: Program) -> BTreeMap<&'static str, Value> {
    let mut m = BTreeMap::new();
    match program {
        Program::Gaussian16 => {
            m.insert("memory", Value::from(16u32));
        }
        Program::Gamess => {
            // MWORDS-style memory specification is far smaller
            m.insert("memory", Value::from(500u32));
            m.insert("timelim", Value::from(1400u32));
        }
    }
    m
}

/// Parameters that must be supplied explicitly for each program.
pub fn required_params(program: Program) -> &'static [&'static str] {
    match program {
        Program::Gaussian16 => &["route"],
        Program::Gamess => &["gbasis"],
    }
}

fn get_bool(params: &BTreeMap<String, Value>, key: &str, step_id: &str) -> Result<bool> {
    match params.get(key) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(FlowError::Config(format!(
            "step '{}': parameter '{}' must be a boolean",
            step_id, key
        ))),
        None => unreachable!("'{}' filled from defaults", key),
    }
}

fn get_u32(params: &BTreeMap<String, Value>, key: &str, step_id: &str) -> Result<u32> {
    match params.get(key).and_then(Value::as_u64) {
        Some(v) => Ok(v as u32),
        None => Err(FlowError::Config(format!(
            "step '{}': parameter '{}' must be a non-negative integer",
            step_id, key
        ))),
    }
}

fn get_i32(params: &BTreeMap<String, Value>, key: &str, step_id: &str) -> Result<i32> {
    match params.get(key).and_then(Value::as_i64) {
        Some(v) => Ok(v as i32),
        None => Err(FlowError::Config(format!(
            "step '{}': parameter '{}' must be an integer",
            step_id, key
        ))),
    }
}

fn get_string(params: &BTreeMap<String, Value>, key: &str, step_id: &str) -> Result<String> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(FlowError::Config(format!(
            "step '{}': parameter '{}' must be a string",
            step_id, key
        ))),
        None => unreachable!("'{}' filled from defaults", key),
    }
}

fn get_opt_string(
    params: &BTreeMap<String, Value>,
    key: &str,
    step_id: &str,
) -> Result<Option<String>> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(FlowError::Config(format!(
            "step '{}': parameter '{}' must be a string",
            step_id, key
        ))),
    }
}

impl StepParams {
    /// Builds typed step parameters from a raw configuration mapping.
    ///
    /// Missing optional parameters are filled from the general and
    /// program-specific default tables; this fill is pure and
    /// deterministic. Required program parameters and value types are
    /// validated here so later stages never re-check them.
    pub fn from_raw(step_id: &str, raw: &BTreeMap<String, Value>) -> Result<Self> {
        let program_tag = match raw.get("program") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(FlowError::Config(format!(
                    "step '{}': parameter 'program' must be a string",
                    step_id
                )))
            }
            None => {
                return Err(FlowError::Config(format!(
                    "step '{}' does not specify a program",
                    step_id
                )))
            }
        };

        let program = Program::from_tag(&program_tag)
            .map_err(|_| FlowError::Config(format!(
                "step '{}': unsupported program '{}'",
                step_id, program_tag
            )))?;

        // Default fill: general table first, then program overrides,
        // then the supplied values.
        let mut params: BTreeMap<String, Value> = GENERAL_DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        for (k, v) in program_defaults(program) {
            params.insert(k.to_string(), v);
        }
        for (k, v) in raw {
            params.insert(k.clone(), v.clone());
        }

        for required in required_params(program) {
            if !params.contains_key(*required) {
                return Err(FlowError::Config(format!(
                    "step '{}': program '{}' requires parameter '{}'",
                    step_id,
                    program.tag(),
                    required
                )));
            }
        }

        let dependents = match params.get("dependents") {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s.clone()),
                    _ => Err(FlowError::Config(format!(
                        "step '{}': 'dependents' must be a list of step IDs",
                        step_id
                    ))),
                })
                .collect::<Result<Vec<String>>>()?,
            Some(_) => {
                return Err(FlowError::Config(format!(
                    "step '{}': 'dependents' must be a list of step IDs",
                    step_id
                )))
            }
            None => Vec::new(),
        };

        Ok(StepParams {
            program,
            opt: get_bool(&params, "opt", step_id)?,
            freq: get_bool(&params, "freq", step_id)?,
            single_point: get_bool(&params, "single_point", step_id)?,
            conformers: get_bool(&params, "conformers", step_id)?,
            proceed_on_failed_conf: get_bool(&params, "proceed_on_failed_conf", step_id)?,
            attempt_restart: get_bool(&params, "attempt_restart", step_id)?,
            save_output: get_bool(&params, "save_output", step_id)?,
            nproc: get_u32(&params, "nproc", step_id)?,
            memory: get_u32(&params, "memory", step_id)?,
            timelim: get_u32(&params, "timelim", step_id)?,
            timelim_padding: get_u32(&params, "timelim_padding", step_id)?,
            partition: get_string(&params, "partition", step_id)?,
            simul_jobs: get_u32(&params, "simul_jobs", step_id)?,
            charge: get_i32(&params, "charge", step_id)?,
            multiplicity: get_u32(&params, "multiplicity", step_id)?,
            route: get_opt_string(&params, "route", step_id)?,
            gbasis: get_opt_string(&params, "gbasis", step_id)?,
            dependents,
        })
    }

    /// Scheduler time limit including padding, in minutes.
    pub fn scheduler_timelim(&self) -> u32 {
        self.timelim + self.timelim_padding
    }
}
