//! qcflow CLI Entry Point
//!
//! Command-line driver for the workflow engine. The `begin` command is
//! invoked by users and by queued submitter jobs; `run` and `handle`
//! only make sense inside a Slurm array task.
//!
//! # Usage
//!
//! ```bash
//! # Create a workflow directory tree
//! qcflow setup my_workflow --config flow.yaml --config-id default
//!
//! # Begin the initial step
//! qcflow begin
//!
//! # Begin a specific step and wave (as the submitter jobs do)
//! qcflow begin --step-id sp --wave-id 2
//!
//! # Inside an array task: run and handle one calculation
//! qcflow run --step-id opt --wave-id 1 --time 1440
//! qcflow handle --step-id opt --wave-id 1
//! ```

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use log::{debug, error, info};

use qcflow::execution::{CopyMaterializer, GaussianRestartUpdater, WaveOrchestrator};
use qcflow::execution::task;
use qcflow::scheduler::SlurmScheduler;
use qcflow::workflow::layout::UNOPT_STRUCTURES_DIR;
use qcflow::workflow::{StepGraph, WorkflowLayout, WorkflowParams};
use qcflow::{APP_NAME, VERSION};

/// Default wave for a fresh begin.
const DEFAULT_WAVE_ID: u32 = 1;

/// Subcommand selected on the command line.
#[derive(Debug, PartialEq)]
enum Command {
    Setup,
    Begin,
    Run,
    Handle,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    /// Workflow name (setup only)
    name: Option<String>,
    config_file: Option<PathBuf>,
    config_id: String,
    archive_dir: Option<PathBuf>,
    step_id: Option<String>,
    wave_id: u32,
    attempt_restart: bool,
    /// Calculation time limit in minutes (run only)
    time: Option<u32>,
    max_waves: Option<u32>,
    overwrite: bool,
    verbose: bool,
}

impl Config {
    fn new(command: Command) -> Self {
        Self {
            command,
            name: None,
            config_file: None,
            config_id: "default".to_string(),
            archive_dir: None,
            step_id: None,
            wave_id: DEFAULT_WAVE_ID,
            attempt_restart: false,
            time: None,
            max_waves: None,
            overwrite: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Quantum Chemistry Workflow Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: qcflow <COMMAND> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  setup <NAME>   Create a workflow directory tree");
    println!("  begin          Begin (or restart) a workflow step");
    println!("  run            Run one array calculation (inside an array job)");
    println!("  handle         Handle one finished calculation (inside an array job)");
    println!();
    println!("Setup options:");
    println!("  --config PATH        Step configuration file");
    println!("  --config-id ID       Configuration ID within the file (default: default)");
    println!("  --archive-dir PATH   Long-term archive for saved outputs");
    println!();
    println!("Step options:");
    println!("  --step-id ID         Step to act on (begin defaults to the initial step)");
    println!("  --wave-id N          Wave number (default: {})", DEFAULT_WAVE_ID);
    println!("  --attempt-restart    Restart the failed subset of the given wave");
    println!("  --max-waves N        Cap on restart waves per step");
    println!("  --time N             Calculation time limit in minutes (run)");
    println!("  --overwrite          Overwrite existing input files");
    println!();
    println!("Options:");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Examples:");
    println!("  qcflow setup benzene_scan --config flow.yaml");
    println!("  qcflow begin");
    println!("  qcflow begin --step-id sp --wave-id 2 --attempt-restart");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut i = 1; // Skip program name

    // Global flags may precede the subcommand
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            _ => break,
        }
    }

    let command = match args.get(i).map(|s| s.as_str()) {
        Some("setup") => Command::Setup,
        Some("begin") => Command::Begin,
        Some("run") => Command::Run,
        Some("handle") => Command::Handle,
        Some(other) => return Err(format!("Unknown command: {}", other)),
        None => return Err("No command given".to_string()),
    };
    i += 1;

    let mut config = Config::new(command);

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--attempt-restart" => {
                config.attempt_restart = true;
            }
            "--overwrite" => {
                config.overwrite = true;
            }
            "--config" => {
                i += 1;
                let value = args.get(i).ok_or("--config requires a path argument")?;
                config.config_file = Some(PathBuf::from(value));
            }
            "--config-id" => {
                i += 1;
                let value = args.get(i).ok_or("--config-id requires an argument")?;
                config.config_id = value.clone();
            }
            "--archive-dir" => {
                i += 1;
                let value = args.get(i).ok_or("--archive-dir requires a path argument")?;
                config.archive_dir = Some(PathBuf::from(value));
            }
            "--step-id" => {
                i += 1;
                let value = args.get(i).ok_or("--step-id requires an argument")?;
                config.step_id = Some(value.clone());
            }
            "--wave-id" => {
                i += 1;
                let value = args.get(i).ok_or("--wave-id requires a number argument")?;
                config.wave_id = value
                    .parse()
                    .map_err(|_| format!("Invalid wave ID: {}", value))?;
            }
            "--time" => {
                i += 1;
                let value = args.get(i).ok_or("--time requires a number argument")?;
                config.time = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid time limit: {}", value))?,
                );
            }
            "--max-waves" => {
                i += 1;
                let value = args.get(i).ok_or("--max-waves requires a number argument")?;
                config.max_waves = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid wave cap: {}", value))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.command == Command::Setup && config.name.is_none() {
                    config.name = Some(arg.clone());
                } else {
                    return Err(format!("Unexpected argument: {}", arg));
                }
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Loads the workflow context the step-level commands operate in.
fn load_context() -> Result<(WorkflowLayout, WorkflowParams, StepGraph), Box<dyn std::error::Error>>
{
    let layout = WorkflowLayout::discover(&env::current_dir()?)?;
    let workflow_params = WorkflowParams::load(layout.workflow_dir())?;
    let graph = StepGraph::load(&workflow_params.config_file, &workflow_params.config_id)?;
    Ok((layout, workflow_params, graph))
}

/// Creates a new workflow directory tree and its parameter record.
fn cmd_setup(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let name = config
        .name
        .as_ref()
        .ok_or("setup requires a workflow name")?;
    let config_file = config
        .config_file
        .as_ref()
        .ok_or("setup requires --config")?;

    // Validate the configuration before creating anything
    let graph = StepGraph::load(config_file, &config.config_id)?;

    let workflow_dir = env::current_dir()?.join(name);
    fs::create_dir_all(workflow_dir.join(UNOPT_STRUCTURES_DIR))?;
    for step_id in graph.topological_step_ids() {
        fs::create_dir_all(workflow_dir.join(step_id))?;
    }

    let mut workflow_params =
        WorkflowParams::new(config_file.canonicalize()?, config.config_id.clone());
    workflow_params.archive_dir = config.archive_dir.clone();
    workflow_params.save(&workflow_dir)?;

    info!("Workflow '{}' created at {}", name, workflow_dir.display());
    info!(
        "Place raw structures under {}/ and run 'qcflow begin' inside the workflow",
        workflow_dir.join(UNOPT_STRUCTURES_DIR).display()
    );
    Ok(())
}

/// Begins or restarts a workflow step.
fn cmd_begin(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let (layout, workflow_params, graph) = load_context()?;

    let step_id = config
        .step_id
        .clone()
        .unwrap_or_else(|| graph.initial_step_id().to_string());

    let scheduler = SlurmScheduler;
    let materializer = CopyMaterializer::new(config.overwrite);
    let updater = GaussianRestartUpdater;

    let mut orchestrator = WaveOrchestrator::new(
        &graph,
        &layout,
        workflow_params,
        &scheduler,
        &materializer,
        &updater,
    );
    if let Some(max_waves) = config.max_waves {
        orchestrator.set_max_waves(max_waves);
    }

    orchestrator.run(&step_id, config.wave_id, config.attempt_restart)?;
    Ok(())
}

/// Runs one array calculation from inside a Slurm array task.
fn cmd_run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    log_scheduler_environment();

    let (layout, _, graph) = load_context()?;
    let step_id = config.step_id.as_ref().ok_or("run requires --step-id")?;
    let task_index = task::array_task_index()?;

    let time = match config.time {
        Some(time) => time,
        None => graph.step(step_id)?.timelim,
    };

    task::run_array_calc(&graph, &layout, step_id, config.wave_id, task_index, time)?;
    Ok(())
}

/// Handles one finished array calculation's output.
fn cmd_handle(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let (layout, workflow_params, graph) = load_context()?;
    let step_id = config.step_id.as_ref().ok_or("handle requires --step-id")?;
    let task_index = task::array_task_index()?;

    task::handle_array_output(
        &graph,
        &layout,
        &workflow_params,
        step_id,
        config.wave_id,
        task_index,
    )?;
    Ok(())
}

/// Logs the scheduler environment, useful when troubleshooting
/// cluster or partition issues.
fn log_scheduler_environment() {
    for var in [
        "SLURM_CLUSTER_NAME",
        "SLURM_JOB_ID",
        "SLURM_ARRAY_JOB_ID",
        "SLURM_ARRAY_TASK_ID",
        "SLURM_JOB_PARTITION",
        "SLURM_JOB_NODELIST",
    ] {
        debug!("{}={}", var, env::var(var).unwrap_or_else(|_| "<unset>".to_string()));
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    match config.command {
        Command::Setup => {
            print_banner();
            cmd_setup(&config)
        }
        Command::Begin => {
            print_banner();
            cmd_begin(&config)
        }
        Command::Run => cmd_run(&config),
        Command::Handle => cmd_handle(&config),
    }
    .map_err(|e| {
        error!("{}", e);
        e
    })
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
