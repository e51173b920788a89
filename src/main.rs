//! SeqFlow CLI Entry Point
//!
//! Runs one workflow file through a local runtime with the built-in
//! handlers and prints a summary.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! seqflow workflow.yaml
//!
//! # Show the execution plan without running anything
//! seqflow workflow.yaml --plan
//!
//! # Override strategy and priority
//! seqflow workflow.yaml --strategy smart --priority high
//!
//! # Use an explicit engine configuration
//! seqflow workflow.yaml --config seqflow.yaml
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{error, info};

use seqflow::monitoring::{EventSink, ExecutionTimeline, HostSampler};
use seqflow::workflow::{Priority, StrategyKind, WorkflowExecution};
use seqflow::{
    load_workflow, register_builtin_handlers, EngineConfig, ExecutionStatus, Runtime,
    SubmitOptions, APP_NAME, VERSION,
};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Upper bound on how long the CLI waits for a run.
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Host sampling interval while a workflow runs.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: String,
    config_path: Option<PathBuf>,
    strategy: Option<StrategyKind>,
    priority: Option<Priority>,
    plan_only: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            config_path: None,
            strategy: None,
            priority: None,
            plan_only: false,
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
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Sequential Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: seqflow [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>       Path to workflow YAML file");
    println!();
    println!("Options:");
    println!("  --config PATH         Engine configuration file");
    println!("  --strategy NAME       basic, optimized or smart");
    println!("  --priority NAME       low, normal, high or critical");
    println!("  --plan                Print the execution plan and exit");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  seqflow pipeline.yaml");
    println!("  seqflow pipeline.yaml --plan --strategy optimized");
    println!("  seqflow pipeline.yaml --config seqflow.yaml --priority high");
}

/// Returns the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", option))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_seen = false;
    let mut i = 1; // Skip program name

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
            "--plan" => {
                config.plan_only = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--config" => {
                config.config_path = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--strategy" => {
                config.strategy = Some(option_value(args, &mut i, arg)?.parse()?);
            }
            "--priority" => {
                config.priority = Some(option_value(args, &mut i, arg)?.parse()?);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if positional_seen {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.workflow_path = arg.clone();
                positional_seen = true;
            }
        }
        i += 1;
    }

    Ok(config)
}

fn status_label(status: ExecutionStatus) -> String {
    let label = status.to_string().to_uppercase();
    match status {
        ExecutionStatus::Completed => label.green().bold().to_string(),
        ExecutionStatus::Failed => label.red().bold().to_string(),
        ExecutionStatus::Cancelled => label.yellow().bold().to_string(),
        _ => label,
    }
}

/// Prints per-step results and the overall outcome.
fn print_summary(execution: &WorkflowExecution, step_count: usize) {
    println!();
    println!("{}", "=== Execution Summary ===".bold());
    println!("Execution: {}", execution.execution_id);
    println!("Workflow:  {}", execution.workflow_id);
    println!("Strategy:  {}", execution.strategy);
    println!("Status:    {}", status_label(execution.status));
    println!();

    for result in &execution.step_results {
        let mark = if result.success {
            "ok".green()
        } else {
            "failed".red()
        };
        let mut notes = Vec::new();
        if result.cache_hit {
            notes.push("cached".to_string());
        }
        if result.batched {
            notes.push("batched".to_string());
        }
        if result.attempts > 1 {
            notes.push(format!("{} attempts", result.attempts));
        }
        let notes = if notes.is_empty() {
            String::new()
        } else {
            format!(" ({})", notes.join(", ")).dimmed().to_string()
        };

        println!(
            "  {:<24} {:<12} {:>6} ms  {}{}",
            result.step_key, result.handler, result.duration_ms, mark, notes
        );
        if let Some(error) = &result.error {
            println!("    {}", error.to_string().red());
        }
    }

    let skipped = step_count.saturating_sub(execution.step_results.len());
    if skipped > 0 {
        println!("  {}", format!("{} step(s) not run", skipped).dimmed());
    }
    if let Some(error) = &execution.error {
        println!();
        println!("Error: {}", error.to_string().red());
    }
}

/// Main application entry point.
async fn run() -> Result<ExecutionStatus, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::discover()?,
    };

    info!("Loading workflow: {}", config.workflow_path);
    let workflow = load_workflow(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            config.workflow_path, e
        )
    })?;
    info!("Workflow '{}' loaded: {} steps", workflow.id, workflow.steps.len());

    let timeline = Arc::new(ExecutionTimeline::new());
    let sinks: Vec<Arc<dyn EventSink>> = vec![timeline.clone()];
    let runtime = Runtime::with_sinks(engine_config, sinks)?;
    register_builtin_handlers(runtime.registry())?;

    if config.plan_only {
        let strategy = config
            .strategy
            .unwrap_or_else(|| runtime.engine().strategy_kind(&workflow));
        let plan = runtime.engine().plan(&workflow, strategy);
        println!("Strategy: {}", strategy);
        println!("{}", plan);
        return Ok(ExecutionStatus::Completed);
    }

    let mut options = SubmitOptions::new().owner("cli");
    if let Some(strategy) = config.strategy {
        options = options.strategy(strategy);
    }
    if let Some(priority) = config.priority {
        options = options.priority(priority);
    }

    let step_count = workflow.steps.len();
    let sampler = HostSampler::spawn(SAMPLE_INTERVAL);
    runtime.start();
    let execution_id = runtime.scheduler().submit_with(workflow, options)?;
    let execution = runtime.scheduler().wait(&execution_id, MAX_WAIT).await?;
    runtime.shutdown();
    let host = sampler.finish().await;

    print_summary(&execution, step_count);
    println!();
    println!("{}", timeline.gantt_chart());
    println!("{}", host.summary());

    Ok(execution.status)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(ExecutionStatus::Completed) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
