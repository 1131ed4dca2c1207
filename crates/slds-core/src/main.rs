//! slds - fit and sample switching linear dynamical systems
//!
//! Commands:
//! - `fit`: variational EM from an initial model and an observation file
//! - `simulate`: draw a seeded sample from a model
//! - `check`: validate model, fit config and observation files
//! - `version`
//!
//! Payloads go to stdout, logs and errors to stderr. The exit code alone
//! tells a script how the command ended (see `slds_core::exit_codes`).

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use slds_common::error::StructuredError;
use slds_common::{Error, OutputFormat, Result};
use slds_core::config::{
    is_json, load_fit_config, load_model_spec, load_observations, FitConfig, ModelSpec,
};
use slds_core::exit_codes::ExitCode;
use slds_core::inference::{ElboTerms, FitStatus, HiddenChain};
use slds_core::log_event;
use slds_core::logging::{
    event_names, generate_run_id, init_logging, LogConfig, LogContext, LogFormat, LogLevel,
    Stage,
};
use slds_core::simulate::simulate;
use slds_math::matrix_to_rows;

/// Switching linear dynamical systems: variational EM and simulation
#[derive(Parser)]
#[command(name = "slds")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "json")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log line format on stderr (human or jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a switching model to observations with variational EM
    Fit(FitArgs),

    /// Sample a sequence from a model
    Simulate(SimulateArgs),

    /// Validate model, config and observation files without fitting
    Check(CheckArgs),

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct FitArgs {
    /// Initial model (TOML, or JSON by extension)
    #[arg(long)]
    model: PathBuf,

    /// Observations (JSON rows)
    #[arg(long)]
    observations: PathBuf,

    /// Fit settings (TOML, or JSON by extension)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the outer iteration budget
    #[arg(long)]
    max_iter: Option<usize>,

    /// Override the outer tolerance
    #[arg(long)]
    tol: Option<f64>,

    /// Also re-estimate each regime's observation noise
    #[arg(long)]
    update_observation_noise: bool,

    /// Run regimes sequentially
    #[arg(long)]
    no_parallel: bool,

    /// Write the fitted model here (TOML, or JSON by extension)
    #[arg(long)]
    save_model: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Model to sample from
    #[arg(long)]
    model: PathBuf,

    /// Number of steps
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    steps: u64,

    /// Random seed
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the sample here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Model file to validate
    #[arg(long)]
    model: PathBuf,

    /// Fit settings to validate
    #[arg(long)]
    config: Option<PathBuf>,

    /// Observations to check against the model
    #[arg(long)]
    observations: Option<PathBuf>,
}

// ============================================================================
// Main entry point
// ============================================================================

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                ExitCode::ArgsError
            } else {
                ExitCode::Ok
            };
            let _ = err.print();
            std::process::exit(code.as_i32());
        }
    };

    let cli_level = (cli.global.verbose > 0 || cli.global.quiet)
        .then(|| LogLevel::default().adjusted(cli.global.verbose, cli.global.quiet));
    init_logging(&LogConfig::from_env(cli_level, cli.global.log_format));

    let ctx = LogContext::new(generate_run_id());
    let result = match &cli.command {
        Commands::Fit(args) => run_fit(&cli.global, &ctx, args),
        Commands::Simulate(args) => run_simulate(&cli.global, &ctx, args),
        Commands::Check(args) => run_check(&cli.global, &ctx, args),
        Commands::Version => {
            print_version(&cli.global);
            Ok(ExitCode::Ok)
        }
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(err) => output_error(&cli.global, &ctx, &err),
    };
    std::process::exit(exit_code.as_i32());
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Serialize)]
struct FitReport<'a> {
    run_id: &'a str,
    status: FitStatus,
    exit_code: &'static str,
    iterations: usize,
    final_elbo: f64,
    ml_history: &'a [f64],
    param_change_history: &'a [f64],
    inner_iterations: &'a [usize],
    terms: &'a ElboTerms,
    most_likely_regimes: Vec<usize>,
    /// T rows of `q(s_t = k)`.
    responsibilities: Vec<Vec<f64>>,
    model: ModelSpec,
}

fn fit_config(ctx: &LogContext, args: &FitArgs) -> Result<FitConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let config = load_fit_config(path)?;
            log_event!(
                ctx,
                DEBUG,
                event_names::CONFIG_LOADED,
                Stage::Init,
                "loaded fit config",
                path = path.display().to_string().as_str()
            );
            config
        }
        None => {
            log_event!(
                ctx,
                DEBUG,
                event_names::CONFIG_DEFAULT_USED,
                Stage::Init,
                "using default fit config"
            );
            FitConfig::default()
        }
    };
    if let Some(max_iter) = args.max_iter {
        config.max_iter = max_iter;
    }
    if let Some(tol) = args.tol {
        config.tol = tol;
    }
    if args.update_observation_noise {
        config.updates.observation_noise = true;
    }
    if args.no_parallel {
        config.parallel = false;
    }
    config.validate()?;
    Ok(config)
}

fn run_fit(global: &GlobalOpts, ctx: &LogContext, args: &FitArgs) -> Result<ExitCode> {
    let ctx = ctx.clone().with_model(args.model.display().to_string());
    let config = fit_config(&ctx, args)?;
    let model = load_model_spec(&args.model)?.to_model()?;
    log_event!(
        ctx,
        DEBUG,
        event_names::MODEL_LOADED,
        Stage::Init,
        "loaded model",
        regimes = model.num_regimes(),
        obs_dim = model.obs_dim()
    );
    let observations = load_observations(&args.observations)?;
    log_event!(
        ctx,
        DEBUG,
        event_names::OBSERVATIONS_LOADED,
        Stage::Init,
        "loaded observations",
        steps = observations.ncols()
    );

    let result = slds_core::fit(model, &observations, &config)?;
    let exit_code = ExitCode::from(result.status);

    let fitted = ModelSpec::from_model(&result.model);
    if let Some(path) = &args.save_model {
        write_model(path, &fitted)?;
    }

    match global.format {
        OutputFormat::Json => {
            let report = FitReport {
                run_id: &ctx.run_id,
                status: result.status,
                exit_code: exit_code.code_name(),
                iterations: result.iterations(),
                final_elbo: result.final_elbo(),
                ml_history: &result.ml_history,
                param_change_history: &result.param_change_history,
                inner_iterations: &result.inner_iterations,
                terms: &result.final_terms,
                most_likely_regimes: result.most_likely_regimes(),
                responsibilities: matrix_to_rows(&result.responsibilities().transpose()),
                model: fitted,
            };
            emit_json(&report)?;
        }
        OutputFormat::Summary => {
            println!(
                "[{}] fit: {} after {} iterations, elbo {:.6}",
                ctx.run_id,
                result.status,
                result.iterations(),
                result.final_elbo()
            );
        }
    }
    Ok(exit_code)
}

fn run_simulate(global: &GlobalOpts, ctx: &LogContext, args: &SimulateArgs) -> Result<ExitCode> {
    let ctx = ctx.clone().with_model(args.model.display().to_string());
    let model = load_model_spec(&args.model)?.to_model()?;
    let steps = usize::try_from(args.steps)
        .map_err(|_| Error::Config(format!("--steps {} is too large", args.steps)))?;
    let sample = simulate(&model, steps, args.seed)?;
    let output = sample.to_output(args.seed);

    match &args.out {
        Some(path) => {
            std::fs::write(path, serde_json::to_string_pretty(&output)?)?;
            match global.format {
                OutputFormat::Json => emit_json(&serde_json::json!({
                    "run_id": ctx.run_id,
                    "steps": steps,
                    "seed": args.seed,
                    "out": path.display().to_string(),
                }))?,
                OutputFormat::Summary => println!(
                    "[{}] simulate: {} steps written to {}",
                    ctx.run_id,
                    steps,
                    path.display()
                ),
            }
        }
        None => match global.format {
            OutputFormat::Json => emit_json(&output)?,
            OutputFormat::Summary => {
                let switches = output.regimes.windows(2).filter(|w| w[0] != w[1]).count();
                println!(
                    "[{}] simulate: {} steps, {} regime switches",
                    ctx.run_id, steps, switches
                );
            }
        },
    }
    Ok(ExitCode::Ok)
}

/// Outcome of each `check` item, plus the exit code of the first failure.
#[derive(Default)]
struct CheckReport {
    results: Vec<serde_json::Value>,
    failure: Option<ExitCode>,
}

impl CheckReport {
    fn record(&mut self, check: &str, outcome: std::result::Result<serde_json::Value, &Error>) {
        let entry = match outcome {
            Ok(details) => serde_json::json!({ "check": check, "status": "ok", "details": details }),
            Err(err) => {
                self.failure.get_or_insert(ExitCode::from(err));
                serde_json::json!({
                    "check": check,
                    "status": "error",
                    "error": StructuredError::from(err),
                })
            }
        };
        self.results.push(entry);
    }
}

fn run_check(global: &GlobalOpts, ctx: &LogContext, args: &CheckArgs) -> Result<ExitCode> {
    let mut report = CheckReport::default();

    let model = load_model_spec(&args.model).and_then(|spec| spec.to_model());
    report.record(
        "model",
        model.as_ref().map(|m| {
            serde_json::json!({
                "regimes": m.num_regimes(),
                "obs_dim": m.obs_dim(),
                "state_dims": m.regimes().iter().map(|r| r.state_dim()).collect::<Vec<_>>(),
                "transition": matrix_to_rows(m.transition_matrix()),
            })
        }),
    );

    if let Some(path) = &args.config {
        let outcome = load_fit_config(path).and_then(|c| Ok(serde_json::to_value(c)?));
        report.record("config", outcome.as_ref().cloned());
    }

    if let Some(path) = &args.observations {
        let outcome = load_observations(path).and_then(|obs| {
            if let Ok(model) = &model {
                model.check_observations(&obs)?;
            }
            Ok(serde_json::json!({ "steps": obs.ncols(), "obs_dim": obs.nrows() }))
        });
        report.record("observations", outcome.as_ref().cloned());
    }

    let status = if report.failure.is_none() { "ok" } else { "error" };
    match global.format {
        OutputFormat::Json => emit_json(&serde_json::json!({
            "run_id": ctx.run_id,
            "status": status,
            "checks": report.results,
        }))?,
        OutputFormat::Summary => {
            println!("[{}] check: {}", ctx.run_id, status.to_uppercase());
        }
    }
    Ok(report.failure.unwrap_or(ExitCode::Ok))
}

fn write_model(path: &Path, spec: &ModelSpec) -> Result<()> {
    let text = if is_json(path) {
        serde_json::to_string_pretty(spec)?
    } else {
        toml::to_string_pretty(spec).map_err(|e| Error::Toml(e.to_string()))?
    };
    std::fs::write(path, text)?;
    Ok(())
}

fn print_version(global: &GlobalOpts) {
    let version = env!("CARGO_PKG_VERSION");
    match global.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({ "name": "slds", "version": version })
            );
        }
        OutputFormat::Summary => println!("slds {version}"),
    }
}

// ============================================================================
// Output helpers
// ============================================================================

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Report a failed command on stderr and pick its exit code.
fn output_error(global: &GlobalOpts, ctx: &LogContext, err: &Error) -> ExitCode {
    let exit_code = ExitCode::from(err);
    log_event!(
        ctx,
        ERROR,
        event_names::COMMAND_FAILED,
        Stage::Output,
        "command failed",
        code = err.code(),
        error = err.to_string().as_str()
    );
    match global.format {
        OutputFormat::Json => {
            let structured = StructuredError::from(err)
                .with_context("run_id", &ctx.run_id)
                .with_context("exit_code", exit_code.code_name());
            eprintln!("{}", structured.to_json());
        }
        OutputFormat::Summary => {
            eprintln!("[{}] {}: {}", ctx.run_id, err.headline(), err);
        }
    }
    exit_code
}
