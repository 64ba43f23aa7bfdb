use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use droid_repro::bug_report::BugReportReader;
use droid_repro::config::{self, ExploreConfig, TieBreak, parse_global_actions};
use droid_repro::device::AdbDevice;
use droid_repro::explore::CancelToken;
use droid_repro::llm::{ChatClient, ChatConfig, PromptSet, check_health};
use droid_repro::record::read_run;
use droid_repro::runner::{EXIT_FATAL, EXIT_PREFLIGHT, RunOptions, run_exploration};
use droid_repro::session::{RunDir, list_runs};

/// droid-repro - reproduce Android app bugs with LLM-guided exploration
#[derive(Parser, Debug)]
#[command(
    name = "droid-repro",
    about = "Reproduce reported Android app bugs by LLM-guided beam search over a live emulator",
    after_help = "ENVIRONMENT VARIABLES:\n\
        DROID_REPRO_LLM_ENDPOINT    Chat completions endpoint URL\n\
        DROID_REPRO_LLM_MODEL       Model name\n\
        DROID_REPRO_LLM_API_KEY     API token (OPENAI_API_KEY is also accepted)\n\
        DROID_REPRO_RESULT_DIR      Base directory for run records\n\
        DROID_REPRO_BUGS_DIR        Directory of <bug-id>.json reports\n\
        DROID_REPRO_SERIAL          Emulator serial\n\
        RUST_LOG                    Log filter (default: info)"
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Explore the app until the bug is reproduced or a budget runs out
    Run {
        /// Bug id (looked up as <bugs-dir>/<id>.json) or a path to a report
        #[arg(short, long)]
        bug: String,

        /// Directory of bug reports
        #[arg(long, env = "DROID_REPRO_BUGS_DIR")]
        bugs_dir: Option<PathBuf>,

        /// Override the package named in the report
        #[arg(short, long)]
        package: Option<String>,

        /// Run directory (default: <result-dir>/<package>/<timestamp>)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Base directory for run records
        #[arg(long, env = "DROID_REPRO_RESULT_DIR")]
        result_dir: Option<PathBuf>,

        /// Round budget
        #[arg(long, default_value_t = config::DEFAULT_MAX_STEP)]
        max_step: usize,

        /// Committed-action budget
        #[arg(long, default_value_t = config::DEFAULT_MAX_TRANSITION)]
        max_transition: usize,

        /// Wall-clock budget in minutes (0 = unlimited)
        #[arg(long, default_value_t = config::DEFAULT_MAX_MINUTES)]
        max_minutes: u64,

        /// Children kept per expanded node
        #[arg(short = 'a', long, default_value_t = config::DEFAULT_THRESHOLD_A)]
        threshold_a: usize,

        /// Paths kept per round
        #[arg(short = 'k', long, default_value_t = config::DEFAULT_THRESHOLD_K)]
        threshold_k: usize,

        /// Comma-separated actions offered on every screen (e.g. "back,swipe-up")
        #[arg(long, default_value = "back")]
        global_actions: String,

        /// Fallback ordering: enumeration-order or largest-screen-delta
        #[arg(long, default_value = "enumeration-order")]
        tie_break: TieBreak,

        /// Attempts per LLM judgment before falling back
        #[arg(long, default_value_t = config::DEFAULT_LLM_MAX_ATTEMPTS)]
        llm_attempts: usize,

        /// LLM calls in flight during a judgment phase
        #[arg(long, default_value_t = config::DEFAULT_LLM_CONCURRENCY)]
        llm_concurrency: usize,

        /// Minimum similarity of a restored state to its recording (1.0 = exact)
        #[arg(long, default_value_t = config::DEFAULT_RESTORE_TOLERANCE)]
        restore_tolerance: f64,

        /// Directory with prompt template overrides (filter.txt, evaluate.txt, ...)
        #[arg(long)]
        prompts_dir: Option<PathBuf>,

        /// Chat completions endpoint URL
        #[arg(long, env = "DROID_REPRO_LLM_ENDPOINT")]
        endpoint: Option<String>,

        /// Model name
        #[arg(long, env = "DROID_REPRO_LLM_MODEL")]
        model: Option<String>,

        /// Emulator serial
        #[arg(long, env = "DROID_REPRO_SERIAL")]
        serial: Option<String>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recorded runs
    Runs {
        /// Only runs of this package
        #[arg(short, long)]
        package: Option<String>,

        /// Base directory for run records
        #[arg(long, env = "DROID_REPRO_RESULT_DIR")]
        result_dir: Option<PathBuf>,
    },

    /// Summarize a recorded run
    Show {
        /// Run directory
        dir: PathBuf,

        /// Print the run trailer as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that the LLM endpoint is reachable
    CheckLlm {
        /// Chat completions endpoint URL
        #[arg(long, env = "DROID_REPRO_LLM_ENDPOINT")]
        endpoint: Option<String>,

        /// Connection timeout in seconds
        #[arg(long, default_value = "5")]
        timeout: u64,
    },
}

/// Log to stderr, and to `log_file` without colors when given
fn init_logging(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = log_file
        .and_then(|path| match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("Warning: cannot open log file {}: {}", path.display(), e);
                None
            }
        })
        .map(|file| fmt::layer().with_writer(Mutex::new(file)).with_ansi(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Commands::Run {
            bug,
            bugs_dir,
            package,
            output,
            result_dir,
            max_step,
            max_transition,
            max_minutes,
            threshold_a,
            threshold_k,
            global_actions,
            tie_break,
            llm_attempts,
            llm_concurrency,
            restore_tolerance,
            prompts_dir,
            endpoint,
            model,
            serial,
            json,
        } => {
            let settings = config::get();

            // Pre-flight: bug report, parameters and prompts
            let bugs_dir = bugs_dir.unwrap_or_else(|| settings.output.bugs_dir.clone());
            let mut report = match BugReportReader::new(bugs_dir).read(&bug) {
                Ok(report) => report,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return exit(EXIT_PREFLIGHT);
                }
            };
            if let Some(package) = package {
                report.package = package;
            }
            let global_actions = match parse_global_actions(&global_actions) {
                Ok(actions) => actions,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return exit(EXIT_PREFLIGHT);
                }
            };
            let explore = ExploreConfig {
                max_step,
                max_transition,
                max_duration: (max_minutes > 0).then(|| Duration::from_secs(max_minutes * 60)),
                threshold_a,
                threshold_k,
                global_actions,
                tie_break,
                llm_max_attempts: llm_attempts,
                llm_concurrency,
                restore_tolerance,
                ..ExploreConfig::default()
            };
            if let Err(e) = explore.validate() {
                eprintln!("Error: {}", e);
                return exit(EXIT_PREFLIGHT);
            }
            let prompts = match prompts_dir.as_deref().map(PromptSet::from_dir).transpose() {
                Ok(prompts) => prompts.unwrap_or_default(),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return exit(EXIT_PREFLIGHT);
                }
            };

            let run_dir = match output {
                Some(dir) => RunDir::in_dir(dir),
                None => RunDir::new(result_dir.unwrap_or_else(|| settings.output.result_dir.clone()), &report.package),
            };
            if let Err(e) = std::fs::create_dir_all(&run_dir.dir) {
                eprintln!("Error: cannot create {}: {}", run_dir.dir.display(), e);
                return exit(EXIT_FATAL);
            }
            init_logging(Some(&run_dir.dir.join("log.txt")));

            let mut chat = ChatConfig::default();
            if let Some(endpoint) = endpoint {
                chat.endpoint = endpoint;
            }
            if let Some(model) = model {
                chat = chat.model(model);
            }
            match check_health(&chat.endpoint, 5) {
                Ok(true) => info!(endpoint = %chat.endpoint, model = %chat.model, "LLM endpoint responding"),
                _ => warn!(endpoint = %chat.endpoint, "LLM endpoint not responding, judgments will fall back"),
            }
            let client = ChatClient::new(chat);

            let mut device_settings = settings.device.clone();
            if let Some(serial) = serial {
                device_settings.serial = serial;
            }
            let mut device = AdbDevice::new(device_settings, report.package.clone());
            if let Err(e) = device.connect().and_then(|_| device.launch(report.activity.as_deref())) {
                error!(error = %e, "emulator not usable");
                return exit(EXIT_FATAL);
            }

            let cancel = CancelToken::new();
            let watcher = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping at the next phase boundary");
                    watcher.cancel();
                }
            });

            let options = RunOptions::new(report, explore, run_dir)
                .prompts(prompts)
                .cancel_token(cancel);
            let joined =
                tokio::task::spawn_blocking(move || run_exploration(&mut device, &client, Some(&client), &options)).await;

            let summary = match joined {
                Ok(Ok(summary)) => summary,
                Ok(Err(e)) => {
                    error!(error = %e, "run failed");
                    return exit(e.exit_code());
                }
                Err(e) => {
                    error!(error = %e, "exploration task panicked");
                    return exit(EXIT_FATAL);
                }
            };

            if json {
                match serde_json::to_string_pretty(&summary) {
                    Ok(text) => println!("{}", text),
                    Err(e) => eprintln!("Error: {}", e),
                }
            } else {
                println!("Outcome: {} ({})", summary.outcome, summary.detail);
                println!(
                    "  {} round(s), {} action(s) committed, {} node(s), {} ms",
                    summary.rounds, summary.transitions, summary.nodes, summary.elapsed_ms
                );
                for (i, action) in summary.actions.iter().enumerate() {
                    println!("  {}. {}", i + 1, action);
                }
                println!("\nRun: {}", summary.run_dir.display());
            }
            exit(summary.exit_code)
        }

        Commands::Runs { package, result_dir } => {
            init_logging(None);
            let base = result_dir.unwrap_or_else(|| config::get().output.result_dir.clone());
            let runs = match list_runs(&base, package.as_deref()) {
                Ok(runs) => runs,
                Err(e) => {
                    eprintln!("Error: cannot list {}: {}", base.display(), e);
                    return exit(EXIT_FATAL);
                }
            };
            if runs.is_empty() {
                println!("No runs under {}", base.display());
            }
            for dir in runs {
                let status = match read_run(&dir) {
                    Ok(log) => match (&log.trailer, &log.state) {
                        (Some(t), _) => format!("{} ({} actions)", t.outcome, t.transitions),
                        (None, Some(state)) => format!("unfinished: {}", state),
                        (None, None) => "unfinished".to_string(),
                    },
                    Err(e) => format!("unreadable: {}", e),
                };
                println!("{}  {}", dir.display(), status);
            }
            ExitCode::SUCCESS
        }

        Commands::Show { dir, json } => {
            init_logging(None);
            let log = match read_run(&dir) {
                Ok(log) => log,
                Err(e) => {
                    eprintln!("Error: cannot read run {}: {}", dir.display(), e);
                    return exit(EXIT_FATAL);
                }
            };
            if json {
                match serde_json::to_string_pretty(&log.trailer) {
                    Ok(text) => println!("{}", text),
                    Err(e) => eprintln!("Error: {}", e),
                }
            } else {
                println!("{}", log.summary());
            }
            ExitCode::SUCCESS
        }

        Commands::CheckLlm { endpoint, timeout } => {
            init_logging(None);
            let endpoint = endpoint.unwrap_or_else(|| config::get().llm.endpoint.clone());
            match check_health(&endpoint, timeout) {
                Ok(true) => {
                    println!("LLM endpoint responding: {}", endpoint);
                    ExitCode::SUCCESS
                }
                Ok(false) => {
                    println!("LLM endpoint not responding: {}", endpoint);
                    exit(EXIT_FATAL)
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(EXIT_FATAL)
                }
            }
        }
    }
}
