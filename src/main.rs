//! tollgate -- inspect and drive an admission-and-cache gate from the shell.
//!
//! Subcommands:
//!   - `status`: today's admission state and cache layout
//!   - `check <SYMBOL>`: run one admission check and print the decision
//!   - `sweep`: remove expired cache day buckets
//!   - `config`: print the effective configuration

use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use tollgate::Gate;
use tollgate::config::Config;

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Command {
    Status,
    Check {
        symbol: String,
        request_id: Option<String>,
        quota: Option<u32>,
    },
    Sweep {
        keep_days: Option<u32>,
    },
    Config,
}

#[derive(Debug, PartialEq)]
struct CliArgs {
    config_path: Option<PathBuf>,
    command: Command,
}

enum ParseOutcome {
    Run(CliArgs),
    Help,
    Version,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParseOutcome, String> {
    let mut args = args.into_iter();
    let mut config_path = None;
    let mut command: Option<String> = None;
    let mut positional: Vec<String> = Vec::new();
    let mut request_id = None;
    let mut quota = None;
    let mut keep_days = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().ok_or("--config requires a path argument")?;
                config_path = Some(PathBuf::from(path));
            }
            "--request-id" => {
                request_id = Some(args.next().ok_or("--request-id requires a value")?);
            }
            "--quota" => {
                let val = args.next().ok_or("--quota requires a number")?;
                quota = Some(val.parse().map_err(|_| format!("Invalid --quota: {val}"))?);
            }
            "--keep-days" => {
                let val = args.next().ok_or("--keep-days requires a number")?;
                keep_days = Some(val.parse().map_err(|_| format!("Invalid --keep-days: {val}"))?);
            }
            "--help" | "-h" => return Ok(ParseOutcome::Help),
            "--version" | "-V" => return Ok(ParseOutcome::Version),
            other if other.starts_with('-') => return Err(format!("Unknown argument: {other}")),
            other => {
                if command.is_none() {
                    command = Some(other.to_string());
                } else {
                    positional.push(other.to_string());
                }
            }
        }
    }

    let command = match command.as_deref() {
        None | Some("status") => Command::Status,
        Some("check") => {
            let symbol = positional
                .first()
                .cloned()
                .ok_or("check requires a SYMBOL argument")?;
            Command::Check {
                symbol,
                request_id,
                quota,
            }
        }
        Some("sweep") => Command::Sweep { keep_days },
        Some("config") => Command::Config,
        Some(other) => return Err(format!("Unknown command: {other}")),
    };

    Ok(ParseOutcome::Run(CliArgs {
        config_path,
        command,
    }))
}

fn print_usage() {
    println!(
        "\
tollgate {version} -- admission-and-cache gate for rate-limited inference calls

USAGE:
    tollgate [OPTIONS] [COMMAND]

COMMANDS:
    status                    Show today's admission state (default)
    check <SYMBOL>            Run one admission check and print the decision
        --request-id <ID>     Request id for the audit trail [default: random]
        --quota <N>           Override the daily call cap for this check
    sweep                     Remove old cache day buckets
        --keep-days <N>       Days to keep before today [default: cache.retain_days]
    config                    Print the effective configuration

OPTIONS:
    -c, --config <PATH>       Path to configuration file
    -h, --help                Print this help message
    -V, --version             Print version information

ENVIRONMENT:
    RUST_LOG                  Override log level (e.g. RUST_LOG=debug)
    TOLLGATE_CONFIG           Alternative to --config flag
    TOLLGATE_*                Override individual settings
",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = match parse_args(std::env::args().skip(1)) {
        Ok(ParseOutcome::Run(cli)) => cli,
        Ok(ParseOutcome::Help) => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Ok(ParseOutcome::Version) => {
            println!("tollgate {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("Run with --help for usage information.");
            return ExitCode::from(64);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to build tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: CliArgs) -> anyhow::Result<ExitCode> {
    // Allow TOLLGATE_CONFIG env var as alternative to --config flag
    let config_path = cli
        .config_path
        .or_else(|| std::env::var_os("TOLLGATE_CONFIG").map(PathBuf::from))
        .unwrap_or_else(Config::default_path);

    let config = Config::load(&config_path)?;
    init_tracing(&config);
    tracing::debug!(config = %config_path.display(), "Configuration loaded");

    if cli.command == Command::Config {
        print_config(&config)?;
        return Ok(ExitCode::SUCCESS);
    }

    let gate = Gate::open(&config)?;
    with_gate(gate, |gate| execute(gate, &config, cli.command)).await
}

/// Run `f` against `gate`, then let the audit writer drain before returning
/// whatever `f` produced, error or not.
async fn with_gate<T>(
    gate: Gate,
    f: impl FnOnce(&Gate) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let result = f(&gate);
    if let Some(task) = gate.into_audit_task()
        && let Err(e) = task.await
    {
        tracing::warn!(error = %e, "Audit logger task failed");
    }
    result
}

fn execute(gate: &Gate, config: &Config, command: Command) -> anyhow::Result<ExitCode> {
    let code = match command {
        Command::Status => {
            let report = serde_json::json!({
                "admission": gate.controller().snapshot()?,
                "state_path": config.admission.state_path,
                "cache_dir": gate.cache().dir(),
                "cache_ttl_secs": gate.cache().ttl_secs(),
                "throttle_delay_ms": gate.controller().throttle_delay().as_millis() as u64,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            ExitCode::SUCCESS
        }
        Command::Check {
            symbol,
            request_id,
            quota,
        } => {
            let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let decision = gate.check_access(&symbol, &request_id, quota, None)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
            if decision.allowed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }
        Command::Sweep { keep_days } => {
            let keep = keep_days.unwrap_or(config.cache.retain_days);
            let report = gate.cache().sweep(keep)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            ExitCode::SUCCESS
        }
        Command::Config => ExitCode::SUCCESS,
    };
    Ok(code)
}

fn print_config(config: &Config) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    let mut overridden: Vec<_> = config.env_overrides.all().iter().collect();
    if !overridden.is_empty() {
        overridden.sort();
        println!();
        println!("# Overridden by environment:");
        for (key, var) in overridden {
            println!("#   {key} <- {var}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

/// Set up the tracing subscriber based on configuration. Logs go to stderr so
/// command output on stdout stays machine-readable.
fn init_tracing(config: &Config) {
    // RUST_LOG env var takes precedence over config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        EnvFilter::new(format!("tollgate={level},warn"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
