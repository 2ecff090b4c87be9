//! reflector-launcher - supervises one match
//! Resolves the punch proxy, starts it (and optionally the emulator) and
//! tears both down when either side ends.

mod settings;
mod telemetry;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use reflector_core::application::{shutdown_channel, EndedBy, MatchSession, SessionOutcome};
use reflector_core::port::id_provider::UuidProvider;
use reflector_infra_system::{BinaryResolver, SubprocessLauncher};
use settings::{LauncherSettings, Overrides};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "reflector-launcher")]
#[command(about = "Run a netplay match through the punch proxy", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: platform config dir/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log format: pretty or json
    #[arg(long, global = true, env = "REFLECTOR_LOG_FORMAT", default_value = "pretty")]
    log_format: String,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy (and emulator) and wait for the match to end
    Run,

    /// Print the proxy command line without starting anything
    Args,

    /// Print where the proxy binary would be loaded from
    Resolve,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "launcher failed");
            eprintln!("{} {:#}", "✗".red(), e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let mut settings =
        LauncherSettings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    settings.apply(&cli.overrides);

    let _log_guard = telemetry::init_logging(&cli.log_format, settings.log_dir().as_deref());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Resolve => {
            let resolver = BinaryResolver::for_proxy(settings.proxy_path.as_deref());
            for candidate in resolver.candidates() {
                let mark = if candidate.is_file() { "✓".green() } else { "○".dimmed() };
                println!("  {} {}", mark, candidate.display());
            }
            let path = resolver.resolve()?;
            println!("{} {}", "Proxy:".bold(), path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Args => {
            let plan = settings.session_plan(PathBuf::from("punch-proxy"))?;
            let spec = plan.proxy_spec();
            println!("{} {}", spec.program.display(), spec.args.join(" "));
            if let Some(emulator) = &plan.emulator {
                let spec = plan.emulator_spec(emulator);
                println!("{} {}", spec.program.display(), spec.args.join(" "));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run => run(&settings).await,
    }
}

async fn run(settings: &LauncherSettings) -> Result<ExitCode> {
    info!("reflector-launcher v{} starting...", VERSION);

    let proxy_program = BinaryResolver::for_proxy(settings.proxy_path.as_deref())
        .resolve()
        .context("Failed to locate punch proxy")?;
    let plan = settings.session_plan(proxy_program)?;
    info!(proxy = %plan.proxy_program.display(), server = %plan.proxy_args.server_authority(), "Session planned");

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    tokio::spawn(shutdown_tx.shutdown_on(tokio::signal::ctrl_c()));

    let session = MatchSession::new(Arc::new(SubprocessLauncher::new()), Arc::new(UuidProvider));
    let outcome = session.run(&plan, shutdown_rx).await?;

    print_summary(&outcome);
    Ok(if outcome.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_summary(outcome: &SessionOutcome) {
    let headline = if outcome.is_clean() {
        "✓ Match ended".green().bold()
    } else {
        "✗ Match ended abnormally".red().bold()
    };
    println!("{}", headline);
    println!("  {} {}", "Session:".bold(), outcome.session_id);

    let ended_by = match outcome.ended_by {
        EndedBy::ProxyExited => "proxy exited",
        EndedBy::EmulatorExited => "emulator exited",
        EndedBy::Shutdown => "shutdown requested",
    };
    println!("  {} {}", "Ended by:".bold(), ended_by);

    if let Some(report) = outcome.proxy {
        match outcome.proxy_exit() {
            Some(reason) => println!("  {} {} ({})", "Proxy:".bold(), report, reason),
            None => println!("  {} {}", "Proxy:".bold(), report),
        }
    }
    if let Some(report) = outcome.emulator {
        println!("  {} {}", "Emulator:".bold(), report);
    }
}
