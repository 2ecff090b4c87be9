//! punch-proxy - UDP hole-punch relay
//! Registers with the rendezvous server, learns the opponent endpoint and
//! relays emulator traffic until the match ends.

mod cli;

use anyhow::{Context, Result};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::ProxyCli;
use reflector_core::application::shutdown_channel;
use reflector_core::domain::ProxyExit;
use reflector_infra_net::PunchProxy;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match ProxyCli::parse_go_style(std::env::args_os()) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                exit_code(ProxyExit::InvalidArguments)
            } else {
                // --help / --version
                ExitCode::SUCCESS
            };
        }
    };

    init_logging(&cli.log_format);
    info!("punch-proxy v{} starting...", VERSION);

    let (args, config) = match cli.into_parts() {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("invalid arguments: {}", e);
            return exit_code(ProxyExit::InvalidArguments);
        }
    };

    match run(args, config).await {
        Ok(exit) => exit_code(exit),
        Err(e) => {
            error!(error = ?e, "punch-proxy failed");
            exit_code(ProxyExit::Fatal)
        }
    }
}

async fn run(
    args: reflector_core::domain::ProxyArgs,
    config: reflector_core::application::RelayConfig,
) -> Result<ProxyExit> {
    let bound = PunchProxy::new(args, config)
        .bind()
        .await
        .context("Failed to set up proxy sockets")?;

    let punch = bound.punch_addr().context("punch socket has no local address")?;
    let emu_in = bound.emulator_addr().context("emulator socket has no local address")?;
    info!(server = %bound.server_addr(), punch = %punch, emu_in = %emu_in, "Sockets bound");
    // machine-readable line for the host
    println!("ready punch={} emu_in={}", punch, emu_in);

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    tokio::spawn(shutdown_tx.shutdown_on(wait_for_signal()));

    let report = bound.run(shutdown_rx).await;
    Ok(report.exit)
}

/// Ctrl+C, or SIGTERM from the supervising host
async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = term.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn init_logging(format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("reflector=info,punch_proxy=info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout: the host relays our stdout as data and stderr as errors
    match format {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stdout))
            .init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_ansi(false).with_writer(std::io::stdout))
            .init(),
    }
}

fn exit_code(exit: ProxyExit) -> ExitCode {
    ExitCode::from(exit.code() as u8)
}
