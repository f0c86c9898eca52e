//! meshcore-console binary: headless access to a meshcore radio.
//!
//! Logs go to stderr through `tracing`; command output goes to stdout as
//! JSON lines (or `[OK]`/`[FAIL]` lines for `doctor`).

use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use meshcore_console::{commands, config, doctor, Config, ConsoleError};
use meshcore_radio::AdapterKind;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshcore-console", version, about = "Headless meshcore radio console")]
struct Cli {
    /// Configuration file (defaults to MESHCORE_CONFIG_PATH, then meshcore.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Use synthetic traffic instead of the radio hardware.
    #[arg(long, global = true)]
    mock: bool,

    /// Name this node advertises.
    #[arg(long, global = true)]
    node_name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check host prerequisites for radio access.
    Doctor,

    /// Connect and print incoming events.
    Listen {
        /// Stop after N seconds (0 = until Ctrl+C).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },

    /// Connect and send a text message.
    Send {
        /// `#channel`, `@peer`, a peer name or a 64-hex public key.
        #[arg(long)]
        to: String,

        #[arg(long)]
        message: String,

        /// Seconds to wait for an ack or repeater echo.
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },

    /// Connect and flood an advert for this node.
    Advert,

    /// Connect and ask a peer for its sensor readings.
    Telemetry {
        /// `@peer`, a peer name or a 64-hex public key.
        #[arg(long)]
        to: String,

        /// Seconds to wait for the answer.
        #[arg(long, default_value_t = 15)]
        wait: u64,
    },

    /// Pin a peer, or unpin it with --remove.
    Favorite {
        /// Stable id or display name.
        #[arg(long)]
        peer: String,

        #[arg(long)]
        remove: bool,
    },

    /// Delete a channel with its thread and messages.
    RemoveChannel {
        #[arg(long)]
        name: String,
    },

    /// Store a channel secret.
    ImportChannel {
        #[arg(long)]
        name: String,

        /// 16- or 32-byte secret, hex encoded.
        #[arg(long)]
        secret: String,
    },
}

fn resolve_config_path(cli: &Cli) -> (String, &'static str) {
    if let Some(path) = cli.config.as_ref().filter(|p| !p.trim().is_empty()) {
        return (path.clone(), "cli-arg");
    }

    if let Ok(path) = std::env::var("MESHCORE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (path, "env-var");
        }
    }

    ("meshcore.toml".to_string(), "default")
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config_path, config_source) = resolve_config_path(&cli);

    let mut config = match config::load_config(Some(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("meshcore-console: {e}");
            return ExitCode::FAILURE;
        }
    };
    if cli.mock {
        config.radio.mode = AdapterKind::Mock;
    }
    if let Some(name) = cli.node_name.as_ref().filter(|n| !n.trim().is_empty()) {
        config.radio.node_name = name.trim().to_string();
    }

    init_tracing(&config);
    tracing::info!(
        source = config_source,
        path = %config_path,
        mode = %config.radio.mode,
        "resolved startup configuration"
    );

    match run(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: &Config) -> Result<ExitCode, ConsoleError> {
    let mut stdout = std::io::stdout().lock();
    match command {
        Command::Doctor => {
            let checks = doctor::run_checks(config);
            for check in &checks {
                writeln!(stdout, "{check}")?;
            }
            if doctor::all_passed(&checks) {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Listen { duration } => {
            let mut pipeline = meshcore_console::build_pipeline(config)?;
            let duration = (duration > 0).then(|| Duration::from_secs(duration));
            commands::listen(&mut pipeline, config.tick(), duration, &mut stdout, shutdown_signal())
                .await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Send { to, message, wait } => {
            let mut pipeline = meshcore_console::build_pipeline(config)?;
            let sent = commands::send(
                &mut pipeline,
                &to,
                &message,
                Duration::from_secs(wait),
                config.tick(),
            )
            .await?;
            commands::print_json(&mut stdout, &sent)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Advert => {
            let mut pipeline = meshcore_console::build_pipeline(config)?;
            commands::advert(&mut pipeline)?;
            commands::print_json(&mut stdout, &pipeline.service().status())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Telemetry { to, wait } => {
            let mut pipeline = meshcore_console::build_pipeline(config)?;
            let answer =
                commands::telemetry(&mut pipeline, &to, Duration::from_secs(wait), config.tick())
                    .await?;
            match answer {
                Some(event) => {
                    commands::print_json(&mut stdout, &event)?;
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    tracing::warn!(to = %to, wait, "no telemetry answer");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Favorite { peer, remove } => {
            let store = meshcore_console::open_store(config)?;
            let peer = commands::favorite(&store, &peer, !remove)?;
            commands::print_json(&mut stdout, &peer)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::RemoveChannel { name } => {
            let store = meshcore_console::open_store(config)?;
            let removed = commands::remove_channel(&store, &name)?;
            commands::print_json(
                &mut stdout,
                &serde_json::json!({ "channel": name, "removed_messages": removed }),
            )?;
            Ok(ExitCode::SUCCESS)
        }
        Command::ImportChannel { name, secret } => {
            let store = meshcore_console::open_store(config)?;
            let channel = commands::import_channel(&store, &name, &secret)?;
            commands::print_json(&mut stdout, &channel)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, stopping"); }
        () = terminate => { tracing::info!("received SIGTERM, stopping"); }
    }
}
