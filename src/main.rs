//! ssh-remote - Entry point
//!
//! Parses CLI arguments, runs one remote operation and exits with the
//! remote task's status. Ctrl+C and SIGTERM cancel the running operation;
//! its session is still released before the process exits.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ssh_remote::config::{Args, Command, RemoteConfig};
use ssh_remote::error::Result;
use ssh_remote::ssh::{
    BatchRequest, CommandDispatcher, ConnectionDescriptor, ExitOutcome, RusshTransport,
    SessionConnector, SudoBatchDriver,
};

/// Exit code used when the operation was cancelled by a signal
const INTERRUPTED_EXIT_CODE: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries task output
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = Arc::new(RemoteConfig::from_args(&args)?);
    info!("ssh-remote v{} starting...", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let shutdown_handle = tokio::spawn(wait_for_shutdown(cancel.clone()));

    let connector = SessionConnector::new(Arc::new(RusshTransport::new()), config)
        .with_cancel(cancel.clone());
    let result = dispatch(&connector, args.command).await;

    shutdown_handle.abort();

    if cancel.is_cancelled() {
        info!("Operation interrupted");
        if let Ok(output) = &result {
            print!("{}", output);
        }
        return Ok(ExitCode::from(INTERRUPTED_EXIT_CODE));
    }

    report(result, args.json)
}

async fn dispatch(connector: &SessionConnector, command: Command) -> Result<String> {
    let dispatcher = CommandDispatcher::new(connector.clone());
    match command {
        Command::Exec { uri, command } => {
            let descriptor = ConnectionDescriptor::parse(&uri)?;
            dispatcher.exec(&descriptor, &command).await
        }
        Command::Shell { uri, script } => {
            let descriptor = ConnectionDescriptor::parse(&uri)?;
            dispatcher.shell(&descriptor, &script).await
        }
        Command::Attach { uri } => {
            let descriptor = ConnectionDescriptor::parse(&uri)?;
            dispatcher
                .attach(&descriptor, &mut tokio::io::stdin(), &mut tokio::io::stdout())
                .await?;
            Ok(String::new())
        }
        Command::Transfer { from, to } => {
            let copied = dispatcher.transfer(&from, &to).await?;
            Ok(format!("{} bytes copied", copied))
        }
        Command::Batch {
            user,
            password,
            host,
            sudo,
            dir,
            command,
        } => {
            let request = BatchRequest {
                user,
                password,
                host,
                sudo_command: sudo.filter(|s| !s.trim().is_empty()),
                batch_dir: dir,
                batch_command: command,
            };
            SudoBatchDriver::new(connector.clone())
                .execute_batch(&request)
                .await
        }
    }
}

/// Print the outcome and map it to the process exit code
fn report(result: Result<String>, json: bool) -> Result<ExitCode> {
    let (outcome, error) = match result {
        Ok(output) => (ExitOutcome::success(output), None),
        Err(e) => match ExitOutcome::from_error(&e) {
            Some(outcome) => (outcome, Some(e)),
            None => return Err(e),
        },
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if !outcome.output.is_empty() {
        println!("{}", outcome.output.trim_end());
    }

    match error {
        None => Ok(ExitCode::SUCCESS),
        Some(e) => {
            error!("{}", e);
            Ok(ExitCode::from(exit_code(outcome.exit_status)))
        }
    }
}

/// Clamp a remote exit status into the range a process can report as failure
fn exit_code(status: i32) -> u8 {
    u8::try_from(status.clamp(1, 255)).unwrap_or(1)
}

async fn wait_for_shutdown(cancel: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), cancelling...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to register SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, cancelling...");
        }
    }
    cancel.cancel();
}
