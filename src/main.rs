//! Command-line entry point of the last-resort gateway daemon.

use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lrgd::{DaemonConfig, KernelSocket, LogLifecycle, Reporter, Supervisor};

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;

#[derive(Debug, Parser)]
#[command(name = "lrgd", version, about = "Last-Resort Gateway daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the daemon with the given configuration file.
    Daemon {
        /// Path to the YAML configuration file.
        config: std::path::PathBuf,
        /// Only validate the configuration, then exit.
        #[arg(long)]
        check: bool,
    },
    /// Print version information.
    Version,
}

fn main() -> ExitCode {
    ExitCode::from(run(std::env::args_os()))
}

/// Parses the arguments and dispatches the command, returning the process
/// exit code. Usage and runtime errors both exit 1, with distinct
/// renderings on stderr.
fn run<I, T>(args: I) -> u8
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err)
            if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) =>
        {
            let _ = err.print();
            return EXIT_SUCCESS;
        }
        Err(err) => {
            eprintln!("{}", usage_error(&err));
            eprintln!("Use --help for usage");
            return EXIT_FAILURE;
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let result = match cli.command {
        Command::Version => {
            println!("{}", version());
            Ok(())
        }
        Command::Daemon { config, check } => run_daemon(&config, check),
    };
    match result {
        Ok(()) => EXIT_SUCCESS,
        Err(err) => {
            eprintln!("{}", runtime_error(&err));
            EXIT_FAILURE
        }
    }
}

fn usage_error(err: &clap::Error) -> String {
    format!("Usage error: {}", err)
}

fn runtime_error(err: &lrgd::Error) -> String {
    format!("Runtime error: {}", err)
}

fn version() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

fn run_daemon(path: &Path, check: bool) -> lrgd::Result<()> {
    let config = DaemonConfig::load(path)?;
    if check {
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let reporter = Arc::new(Reporter::new());
        let socket = Arc::new(KernelSocket::new(config.netlink.socket_size)?);
        let supervisor =
            Supervisor::start(reporter, socket, &config, Arc::new(LogLifecycle));
        wait_for_signal().await?;
        supervisor.shutdown().await;
        Ok(())
    })
}

/// Waits for SIGINT or SIGTERM.
async fn wait_for_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => tracing::info!(signal = "SIGTERM", "quitting..."),
        _ = interrupt.recv() => tracing::info!(signal = "SIGINT", "quitting..."),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_unknown_subcommand_is_a_usage_error() {
        let err = Cli::try_parse_from(["lrgd", "bogus"]).unwrap_err();
        assert!(!matches!(
            err.kind(),
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
        ));
        assert!(usage_error(&err).starts_with("Usage error: "));
        assert_eq!(run(["lrgd", "bogus"]), EXIT_FAILURE);
    }

    #[test]
    fn test_missing_config_argument_is_a_usage_error() {
        let err = Cli::try_parse_from(["lrgd", "daemon"]).unwrap_err();
        assert!(usage_error(&err).starts_with("Usage error: "));
        assert_eq!(run(["lrgd", "daemon"]), EXIT_FAILURE);
    }

    #[test]
    fn test_help_exits_successfully() {
        let err = Cli::try_parse_from(["lrgd", "--help"]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::DisplayHelp));
        assert_eq!(run(["lrgd", "--help"]), EXIT_SUCCESS);
    }

    #[test]
    fn test_version_command() {
        assert_eq!(version(), format!("lrgd {}", env!("CARGO_PKG_VERSION")));
        assert_eq!(run(["lrgd", "version"]), EXIT_SUCCESS);
    }

    #[test]
    fn test_unreadable_config_is_a_runtime_error() {
        let err = run_daemon(Path::new("/nonexistent/lrgd.yaml"), true).unwrap_err();
        let message = runtime_error(&err);
        assert!(message.starts_with("Runtime error: "));
        assert!(message.contains("cannot read"));
        assert_eq!(
            run(["lrgd", "daemon", "--check", "/nonexistent/lrgd.yaml"]),
            EXIT_FAILURE
        );
    }

    #[test]
    fn test_invalid_config_fails_the_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lrgd.yaml");
        fs::write(&path, "gateways: []\n").unwrap();
        let err = run_daemon(&path, true).unwrap_err();
        assert!(runtime_error(&err).contains("at least one gateway is needed"));
    }

    #[test]
    fn test_check_accepts_a_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lrgd.yaml");
        fs::write(&path, "gateways:\n  - from:\n      prefix: 0.0.0.0/0\n").unwrap();
        run_daemon(&path, true).unwrap();
        let path = path.to_str().unwrap();
        assert_eq!(run(["lrgd", "daemon", "--check", path]), EXIT_SUCCESS);
    }
}
