// ABOUTME: Main entry point for the chat relay
// ABOUTME: Parses the CLI, initializes logging and configuration, then runs the supervisor

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use warelay::bootstrap::{self, LaunchOptions};
use warelay::config::Config;
use warelay::paths;
use warelay_core::LoginMode;

/// Login flow selected by the optional positional argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Print a QR code to scan instead of requesting a pairing code
    Qr,
}

/// CLI arguments for warelay
#[derive(Parser, Debug)]
#[command(name = "warelay")]
#[command(version, about = "Relay chat messages to a language model and reply in the same conversation")]
#[command(long_about = r#"
Relays incoming chat messages to an OpenAI-compatible completion service and
replies in the same conversation, quoting the original message.

A new session must be linked first: either pass --number to receive a pairing
code, or run with `qr` and scan the printed QR code.

Configuration files are loaded from (in priority order):
1. --config <path>
2. $WARELAY_CONFIG_PATH
3. ./config.toml
4. ~/.config/warelay/config.toml

Example:
  warelay --number 081234567890
  warelay qr
"#)]
struct Cli {
    /// Use QR login instead of the pairing-code flow
    #[arg(value_enum)]
    mode: Option<Mode>,

    /// Phone number to pair with (leading 0 is replaced by the local prefix)
    #[arg(long, value_name = "NUMBER")]
    number: Option<String>,

    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbosity level (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Console output plus JSON lines in a daily rolling file. The returned guard
/// must live until exit so buffered file output is flushed.
fn init_logging(verbose: u8) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_dir = paths::log_dir();
    let file_appender = std::fs::create_dir_all(&log_dir)
        .map_err(anyhow::Error::from)
        .and_then(|_| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("warelay")
                .filename_suffix("log")
                .build(&log_dir)
                .map_err(anyhow::Error::from)
        });

    let (file_layer, guard, file_error) = match file_appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    match file_error {
        Some(e) => tracing::warn!(
            path = %log_dir.display(),
            error = %e,
            "File logging disabled"
        ),
        None => tracing::debug!(path = %log_dir.display(), "Writing JSON logs"),
    }
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log panics before they take the process down
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\nwarelay crashed: {}", panic_info);
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    let log_guard = init_logging(cli.verbose);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting warelay");

    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "Configuration loaded");

    let launch = LaunchOptions {
        login: match cli.mode {
            Some(Mode::Qr) => LoginMode::Qr,
            None => LoginMode::PairingCode,
        },
        phone_number: cli.number,
    };

    let supervisor = bootstrap::build(&config, launch)?;
    let result = bootstrap::run(supervisor).await;
    let code = bootstrap::exit_code(&result);

    drop(log_guard);
    std::process::exit(code);
}
