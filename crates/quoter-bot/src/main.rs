//! quoter-bot: market-making agent for binary outcome markets.
//!
//! Usage:
//!   quoter-bot [OPTIONS]
//!
//! Options:
//!   -m, --mode <MODE>       Run mode: live, paper
//!   -c, --config <FILE>     Config file path (default: config/quoter.toml)
//!   --registry-url <URL>    Registry HTTP base URL (overrides config)

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use quoter_bot::app::App;
use quoter_bot::config::BotConfig;

/// CLI arguments for quoter-bot.
#[derive(Parser, Debug)]
#[command(name = "quoter-bot")]
#[command(about = "Market-making agent for binary outcome markets")]
#[command(version)]
struct Args {
    /// Run mode: live, paper
    #[arg(short, long)]
    mode: Option<String>,

    /// Config file path
    #[arg(short, long, default_value = "config/quoter.toml")]
    config: PathBuf,

    /// Registry HTTP base URL (overrides config file)
    #[arg(long)]
    registry_url: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    let mut config = if args.config.exists() {
        BotConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        warn!("Config file not found at {:?}, using defaults", args.config);
        BotConfig::default()
    };

    config.apply_env_overrides();
    config.apply_cli_overrides(args.mode);
    if let Some(url) = args.registry_url {
        config.registry.source = "http".to_string();
        config.registry.url = url;
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    info!("Starting quoter-bot");
    info!("Mode: {}", config.mode);

    config.validate().context("Configuration validation failed")?;

    let app = App::from_config(config).context("Failed to build application")?;
    let shutdown = app.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            error!("Shutdown signal handler error: {}", e);
        }
        info!("Requesting shutdown...");
        let _ = shutdown.send(());
    });

    app.run().await
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing_defaults() {
        let args = Args::try_parse_from(["quoter-bot"]).unwrap();
        assert_eq!(args.config.to_str().unwrap(), "config/quoter.toml");
        assert!(args.mode.is_none());
        assert!(args.registry_url.is_none());
    }

    #[test]
    fn test_cli_mode_override() {
        let args = Args::try_parse_from(["quoter-bot", "--mode", "paper"]).unwrap();
        assert_eq!(args.mode, Some("paper".to_string()));
    }

    #[test]
    fn test_cli_combined_options() {
        let args = Args::try_parse_from([
            "quoter-bot",
            "-m",
            "live",
            "-c",
            "/etc/quoter.toml",
            "--registry-url",
            "http://registry:8080",
        ])
        .unwrap();

        assert_eq!(args.mode, Some("live".to_string()));
        assert_eq!(args.config.to_str().unwrap(), "/etc/quoter.toml");
        assert_eq!(args.registry_url, Some("http://registry:8080".to_string()));
    }
}
