use std::process::ExitCode;

use clap::Parser;

use mediagate::cli::{self, Cli, Command, ConfigCommand};
use mediagate::config;
use mediagate::logging::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let path = cli::config_path(cli.config.as_deref());

    // Path and validate must work even when the file is broken.
    match &cli.command {
        Command::Config(ConfigCommand::Path) => {
            cli::handle_config_path(&path);
            return Ok(ExitCode::SUCCESS);
        }
        Command::Config(ConfigCommand::Validate) => {
            return Ok(if cli::handle_config_validate(&path)? {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        Command::Version => {
            cli::handle_version();
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let config = config::load_config_from(&path)?;

    let mut log_config = LogConfig::from(&config.logging);
    if cli.verbose {
        log_config = log_config.with_default_filter("debug");
    }
    init_logging(log_config)?;

    match cli.command {
        Command::Ingest {
            file,
            name,
            timeout,
            stats,
        } => cli::handle_ingest(&config, &file, name, timeout, stats).await?,
        Command::Fetch {
            url,
            timeout,
            stats,
        } => cli::handle_fetch(&config, &url, timeout, stats).await?,
        Command::CheckUrl { url } => cli::handle_check_url(&config, &url).await?,
        Command::Config(ConfigCommand::Show) => cli::handle_config_show(&config)?,
        Command::Config(_) | Command::Version => {}
    }

    Ok(ExitCode::SUCCESS)
}
