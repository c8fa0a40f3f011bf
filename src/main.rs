//! lightwave-smart - administration CLI
//!
//! Main entry point for the lightwave-smart command-line tool.

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lightwave_smart::cli::{Cli, Commands, ConfigCommand, FlowCommand, TokensCommand};
use lightwave_smart::commands;
use lightwave_smart::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    init_tracing(cli.verbose, cli.json_logs);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path)?;

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Config { command } => match command {
            ConfigCommand::Check => {
                tracing::info!("Checking configuration from {}", config_path);
                commands::config::check(&config)?;
                Ok(())
            }
        },
        Commands::Tokens { command } => match command {
            TokensCommand::Show { identity, json } => {
                commands::tokens::show(&config, &identity, json).await?;
                Ok(())
            }
            TokensCommand::Delete { identity } => {
                commands::tokens::delete(&config, &identity).await?;
                Ok(())
            }
        },
        Commands::Flow { command } => match command {
            FlowCommand::ClearPending => {
                commands::flow::clear_pending(&config).await?;
                Ok(())
            }
        },
    }
}

/// Initialize tracing subscriber with environment filter
///
/// `RUST_LOG` wins when set; otherwise `--verbose` selects debug output for
/// this crate.
fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose {
        "lightwave_smart=debug"
    } else {
        "lightwave_smart=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
