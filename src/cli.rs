//! Command-line interface definition for lightwave-smart
//!
//! This module defines the CLI structure using clap's derive API. The binary
//! is an administration tool for the durable state the integration keeps:
//! configuration, stored credential sets and the pending flow continuation.

use clap::{Parser, Subcommand};

/// lightwave-smart - Lightwave Smart hub integration tooling
///
/// Inspect configuration and manage stored credentials and pending
/// authorization flows.
#[derive(Parser, Debug, Clone)]
#[command(name = "lightwave-smart")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Stored credential commands
    Tokens {
        #[command(subcommand)]
        command: TokensCommand,
    },

    /// Authorization flow commands
    Flow {
        #[command(subcommand)]
        command: FlowCommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Load and validate the configuration, then print the effective values
    Check,
}

/// Stored credential subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum TokensCommand {
    /// Show the credential set stored for an identity, secrets redacted
    Show {
        /// Username or instance identity
        identity: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Delete every credential record stored for an identity
    Delete {
        /// Username or instance identity
        identity: String,
    },
}

/// Authorization flow subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum FlowCommand {
    /// Discard a suspended authorization-code flow
    ClearPending,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_config_check() {
        let cli = Cli::try_parse_from(["lightwave-smart", "config", "check"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                command: ConfigCommand::Check
            }
        ));
        assert_eq!(cli.config.as_deref(), Some("config/config.yaml"));
    }

    #[test]
    fn test_cli_parse_tokens_show_json() {
        let cli = Cli::try_parse_from([
            "lightwave-smart",
            "--verbose",
            "tokens",
            "show",
            "me@example.com",
            "--json",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Tokens {
                command: TokensCommand::Show { identity, json },
            } => {
                assert_eq!(identity, "me@example.com");
                assert!(json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parse_flow_clear_pending() {
        let cli = Cli::try_parse_from([
            "lightwave-smart",
            "--json-logs",
            "-c",
            "other.yaml",
            "flow",
            "clear-pending",
        ])
        .unwrap();

        assert!(cli.json_logs);
        assert_eq!(cli.config.as_deref(), Some("other.yaml"));
        assert!(matches!(
            cli.command,
            Commands::Flow {
                command: FlowCommand::ClearPending
            }
        ));
    }

    #[test]
    fn test_cli_tokens_show_requires_identity() {
        assert!(Cli::try_parse_from(["lightwave-smart", "tokens", "show"]).is_err());
    }
}
