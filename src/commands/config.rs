use colored::Colorize;
use prettytable::{format, row, Table};

use crate::config::{Config, StorageBackend};
use crate::error::Result;
use crate::storage;

/// Prints the effective configuration. The caller has already validated it.
pub fn check(config: &Config) -> Result<()> {
    let path = match (&config.storage.path, config.storage.backend) {
        (Some(path), _) => path.display().to_string(),
        (None, StorageBackend::Sled) => storage::default_path()?
            .display()
            .to_string(),
        (None, _) => "-".to_string(),
    };

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.add_row(row!["Setting".bold(), "Value".bold()]);
    table.add_row(row!["storage.backend", format!("{:?}", config.storage.backend).to_lowercase()]);
    table.add_row(row!["storage.path", path]);
    table.add_row(row!["activation.retries", config.activation.retries]);
    table.add_row(row![
        "activation.backoff",
        format!(
            "{}ms .. {}ms",
            config.activation.initial_backoff_ms, config.activation.max_backoff_ms
        )
    ]);
    table.add_row(row![
        "activation.attempt_timeout",
        format!("{}s", config.activation.attempt_timeout_secs)
    ]);
    table.add_row(row!["validation.retries", config.validation.retries]);

    println!("{}", "Configuration OK".green());
    table.printstd();
    Ok(())
}
