use colored::Colorize;

use crate::config::Config;
use crate::error::Result;
use crate::flow::state::PendingFlowStore;
use crate::storage;

/// Discards the suspended authorization-code flow, if any.
pub async fn clear_pending(config: &Config) -> Result<()> {
    let pending = PendingFlowStore::new(storage::open(&config.storage)?);

    if !pending.is_pending().await? {
        println!("{}", "No pending flow.".yellow());
        return Ok(());
    }

    pending.clear().await?;
    tracing::info!("Cleared pending authorization flow");
    println!("{}", "Cleared pending flow.".green());
    Ok(())
}
