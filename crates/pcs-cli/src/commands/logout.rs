//! Logout command: remove `~/.pcs/cache.json`.

use clap::Args;
use tracing::info;

use crate::config;
use crate::Result;

/// Remove stored credentials
#[derive(Args, Debug)]
pub struct LogoutArgs {}

pub async fn run(_args: LogoutArgs) -> Result<()> {
    let path = config::cache_path()?;
    if config::remove_cache_at(&path)? {
        info!("Removed {}", path.display());
        println!("Logged out. Saved credentials have been removed.");
    } else {
        println!("Already logged out (no saved credentials found).");
    }
    Ok(())
}
