//! pcs CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Environment variable holding a log filter directive, e.g. `pcs_deploy=debug`
pub const LOG_ENV: &str = "PCS_LOG";

/// Our crates log at info; HTTP and kube client chatter stays at warn.
const DEFAULT_LOG_FILTER: &str = "warn,pcs=info,pcs_cli=info,pcs_deploy=info,pcs_common=info";

/// Log filter from `PCS_LOG`, falling back to the default directives
pub fn log_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// pcs - deploy pcs solutions to a cloud subscription
#[derive(Parser, Debug)]
#[command(name = "pcs")]
#[command(version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub deploy: commands::deploy::DeployArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Store credentials for later deployments
    Login(commands::login::LoginArgs),
    /// Remove stored credentials
    Logout(commands::logout::LogoutArgs),
}

impl Cli {
    /// Run the CLI command; no subcommand deploys
    pub async fn run(self) -> Result<()> {
        match self.command {
            Some(Commands::Login(args)) => commands::login::run(args).await,
            Some(Commands::Logout(args)) => commands::logout::run(args).await,
            None => commands::deploy::run(self.deploy).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_quiets_client_crates() {
        assert!(DEFAULT_LOG_FILTER.parse::<EnvFilter>().is_ok());
        let mut directives = DEFAULT_LOG_FILTER.split(',');
        assert_eq!(directives.next(), Some("warn"));
        assert!(directives.all(|d| d.starts_with("pcs") && d.ends_with("=info")));
    }

    #[test]
    fn no_subcommand_means_deploy() {
        let cli = Cli::try_parse_from(["pcs", "-s", "local"]).unwrap();
        assert!(cli.command.is_none());
        assert!(Cli::try_parse_from(["pcs", "logout"]).unwrap().command.is_some());
    }
}
