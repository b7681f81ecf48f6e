//! `pcs login`: store a bearer token for later deployments.
//!
//! The token comes either from `--token` or from the Azure CLI
//! (`az account get-access-token`), together with the subscriptions it can
//! reach (`az account list`). Both are written to `~/.pcs/cache.json`.
//!
//! # Usage
//!
//! ```bash
//! # Reuse an existing `az login` session
//! pcs login
//!
//! # Sovereign cloud
//! pcs login -e AzureChinaCloud
//!
//! # Explicit token (CI)
//! pcs login --token "$TOKEN" --subscription-id <id>
//! ```

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use clap::Args;
use pcs_deploy::CloudEnvironment;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::commands::CommandErrorExt;
use crate::config::{self, CredentialCache, Subscription};
use crate::{Error, Result};

/// Store credentials for later deployments
#[derive(Args, Debug)]
pub struct LoginArgs {
    /// Cloud to log in to
    #[arg(short = 'e', long, default_value = "AzureCloud")]
    pub environment: CloudEnvironment,

    /// Bearer token for the resource manager (skips the Azure CLI)
    #[arg(long, env = "PCS_ACCESS_TOKEN", requires = "subscription_id")]
    pub token: Option<String>,

    /// Subscription the token belongs to
    #[arg(long)]
    pub subscription_id: Option<String>,

    /// Azure CLI executable
    #[arg(long, default_value = "az", hide = true)]
    pub az: String,
}

/// Run the login command.
pub async fn run(args: LoginArgs) -> Result<()> {
    let cache = match args.token {
        Some(token) => CredentialCache {
            environment: args.environment.name().to_string(),
            access_token: token,
            expires_on: None,
            subscriptions: args
                .subscription_id
                .map(|id| Subscription {
                    id,
                    name: String::new(),
                    is_default: true,
                })
                .into_iter()
                .collect(),
        },
        None => {
            let token = az_json(&args.az, &["account", "get-access-token"]).await?;
            let (access_token, expires_on) = parse_access_token(&token)?;
            let list = az_json(&args.az, &["account", "list"]).await?;
            CredentialCache {
                environment: args.environment.name().to_string(),
                access_token,
                expires_on,
                subscriptions: parse_subscriptions(&list)?,
            }
        }
    };

    let path = config::save_cache(&cache)?;

    eprintln!(
        "Logged in to {}. Credentials saved to {}",
        args.environment,
        path.display()
    );
    if !cache.subscriptions.is_empty() {
        eprintln!();
        eprintln!("Available subscriptions:");
        for sub in &cache.subscriptions {
            let marker = if sub.is_default { " *" } else { "" };
            eprintln!("  - {} ({}){}", sub.name, sub.id, marker);
        }
    }
    Ok(())
}

/// Run the Azure CLI with JSON output and return stdout.
async fn az_json(program: &str, args: &[&str]) -> Result<String> {
    debug!(program, ?args, "Running Azure CLI");
    let output = Command::new(program)
        .args(args)
        .args(["--output", "json"])
        .output()
        .await
        .map_err(|e| {
            Error::command_failed(format!(
                "failed to run {}: {}. Install the Azure CLI or pass --token",
                program, e
            ))
        })?;
    if !output.status.success() {
        return Err(Error::command_failed(format!(
            "{} {} failed: {}. Run `az login` first",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    String::from_utf8(output.stdout).cmd_err()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzAccessToken {
    access_token: String,
    /// Local time, `%Y-%m-%d %H:%M:%S%.f`
    expires_on: Option<String>,
    /// Unix seconds, newer CLI versions only
    #[serde(rename = "expires_on")]
    expires_on_epoch: Option<i64>,
}

/// Token and expiry from `az account get-access-token` output.
pub fn parse_access_token(json: &str) -> Result<(String, Option<DateTime<Utc>>)> {
    let token: AzAccessToken = serde_json::from_str(json)?;
    if token.access_token.is_empty() {
        return Err(Error::command_failed("Azure CLI returned an empty token"));
    }
    let expires_on = match (token.expires_on_epoch, token.expires_on.as_deref()) {
        (Some(secs), _) => DateTime::from_timestamp(secs, 0),
        (None, Some(local)) => NaiveDateTime::parse_from_str(local, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .and_then(|naive| Local.from_local_datetime(&naive).single())
            .map(|t| t.with_timezone(&Utc)),
        (None, None) => None,
    };
    Ok((token.access_token, expires_on))
}

/// Subscriptions from `az account list` output.
pub fn parse_subscriptions(json: &str) -> Result<Vec<Subscription>> {
    Ok(serde_json::from_str(json)?)
}
