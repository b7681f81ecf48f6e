//! Deploy a solution (the default command).
//!
//! # Usage
//!
//! ```bash
//! # Single VM in the default cloud
//! pcs -t remotemonitoring -s basic --name contoso --location eastus \
//!     --admin-username azureuser --admin-password '...'
//!
//! # Kubernetes cluster
//! pcs -s standard --name contoso --location eastus \
//!     --ssh-public-key ~/.ssh/id_rsa.pub \
//!     --servicePrincipalId <id> --servicePrincipalSecret <secret> \
//!     --cert cert.pem --cert-key key.pem --cert-thumbprint <sha1>
//!
//! # Cloud resources only, microservices run locally
//! pcs -s local --name contoso --location eastus
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use pcs_common::progress::reporter_for_stdout;
use pcs_deploy::cluster::TlsMaterial;
use pcs_deploy::platform::ArmClient;
use pcs_deploy::{
    CloudEnvironment, DeploymentAnswers, DeploymentTarget, Orchestrator, Runtime, Sku,
    SolutionLoader, SolutionType,
};
use tracing::{debug, info, warn};

use crate::commands::read_input_file;
use crate::config::{self, CredentialCache};
use crate::{Error, Result};

/// Deploy a solution to the logged-in subscription
#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Solution type
    #[arg(short = 't', long = "type", default_value = "remotemonitoring")]
    pub solution_type: SolutionType,

    /// Deployment flavour: basic (single VM), standard (cluster) or local
    #[arg(short = 's', long, default_value = "basic")]
    pub sku: Sku,

    /// Cloud to deploy to; defaults to the cloud used at login
    #[arg(short = 'e', long)]
    pub environment: Option<CloudEnvironment>,

    /// Microservice runtime
    #[arg(short = 'r', long, default_value = "dotnet")]
    pub runtime: Runtime,

    /// Service principal used by the cluster
    #[arg(long = "servicePrincipalId", requires = "service_principal_secret")]
    pub service_principal_id: Option<String>,

    /// Service principal secret
    #[arg(long = "servicePrincipalSecret", env = "PCS_SERVICE_PRINCIPAL_SECRET")]
    pub service_principal_secret: Option<String>,

    /// Solution name, also used for the resource group
    #[arg(short = 'n', long, env = "PCS_SOLUTION_NAME")]
    pub name: Option<String>,

    /// Subscription to deploy into; defaults to the login's default subscription
    #[arg(long, env = "PCS_SUBSCRIPTION_ID")]
    pub subscription_id: Option<String>,

    /// Region
    #[arg(short = 'l', long)]
    pub location: Option<String>,

    /// Website name, when it differs from the solution name
    #[arg(long)]
    pub website_name: Option<String>,

    /// Admin user for the VM or cluster
    #[arg(long)]
    pub admin_username: Option<String>,

    /// Admin password for the VM
    #[arg(long, env = "PCS_ADMIN_PASSWORD")]
    pub admin_password: Option<String>,

    /// SSH public key; the private key `id_rsa` must sit next to it
    #[arg(long)]
    pub ssh_public_key: Option<PathBuf>,

    /// AAD tenant id
    #[arg(long)]
    pub aad_tenant_id: Option<String>,

    /// AAD application id
    #[arg(long)]
    pub app_id: Option<String>,

    /// AAD application URL
    #[arg(long)]
    pub app_url: Option<String>,

    /// AAD domain, used in portal links
    #[arg(long)]
    pub domain: Option<String>,

    /// PEM certificate for the site's TLS endpoint
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// PEM private key for `--cert`
    #[arg(long)]
    pub cert_key: Option<PathBuf>,

    /// Thumbprint of `--cert`
    #[arg(long)]
    pub cert_thumbprint: Option<String>,

    /// Directory holding the solution templates
    #[arg(long, env = "PCS_SOLUTIONS_DIR", default_value = "solutions")]
    pub solutions_dir: PathBuf,

    /// Directory receiving `deployments/<name>-output.json`
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,
}

/// Run the deploy command.
pub async fn run(args: DeployArgs) -> Result<()> {
    let cache = config::load_cache()?.ok_or(Error::NotLoggedIn)?;
    let environment = resolve_environment(&args, &cache)?;
    let subscription_id = resolve_subscription(&args, &cache)?;
    let answers = build_answers(&args)?;
    let target = DeploymentTarget {
        solution_type: args.solution_type,
        sku: args.sku,
        environment,
    };

    info!(
        solution = %answers.solution_name,
        subscription = %subscription_id,
        environment = %environment,
        "Deploying"
    );
    let platform = ArmClient::new(
        environment.resource_manager_url(),
        subscription_id,
        Arc::new(cache.token()),
    )?;
    let orchestrator = Orchestrator::new(
        Arc::new(platform),
        reporter_for_stdout(),
        SolutionLoader::new(&args.solutions_dir),
        target,
    )?
    .with_output_dir(&args.output_dir);

    let report = orchestrator.run(&answers).await.map_err(Error::Reported)?;
    debug!(?report, "Deployment finished");
    Ok(())
}

fn resolve_environment(args: &DeployArgs, cache: &CredentialCache) -> Result<CloudEnvironment> {
    let logged_in = cache.cloud()?;
    match args.environment {
        Some(requested) if requested != logged_in => {
            warn!(
                requested = %requested,
                login = %logged_in,
                "Deploying to a different cloud than the one used at login"
            );
            Ok(requested)
        }
        Some(requested) => Ok(requested),
        None => Ok(logged_in),
    }
}

fn resolve_subscription(args: &DeployArgs, cache: &CredentialCache) -> Result<String> {
    args.subscription_id
        .clone()
        .or_else(|| cache.default_subscription().map(|s| s.id.clone()))
        .ok_or_else(|| {
            Error::validation("--subscription-id is required: the login has no subscriptions")
        })
}

/// Collect the answers from flags, reading key and certificate files.
pub fn build_answers(args: &DeployArgs) -> Result<DeploymentAnswers> {
    let certificate = match (&args.cert, &args.cert_key, &args.cert_thumbprint) {
        (Some(cert), Some(key), Some(thumbprint)) => Some(TlsMaterial {
            cert: read_input_file(cert)?,
            key: read_input_file(key)?,
            fingerprint: thumbprint.clone(),
        }),
        (None, None, None) => None,
        _ => {
            return Err(Error::validation(
                "--cert, --cert-key and --cert-thumbprint must be given together",
            ))
        }
    };

    Ok(DeploymentAnswers {
        solution_name: args.name.clone().unwrap_or_default(),
        location: args.location.clone().unwrap_or_default(),
        runtime: args.runtime,
        website_name: args.website_name.clone(),
        admin_username: args.admin_username.clone(),
        admin_password: args.admin_password.clone(),
        ssh_public_key: args.ssh_public_key.clone(),
        service_principal_id: args.service_principal_id.clone(),
        service_principal_secret: args.service_principal_secret.clone(),
        aad_tenant_id: args.aad_tenant_id.clone(),
        app_id: args.app_id.clone(),
        app_url: args.app_url.clone(),
        domain: args.domain.clone(),
        certificate,
    })
}
