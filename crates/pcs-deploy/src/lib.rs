//! Deployment pipeline for pcs solutions
//!
//! The [`orchestrator`] drives a deployment from template selection to a
//! running website. Each stage lives in its own module and talks to the
//! outside world through a trait so it can be exercised without a cloud:
//! [`platform::Platform`], [`remote::SecureShell`] and
//! [`cluster::ClusterApi`].

#![deny(missing_docs)]

pub mod cluster;
pub mod environment;
pub mod orchestrator;
pub mod outputs;
pub mod platform;
pub mod readiness;
pub mod remote;
pub mod solution;
pub mod status;
pub mod submitter;

pub use environment::CloudEnvironment;
pub use orchestrator::{DeploymentAnswers, DeploymentReport, DeploymentTarget, Orchestrator};
pub use pcs_common::{Error, Result};
pub use solution::{Runtime, Sku, SolutionLoader, SolutionType};
