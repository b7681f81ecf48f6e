//! Cloud environments a solution can be deployed to
//!
//! Each sovereign cloud has its own portal, resource manager endpoint, AAD
//! authority and DNS suffixes. Parameter defaults for single-VM deployments
//! and the links printed to the user are derived from here.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A cloud the platform API can be reached in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CloudEnvironment {
    /// Global Azure
    #[default]
    AzureCloud,
    /// Azure operated in China
    AzureChinaCloud,
    /// Azure Germany
    AzureGermanCloud,
    /// Azure for US Government
    AzureUSGovernment,
}

impl CloudEnvironment {
    /// All supported environments
    pub const ALL: [CloudEnvironment; 4] = [
        Self::AzureCloud,
        Self::AzureChinaCloud,
        Self::AzureGermanCloud,
        Self::AzureUSGovernment,
    ];

    /// Canonical environment name
    pub fn name(&self) -> &'static str {
        match self {
            Self::AzureCloud => "AzureCloud",
            Self::AzureChinaCloud => "AzureChinaCloud",
            Self::AzureGermanCloud => "AzureGermanCloud",
            Self::AzureUSGovernment => "AzureUSGovernment",
        }
    }

    /// Portal base URL used for resource links
    pub fn portal_url(&self) -> &'static str {
        match self {
            Self::AzureCloud => "https://portal.azure.com",
            Self::AzureChinaCloud => "https://portal.azure.cn",
            Self::AzureGermanCloud => "https://portal.microsoftazure.de",
            Self::AzureUSGovernment => "https://portal.azure.us",
        }
    }

    /// Resource manager endpoint
    pub fn resource_manager_url(&self) -> &'static str {
        match self {
            Self::AzureCloud => "https://management.azure.com/",
            Self::AzureChinaCloud => "https://management.chinacloudapi.cn/",
            Self::AzureGermanCloud => "https://management.microsoftazure.de/",
            Self::AzureUSGovernment => "https://management.usgovcloudapi.net/",
        }
    }

    /// AAD authority URL
    pub fn active_directory_url(&self) -> &'static str {
        match self {
            Self::AzureCloud => "https://login.microsoftonline.com/",
            Self::AzureChinaCloud => "https://login.chinacloudapi.cn/",
            Self::AzureGermanCloud => "https://login.microsoftonline.de/",
            Self::AzureUSGovernment => "https://login.microsoftonline.us/",
        }
    }

    /// Storage endpoint suffix, without a leading dot
    pub fn storage_endpoint_suffix(&self) -> &'static str {
        match self {
            Self::AzureCloud => "core.windows.net",
            Self::AzureChinaCloud => "core.chinacloudapi.cn",
            Self::AzureGermanCloud => "core.cloudapi.de",
            Self::AzureUSGovernment => "core.usgovcloudapi.net",
        }
    }

    /// DNS suffix for public VM addresses
    pub fn vm_fqdn_suffix(&self) -> &'static str {
        match self {
            Self::AzureCloud => "cloudapp.azure.com",
            Self::AzureChinaCloud => "cloudapp.chinacloudapi.cn",
            Self::AzureGermanCloud => "cloudapp.azure.de",
            Self::AzureUSGovernment => "cloudapp.azure.us",
        }
    }

    /// Whether map API resources exist in this cloud
    pub fn supports_map_apis(&self) -> bool {
        !matches!(self, Self::AzureChinaCloud)
    }
}

impl fmt::Display for CloudEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CloudEnvironment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|env| env.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!(
                    "invalid environment '{}', must be one of: {}",
                    s,
                    Self::ALL.map(|e| e.name()).join(", ")
                )
            })
    }
}
