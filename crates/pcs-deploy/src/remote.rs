//! Fetch a generated file from a freshly provisioned host
//!
//! The cluster master takes minutes after provisioning before it accepts
//! secure-shell sessions. [`RemoteConfigRetriever`] keeps trying on a fixed
//! interval while the host is unreachable. Every attempt is a new session;
//! the session ends with the attempt whatever its outcome.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pcs_common::retry::{retry_with_backoff, RetryConfig, RetryError};
use pcs_common::{Error, Result, MAX_RETRY};
use thiserror::Error as ThisError;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Interval between connection attempts
pub const REMOTE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Kubeconfig location on the cluster master, relative to the login home
pub const REMOTE_KUBECONFIG: &str = ".kube/config";

/// Secure-shell port
pub const SSH_PORT: u16 = 22;

/// Host and identity for a remote session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Host name or address
    pub host: String,
    /// Port
    pub port: u16,
    /// Login user
    pub username: String,
    /// Private key file
    pub identity_file: PathBuf,
}

impl RemoteTarget {
    /// Target on the default port, authenticating with the private key that
    /// sits next to `public_key` (`id_rsa` in the same directory)
    pub fn with_key_pair(host: impl Into<String>, username: impl Into<String>, public_key: &Path) -> Self {
        let dir = public_key.parent().unwrap_or_else(|| Path::new("."));
        Self {
            host: host.into(),
            port: SSH_PORT,
            username: username.into(),
            identity_file: dir.join("id_rsa"),
        }
    }
}

/// Why a remote session failed
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ShellError {
    /// No session could be established; the host may still be booting
    #[error("host unreachable: {0}")]
    Unreachable(String),
    /// A session was established but the transfer failed
    #[error("transfer failed: {0}")]
    Transfer(String),
}

impl ShellError {
    /// Whether another attempt may succeed
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Copies single files from a remote host
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecureShell: Send + Sync {
    /// Open a session to `target`, copy `remote_path` to `local_path`, close it
    async fn download(
        &self,
        target: &RemoteTarget,
        remote_path: &str,
        local_path: &Path,
    ) -> std::result::Result<(), ShellError>;
}

/// [`SecureShell`] over the OpenSSH `sftp` client in batch mode
#[derive(Debug, Clone)]
pub struct SftpShell {
    program: String,
    connect_timeout: Duration,
}

impl Default for SftpShell {
    fn default() -> Self {
        Self {
            program: "sftp".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SftpShell {
    /// Use a different client binary
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self, target: &RemoteTarget) -> Vec<String> {
        vec![
            "-b".to_string(),
            "-".to_string(),
            "-P".to_string(),
            target.port.to_string(),
            "-i".to_string(),
            target.identity_file.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            format!("{}@{}", target.username, target.host),
        ]
    }
}

/// Batch script fetching one file
fn batch_script(remote_path: &str, local_path: &Path) -> String {
    format!("get \"{}\" \"{}\"\n", remote_path, local_path.display())
}

/// Stderr fragments OpenSSH prints when no session was established
const CONNECT_FAILURES: [&str; 7] = [
    "connection refused",
    "connection timed out",
    "operation timed out",
    "no route to host",
    "could not resolve hostname",
    "network is unreachable",
    "connection closed",
];

/// Classify a failed client run by exit code and stderr
pub fn classify_failure(code: Option<i32>, stderr: &str) -> ShellError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();
    if code == Some(255) || CONNECT_FAILURES.iter().any(|f| lower.contains(f)) {
        return ShellError::Unreachable(message);
    }
    ShellError::Transfer(message)
}

#[async_trait]
impl SecureShell for SftpShell {
    async fn download(
        &self,
        target: &RemoteTarget,
        remote_path: &str,
        local_path: &Path,
    ) -> std::result::Result<(), ShellError> {
        let mut child = Command::new(&self.program)
            .args(self.args(target))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ShellError::Transfer(format!("failed to run {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(batch_script(remote_path, local_path).as_bytes())
                .await
                .map_err(|e| ShellError::Transfer(format!("failed to write batch script: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ShellError::Transfer(format!("failed to wait for {}: {}", self.program, e)))?;

        if output.status.success() {
            return Ok(());
        }
        Err(classify_failure(
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

/// Retries a download until the host answers or the budget runs out
pub struct RemoteConfigRetriever {
    shell: Arc<dyn SecureShell>,
    retry: RetryConfig,
}

impl RemoteConfigRetriever {
    /// Retrier with the default schedule (every 5s, 36 attempts)
    pub fn new(shell: Arc<dyn SecureShell>) -> Self {
        Self {
            shell,
            retry: RetryConfig::fixed(REMOTE_RETRY_INTERVAL, MAX_RETRY),
        }
    }

    /// Override the retry schedule
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Copy `remote_path` from `target` to `local_path`.
    ///
    /// Unreachable hosts are retried; a failed transfer on an established
    /// session is fatal. The parent directory of `local_path` is created.
    pub async fn retrieve(
        &self,
        target: &RemoteTarget,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<PathBuf> {
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let operation = format!("download {} from {}", remote_path, target.host);
        debug!(host = %target.host, user = %target.username, remote = %remote_path, "Retrieving remote file");

        retry_with_backoff(&self.retry, &operation, ShellError::is_unreachable, || {
            self.shell.download(target, remote_path, local_path)
        })
        .await
        .map_err(|e| match e {
            RetryError::Fatal(e) => Error::transport(operation.clone(), e.to_string()),
            RetryError::Exhausted { attempts, last } => {
                Error::timeout(operation.clone(), attempts, last.to_string())
            }
        })?;

        info!(path = %local_path.display(), "Remote file downloaded");
        Ok(local_path.to_path_buf())
    }
}

/// `~/.kube`
pub fn kube_config_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".kube"))
        .ok_or_else(|| Error::configuration("could not determine home directory"))
}

/// Local path for a cluster's kubeconfig: `<dir>/config-<cluster>`
pub fn local_kubeconfig_path(dir: &Path, cluster_name: &str) -> PathBuf {
    dir.join(format!("config-{}", cluster_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn target() -> RemoteTarget {
        RemoteTarget::with_key_pair(
            "contoso-master.eastus.cloudapp.azure.com",
            "azureuser",
            Path::new("/home/me/.ssh/id_rsa.pub"),
        )
    }

    fn retriever(shell: MockSecureShell) -> RemoteConfigRetriever {
        RemoteConfigRetriever::new(Arc::new(shell))
            .with_retry(RetryConfig::fixed(Duration::ZERO, MAX_RETRY))
    }

    #[test]
    fn identity_sits_next_to_public_key() {
        let target = target();
        assert_eq!(target.identity_file, PathBuf::from("/home/me/.ssh/id_rsa"));
        assert_eq!(target.port, 22);
    }

    #[test]
    fn kubeconfig_path_is_per_cluster() {
        assert_eq!(
            local_kubeconfig_path(Path::new("/home/me/.kube"), "contoso-cluster"),
            PathBuf::from("/home/me/.kube/config-contoso-cluster")
        );
    }

    #[test]
    fn classifies_connection_failures() {
        assert!(classify_failure(Some(255), "").is_unreachable());
        assert!(classify_failure(Some(1), "ssh: connect to host x port 22: Connection refused")
            .is_unreachable());
        assert!(classify_failure(None, "Connection timed out during banner exchange").is_unreachable());
        assert_eq!(
            classify_failure(Some(1), "remote open(\".kube/config\"): No such file"),
            ShellError::Transfer("remote open(\".kube/config\"): No such file".into())
        );
    }

    #[test]
    fn sftp_args_use_batch_mode() {
        let args = SftpShell::default().args(&target());
        assert_eq!(&args[..2], ["-b", "-"]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"/home/me/.ssh/id_rsa".to_string()));
        assert_eq!(
            args.last().map(String::as_str),
            Some("azureuser@contoso-master.eastus.cloudapp.azure.com")
        );
        assert_eq!(
            batch_script(".kube/config", Path::new("/tmp/config-x")),
            "get \".kube/config\" \"/tmp/config-x\"\n"
        );
    }

    #[tokio::test]
    async fn unreachable_host_fails_after_exactly_36_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mut shell = MockSecureShell::new();
        shell
            .expect_download()
            .times(36)
            .returning(|_, _, _| Err(ShellError::Unreachable("Connection refused".into())));

        let err = retriever(shell)
            .retrieve(&target(), REMOTE_KUBECONFIG, &dir.path().join("config-x"))
            .await
            .unwrap_err();
        match err {
            Error::Timeout { attempts, message, .. } => {
                assert_eq!(attempts, 36);
                assert!(message.contains("Connection refused"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn transfer_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut shell = MockSecureShell::new();
        shell
            .expect_download()
            .times(1)
            .returning(|_, _, _| Err(ShellError::Transfer("Permission denied".into())));

        let err = retriever(shell)
            .retrieve(&target(), REMOTE_KUBECONFIG, &dir.path().join("config-x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Permission denied"));
    }

    #[tokio::test]
    async fn succeeds_once_host_comes_up() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("nested/config-x");
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let mut shell = MockSecureShell::new();
        shell
            .expect_download()
            .withf(|target, remote, _| target.username == "azureuser" && remote == ".kube/config")
            .returning(move |_, _, _| {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(ShellError::Unreachable("No route to host".into()))
                } else {
                    Ok(())
                }
            });

        let path = retriever(shell)
            .retrieve(&target(), REMOTE_KUBECONFIG, &local)
            .await
            .unwrap();
        assert_eq!(path, local);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(local.parent().unwrap().is_dir());
    }
}
