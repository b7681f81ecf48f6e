//! Live status of a running deployment
//!
//! While the platform applies a deployment, [`StatusAggregator`] polls its
//! operations on a fixed interval, folds them into per-resource progress and
//! hands the rendered text to the progress reporter. The aggregation itself
//! is the pure [`aggregate`] function; the polling task only owns counters.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use pcs_common::progress::{FinalStatus, ProgressReporter, CHECK_MARK, CROSS_MARK, SPINNER_FRAMES};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::platform::{DeploymentOperation, Platform, ProvisioningState};

/// Default interval between operation polls
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Progress derived from one operation listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedProgress {
    /// Unique resources seen in this tick
    pub total: usize,
    /// Resources whose state is Succeeded
    pub completed: usize,
    /// One line per resource, Succeeded entries last
    pub lines: Vec<String>,
    /// `(resource id, status message)` for failed resources, first per id
    pub errors: Vec<(String, String)>,
}

impl AggregatedProgress {
    /// Whether any eligible operation was seen
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

fn is_eligible(op: &DeploymentOperation) -> bool {
    let present = |s: &Option<String>| s.as_deref().is_some_and(|v| !v.is_empty());
    present(&op.resource_type) && present(&op.resource_name) && op.action_name.is_none()
}

fn resource_key(op: &DeploymentOperation) -> String {
    match &op.target_resource_id {
        Some(id) if !id.is_empty() => id.clone(),
        _ => format!(
            "{}/{}",
            op.resource_type.as_deref().unwrap_or_default(),
            op.resource_name.as_deref().unwrap_or_default()
        ),
    }
}

fn status_text(op: &DeploymentOperation, key: &str) -> String {
    match &op.status_message {
        Some(message) => {
            serde_json::to_string_pretty(message).unwrap_or_else(|_| message.to_string())
        }
        None => format!("{} failed without a status message", key),
    }
}

/// Fold one operation listing into progress lines.
///
/// Operations without a resource type and name, and sub-actions, are skipped.
/// The first operation per resource id wins.
pub fn aggregate(operations: &[DeploymentOperation], spinner: &str) -> AggregatedProgress {
    let mut seen = HashSet::new();
    let mut progress = AggregatedProgress::default();
    let mut lines: Vec<(bool, String)> = Vec::new();

    for op in operations.iter().filter(|op| is_eligible(op)) {
        let key = resource_key(op);
        if !seen.insert(key.clone()) {
            continue;
        }
        progress.total += 1;

        let state = &op.provisioning_state;
        let glyph = match state {
            ProvisioningState::Succeeded => {
                progress.completed += 1;
                CHECK_MARK
            }
            ProvisioningState::Failed => {
                let message = status_text(op, &key);
                progress.errors.push((key, message));
                CROSS_MARK
            }
            _ => spinner,
        };
        lines.push((
            *state == ProvisioningState::Succeeded,
            format!(
                "{}Provisioning State: {}\tResource Type: {}",
                glyph,
                state,
                op.resource_type.as_deref().unwrap_or_default()
            ),
        ));
    }

    // Stable, so the listing order is kept within each group
    lines.sort_by_key(|(succeeded, _)| *succeeded);
    progress.lines = lines.into_iter().map(|(_, line)| line).collect();
    progress
}

/// `<m> minutes & <s> seconds`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{} minutes & {} seconds", secs / 60, secs % 60)
}

/// Full display text for one tick: resource lines, then the trailer
pub fn render_tick(
    progress: &AggregatedProgress,
    spinner: &str,
    known_total: usize,
    elapsed: Duration,
) -> String {
    if progress.is_empty() {
        return format!("{}Deploying...", spinner);
    }
    let mut text = progress.lines.join("\n");
    text.push('\n');
    text.push_str(&format!(
        "{}Deployed resources {} of {}\t(Elapsed Time: {})",
        spinner,
        progress.completed,
        known_total.max(progress.total),
        format_elapsed(elapsed)
    ));
    text
}

/// Poller state, owned by the task and returned on stop
#[derive(Debug, Default)]
struct PollState {
    known_total: usize,
    frame: usize,
    last: Option<AggregatedProgress>,
    failed_before: BTreeSet<String>,
}

impl PollState {
    fn next_spinner(&mut self) -> &'static str {
        let glyph = SPINNER_FRAMES[self.frame % SPINNER_FRAMES.len()];
        self.frame += 1;
        glyph
    }

    fn record(&mut self, progress: AggregatedProgress) {
        self.known_total = self.known_total.max(progress.total);

        let failing: BTreeSet<String> = progress.errors.iter().map(|(id, _)| id.clone()).collect();
        for recovered in self.failed_before.difference(&failing) {
            warn!(resource = %recovered, "Resource no longer reports Failed");
        }
        self.failed_before = failing;
        self.last = Some(progress);
    }
}

/// What the aggregator observed, handed back on stop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatorReport {
    /// Largest resource count seen (template count included)
    pub total: usize,
    /// Completed resources at the last tick
    pub completed: usize,
    /// Resource lines from the last tick
    pub lines: Vec<String>,
    /// Failures from the last tick
    pub errors: Vec<(String, String)>,
    /// Time since the aggregator started
    pub elapsed: Duration,
}

impl AggregatorReport {
    /// `Deployment failed` followed by every recorded message, if any failed
    pub fn failure_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        let mut summary = String::from("Deployment failed");
        for (_, message) in &self.errors {
            summary.push('\n');
            summary.push_str(message);
        }
        Some(summary)
    }

    /// Final line to render. Recorded failures win over `status`.
    pub fn final_status(&self, status: Option<FinalStatus>) -> FinalStatus {
        if let Some(summary) = self.failure_summary() {
            return FinalStatus::Failure(summary);
        }
        if let Some(status) = status {
            return status;
        }
        let mut message = self.lines.join("\n");
        if !message.is_empty() {
            message.push('\n');
        }
        message.push_str(&format!(
            "Deployed successfully, time taken: {}",
            format_elapsed(self.elapsed)
        ));
        FinalStatus::Success(message)
    }
}

/// Starts the background poller
pub struct StatusAggregator;

impl StatusAggregator {
    /// Spawn the poller for `deployment` in `group`.
    ///
    /// `known_total` seeds the trailer total with the template's resource
    /// count. A poll is issued, awaited, then the task sleeps `interval`
    /// before the next one, so polls never overlap.
    pub fn start(
        platform: Arc<dyn Platform>,
        progress: Arc<dyn ProgressReporter>,
        group: impl Into<String>,
        deployment: impl Into<String>,
        known_total: usize,
        interval: Duration,
    ) -> RunningAggregator {
        let group = group.into();
        let deployment = deployment.into();
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let token = cancel.clone();
        let reporter = progress.clone();

        let handle = tokio::spawn(async move {
            let mut state = PollState {
                known_total,
                ..Default::default()
            };
            loop {
                let spinner = state.next_spinner();
                let operations = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    result = platform.list_deployment_operations(&group, &deployment) => result,
                };

                let text = match operations {
                    Ok(operations) => {
                        let tick = aggregate(&operations, spinner);
                        let text = render_tick(&tick, spinner, state.known_total, started.elapsed());
                        if !tick.is_empty() {
                            state.record(tick);
                        }
                        text
                    }
                    Err(e) => {
                        debug!(error = %e, deployment = %deployment, "Failed to list deployment operations");
                        format!("{}Deploying...", spinner)
                    }
                };
                reporter.update(&text);

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            state
        });

        RunningAggregator {
            cancel,
            handle,
            progress,
            started,
        }
    }
}

/// Handle to a polling task
pub struct RunningAggregator {
    cancel: CancellationToken,
    handle: JoinHandle<PollState>,
    progress: Arc<dyn ProgressReporter>,
    started: Instant,
}

impl RunningAggregator {
    /// Cancel polling and collect what was observed, without rendering
    pub async fn stop(self) -> AggregatorReport {
        self.cancel.cancel();
        let elapsed = self.started.elapsed();
        let state = match self.handle.await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Status poller ended abnormally");
                PollState::default()
            }
        };
        let last = state.last.unwrap_or_default();
        AggregatorReport {
            total: state.known_total.max(last.total),
            completed: last.completed,
            lines: last.lines,
            errors: last.errors,
            elapsed,
        }
    }

    /// Cancel polling and render the final line
    pub async fn stop_with(self, status: Option<FinalStatus>) -> AggregatorReport {
        let progress = self.progress.clone();
        let report = self.stop().await;
        progress.finish(report.final_status(status));
        report
    }
}
