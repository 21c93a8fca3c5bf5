use crate::errors::ClusterViewError;
use crate::logging::append_run_log;
use crate::model::{ClusterSnapshot, Guest, GuestKey, GuestType, Task, Upid, STATUS_RUNNING};
use crate::runtime::{CancelToken, Clock};
use crate::source::{ClusterDataSource, OperationInvoker};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestAction {
    Start,
    Stop,
    Shutdown,
    Restart,
    Migrate { target: String, online: bool },
    Delete { force: bool },
    Backup { storage: String },
    Snapshot { name: String },
    ConfigEdit { changes: BTreeMap<String, String> },
}

impl GuestAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
            Self::Restart => "restart",
            Self::Migrate { .. } => "migrate",
            Self::Delete { .. } => "delete",
            Self::Backup { .. } => "backup",
            Self::Snapshot { .. } => "snapshot",
            Self::ConfigEdit { .. } => "config_edit",
        }
    }

    /// In-progress label shown next to the guest.
    pub fn label(&self) -> String {
        match self {
            Self::Start => "Starting".to_string(),
            Self::Stop => "Stopping".to_string(),
            Self::Shutdown => "Shutting down".to_string(),
            Self::Restart => "Restarting".to_string(),
            Self::Migrate { target, .. } => format!("Migrating to {target}"),
            Self::Delete { .. } => "Deleting".to_string(),
            Self::Backup { .. } => "Backing up".to_string(),
            Self::Snapshot { .. } => "Snapshotting".to_string(),
            Self::ConfigEdit { .. } => "Updating config".to_string(),
        }
    }

    /// Migrations and deletions change which guests exist where, so they are
    /// followed by a full snapshot instead of a single-guest patch.
    pub fn needs_full_resync(&self) -> bool {
        matches!(self, Self::Migrate { .. } | Self::Delete { .. })
    }

    pub fn completion_check(
        &self,
        guest_type: GuestType,
        upid: Option<&Upid>,
        baseline_uptime: Option<u64>,
        restart_slack_secs: u64,
    ) -> CompletionCheck {
        match self {
            Self::Start => CompletionCheck::StatusIs(STATUS_RUNNING.to_string()),
            Self::Stop | Self::Shutdown => CompletionCheck::StatusIsNot(STATUS_RUNNING.to_string()),
            Self::Restart => CompletionCheck::UptimeDropped {
                baseline: baseline_uptime,
                slack_secs: restart_slack_secs,
            },
            Self::Migrate { target, online } => CompletionCheck::AppearsOn {
                node: target.clone(),
                require_running: *online && guest_type == GuestType::Qemu,
            },
            Self::Delete { .. } => CompletionCheck::Gone,
            Self::Backup { .. } | Self::Snapshot { .. } => match upid {
                Some(upid) => CompletionCheck::TaskFinished(upid.clone()),
                None => CompletionCheck::Immediate,
            },
            Self::ConfigEdit { .. } => CompletionCheck::Immediate,
        }
    }
}

/// Observable condition that marks an operation as done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionCheck {
    StatusIs(String),
    StatusIsNot(String),
    /// Restart heuristic: reported uptime fell below `baseline - slack_secs`.
    /// Can miss a restart whose new uptime already exceeds that threshold.
    UptimeDropped {
        baseline: Option<u64>,
        slack_secs: u64,
    },
    AppearsOn {
        node: String,
        require_running: bool,
    },
    Gone,
    TaskFinished(Upid),
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationPolicies {
    pub default_wait: WaitPolicy,
    pub migrate_wait: WaitPolicy,
    pub restart_slack_secs: u64,
}

impl Default for OperationPolicies {
    fn default() -> Self {
        Self {
            default_wait: WaitPolicy::default(),
            migrate_wait: WaitPolicy {
                poll_interval: Duration::from_secs(3),
                max_wait: Duration::from_secs(300),
            },
            restart_slack_secs: 10,
        }
    }
}

impl OperationPolicies {
    pub fn wait_for(&self, action: &GuestAction) -> WaitPolicy {
        match action {
            GuestAction::Migrate { .. } => self.migrate_wait,
            _ => self.default_wait,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Observed,
    TimedOut,
    Cancelled,
}

pub trait CompletionWaiter: Send + Sync {
    fn wait_for_observable_change(
        &self,
        target: &GuestKey,
        check: &CompletionCheck,
        policy: &WaitPolicy,
    ) -> WaitOutcome;
}

/// Re-fetches the target every `poll_interval` until `check` holds.
pub struct PollingWaiter {
    source: Arc<dyn ClusterDataSource>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
}

impl PollingWaiter {
    pub fn new(source: Arc<dyn ClusterDataSource>, clock: Arc<dyn Clock>, cancel: CancelToken) -> Self {
        Self {
            source,
            clock,
            cancel,
        }
    }

    fn observe(&self, target: &GuestKey, check: &CompletionCheck) -> bool {
        match check {
            CompletionCheck::Immediate => true,
            CompletionCheck::StatusIs(status) => self
                .source
                .fetch_single_guest(target)
                .map(|guest| guest.status.eq_ignore_ascii_case(status))
                .unwrap_or(false),
            CompletionCheck::StatusIsNot(status) => self
                .source
                .fetch_single_guest(target)
                .map(|guest| !guest.status.eq_ignore_ascii_case(status))
                .unwrap_or(false),
            CompletionCheck::UptimeDropped {
                baseline: Some(baseline),
                slack_secs,
            } => self
                .source
                .fetch_single_guest(target)
                .map(|guest| guest.uptime > 0 && guest.uptime < baseline.saturating_sub(*slack_secs))
                .unwrap_or(false),
            CompletionCheck::UptimeDropped { baseline: None, .. } => self
                .source
                .fetch_single_guest(target)
                .map(|guest| guest.is_running())
                .unwrap_or(false),
            CompletionCheck::AppearsOn {
                node,
                require_running,
            } => self
                .source
                .fetch_single_guest(&target.moved_to(node.clone()))
                .map(|guest| guest.node == *node && (!*require_running || guest.is_running()))
                .unwrap_or(false),
            CompletionCheck::Gone => matches!(
                self.source.fetch_single_guest(target),
                Err(ref err) if err.is_not_found()
            ),
            CompletionCheck::TaskFinished(upid) => self
                .source
                .fetch_tasks()
                .map(|tasks| {
                    tasks
                        .iter()
                        .any(|task| &task.upid == upid && !task.is_running())
                })
                .unwrap_or(false),
        }
    }
}

impl CompletionWaiter for PollingWaiter {
    fn wait_for_observable_change(
        &self,
        target: &GuestKey,
        check: &CompletionCheck,
        policy: &WaitPolicy,
    ) -> WaitOutcome {
        let deadline = self.clock.now() + policy.max_wait;
        loop {
            if self.cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            if self.observe(target, check) {
                return WaitOutcome::Observed;
            }
            if self.clock.now() >= deadline {
                return WaitOutcome::TimedOut;
            }
            if self.clock.sleep_for(policy.poll_interval).is_err() {
                return WaitOutcome::Cancelled;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Completed,
    Failed(String),
    /// The wait gave up; the real outcome is unknown.
    TimedOut,
    Cancelled,
}

impl OperationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Data fetched after an operation so its result is visible before the
/// pending marker is cleared.
#[derive(Debug, Clone, PartialEq)]
pub enum Resync {
    None,
    Full {
        seq: u64,
        result: Result<ClusterSnapshot, ClusterViewError>,
    },
    Guest {
        guest: Guest,
        tasks: Option<Vec<Task>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationReport {
    pub target: GuestKey,
    pub action: GuestAction,
    pub outcome: OperationOutcome,
    pub resync: Resync,
}

pub struct OperationWorker<'a> {
    pub source: &'a dyn ClusterDataSource,
    pub invoker: &'a dyn OperationInvoker,
    pub waiter: &'a dyn CompletionWaiter,
    pub policies: OperationPolicies,
    /// Hands out the sequence number for a full resync at the moment it starts.
    pub next_seq: &'a dyn Fn() -> u64,
}

impl OperationWorker<'_> {
    pub fn run(&self, target: &GuestKey, guest_type: GuestType, action: &GuestAction) -> OperationReport {
        append_run_log(
            "info",
            "operation.started",
            json!({ "target": target.to_string(), "action": action.name() }),
        );
        let baseline = match action {
            GuestAction::Restart => self
                .source
                .fetch_single_guest(target)
                .ok()
                .map(|guest| guest.uptime),
            _ => None,
        };

        let upid = match self.invoker.invoke(target, action) {
            Ok(upid) => upid,
            Err(err) => {
                append_run_log(
                    "warn",
                    "operation.invoke_failed",
                    json!({
                        "target": target.to_string(),
                        "action": action.name(),
                        "error": err.to_string(),
                    }),
                );
                return OperationReport {
                    target: target.clone(),
                    action: action.clone(),
                    outcome: OperationOutcome::Failed(err.to_string()),
                    resync: Resync::None,
                };
            }
        };

        let check = action.completion_check(
            guest_type,
            upid.as_ref(),
            baseline,
            self.policies.restart_slack_secs,
        );
        let policy = self.policies.wait_for(action);
        let outcome = match self.waiter.wait_for_observable_change(target, &check, &policy) {
            WaitOutcome::Observed => OperationOutcome::Completed,
            WaitOutcome::TimedOut => OperationOutcome::TimedOut,
            WaitOutcome::Cancelled => OperationOutcome::Cancelled,
        };
        append_run_log(
            "info",
            "operation.wait_finished",
            json!({
                "target": target.to_string(),
                "action": action.name(),
                "outcome": outcome.as_str(),
                "upid": upid.as_ref().map(Upid::to_string),
            }),
        );

        let resync = match outcome {
            OperationOutcome::Cancelled => Resync::None,
            OperationOutcome::TimedOut => self.full_resync(),
            _ if action.needs_full_resync() => self.full_resync(),
            _ => self.guest_resync(target),
        };
        OperationReport {
            target: target.clone(),
            action: action.clone(),
            outcome,
            resync,
        }
    }

    fn full_resync(&self) -> Resync {
        let seq = (self.next_seq)();
        Resync::Full {
            seq,
            result: self.source.fetch_full_snapshot(),
        }
    }

    fn guest_resync(&self, target: &GuestKey) -> Resync {
        match self.source.fetch_single_guest(target) {
            Ok(guest) => Resync::Guest {
                guest,
                tasks: self.source.fetch_tasks().ok(),
            },
            Err(err) if err.is_not_found() => {
                append_run_log(
                    "info",
                    "operation.resync_fallback",
                    json!({ "target": target.to_string(), "reason": err.to_string() }),
                );
                self.full_resync()
            }
            Err(err) => {
                append_run_log(
                    "warn",
                    "operation.resync_failed",
                    json!({ "target": target.to_string(), "error": err.to_string() }),
                );
                Resync::None
            }
        }
    }
}
