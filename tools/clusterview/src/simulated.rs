use crate::errors::ClusterViewError;
use crate::model::{
    ClusterSnapshot, Entity, Guest, GuestKey, GuestType, Node, NodeDetails, NodeKey, Task,
    Upid, STATUS_RUNNING, STATUS_STOPPED,
};
use crate::operations::GuestAction;
use crate::source::{ClusterDataSource, ConsoleSessions, OperationInvoker};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Seconds of uptime every running guest gains per full fetch.
const UPTIME_STEP_SECS: u64 = 1;

#[derive(Debug, Default)]
struct SimState {
    nodes: Vec<Node>,
    guests: Vec<Guest>,
    tasks: Vec<Task>,
    details: BTreeMap<NodeKey, NodeDetails>,
    sessions: usize,
    next_task: u64,
    clock_secs: u64,
    fetch_failures: VecDeque<ClusterViewError>,
}

/// In-memory cluster that behaves like the remote API: operations take
/// effect immediately and are recorded as finished tasks.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedCluster {
    pub fn from_snapshot(snapshot: ClusterSnapshot) -> Self {
        let mut state = SimState {
            next_task: 1,
            clock_secs: 1_700_000_000,
            ..SimState::default()
        };
        for mut node in snapshot.nodes {
            let details = std::mem::take(&mut node.details);
            if !details.is_empty() {
                state.details.insert(node.key(), details);
            }
            state.nodes.push(node);
        }
        state.guests = snapshot.guests;
        state.tasks = snapshot.tasks;
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Parses an inventory file shaped like `ClusterSnapshot`
    /// (`[[nodes]]`, `[[guests]]`, `[[tasks]]` tables).
    pub fn from_toml_str(profile: &str, text: &str) -> Result<Self, ClusterViewError> {
        let mut snapshot: ClusterSnapshot =
            toml::from_str(text).map_err(|e| ClusterViewError::ConfigParse(e.to_string()))?;
        for node in &mut snapshot.nodes {
            if node.profile.is_empty() {
                node.profile = profile.to_string();
            }
        }
        for guest in &mut snapshot.guests {
            if guest.profile.is_empty() {
                guest.profile = profile.to_string();
            }
        }
        for task in &mut snapshot.tasks {
            if task.profile.is_empty() {
                task.profile = profile.to_string();
            }
        }
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn demo(profile: &str) -> Self {
        let node = |name: &str, online: bool, ip: &str, cpus: u32| {
            let mut node = Node::new(profile, name, online);
            node.ip = ip.to_string();
            node.cpu_count = cpus;
            node.memory_total = 64 * 1024 * 1024 * 1024;
            node.storage_total = 2 * 1024 * 1024 * 1024 * 1024;
            if online {
                node.cpu_usage = 0.12;
                node.memory_used = 21 * 1024 * 1024 * 1024;
                node.storage_used = 600 * 1024 * 1024 * 1024;
                node.uptime = 86_400 * 12;
                node.details = NodeDetails {
                    version: Some("pve-manager/8.2.4".to_string()),
                    kernel_version: Some("6.8.12-1-pve".to_string()),
                    cpu_model: Some("AMD EPYC 7302P 16-Core Processor".to_string()),
                    load_avg: Some(vec!["0.42".to_string(), "0.37".to_string(), "0.30".to_string()]),
                    cgroup_mode: Some(2),
                    level: Some(String::new()),
                };
            }
            node
        };
        let guest = |vmid: u32, name: &str, node: &str, kind: GuestType, running: bool, tags: &str| {
            let status = if running { STATUS_RUNNING } else { STATUS_STOPPED };
            let mut guest = Guest::new(profile, node, vmid, name, kind, status);
            guest.tags = tags.to_string();
            guest.max_mem = 4 * 1024 * 1024 * 1024;
            if running {
                guest.uptime = 3_600 + u64::from(vmid);
                guest.cpu = 0.05;
                guest.mem = 1024 * 1024 * 1024;
            }
            guest
        };
        Self::from_snapshot(ClusterSnapshot {
            nodes: vec![
                node("pve1", true, "10.0.0.11", 16),
                node("pve2", true, "10.0.0.12", 16),
                node("pve3", false, "10.0.0.13", 8),
            ],
            guests: vec![
                guest(100, "web-01", "pve1", GuestType::Qemu, true, "prod;web"),
                guest(101, "db-01", "pve1", GuestType::Qemu, true, "prod;db"),
                guest(102, "cache-01", "pve2", GuestType::Lxc, true, "prod;cache"),
                guest(103, "web-02", "pve2", GuestType::Lxc, false, "staging;web"),
                guest(104, "build", "pve2", GuestType::Qemu, false, "ci"),
                guest(105, "monitor", "pve1", GuestType::Lxc, true, "ops"),
            ],
            tasks: Vec::new(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>, ClusterViewError> {
        self.state
            .lock()
            .map_err(|_| ClusterViewError::Transport("simulated cluster poisoned".to_string()))
    }

    pub fn fail_next_fetch(&self, error: ClusterViewError) {
        if let Ok(mut state) = self.lock() {
            state.fetch_failures.push_back(error);
        }
    }

    pub fn set_sessions(&self, count: usize) {
        if let Ok(mut state) = self.lock() {
            state.sessions = count;
        }
    }

    pub fn guest(&self, key: &GuestKey) -> Option<Guest> {
        let state = self.lock().ok()?;
        state.find_guest(key).map(|idx| state.guests[idx].clone())
    }
}

impl SimState {
    fn find_guest(&self, key: &GuestKey) -> Option<usize> {
        self.guests.iter().position(|guest| {
            guest.profile == key.profile && guest.node == key.node && guest.vmid == key.vmid
        })
    }

    fn record_task(&mut self, guest: &Guest, action: &str) -> Upid {
        let prefix = match guest.guest_type {
            GuestType::Qemu => "qm",
            GuestType::Lxc => "vz",
        };
        let upid = Upid(format!(
            "UPID:{}:{:08X}:{}{}:{}:root@pam:",
            guest.node, self.next_task, prefix, action, guest.vmid
        ));
        self.next_task += 1;
        self.tasks.insert(
            0,
            Task {
                upid: upid.clone(),
                profile: guest.profile.clone(),
                node: guest.node.clone(),
                task_type: format!("{prefix}{action}"),
                status: "OK".to_string(),
                user: "root@pam".to_string(),
                vmid: Some(guest.vmid),
                start_time: self.clock_secs,
                end_time: Some(self.clock_secs + 1),
            },
        );
        upid
    }

    fn apply(&mut self, key: &GuestKey, action: &GuestAction) -> Result<Upid, ClusterViewError> {
        let idx = self
            .find_guest(key)
            .ok_or_else(|| ClusterViewError::NotFound(format!("guest {key}")))?;
        let running = self.guests[idx].is_running();
        match action {
            GuestAction::Start if running => {
                return Err(ClusterViewError::Operation(format!("{key} is already running")));
            }
            GuestAction::Start => {
                self.guests[idx].status = STATUS_RUNNING.to_string();
                self.guests[idx].uptime = 1;
            }
            GuestAction::Stop | GuestAction::Shutdown if !running => {
                return Err(ClusterViewError::Operation(format!("{key} is not running")));
            }
            GuestAction::Stop | GuestAction::Shutdown => {
                self.guests[idx].status = STATUS_STOPPED.to_string();
                self.guests[idx].uptime = 0;
            }
            GuestAction::Restart if !running => {
                return Err(ClusterViewError::Operation(format!("{key} is not running")));
            }
            GuestAction::Restart => {
                self.guests[idx].uptime = 1;
            }
            GuestAction::Migrate { target, .. } => {
                let online = self
                    .nodes
                    .iter()
                    .any(|node| node.profile == key.profile && node.name == *target && node.online);
                if !online || *target == key.node {
                    return Err(ClusterViewError::Operation(format!(
                        "cannot migrate {key} to {target}"
                    )));
                }
                self.guests[idx].node = target.clone();
            }
            GuestAction::Delete { force } => {
                if running && !force {
                    return Err(ClusterViewError::Operation(format!(
                        "{key} must be stopped before deletion"
                    )));
                }
                let removed = self.guests.remove(idx);
                return Ok(self.record_task(&removed, "destroy"));
            }
            GuestAction::Backup { .. } | GuestAction::Snapshot { .. } => {}
            GuestAction::ConfigEdit { changes } => {
                let guest = &mut self.guests[idx];
                for (field, value) in changes {
                    match field.as_str() {
                        "name" => guest.name = value.clone(),
                        "tags" => guest.tags = value.clone(),
                        "description" => guest.description = Some(value.clone()),
                        other => {
                            return Err(ClusterViewError::Operation(format!(
                                "unsupported config field {other}"
                            )))
                        }
                    }
                }
            }
        }
        let guest = self.guests[idx].clone();
        Ok(self.record_task(&guest, action.name()))
    }
}

impl ClusterDataSource for SimulatedCluster {
    fn fetch_full_snapshot(&self) -> Result<ClusterSnapshot, ClusterViewError> {
        let mut state = self.lock()?;
        if let Some(error) = state.fetch_failures.pop_front() {
            return Err(error);
        }
        state.clock_secs += UPTIME_STEP_SECS;
        for guest in state.guests.iter_mut().filter(|guest| guest.is_running()) {
            guest.uptime += UPTIME_STEP_SECS;
        }
        // Detail fields only come from fetch_node_details.
        let nodes = state
            .nodes
            .iter()
            .cloned()
            .map(|mut node| {
                node.details = NodeDetails::default();
                node
            })
            .collect();
        Ok(ClusterSnapshot {
            nodes,
            guests: state.guests.clone(),
            tasks: state.tasks.clone(),
        })
    }

    fn fetch_single_guest(&self, key: &GuestKey) -> Result<Guest, ClusterViewError> {
        let state = self.lock()?;
        state
            .find_guest(key)
            .map(|idx| state.guests[idx].clone())
            .ok_or_else(|| ClusterViewError::NotFound(format!("guest {key}")))
    }

    fn fetch_tasks(&self) -> Result<Vec<Task>, ClusterViewError> {
        Ok(self.lock()?.tasks.clone())
    }

    fn fetch_node_details(&self, key: &NodeKey) -> Result<NodeDetails, ClusterViewError> {
        let state = self.lock()?;
        let node = state
            .nodes
            .iter()
            .find(|node| node.key() == *key)
            .ok_or_else(|| ClusterViewError::NotFound(format!("node {key}")))?;
        if !node.online {
            return Err(ClusterViewError::Transport(format!("node {key} is offline")));
        }
        Ok(state.details.get(key).cloned().unwrap_or_default())
    }
}

impl OperationInvoker for SimulatedCluster {
    fn invoke(
        &self,
        target: &GuestKey,
        action: &GuestAction,
    ) -> Result<Option<Upid>, ClusterViewError> {
        let mut state = self.lock()?;
        state.apply(target, action).map(Some)
    }
}

impl ConsoleSessions for SimulatedCluster {
    fn active_sessions(&self) -> usize {
        self.lock().map(|state| state.sessions).unwrap_or(0)
    }
}
