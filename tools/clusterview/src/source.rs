use crate::errors::ClusterViewError;
use crate::model::{ClusterSnapshot, Guest, GuestKey, NodeDetails, NodeKey, Task, Upid};
use crate::operations::GuestAction;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Read side of the cluster API. Implementations block on network I/O and
/// are called from worker threads only.
pub trait ClusterDataSource: Send + Sync {
    fn fetch_full_snapshot(&self) -> Result<ClusterSnapshot, ClusterViewError>;
    fn fetch_single_guest(&self, key: &GuestKey) -> Result<Guest, ClusterViewError>;
    fn fetch_tasks(&self) -> Result<Vec<Task>, ClusterViewError>;
    fn fetch_node_details(&self, key: &NodeKey) -> Result<NodeDetails, ClusterViewError>;
}

/// Write side of the cluster API. `Ok(Some(upid))` means the request was
/// accepted and a cluster task tracks it; `Ok(None)` means it was applied
/// without a task.
pub trait OperationInvoker: Send + Sync {
    fn invoke(&self, target: &GuestKey, action: &GuestAction)
        -> Result<Option<Upid>, ClusterViewError>;
}

pub trait ConsoleSessions: Send + Sync {
    fn active_sessions(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCall {
    FullSnapshot,
    SingleGuest(GuestKey),
    Tasks,
    NodeDetails(NodeKey),
    Invoke(GuestKey, String),
}

#[derive(Default)]
struct ScriptedInner {
    snapshots: VecDeque<Result<ClusterSnapshot, ClusterViewError>>,
    guests: VecDeque<Result<Guest, ClusterViewError>>,
    tasks: VecDeque<Result<Vec<Task>, ClusterViewError>>,
    invokes: VecDeque<Result<Option<Upid>, ClusterViewError>>,
    details: VecDeque<Result<NodeDetails, ClusterViewError>>,
    calls: Vec<SourceCall>,
    sessions: usize,
}

/// Queued responses for each collaborator call. The last queued response of
/// each kind is repeated once the queue drains to one entry.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    inner: Arc<Mutex<ScriptedInner>>,
}

fn next_response<T: Clone>(
    queue: &mut VecDeque<Result<T, ClusterViewError>>,
    what: &str,
) -> Result<T, ClusterViewError> {
    if queue.len() > 1 {
        return queue
            .pop_front()
            .unwrap_or_else(|| Err(ClusterViewError::NotFound(what.to_string())));
    }
    queue
        .front()
        .cloned()
        .unwrap_or_else(|| Err(ClusterViewError::NotFound(format!("no scripted {what}"))))
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_snapshot(&self, response: Result<ClusterSnapshot, ClusterViewError>) -> &Self {
        self.inner.lock().expect("script lock").snapshots.push_back(response);
        self
    }

    pub fn push_guest(&self, response: Result<Guest, ClusterViewError>) -> &Self {
        self.inner.lock().expect("script lock").guests.push_back(response);
        self
    }

    pub fn push_tasks(&self, response: Result<Vec<Task>, ClusterViewError>) -> &Self {
        self.inner.lock().expect("script lock").tasks.push_back(response);
        self
    }

    pub fn push_invoke(&self, response: Result<Option<Upid>, ClusterViewError>) -> &Self {
        self.inner.lock().expect("script lock").invokes.push_back(response);
        self
    }

    pub fn push_details(&self, response: Result<NodeDetails, ClusterViewError>) -> &Self {
        self.inner.lock().expect("script lock").details.push_back(response);
        self
    }

    pub fn set_sessions(&self, count: usize) {
        self.inner.lock().expect("script lock").sessions = count;
    }

    pub fn calls(&self) -> Vec<SourceCall> {
        self.inner.lock().expect("script lock").calls.clone()
    }

    fn record(&self, call: SourceCall) -> std::sync::MutexGuard<'_, ScriptedInner> {
        let mut inner = self.inner.lock().expect("script lock");
        inner.calls.push(call);
        inner
    }
}

impl ClusterDataSource for ScriptedSource {
    fn fetch_full_snapshot(&self) -> Result<ClusterSnapshot, ClusterViewError> {
        let mut inner = self.record(SourceCall::FullSnapshot);
        next_response(&mut inner.snapshots, "snapshot")
    }

    fn fetch_single_guest(&self, key: &GuestKey) -> Result<Guest, ClusterViewError> {
        let mut inner = self.record(SourceCall::SingleGuest(key.clone()));
        next_response(&mut inner.guests, "guest")
    }

    fn fetch_tasks(&self) -> Result<Vec<Task>, ClusterViewError> {
        let mut inner = self.record(SourceCall::Tasks);
        next_response(&mut inner.tasks, "tasks")
    }

    fn fetch_node_details(&self, key: &NodeKey) -> Result<NodeDetails, ClusterViewError> {
        let mut inner = self.record(SourceCall::NodeDetails(key.clone()));
        next_response(&mut inner.details, "node details")
    }
}

impl OperationInvoker for ScriptedSource {
    fn invoke(
        &self,
        target: &GuestKey,
        action: &GuestAction,
    ) -> Result<Option<Upid>, ClusterViewError> {
        let mut inner = self.record(SourceCall::Invoke(target.clone(), action.name().to_string()));
        if inner.invokes.is_empty() {
            return Ok(None);
        }
        next_response(&mut inner.invokes, "invoke")
    }
}

impl ConsoleSessions for ScriptedSource {
    fn active_sessions(&self) -> usize {
        self.inner.lock().expect("script lock").sessions
    }
}
