use crate::console::spawn_session_monitor;
use crate::errors::ClusterViewError;
use crate::filter::{distinct_statuses, Filterable, StructuredFilter, ViewFilter};
use crate::logging::append_run_log;
use crate::model::{
    ClusterSnapshot, Entity, Guest, GuestKey, GuestType, Node, NodeDetails, NodeKey, Task, Upid,
    ViewKind,
};
use crate::operations::{
    CompletionWaiter, GuestAction, OperationOutcome, OperationPolicies, OperationReport,
    OperationWorker, PollingWaiter, Resync,
};
use crate::pending::{PendingKey, PendingPhase, PendingTracker};
use crate::refresh::{spawn_ticker, FetchOrigin, RefreshPhase, RefreshScheduler, TickOutcome};
use crate::runtime::{CancelToken, Clock};
use crate::selection::{reconcile, Cursor, SearchStates};
use crate::source::{ClusterDataSource, ConsoleSessions, OperationInvoker};
use crate::store::{ActiveFilters, EntityStore, ReplaceOutcome, SnapshotPair};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

const QUEUE_DEPTH: usize = 256;

type EngineResult<T> = Result<T, ClusterViewError>;

#[derive(Debug, Clone, PartialEq)]
pub enum ViewRows {
    Nodes(Vec<Node>),
    Guests(Vec<Guest>),
    Tasks(Vec<Task>),
}

impl ViewRows {
    pub fn len(&self) -> usize {
        match self {
            Self::Nodes(rows) => rows.len(),
            Self::Guests(rows) => rows.len(),
            Self::Tasks(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusMessage {
    pub level: MessageLevel,
    pub text: String,
}

impl StatusMessage {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Info,
            text: text.into(),
        }
    }

    pub fn warn(text: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Warn,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Error,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshStatus {
    pub enabled: bool,
    pub phase: RefreshPhase,
    pub countdown: u32,
    pub interval: u32,
    pub last_error: Option<String>,
}

/// Everything the render surface needs for one frame. Built by the writer
/// after a mutation has fully completed.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    pub generation: u64,
    pub revision: u64,
    pub loaded: bool,
    pub active_view: ViewKind,
    pub nodes: Vec<Node>,
    pub guests: Vec<Guest>,
    pub tasks: Vec<Task>,
    /// Unfiltered node list in cluster order, for picking migration targets.
    pub all_nodes: Vec<Node>,
    pub totals: BTreeMap<ViewKind, usize>,
    pub cursors: BTreeMap<ViewKind, Cursor>,
    pub filters: BTreeMap<ViewKind, ViewFilter>,
    /// Every status present in the unfiltered guest list, for the status facet.
    pub guest_statuses: Vec<String>,
    pub pending: Vec<(PendingKey, String)>,
    pub refresh: RefreshStatus,
    pub message: Option<StatusMessage>,
    pub console_sessions: usize,
    pub shutting_down: bool,
}

impl ViewSnapshot {
    pub fn cursor(&self, kind: ViewKind) -> Cursor {
        self.cursors.get(&kind).copied().unwrap_or(Cursor::Empty)
    }

    pub fn row_count(&self, kind: ViewKind) -> usize {
        match kind {
            ViewKind::Nodes => self.nodes.len(),
            ViewKind::Guests => self.guests.len(),
            ViewKind::Tasks => self.tasks.len(),
        }
    }

    pub fn focused_guest(&self) -> Option<&Guest> {
        self.cursor(ViewKind::Guests)
            .index()
            .and_then(|idx| self.guests.get(idx))
    }

    pub fn focused_node(&self) -> Option<&Node> {
        self.cursor(ViewKind::Nodes)
            .index()
            .and_then(|idx| self.nodes.get(idx))
    }

    pub fn pending_label(&self, key: &PendingKey) -> Option<&str> {
        self.pending
            .iter()
            .find(|(held, _)| held == key)
            .map(|(_, label)| label.as_str())
    }

    pub fn filter(&self, kind: ViewKind) -> ViewFilter {
        self.filters.get(&kind).cloned().unwrap_or_default()
    }
}

/// Receives each completed state. Must not call back into the engine.
pub trait RenderSurface: Send {
    fn apply(&mut self, view: &ViewSnapshot);
}

/// Forwards frames to another thread, typically the terminal loop.
pub struct ChannelSurface {
    tx: std::sync::mpsc::Sender<ViewSnapshot>,
}

impl ChannelSurface {
    pub fn new() -> (Self, std::sync::mpsc::Receiver<ViewSnapshot>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (Self { tx }, rx)
    }
}

impl RenderSurface for ChannelSurface {
    fn apply(&mut self, view: &ViewSnapshot) {
        let _ = self.tx.send(view.clone());
    }
}

/// Drains frames from a `ChannelSurface` until one satisfies `predicate`.
pub fn wait_for_view<F>(
    frames: &std::sync::mpsc::Receiver<ViewSnapshot>,
    timeout: Duration,
    mut predicate: F,
) -> Option<ViewSnapshot>
where
    F: FnMut(&ViewSnapshot) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        let view = frames.recv_timeout(remaining).ok()?;
        if predicate(&view) {
            return Some(view);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub cleared_pending: usize,
}

#[derive(Debug)]
pub enum EngineEvent {
    FilteredView {
        kind: ViewKind,
        reply: oneshot::Sender<ViewRows>,
    },
    Snapshot {
        reply: oneshot::Sender<ViewSnapshot>,
    },
    IsPending {
        key: PendingKey,
        reply: oneshot::Sender<(bool, Option<String>)>,
    },
    SetTextFilter {
        kind: ViewKind,
        text: String,
        reply: oneshot::Sender<EngineResult<usize>>,
    },
    SetStructuredFilter {
        kind: ViewKind,
        filter: StructuredFilter,
        reply: oneshot::Sender<EngineResult<usize>>,
    },
    ClearFilter {
        kind: ViewKind,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    MoveCursor {
        kind: ViewKind,
        delta: isize,
        reply: oneshot::Sender<Cursor>,
    },
    SetActiveView {
        kind: ViewKind,
        reply: oneshot::Sender<()>,
    },
    ShowMessage(StatusMessage),
    RequestManualRefresh {
        reply: oneshot::Sender<EngineResult<u64>>,
    },
    StartAutoRefresh {
        interval_secs: u32,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    StopAutoRefresh {
        reply: oneshot::Sender<()>,
    },
    Dispatch {
        target: GuestKey,
        action: GuestAction,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    RefreshGuest {
        target: GuestKey,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Tick {
        ticker_id: u64,
    },
    SnapshotReady {
        seq: u64,
        result: EngineResult<ClusterSnapshot>,
    },
    GuestFetched {
        target: GuestKey,
        result: EngineResult<Guest>,
    },
    NodeDetailsReady {
        key: NodeKey,
        result: EngineResult<NodeDetails>,
    },
    OperationFinished(Box<OperationReport>),
    SessionCountChanged(usize),
    Shutdown {
        reply: Option<oneshot::Sender<ShutdownReport>>,
    },
}

impl EngineEvent {
    /// Results posted by background workers, as opposed to requests.
    fn is_worker_result(&self) -> bool {
        matches!(
            self,
            Self::SnapshotReady { .. }
                | Self::GuestFetched { .. }
                | Self::NodeDetailsReady { .. }
                | Self::OperationFinished(_)
        )
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn ClusterDataSource>,
    pub invoker: Arc<dyn OperationInvoker>,
    pub sessions: Option<Arc<dyn ConsoleSessions>>,
    pub clock: Arc<dyn Clock>,
    /// Replaces the polling completion check when set.
    pub waiter: Option<Arc<dyn CompletionWaiter>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub refresh_interval_secs: u32,
    pub auto_refresh: bool,
    pub tick_period: Duration,
    pub console_poll: Duration,
    pub policies: OperationPolicies,
    pub fetch_node_details: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: crate::refresh::DEFAULT_INTERVAL_SECS,
            auto_refresh: true,
            tick_period: Duration::from_secs(1),
            console_poll: Duration::from_secs(5),
            policies: OperationPolicies::default(),
            fetch_node_details: true,
        }
    }
}

/// Cloneable front door to the writer thread. Every call blocks until the
/// writer has applied the request, so it must not be used from inside a
/// `RenderSurface`.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineEvent>,
}

impl EngineHandle {
    fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineEvent,
    ) -> EngineResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(build(reply_tx))
            .map_err(|_| ClusterViewError::Shutdown)?;
        reply_rx.blocking_recv().map_err(|_| ClusterViewError::Shutdown)
    }

    pub(crate) fn post(&self, event: EngineEvent) -> bool {
        self.tx.blocking_send(event).is_ok()
    }

    pub fn filtered_view(&self, kind: ViewKind) -> EngineResult<ViewRows> {
        self.request(|reply| EngineEvent::FilteredView { kind, reply })
    }

    pub fn snapshot(&self) -> EngineResult<ViewSnapshot> {
        self.request(|reply| EngineEvent::Snapshot { reply })
    }

    pub fn is_pending(&self, key: PendingKey) -> EngineResult<(bool, Option<String>)> {
        self.request(|reply| EngineEvent::IsPending { key, reply })
    }

    pub fn set_text_filter(&self, kind: ViewKind, text: impl Into<String>) -> EngineResult<usize> {
        let text = text.into();
        self.request(|reply| EngineEvent::SetTextFilter { kind, text, reply })?
    }

    pub fn set_structured_filter(
        &self,
        kind: ViewKind,
        filter: StructuredFilter,
    ) -> EngineResult<usize> {
        self.request(|reply| EngineEvent::SetStructuredFilter {
            kind,
            filter,
            reply,
        })?
    }

    pub fn clear_filter(&self, kind: ViewKind) -> EngineResult<()> {
        self.request(|reply| EngineEvent::ClearFilter { kind, reply })?
    }

    pub fn move_cursor(&self, kind: ViewKind, delta: isize) -> EngineResult<Cursor> {
        self.request(|reply| EngineEvent::MoveCursor { kind, delta, reply })
    }

    pub fn set_active_view(&self, kind: ViewKind) -> EngineResult<()> {
        self.request(|reply| EngineEvent::SetActiveView { kind, reply })
    }

    pub fn show_message(&self, message: StatusMessage) -> EngineResult<()> {
        if self.post(EngineEvent::ShowMessage(message)) {
            Ok(())
        } else {
            Err(ClusterViewError::Shutdown)
        }
    }

    /// Returns the fetch sequence number on success.
    pub fn request_manual_refresh(&self) -> EngineResult<u64> {
        self.request(|reply| EngineEvent::RequestManualRefresh { reply })?
    }

    pub fn start_auto_refresh(&self, interval_secs: u32) -> EngineResult<()> {
        self.request(|reply| EngineEvent::StartAutoRefresh {
            interval_secs,
            reply,
        })?
    }

    pub fn stop_auto_refresh(&self) -> EngineResult<()> {
        self.request(|reply| EngineEvent::StopAutoRefresh { reply })
    }

    /// Marks the guest pending and starts the operation in the background.
    /// Fails immediately with `Busy` if another operation holds the guest.
    pub fn dispatch(&self, target: GuestKey, action: GuestAction) -> EngineResult<()> {
        self.request(|reply| EngineEvent::Dispatch {
            target,
            action,
            reply,
        })?
    }

    pub fn refresh_guest(&self, target: GuestKey) -> EngineResult<()> {
        self.request(|reply| EngineEvent::RefreshGuest { target, reply })?
    }

    pub fn shutdown(&self) -> EngineResult<ShutdownReport> {
        self.request(|reply| EngineEvent::Shutdown { reply: Some(reply) })
    }
}

/// Owns the writer thread. Dropping the engine shuts it down.
pub struct Engine {
    handle: EngineHandle,
    writer_join: Option<thread::JoinHandle<()>>,
    cancel: CancelToken,
}

impl Engine {
    pub fn start(
        collaborators: Collaborators,
        settings: EngineSettings,
        surface: Box<dyn RenderSurface>,
    ) -> EngineResult<Self> {
        if settings.refresh_interval_secs == 0 {
            return Err(ClusterViewError::InvalidConfig(
                "refresh interval must be at least one second".to_string(),
            ));
        }
        let (tx, mut rx) = mpsc::channel(QUEUE_DEPTH);
        let cancel = CancelToken::new();
        let handle = EngineHandle { tx };
        let mut writer = Writer::new(
            collaborators,
            settings,
            surface,
            handle.clone(),
            cancel.clone(),
        );
        let writer_join = thread::Builder::new()
            .name("clusterview-writer".to_string())
            .spawn(move || {
                writer.boot();
                while let Some(event) = rx.blocking_recv() {
                    if !writer.apply_event(event) {
                        break;
                    }
                }
                append_run_log("info", "engine.writer.stopped", json!({}));
            })
            .map_err(|e| ClusterViewError::Io(e.to_string()))?;
        Ok(Self {
            handle,
            writer_join: Some(writer_join),
            cancel,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn shutdown(mut self) -> EngineResult<ShutdownReport> {
        let report = self.handle.shutdown();
        if let Some(join) = self.writer_join.take() {
            let _ = join.join();
        }
        report
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(join) = self.writer_join.take() {
            self.cancel.cancel();
            // Workers keep senders alive, so the queue never closes by itself.
            let _ = self.handle.post(EngineEvent::Shutdown { reply: None });
            let _ = join.join();
        }
    }
}

struct Focus {
    node: Option<NodeKey>,
    guest: Option<GuestKey>,
    task: Option<Upid>,
}

fn focused_key<E: Entity + Filterable>(pair: &SnapshotPair<E>, cursor: Cursor) -> Option<E::Key> {
    cursor
        .index()
        .and_then(|row| pair.filtered_at(row))
        .map(Entity::key)
}

/// State owned by the writer thread. Nothing here is shared.
struct Writer {
    collaborators: Collaborators,
    settings: EngineSettings,
    surface: Box<dyn RenderSurface>,
    handle: EngineHandle,
    cancel: CancelToken,
    store: EntityStore,
    searches: SearchStates,
    cursors: BTreeMap<ViewKind, Cursor>,
    pending: PendingTracker,
    scheduler: RefreshScheduler,
    active_view: ViewKind,
    message: Option<StatusMessage>,
    sessions: usize,
    generation: u64,
    shutting_down: bool,
    ticker: Option<(u64, CancelToken)>,
    next_ticker_id: u64,
    details_requested: bool,
}

impl Writer {
    fn new(
        collaborators: Collaborators,
        settings: EngineSettings,
        surface: Box<dyn RenderSurface>,
        handle: EngineHandle,
        cancel: CancelToken,
    ) -> Self {
        let scheduler = RefreshScheduler::new(settings.refresh_interval_secs, Default::default());
        Self {
            collaborators,
            settings,
            surface,
            handle,
            cancel,
            store: EntityStore::default(),
            searches: SearchStates::default(),
            cursors: ViewKind::ALL
                .into_iter()
                .map(|kind| (kind, Cursor::Empty))
                .collect(),
            pending: PendingTracker::default(),
            scheduler,
            active_view: ViewKind::Guests,
            message: None,
            sessions: 0,
            generation: 0,
            shutting_down: false,
            ticker: None,
            next_ticker_id: 0,
            details_requested: false,
        }
    }

    fn boot(&mut self) {
        append_run_log(
            "info",
            "engine.started",
            json!({
                "refresh_interval_secs": self.settings.refresh_interval_secs,
                "auto_refresh": self.settings.auto_refresh,
            }),
        );
        if self.settings.auto_refresh {
            let interval = self.settings.refresh_interval_secs;
            if self.scheduler.start(interval).is_ok() {
                self.start_ticker();
            }
        }
        if let Some(sessions) = self.collaborators.sessions.clone() {
            let handle = self.handle.clone();
            spawn_session_monitor(
                sessions,
                self.settings.console_poll,
                self.cancel.child(),
                move |count| handle.post(EngineEvent::SessionCountChanged(count)),
            );
        }
        if let Ok(seq) = self.scheduler.begin_fetch(FetchOrigin::Manual) {
            self.spawn_fetch(seq);
        }
        self.message = Some(StatusMessage::info("Loading cluster data..."));
        self.redraw();
    }

    /// Applies one event. Returns `false` once the engine has shut down.
    fn apply_event(&mut self, event: EngineEvent) -> bool {
        if self.shutting_down && event.is_worker_result() {
            append_run_log("debug", "engine.result.discarded", json!({ "reason": "shutdown" }));
            return true;
        }
        match event {
            EngineEvent::FilteredView { kind, reply } => {
                let _ = reply.send(self.rows(kind));
            }
            EngineEvent::Snapshot { reply } => {
                let _ = reply.send(self.view_snapshot());
            }
            EngineEvent::IsPending { key, reply } => {
                let _ = reply.send(self.pending_status(&key));
            }
            EngineEvent::SetTextFilter { kind, text, reply } => {
                let result = self.set_text_filter(kind, text);
                let _ = reply.send(result);
            }
            EngineEvent::SetStructuredFilter {
                kind,
                filter,
                reply,
            } => {
                let result = self.set_structured_filter(kind, filter);
                let _ = reply.send(result);
            }
            EngineEvent::ClearFilter { kind, reply } => {
                let result = self.clear_filter(kind);
                let _ = reply.send(result);
            }
            EngineEvent::MoveCursor { kind, delta, reply } => {
                let _ = reply.send(self.move_cursor(kind, delta));
            }
            EngineEvent::SetActiveView { kind, reply } => {
                self.active_view = kind;
                self.redraw();
                let _ = reply.send(());
            }
            EngineEvent::ShowMessage(message) => {
                self.message = Some(message);
                self.redraw();
            }
            EngineEvent::RequestManualRefresh { reply } => {
                let result = self.request_manual_refresh();
                let _ = reply.send(result);
            }
            EngineEvent::StartAutoRefresh {
                interval_secs,
                reply,
            } => {
                let result = self.start_auto_refresh(interval_secs);
                let _ = reply.send(result);
            }
            EngineEvent::StopAutoRefresh { reply } => {
                self.scheduler.stop();
                self.stop_ticker();
                self.message = Some(StatusMessage::info("Auto-refresh disabled"));
                self.redraw();
                let _ = reply.send(());
            }
            EngineEvent::Dispatch {
                target,
                action,
                reply,
            } => {
                let result = self.dispatch(target, action);
                let _ = reply.send(result);
            }
            EngineEvent::RefreshGuest { target, reply } => {
                let result = self.refresh_guest(target);
                let _ = reply.send(result);
            }
            EngineEvent::Tick { ticker_id } => self.on_tick(ticker_id),
            EngineEvent::SnapshotReady { seq, result } => self.on_snapshot(seq, result),
            EngineEvent::GuestFetched { target, result } => self.on_guest_fetched(target, result),
            EngineEvent::NodeDetailsReady { key, result } => self.on_node_details(key, result),
            EngineEvent::OperationFinished(report) => self.on_operation_finished(*report),
            EngineEvent::SessionCountChanged(count) => {
                self.sessions = count;
                self.redraw();
            }
            EngineEvent::Shutdown { reply } => {
                let report = self.shutdown();
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
                return false;
            }
        }
        true
    }

    fn active_filters(&self) -> ActiveFilters {
        ActiveFilters {
            nodes: self.searches.filter(ViewKind::Nodes),
            guests: self.searches.filter(ViewKind::Guests),
            tasks: self.searches.filter(ViewKind::Tasks),
        }
    }

    fn cursor(&self, kind: ViewKind) -> Cursor {
        self.cursors.get(&kind).copied().unwrap_or(Cursor::Empty)
    }

    fn capture_focus(&self) -> Focus {
        Focus {
            node: focused_key(self.store.nodes(), self.cursor(ViewKind::Nodes)),
            guest: focused_key(self.store.guests(), self.cursor(ViewKind::Guests)),
            task: focused_key(self.store.tasks(), self.cursor(ViewKind::Tasks)),
        }
    }

    fn set_cursor(&mut self, kind: ViewKind, cursor: Cursor) {
        self.cursors.insert(kind, cursor);
        self.searches.record_selection(kind, cursor);
    }

    /// Re-resolves every cursor against the current filtered lists, then
    /// redraws. Runs after each change to a filtered list.
    fn commit(&mut self, focus: Focus) {
        let nodes = reconcile(focus.node.as_ref(), self.store.nodes().filtered());
        let guests = reconcile(focus.guest.as_ref(), self.store.guests().filtered());
        let tasks = reconcile(focus.task.as_ref(), self.store.tasks().filtered());
        self.set_cursor(ViewKind::Nodes, nodes);
        self.set_cursor(ViewKind::Guests, guests);
        self.set_cursor(ViewKind::Tasks, tasks);
        self.redraw();
    }

    fn redraw(&mut self) {
        self.generation += 1;
        let view = self.view_snapshot();
        self.surface.apply(&view);
    }

    fn rows(&self, kind: ViewKind) -> ViewRows {
        match kind {
            ViewKind::Nodes => ViewRows::Nodes(self.store.nodes().filtered_cloned()),
            ViewKind::Guests => ViewRows::Guests(self.store.guests().filtered_cloned()),
            ViewKind::Tasks => ViewRows::Tasks(self.store.tasks().filtered_cloned()),
        }
    }

    fn view_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            generation: self.generation,
            revision: self.store.revision(),
            loaded: self.store.is_loaded(),
            active_view: self.active_view,
            nodes: self.store.nodes().filtered_cloned(),
            guests: self.store.guests().filtered_cloned(),
            tasks: self.store.tasks().filtered_cloned(),
            all_nodes: self.store.nodes().original().to_vec(),
            totals: BTreeMap::from([
                (ViewKind::Nodes, self.store.nodes().original().len()),
                (ViewKind::Guests, self.store.guests().original().len()),
                (ViewKind::Tasks, self.store.tasks().original().len()),
            ]),
            cursors: self.cursors.clone(),
            filters: self.searches.filters(),
            guest_statuses: distinct_statuses(self.store.guests().original()),
            pending: self.pending_labels(),
            refresh: RefreshStatus {
                enabled: self.scheduler.is_enabled(),
                phase: self.scheduler.phase(),
                countdown: self.scheduler.remaining(),
                interval: self.scheduler.interval(),
                last_error: self.scheduler.last_error().map(str::to_string),
            },
            message: self.message.clone(),
            console_sessions: self.sessions,
            shutting_down: self.shutting_down,
        }
    }

    fn set_text_filter(&mut self, kind: ViewKind, text: String) -> EngineResult<usize> {
        let focus = self.capture_focus();
        self.searches.activate(kind).filter.text = text;
        self.store.refilter(&self.active_filters());
        self.commit(focus);
        Ok(self.rows_len(kind))
    }

    fn set_structured_filter(
        &mut self,
        kind: ViewKind,
        filter: StructuredFilter,
    ) -> EngineResult<usize> {
        let focus = self.capture_focus();
        let state = self.searches.activate(kind);
        state.filter.structured = filter;
        let active = state.filter.active_criteria();
        self.store.refilter(&self.active_filters());
        let noun = match kind {
            ViewKind::Nodes => "node",
            ViewKind::Guests => "guest",
            ViewKind::Tasks => "task",
        };
        self.message = Some(StatusMessage::info(format!(
            "Applied {noun} filters ({active} active)"
        )));
        append_run_log(
            "debug",
            "engine.filter.structured",
            json!({ "view": kind.as_str(), "active": active }),
        );
        self.commit(focus);
        Ok(self.rows_len(kind))
    }

    fn clear_filter(&mut self, kind: ViewKind) -> EngineResult<()> {
        let focus = self.capture_focus();
        if self.searches.clear(kind) {
            self.store.refilter(&self.active_filters());
            self.message = Some(StatusMessage::info("Filter cleared"));
        }
        self.commit(focus);
        Ok(())
    }

    fn rows_len(&self, kind: ViewKind) -> usize {
        match kind {
            ViewKind::Nodes => self.store.nodes().filtered_len(),
            ViewKind::Guests => self.store.guests().filtered_len(),
            ViewKind::Tasks => self.store.tasks().filtered_len(),
        }
    }

    fn move_cursor(&mut self, kind: ViewKind, delta: isize) -> Cursor {
        let cursor = self.cursor(kind).step(delta, self.rows_len(kind));
        self.set_cursor(kind, cursor);
        self.redraw();
        cursor
    }

    fn current_guest_key(&self, key: &GuestKey) -> Option<GuestKey> {
        self.store.guests().get(key).map(Entity::key)
    }

    /// The pending entry covering `target`. Entries stay keyed by the identity
    /// used at dispatch; one whose guest has since moved is followed through
    /// the store, which only resolves unique lineage.
    fn pending_key_for(&self, target: &GuestKey) -> PendingKey {
        let exact = PendingKey::Guest(target.clone());
        if self.pending.is_pending(&exact).0 {
            return exact;
        }
        let Some(current) = self.current_guest_key(target) else {
            return exact;
        };
        self.pending
            .guest_keys()
            .find(|held| self.current_guest_key(held).as_ref() == Some(&current))
            .map(|held| PendingKey::Guest(held.clone()))
            .unwrap_or(exact)
    }

    fn pending_status(&self, key: &PendingKey) -> (bool, Option<String>) {
        match key {
            PendingKey::Guest(guest) => self.pending.is_pending(&self.pending_key_for(guest)),
            PendingKey::Node(_) => self.pending.is_pending(key),
        }
    }

    /// Pending labels keyed by where each guest is now.
    fn pending_labels(&self) -> Vec<(PendingKey, String)> {
        self.pending
            .labels()
            .into_iter()
            .map(|(key, label)| match key {
                PendingKey::Guest(guest) => {
                    let current = self.current_guest_key(&guest).unwrap_or(guest);
                    (PendingKey::Guest(current), label)
                }
                PendingKey::Node(_) => (key, label),
            })
            .collect()
    }

    fn frozen_guests(&self, owner: Option<&PendingKey>) -> BTreeSet<GuestKey> {
        self.pending
            .frozen_guests(owner)
            .into_iter()
            .map(|key| self.current_guest_key(&key).unwrap_or(key))
            .collect()
    }

    fn busy_with_operations(&self) -> Option<ClusterViewError> {
        self.pending
            .labels()
            .into_iter()
            .next()
            .map(|(key, label)| ClusterViewError::Busy {
                target: key.to_string(),
                label,
            })
    }

    fn request_manual_refresh(&mut self) -> EngineResult<u64> {
        if self.shutting_down {
            return Err(ClusterViewError::Shutdown);
        }
        let begin = match self.busy_with_operations() {
            Some(busy) => Err(busy),
            None => self.scheduler.begin_fetch(FetchOrigin::Manual),
        };
        match begin {
            Ok(seq) => {
                self.spawn_fetch(seq);
                self.message = Some(StatusMessage::info("Refreshing..."));
                self.redraw();
                Ok(seq)
            }
            Err(err) => {
                self.message = Some(StatusMessage::warn(format!(
                    "Cannot refresh now: {err}"
                )));
                self.redraw();
                Err(err)
            }
        }
    }

    fn start_auto_refresh(&mut self, interval_secs: u32) -> EngineResult<()> {
        if self.shutting_down {
            return Err(ClusterViewError::Shutdown);
        }
        self.scheduler.start(interval_secs)?;
        self.start_ticker();
        self.message = Some(StatusMessage::info(format!(
            "Auto-refresh every {interval_secs}s"
        )));
        self.redraw();
        Ok(())
    }

    fn start_ticker(&mut self) {
        self.stop_ticker();
        self.next_ticker_id += 1;
        let ticker_id = self.next_ticker_id;
        let token = self.cancel.child();
        let handle = self.handle.clone();
        spawn_ticker(
            ticker_id,
            self.settings.tick_period,
            token.clone(),
            move |ticker_id| handle.post(EngineEvent::Tick { ticker_id }),
        );
        self.ticker = Some((ticker_id, token));
    }

    fn stop_ticker(&mut self) {
        if let Some((_, token)) = self.ticker.take() {
            token.cancel();
        }
    }

    fn on_tick(&mut self, ticker_id: u64) {
        if self.ticker.as_ref().map(|(id, _)| *id) != Some(ticker_id) {
            return;
        }
        match self.scheduler.tick(self.pending.any()) {
            TickOutcome::Disabled => {}
            TickOutcome::Start(seq) => {
                self.spawn_fetch(seq);
                self.redraw();
            }
            TickOutcome::Skipped => {
                append_run_log(
                    "debug",
                    "engine.refresh.skipped",
                    json!({ "pending": self.pending.len() }),
                );
                self.redraw();
            }
            TickOutcome::Paused | TickOutcome::Counting(_) => self.redraw(),
        }
    }

    fn spawn_fetch(&self, seq: u64) {
        let source = self.collaborators.source.clone();
        let handle = self.handle.clone();
        let cancel = self.cancel.clone();
        thread::spawn(move || {
            let result = source.fetch_full_snapshot();
            if cancel.is_cancelled() {
                return;
            }
            handle.post(EngineEvent::SnapshotReady { seq, result });
        });
    }

    fn on_snapshot(&mut self, seq: u64, result: EngineResult<ClusterSnapshot>) {
        let Some(origin) = self.scheduler.enter_applying(seq) else {
            append_run_log("debug", "engine.snapshot.unclaimed", json!({ "seq": seq }));
            return;
        };
        match result {
            Ok(snapshot) => {
                let focus = self.capture_focus();
                let frozen = self.frozen_guests(None);
                let outcome =
                    self.store
                        .replace_snapshot(seq, snapshot, &self.active_filters(), &frozen);
                self.scheduler.finish(seq, None);
                let stale = outcome == ReplaceOutcome::Stale;
                append_run_log(
                    "info",
                    "engine.snapshot.applied",
                    json!({
                        "seq": seq,
                        "applied_seq": self.store.applied_seq(),
                        "origin": origin.as_str(),
                        "stale": stale,
                        "nodes": self.store.nodes().original().len(),
                        "guests": self.store.guests().original().len(),
                        "tasks": self.store.tasks().original().len(),
                    }),
                );
                match origin {
                    FetchOrigin::Manual | FetchOrigin::Fallback if stale => {
                        self.message = Some(StatusMessage::info(
                            "Newer cluster data was already shown; refresh result dropped",
                        ));
                    }
                    FetchOrigin::Manual => {
                        self.message = Some(StatusMessage::info("Cluster data refreshed"));
                    }
                    FetchOrigin::Fallback => {
                        self.message = Some(StatusMessage::info(
                            "Guest may have moved; refreshed all cluster data",
                        ));
                    }
                    FetchOrigin::Auto => {
                        if self
                            .message
                            .as_ref()
                            .is_some_and(|message| message.text.starts_with("Refresh failed"))
                        {
                            self.message = None;
                        }
                    }
                }
                self.commit(focus);
                self.request_node_details();
            }
            Err(err) => {
                self.scheduler.finish(seq, Some(err.to_string()));
                append_run_log(
                    "warn",
                    "engine.snapshot.failed",
                    json!({ "seq": seq, "origin": origin.as_str(), "error": err.to_string() }),
                );
                self.message = Some(StatusMessage::warn(format!(
                    "Refresh failed: {err} (showing last known data)"
                )));
                self.redraw();
            }
        }
    }

    fn request_node_details(&mut self) {
        if !self.settings.fetch_node_details || self.details_requested {
            return;
        }
        self.details_requested = true;
        let keys = self
            .store
            .nodes()
            .original()
            .iter()
            .filter(|node| node.online)
            .map(Entity::key)
            .collect::<Vec<_>>();
        let source = self.collaborators.source.clone();
        let handle = self.handle.clone();
        let cancel = self.cancel.clone();
        thread::spawn(move || {
            for key in keys {
                if cancel.is_cancelled() {
                    break;
                }
                let result = source.fetch_node_details(&key);
                if !handle.post(EngineEvent::NodeDetailsReady { key, result }) {
                    break;
                }
            }
        });
    }

    fn on_node_details(&mut self, key: NodeKey, result: EngineResult<NodeDetails>) {
        match result {
            Ok(details) => {
                let focus = self.capture_focus();
                let filters = self.active_filters();
                match self.store.patch_node_details(&key, details, &filters.nodes) {
                    Ok(()) => self.commit(focus),
                    Err(err) => append_run_log(
                        "debug",
                        "engine.node_details.dropped",
                        json!({ "node": key.to_string(), "error": err.to_string() }),
                    ),
                }
            }
            Err(err) => append_run_log(
                "warn",
                "engine.node_details.failed",
                json!({ "node": key.to_string(), "error": err.to_string() }),
            ),
        }
    }

    fn dispatch(&mut self, target: GuestKey, action: GuestAction) -> EngineResult<()> {
        if self.shutting_down {
            return Err(ClusterViewError::Shutdown);
        }
        let guest = self
            .store
            .guests()
            .get(&target)
            .cloned()
            .ok_or_else(|| ClusterViewError::NotFound(format!("guest {target}")))?;
        let key = guest.key();
        let label = action.label();
        let held = self.pending_key_for(&key);
        let claimed = match self.pending.entry(&held) {
            Some(entry) => Err(ClusterViewError::Busy {
                target: held.to_string(),
                label: entry.label.clone(),
            }),
            None => self
                .pending
                .set_pending(PendingKey::Guest(key.clone()), label.clone()),
        };
        if let Err(err) = claimed {
            append_run_log(
                "info",
                "engine.dispatch.rejected",
                json!({ "target": key.to_string(), "action": action.name(), "error": err.to_string() }),
            );
            self.message = Some(StatusMessage::warn(err.to_string()));
            self.redraw();
            return Err(err);
        }
        append_run_log(
            "info",
            "engine.dispatch.accepted",
            json!({ "target": key.to_string(), "action": action.name(), "label": label }),
        );
        self.message = Some(StatusMessage::info(format!("{label} {}...", guest.name)));
        self.redraw();
        self.spawn_operation(key, guest.guest_type, action);
        Ok(())
    }

    fn spawn_operation(&self, target: GuestKey, guest_type: GuestType, action: GuestAction) {
        let collaborators = self.collaborators.clone();
        let policies = self.settings.policies;
        let sequence = self.scheduler.sequence();
        let handle = self.handle.clone();
        let cancel = self.cancel.child();
        thread::spawn(move || {
            let polling;
            let waiter: &dyn CompletionWaiter = match collaborators.waiter.as_deref() {
                Some(waiter) => waiter,
                None => {
                    polling = PollingWaiter::new(
                        collaborators.source.clone(),
                        collaborators.clock.clone(),
                        cancel.clone(),
                    );
                    &polling
                }
            };
            let next_seq = || sequence.next();
            let worker = OperationWorker {
                source: collaborators.source.as_ref(),
                invoker: collaborators.invoker.as_ref(),
                waiter,
                policies,
                next_seq: &next_seq,
            };
            let report = worker.run(&target, guest_type, &action);
            if cancel.is_cancelled() {
                return;
            }
            handle.post(EngineEvent::OperationFinished(Box::new(report)));
        });
    }

    /// Resync first, redraw, then release the pending entry so the row is
    /// never shown idle with pre-operation data.
    fn on_operation_finished(&mut self, report: OperationReport) {
        let key = PendingKey::Guest(report.target.clone());
        let focus = self.capture_focus();
        let filters = self.active_filters();
        let mut resync_error = None;
        match report.resync {
            Resync::None => {}
            Resync::Full {
                seq,
                result: Ok(snapshot),
            } => {
                let frozen = self.frozen_guests(Some(&key));
                self.store.replace_snapshot(seq, snapshot, &filters, &frozen);
                self.scheduler.note_external_refresh();
            }
            Resync::Full { result: Err(err), .. } => resync_error = Some(err),
            Resync::Guest { guest, tasks } => {
                if let Err(err) = self.store.patch_guest(&report.target, guest, &filters.guests) {
                    resync_error = Some(err);
                }
                if let Some(tasks) = tasks {
                    self.store.replace_tasks(tasks, &filters.tasks);
                }
            }
        }

        let phase = match &report.outcome {
            OperationOutcome::Completed => PendingPhase::Completed,
            OperationOutcome::Failed(err) => PendingPhase::Failed(err.clone()),
            OperationOutcome::TimedOut => PendingPhase::TimedOut,
            OperationOutcome::Cancelled => PendingPhase::Failed("cancelled".to_string()),
        };
        self.pending.resolve(&key, phase);
        self.commit(focus);
        self.pending.clear_pending(&key);

        let action = report.action.name();
        let target = &report.target;
        let mut message = match &report.outcome {
            OperationOutcome::Completed => {
                StatusMessage::info(format!("{action} of {target} completed"))
            }
            OperationOutcome::Failed(err) => {
                StatusMessage::error(format!("{action} of {target} failed: {err}"))
            }
            OperationOutcome::TimedOut => StatusMessage::warn(format!(
                "{action} of {target}: no confirmation within {}s, showing current state",
                self.settings.policies.wait_for(&report.action).max_wait.as_secs()
            )),
            OperationOutcome::Cancelled => {
                StatusMessage::warn(format!("{action} of {target} cancelled"))
            }
        };
        if let Some(err) = &resync_error {
            message.text.push_str(&format!(" (refresh failed: {err})"));
        }
        append_run_log(
            "info",
            "engine.operation.finished",
            json!({
                "target": target.to_string(),
                "action": action,
                "outcome": report.outcome.as_str(),
                "resync_error": resync_error.as_ref().map(ToString::to_string),
            }),
        );
        self.message = Some(message);
        self.redraw();
    }

    fn refresh_guest(&mut self, target: GuestKey) -> EngineResult<()> {
        if self.shutting_down {
            return Err(ClusterViewError::Shutdown);
        }
        let held = self.pending_key_for(&target);
        if let (true, Some(label)) = self.pending.is_pending(&held) {
            let err = ClusterViewError::Busy {
                target: held.to_string(),
                label,
            };
            self.message = Some(StatusMessage::warn(err.to_string()));
            self.redraw();
            return Err(err);
        }
        let key = self
            .store
            .guests()
            .get(&target)
            .map(Entity::key)
            .ok_or_else(|| ClusterViewError::NotFound(format!("guest {target}")))?;
        let source = self.collaborators.source.clone();
        let handle = self.handle.clone();
        let cancel = self.cancel.clone();
        thread::spawn(move || {
            let result = source.fetch_single_guest(&key);
            if cancel.is_cancelled() {
                return;
            }
            handle.post(EngineEvent::GuestFetched { target: key, result });
        });
        Ok(())
    }

    fn on_guest_fetched(&mut self, target: GuestKey, result: EngineResult<Guest>) {
        if self.pending_status(&PendingKey::Guest(target.clone())).0 {
            append_run_log(
                "debug",
                "engine.guest_refresh.dropped",
                json!({ "target": target.to_string(), "reason": "pending" }),
            );
            return;
        }
        let patched = result.and_then(|guest| {
            let name = guest.name.clone();
            let focus = self.capture_focus();
            let filters = self.active_filters();
            self.store.patch_guest(&target, guest, &filters.guests)?;
            self.message = Some(StatusMessage::info(format!("Refreshed {name}")));
            self.commit(focus);
            Ok(())
        });
        match patched {
            Ok(()) => {}
            Err(err) if err.is_not_found() => self.fallback_refresh(&target),
            Err(err) => {
                self.message = Some(StatusMessage::warn(format!(
                    "Refresh of {target} failed: {err}"
                )));
                self.redraw();
            }
        }
    }

    fn fallback_refresh(&mut self, target: &GuestKey) {
        append_run_log(
            "info",
            "engine.guest_refresh.fallback",
            json!({ "target": target.to_string() }),
        );
        match self.scheduler.begin_fetch(FetchOrigin::Fallback) {
            Ok(seq) => {
                self.spawn_fetch(seq);
                self.message = Some(StatusMessage::info(format!(
                    "{target} not found, refreshing all cluster data"
                )));
            }
            Err(_) => {
                self.message = Some(StatusMessage::info(format!(
                    "{target} not found, waiting for the refresh in progress"
                )));
            }
        }
        self.redraw();
    }

    fn shutdown(&mut self) -> ShutdownReport {
        self.shutting_down = true;
        self.stop_ticker();
        self.scheduler.stop();
        self.cancel.cancel();
        let cleared_pending = self.pending.clear_all();
        append_run_log(
            "info",
            "engine.shutdown",
            json!({ "cleared_pending": cleared_pending }),
        );
        self.message = Some(StatusMessage::info("Shutting down"));
        self.redraw();
        ShutdownReport { cleared_pending }
    }
}
