use clusterview::engine::{
    wait_for_view, ChannelSurface, Collaborators, Engine, EngineSettings, MessageLevel, ViewRows,
    ViewSnapshot,
};
use clusterview::errors::ClusterViewError;
use clusterview::filter::StructuredFilter;
use clusterview::model::{
    ClusterSnapshot, Guest, GuestKey, GuestType, Node, NodeDetails, NodeKey, Task, Upid, ViewKind,
};
use clusterview::operations::{CompletionCheck, CompletionWaiter, GuestAction, WaitOutcome, WaitPolicy};
use clusterview::pending::PendingKey;
use clusterview::refresh::RefreshPhase;
use clusterview::runtime::FakeClock;
use clusterview::selection::Cursor;
use clusterview::simulated::SimulatedCluster;
use clusterview::source::{ClusterDataSource, ScriptedSource, SourceCall};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Holds every completion wait until the test releases it.
struct GateWaiter {
    release: Mutex<Receiver<WaitOutcome>>,
}

impl GateWaiter {
    fn new() -> (Self, Sender<WaitOutcome>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                release: Mutex::new(rx),
            },
            tx,
        )
    }
}

impl CompletionWaiter for GateWaiter {
    fn wait_for_observable_change(
        &self,
        _target: &GuestKey,
        _check: &CompletionCheck,
        _policy: &WaitPolicy,
    ) -> WaitOutcome {
        self.release
            .lock()
            .expect("gate lock")
            .recv()
            .unwrap_or(WaitOutcome::Cancelled)
    }
}

/// Holds every full fetch until the test opens the gate.
struct GatedSource {
    inner: ScriptedSource,
    gate: Mutex<Receiver<()>>,
}

impl ClusterDataSource for GatedSource {
    fn fetch_full_snapshot(&self) -> Result<ClusterSnapshot, ClusterViewError> {
        let _ = self.gate.lock().expect("gate lock").recv();
        self.inner.fetch_full_snapshot()
    }

    fn fetch_single_guest(&self, key: &GuestKey) -> Result<Guest, ClusterViewError> {
        self.inner.fetch_single_guest(key)
    }

    fn fetch_tasks(&self) -> Result<Vec<Task>, ClusterViewError> {
        self.inner.fetch_tasks()
    }

    fn fetch_node_details(&self, key: &NodeKey) -> Result<NodeDetails, ClusterViewError> {
        self.inner.fetch_node_details(key)
    }
}

struct FixedWaiter(WaitOutcome);

impl CompletionWaiter for FixedWaiter {
    fn wait_for_observable_change(
        &self,
        _target: &GuestKey,
        _check: &CompletionCheck,
        _policy: &WaitPolicy,
    ) -> WaitOutcome {
        self.0
    }
}

fn guest(node: &str, vmid: u32, name: &str, status: &str) -> Guest {
    Guest::new("p1", node, vmid, name, GuestType::Qemu, status)
}

fn snapshot(guests: Vec<Guest>) -> ClusterSnapshot {
    ClusterSnapshot {
        nodes: vec![Node::new("p1", "n1", true), Node::new("p1", "n2", true)],
        guests,
        tasks: Vec::new(),
    }
}

fn manual_settings() -> EngineSettings {
    EngineSettings {
        auto_refresh: false,
        fetch_node_details: false,
        ..EngineSettings::default()
    }
}

fn scripted(
    source: &ScriptedSource,
    waiter: Option<Arc<dyn CompletionWaiter>>,
) -> Collaborators {
    Collaborators {
        source: Arc::new(source.clone()),
        invoker: Arc::new(source.clone()),
        sessions: None,
        clock: Arc::new(FakeClock::default()),
        waiter,
    }
}

fn start(
    collaborators: Collaborators,
    settings: EngineSettings,
) -> (Engine, Receiver<ViewSnapshot>) {
    let (surface, frames) = ChannelSurface::new();
    let engine = Engine::start(collaborators, settings, Box::new(surface)).expect("engine");
    (engine, frames)
}

fn loaded(frames: &Receiver<ViewSnapshot>) -> ViewSnapshot {
    wait_for_view(frames, WAIT, |view| view.loaded).expect("first snapshot")
}

fn full_fetches(source: &ScriptedSource) -> usize {
    source
        .calls()
        .iter()
        .filter(|call| **call == SourceCall::FullSnapshot)
        .count()
}

#[test]
fn moved_guest_is_updated_in_place_and_keeps_focus_under_text_filter() {
    let before = vec![
        guest("n1", 1, "web-1", "running"),
        guest("n1", 2, "web-2", "running"),
        guest("n1", 100, "web-app", "running"),
        guest("n2", 3, "web-3", "running"),
        guest("n1", 5, "db", "running"),
        guest("n2", 4, "web-4", "running"),
    ];
    let mut before_app = before[2].clone();
    before_app.ip = Some("10.0.0.100".to_string());
    let mut first = before.clone();
    first[2] = before_app;

    // The cluster lists guests grouped by node, so the moved guest changes position.
    let after = vec![
        guest("n1", 1, "web-1", "running"),
        guest("n1", 2, "web-2", "running"),
        guest("n1", 5, "db", "running"),
        guest("n2", 3, "web-3", "running"),
        guest("n2", 4, "web-4", "running"),
        guest("n2", 100, "web-app", "running"),
    ];
    let source = ScriptedSource::new();
    source
        .push_snapshot(Ok(snapshot(first)))
        .push_snapshot(Ok(snapshot(after)));
    let (engine, frames) = start(scripted(&source, None), manual_settings());
    let handle = engine.handle();
    loaded(&frames);

    assert_eq!(handle.set_text_filter(ViewKind::Guests, "web").expect("filter"), 5);
    assert_eq!(
        handle.move_cursor(ViewKind::Guests, 2).expect("move"),
        Cursor::Row(2)
    );
    let focused = handle.snapshot().expect("snapshot");
    assert_eq!(focused.focused_guest().map(|g| g.vmid), Some(100));

    handle.request_manual_refresh().expect("refresh");
    let view = wait_for_view(&frames, WAIT, |view| {
        view.guests.iter().any(|g| g.vmid == 100 && g.node == "n2")
    })
    .expect("moved view");

    let names = view.guests.iter().map(|g| g.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["web-1", "web-2", "web-3", "web-4", "web-app"]);
    assert_eq!(view.totals.get(&ViewKind::Guests), Some(&6));
    let moved = view.focused_guest().expect("focused");
    assert_eq!(moved.vmid, 100);
    assert_eq!(moved.node, "n2");
    assert_eq!(moved.ip.as_deref(), Some("10.0.0.100"));
    assert_eq!(view.cursor(ViewKind::Guests), Cursor::Row(4));

    engine.shutdown().expect("shutdown");
}

#[test]
fn failed_refresh_keeps_last_known_data_and_warns() {
    let source = ScriptedSource::new();
    source
        .push_snapshot(Ok(snapshot(vec![
            guest("n1", 1, "web-1", "running"),
            guest("n1", 2, "db", "stopped"),
        ])))
        .push_snapshot(Err(ClusterViewError::Transport("connection reset".to_string())));
    let (engine, frames) = start(scripted(&source, None), manual_settings());
    let handle = engine.handle();
    loaded(&frames);
    let before = handle.filtered_view(ViewKind::Guests).expect("rows");

    handle.request_manual_refresh().expect("refresh");
    let view = wait_for_view(&frames, WAIT, |view| view.refresh.last_error.is_some())
        .expect("failed refresh");

    assert!(view.loaded);
    assert_eq!(handle.filtered_view(ViewKind::Guests).expect("rows"), before);
    let message = view.message.expect("warning");
    assert_eq!(message.level, MessageLevel::Warn);
    assert!(message.text.contains("connection reset"));

    engine.shutdown().expect("shutdown");
}

#[test]
fn pending_guest_rejects_second_action_and_manual_refresh() {
    let source = ScriptedSource::new();
    source
        .push_snapshot(Ok(snapshot(vec![
            guest("n1", 1, "web-1", "running"),
            guest("n1", 2, "db", "stopped"),
        ])))
        .push_invoke(Ok(None))
        .push_guest(Ok(guest("n1", 2, "db", "running")));
    let (waiter, release) = GateWaiter::new();
    let (engine, frames) = start(
        scripted(&source, Some(Arc::new(waiter))),
        manual_settings(),
    );
    let handle = engine.handle();
    loaded(&frames);

    let target = GuestKey::new("p1", "n1", 2);
    handle
        .dispatch(target.clone(), GuestAction::Start)
        .expect("first dispatch");
    assert_eq!(
        handle.is_pending(PendingKey::Guest(target.clone())).expect("query"),
        (true, Some("Starting".to_string()))
    );

    let err = handle
        .dispatch(target.clone(), GuestAction::Stop)
        .expect_err("busy");
    assert_eq!(
        err,
        ClusterViewError::Busy {
            target: "guest p1/n1/2".to_string(),
            label: "Starting".to_string(),
        }
    );
    assert!(matches!(
        handle.request_manual_refresh(),
        Err(ClusterViewError::Busy { .. })
    ));
    assert_eq!(
        handle
            .is_pending(PendingKey::Guest(GuestKey::new("p1", "n1", 1)))
            .expect("query"),
        (false, None)
    );

    release.send(WaitOutcome::Observed).expect("release");
    let view = wait_for_view(&frames, WAIT, |view| view.pending.is_empty())
        .expect("pending cleared");
    assert_eq!(
        handle.is_pending(PendingKey::Guest(target)).expect("query"),
        (false, None)
    );
    assert!(view.message.is_some());

    engine.shutdown().expect("shutdown");
}

#[test]
fn same_vmid_on_two_nodes_are_tracked_separately() {
    let source = ScriptedSource::new();
    source.push_snapshot(Ok(snapshot(vec![
        guest("n1", 100, "web-a", "stopped"),
        guest("n2", 100, "web-b", "running"),
    ])));
    let (waiter, _release) = GateWaiter::new();
    let (engine, frames) = start(
        scripted(&source, Some(Arc::new(waiter))),
        manual_settings(),
    );
    let handle = engine.handle();
    loaded(&frames);

    let on_n1 = GuestKey::new("p1", "n1", 100);
    let on_n2 = GuestKey::new("p1", "n2", 100);
    handle
        .dispatch(on_n1.clone(), GuestAction::Start)
        .expect("start on n1");
    assert_eq!(
        handle.is_pending(PendingKey::Guest(on_n2.clone())).expect("query"),
        (false, None)
    );
    handle
        .dispatch(on_n2.clone(), GuestAction::Stop)
        .expect("stop on n2 is independent");

    let view = handle.snapshot().expect("snapshot");
    assert_eq!(view.pending_label(&PendingKey::Guest(on_n1.clone())), Some("Starting"));
    assert_eq!(view.pending_label(&PendingKey::Guest(on_n2.clone())), Some("Stopping"));
    assert_eq!(
        handle.dispatch(on_n2, GuestAction::Start),
        Err(ClusterViewError::Busy {
            target: "guest p1/n2/100".to_string(),
            label: "Stopping".to_string(),
        })
    );
    // A key that no longer names either guest exactly is ambiguous, so it
    // matches neither entry.
    assert_eq!(
        handle
            .is_pending(PendingKey::Guest(GuestKey::new("p1", "n3", 100)))
            .expect("query"),
        (false, None)
    );

    let report = engine.shutdown().expect("shutdown");
    assert_eq!(report.cleared_pending, 2);
}

#[test]
fn pending_guest_is_still_busy_under_a_stale_node_key() {
    let source = ScriptedSource::new();
    source.push_snapshot(Ok(snapshot(vec![guest("n2", 7, "moved", "running")])));
    let (waiter, _release) = GateWaiter::new();
    let (engine, frames) = start(
        scripted(&source, Some(Arc::new(waiter))),
        manual_settings(),
    );
    let handle = engine.handle();
    loaded(&frames);

    handle
        .dispatch(GuestKey::new("p1", "n2", 7), GuestAction::Stop)
        .expect("dispatch");
    let stale = GuestKey::new("p1", "n1", 7);
    assert_eq!(
        handle.is_pending(PendingKey::Guest(stale.clone())).expect("query"),
        (true, Some("Stopping".to_string()))
    );
    assert!(matches!(
        handle.dispatch(stale, GuestAction::Start),
        Err(ClusterViewError::Busy { .. })
    ));
    engine.shutdown().expect("shutdown");
}

#[test]
fn completion_data_is_applied_before_pending_is_cleared() {
    let source = ScriptedSource::new();
    source
        .push_snapshot(Ok(snapshot(vec![guest("n1", 2, "db", "stopped")])))
        .push_invoke(Ok(None))
        .push_guest(Ok(guest("n1", 2, "db", "running")))
        .push_tasks(Ok(vec![Task {
            upid: Upid("UPID:n1:00001:qmstart:2".to_string()),
            profile: "p1".to_string(),
            node: "n1".to_string(),
            task_type: "qmstart".to_string(),
            status: "OK".to_string(),
            user: "root@pam".to_string(),
            vmid: Some(2),
            start_time: 1_700_000_000,
            end_time: Some(1_700_000_002),
        }]));
    let (engine, frames) = start(
        scripted(&source, Some(Arc::new(FixedWaiter(WaitOutcome::Observed)))),
        manual_settings(),
    );
    let handle = engine.handle();
    loaded(&frames);

    handle
        .dispatch(GuestKey::new("p1", "n1", 2), GuestAction::Start)
        .expect("dispatch");

    let first_running = wait_for_view(&frames, WAIT, |view| {
        view.guests.first().is_some_and(Guest::is_running)
    })
    .expect("running frame");
    assert_eq!(first_running.pending.len(), 1);

    let settled = wait_for_view(&frames, WAIT, |view| view.pending.is_empty()).expect("settled");
    assert!(settled.guests[0].is_running());
    assert_eq!(settled.tasks.len(), 1);
    assert_eq!(settled.tasks[0].task_type, "qmstart");
    let message = settled.message.expect("message");
    assert_eq!(message.level, MessageLevel::Info);
    assert!(message.text.contains("completed"));

    engine.shutdown().expect("shutdown");
}

#[test]
fn invoke_failure_clears_pending_and_surfaces_error() {
    let source = ScriptedSource::new();
    source
        .push_snapshot(Ok(snapshot(vec![guest("n1", 2, "db", "stopped")])))
        .push_invoke(Err(ClusterViewError::Operation("storage offline".to_string())));
    let (engine, frames) = start(scripted(&source, None), manual_settings());
    let handle = engine.handle();
    loaded(&frames);

    handle
        .dispatch(GuestKey::new("p1", "n1", 2), GuestAction::Start)
        .expect("dispatch");
    let view = wait_for_view(&frames, WAIT, |view| {
        view.pending.is_empty()
            && view
                .message
                .as_ref()
                .is_some_and(|m| m.level == MessageLevel::Error)
    })
    .expect("failure frame");
    assert!(view
        .message
        .expect("message")
        .text
        .contains("storage offline"));
    assert_eq!(view.guests[0].status, "stopped");

    engine.shutdown().expect("shutdown");
}

#[test]
fn timed_out_wait_forces_full_resync() {
    let source = ScriptedSource::new();
    source
        .push_snapshot(Ok(snapshot(vec![guest("n1", 7, "app", "running")])))
        .push_snapshot(Ok(snapshot(vec![guest("n1", 7, "app", "stopped")])))
        .push_invoke(Ok(None));
    let (engine, frames) = start(
        scripted(&source, Some(Arc::new(FixedWaiter(WaitOutcome::TimedOut)))),
        manual_settings(),
    );
    let handle = engine.handle();
    loaded(&frames);

    handle
        .dispatch(GuestKey::new("p1", "n1", 7), GuestAction::Shutdown)
        .expect("dispatch");
    let view = wait_for_view(&frames, WAIT, |view| {
        view.pending.is_empty() && view.message.as_ref().is_some_and(|m| m.level == MessageLevel::Warn)
    })
    .expect("timeout frame");
    assert_eq!(view.guests[0].status, "stopped");
    assert!(view.message.expect("message").text.contains("no confirmation"));
    assert_eq!(full_fetches(&source), 2);

    engine.shutdown().expect("shutdown");
}

#[test]
fn unknown_guest_dispatch_is_not_found() {
    let source = ScriptedSource::new();
    source.push_snapshot(Ok(snapshot(vec![guest("n1", 1, "web-1", "running")])));
    let (engine, frames) = start(scripted(&source, None), manual_settings());
    let handle = engine.handle();
    loaded(&frames);

    let err = handle
        .dispatch(GuestKey::new("p1", "n1", 404), GuestAction::Start)
        .expect_err("unknown");
    assert!(err.is_not_found());
    assert!(!source
        .calls()
        .iter()
        .any(|call| matches!(call, SourceCall::Invoke(..))));

    engine.shutdown().expect("shutdown");
}

#[test]
fn shutdown_clears_pending_and_rejects_new_requests() {
    let source = ScriptedSource::new();
    source
        .push_snapshot(Ok(snapshot(vec![guest("n1", 2, "db", "stopped")])))
        .push_invoke(Ok(None));
    let (waiter, _release) = GateWaiter::new();
    let (engine, frames) = start(
        scripted(&source, Some(Arc::new(waiter))),
        manual_settings(),
    );
    let handle = engine.handle();
    loaded(&frames);
    handle
        .dispatch(GuestKey::new("p1", "n1", 2), GuestAction::Start)
        .expect("dispatch");

    let report = engine.shutdown().expect("shutdown");
    assert_eq!(report.cleared_pending, 1);
    let last = frames.try_iter().last().expect("final frame");
    assert!(last.shutting_down);
    assert!(last.pending.is_empty());
    assert_eq!(handle.request_manual_refresh(), Err(ClusterViewError::Shutdown));
}

#[test]
fn auto_refresh_reloads_and_holds_while_an_operation_is_pending() {
    let source = ScriptedSource::new();
    source
        .push_snapshot(Ok(snapshot(vec![guest("n1", 2, "db", "stopped")])))
        .push_snapshot(Ok(snapshot(vec![guest("n1", 2, "db-renamed", "stopped")])))
        .push_invoke(Ok(None));
    let (waiter, release) = GateWaiter::new();
    let settings = EngineSettings {
        refresh_interval_secs: 1,
        auto_refresh: true,
        tick_period: Duration::from_millis(10),
        fetch_node_details: false,
        ..EngineSettings::default()
    };
    let (engine, frames) = start(scripted(&source, Some(Arc::new(waiter))), settings);
    let handle = engine.handle();

    wait_for_view(&frames, WAIT, |view| {
        view.guests.first().is_some_and(|g| g.name == "db-renamed")
    })
    .expect("auto refresh applied");
    assert!(handle.snapshot().expect("snapshot").refresh.enabled);

    handle
        .dispatch(GuestKey::new("p1", "n1", 2), GuestAction::Start)
        .expect("dispatch");
    // Let a fetch that started before the dispatch reach the source.
    std::thread::sleep(Duration::from_millis(50));
    let fetches = full_fetches(&source);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(full_fetches(&source), fetches);

    handle.stop_auto_refresh().expect("stop");
    assert!(!handle.snapshot().expect("snapshot").refresh.enabled);
    release.send(WaitOutcome::Cancelled).expect("release");
    engine.shutdown().expect("shutdown");
}

#[test]
fn zero_auto_refresh_interval_is_rejected() {
    let source = ScriptedSource::new();
    source.push_snapshot(Ok(snapshot(Vec::new())));
    let (engine, frames) = start(scripted(&source, None), manual_settings());
    let handle = engine.handle();
    loaded(&frames);
    assert!(matches!(
        handle.start_auto_refresh(0),
        Err(ClusterViewError::InvalidConfig(_))
    ));
    handle.start_auto_refresh(30).expect("start");
    let view = handle.snapshot().expect("snapshot");
    assert!(view.refresh.enabled);
    assert_eq!(view.refresh.interval, 30);
    engine.shutdown().expect("shutdown");
}

#[test]
fn refresh_guest_falls_back_to_full_snapshot_when_guest_is_gone() {
    let source = ScriptedSource::new();
    source
        .push_snapshot(Ok(snapshot(vec![guest("n1", 9, "moved", "running")])))
        .push_snapshot(Ok(snapshot(vec![guest("n2", 9, "moved", "running")])))
        .push_guest(Err(ClusterViewError::NotFound("guest p1/n1/9".to_string())));
    let (engine, frames) = start(scripted(&source, None), manual_settings());
    let handle = engine.handle();
    loaded(&frames);

    handle
        .refresh_guest(GuestKey::new("p1", "n1", 9))
        .expect("refresh guest");
    let view = wait_for_view(&frames, WAIT, |view| {
        view.guests.first().is_some_and(|g| g.node == "n2")
    })
    .expect("fallback applied");
    assert!(view
        .message
        .expect("message")
        .text
        .contains("refreshed all cluster data"));

    engine.shutdown().expect("shutdown");
}

#[test]
fn structured_filter_reports_active_criteria_and_clears() {
    let source = ScriptedSource::new();
    source.push_snapshot(Ok(snapshot(vec![
        guest("n1", 1, "web-1", "running"),
        guest("n1", 2, "db", "stopped"),
        guest("n2", 3, "web-2", "running"),
    ])));
    let (engine, frames) = start(scripted(&source, None), manual_settings());
    let handle = engine.handle();
    loaded(&frames);

    let count = handle
        .set_structured_filter(
            ViewKind::Guests,
            StructuredFilter {
                status: "running".to_string(),
                node: "n2".to_string(),
                ..StructuredFilter::default()
            },
        )
        .expect("filter");
    assert_eq!(count, 1);
    let view = handle.snapshot().expect("snapshot");
    assert_eq!(
        view.message.as_ref().expect("message").text,
        "Applied guest filters (2 active)"
    );
    assert_eq!(view.cursor(ViewKind::Guests), Cursor::Row(0));

    handle.clear_filter(ViewKind::Guests).expect("clear");
    match handle.filtered_view(ViewKind::Guests).expect("rows") {
        ViewRows::Guests(rows) => assert_eq!(rows.len(), 3),
        other => panic!("unexpected rows {other:?}"),
    }

    handle
        .set_text_filter(ViewKind::Guests, "nothing-matches")
        .expect("filter");
    assert_eq!(
        handle.snapshot().expect("snapshot").cursor(ViewKind::Guests),
        Cursor::Empty
    );
    engine.shutdown().expect("shutdown");
}

#[test]
fn shrinking_refresh_clamps_cursor_into_range() {
    let five = (1..=5)
        .map(|vmid| guest("n1", vmid, &format!("g{vmid}"), "running"))
        .collect::<Vec<_>>();
    let two = five[..2].to_vec();
    let source = ScriptedSource::new();
    source
        .push_snapshot(Ok(snapshot(five)))
        .push_snapshot(Ok(snapshot(two)));
    let (engine, frames) = start(scripted(&source, None), manual_settings());
    let handle = engine.handle();
    loaded(&frames);
    assert_eq!(
        handle.move_cursor(ViewKind::Guests, 4).expect("move"),
        Cursor::Row(4)
    );

    handle.request_manual_refresh().expect("refresh");
    let view = wait_for_view(&frames, WAIT, |view| view.guests.len() == 2).expect("shrunk");
    let row = view.cursor(ViewKind::Guests).index().expect("row");
    assert!(row <= 1);
    engine.shutdown().expect("shutdown");
}

#[test]
fn simulated_migration_moves_guest_and_keeps_it_focused() {
    let cluster = SimulatedCluster::demo("lab");
    let collaborators = Collaborators {
        source: Arc::new(cluster.clone()),
        invoker: Arc::new(cluster.clone()),
        sessions: Some(Arc::new(cluster.clone())),
        clock: Arc::new(FakeClock::default()),
        waiter: None,
    };
    let (engine, frames) = start(collaborators, manual_settings());
    let handle = engine.handle();
    let view = loaded(&frames);
    assert_eq!(view.focused_guest().map(|g| g.vmid), Some(100));

    handle
        .dispatch(
            GuestKey::new("lab", "pve1", 100),
            GuestAction::Migrate {
                target: "pve2".to_string(),
                online: true,
            },
        )
        .expect("dispatch");
    let view = wait_for_view(&frames, WAIT, |view| {
        view.pending.is_empty()
            && view
                .message
                .as_ref()
                .is_some_and(|m| m.text.contains("completed"))
    })
    .expect("migrated");
    let focused = view.focused_guest().expect("focused");
    assert_eq!((focused.vmid, focused.node.as_str()), (100, "pve2"));
    assert_eq!(view.totals.get(&ViewKind::Guests), Some(&6));
    assert!(cluster.guest(&GuestKey::new("lab", "pve2", 100)).is_some());

    engine.shutdown().expect("shutdown");
}

#[test]
fn console_session_count_reaches_the_view() {
    let cluster = SimulatedCluster::demo("lab");
    cluster.set_sessions(2);
    let collaborators = Collaborators {
        source: Arc::new(cluster.clone()),
        invoker: Arc::new(cluster.clone()),
        sessions: Some(Arc::new(cluster.clone())),
        clock: Arc::new(FakeClock::default()),
        waiter: None,
    };
    let settings = EngineSettings {
        console_poll: Duration::from_millis(10),
        ..manual_settings()
    };
    let (engine, frames) = start(collaborators, settings);
    wait_for_view(&frames, WAIT, |view| view.console_sessions == 2).expect("two sessions");
    cluster.set_sessions(0);
    wait_for_view(&frames, WAIT, |view| view.console_sessions == 0).expect("closed");
    engine.shutdown().expect("shutdown");
}

#[test]
fn node_details_enrich_online_nodes_after_first_load() {
    let source = ScriptedSource::new();
    let mut nodes = snapshot(vec![guest("n1", 1, "web-1", "running")]);
    nodes.nodes.push(Node::new("p1", "n9", false));
    source.push_snapshot(Ok(nodes)).push_details(Ok(NodeDetails {
        version: Some("pve-manager/8.2.4".to_string()),
        kernel_version: Some("6.8.12-1-pve".to_string()),
        ..NodeDetails::default()
    }));
    let settings = EngineSettings {
        fetch_node_details: true,
        ..manual_settings()
    };
    let (engine, frames) = start(scripted(&source, None), settings);
    let handle = engine.handle();

    let view = wait_for_view(&frames, WAIT, |view| {
        view.nodes
            .iter()
            .filter(|node| node.online)
            .all(|node| node.details.version.is_some())
            && view.loaded
    })
    .expect("details applied");
    let offline = view.nodes.iter().find(|node| node.name == "n9").expect("n9");
    assert!(offline.details.is_empty());
    let detail_calls = source
        .calls()
        .iter()
        .filter(|call| matches!(call, SourceCall::NodeDetails(_)))
        .count();
    assert_eq!(detail_calls, 2);

    handle.set_active_view(ViewKind::Nodes).expect("view");
    let view = handle.snapshot().expect("snapshot");
    let focused = view.focused_node().expect("focused node");
    assert_eq!(focused.name, "n1");
    assert_eq!(focused.details.kernel_version.as_deref(), Some("6.8.12-1-pve"));

    engine.shutdown().expect("shutdown");
}

#[test]
fn fetch_still_running_at_shutdown_is_never_applied() {
    let inner = ScriptedSource::new();
    inner.push_snapshot(Ok(snapshot(vec![guest("n1", 1, "web-1", "running")])));
    let (open, gate) = mpsc::channel();
    let collaborators = Collaborators {
        source: Arc::new(GatedSource {
            inner: inner.clone(),
            gate: Mutex::new(gate),
        }),
        invoker: Arc::new(inner.clone()),
        sessions: None,
        clock: Arc::new(FakeClock::default()),
        waiter: None,
    };
    let (engine, frames) = start(collaborators, manual_settings());
    let handle = engine.handle();
    let booting = wait_for_view(&frames, WAIT, |view| {
        view.refresh.phase == RefreshPhase::Fetching
    })
    .expect("boot fetch in flight");
    assert!(!booting.loaded);

    engine.shutdown().expect("shutdown");
    open.send(()).expect("release fetch");
    let deadline = std::time::Instant::now() + WAIT;
    while full_fetches(&inner) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(full_fetches(&inner), 1);
    std::thread::sleep(Duration::from_millis(50));

    let after = frames.try_iter().collect::<Vec<_>>();
    assert!(after.last().is_some_and(|view| view.shutting_down));
    assert!(after
        .iter()
        .all(|view| !view.loaded && view.revision == booting.revision));
    assert_eq!(handle.snapshot().err(), Some(ClusterViewError::Shutdown));
}
