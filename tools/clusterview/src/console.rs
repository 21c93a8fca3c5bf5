use crate::logging::append_run_log;
use crate::runtime::CancelToken;
use crate::source::ConsoleSessions;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Polls the remote-console session count and reports changes only.
/// Exits when `cancel` fires or `on_change` returns `false`.
pub fn spawn_session_monitor<F>(
    sessions: Arc<dyn ConsoleSessions>,
    poll_interval: Duration,
    cancel: CancelToken,
    mut on_change: F,
) -> thread::JoinHandle<()>
where
    F: FnMut(usize) -> bool + Send + 'static,
{
    thread::spawn(move || {
        let mut last = None;
        while !cancel.is_cancelled() {
            let count = sessions.active_sessions();
            if last != Some(count) {
                append_run_log(
                    "debug",
                    "console.sessions.changed",
                    json!({ "previous": last, "active": count }),
                );
                last = Some(count);
                if !on_change(count) {
                    break;
                }
            }
            if cancel.wait_timeout(poll_interval) {
                break;
            }
        }
    })
}

pub fn quit_warning(active_sessions: usize) -> Option<String> {
    match active_sessions {
        0 => None,
        1 => Some("1 console session is still active. Press q again to quit.".to_string()),
        n => Some(format!(
            "{n} console sessions are still active. Press q again to quit."
        )),
    }
}
