use crate::errors::ClusterViewError;
use crate::logging::append_run_log;
use crate::runtime::CancelToken;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_INTERVAL_SECS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    Idle,
    Waiting,
    Fetching,
    Applying,
}

impl RefreshPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Fetching => "fetching",
            Self::Applying => "applying",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrigin {
    Auto,
    Manual,
    Fallback,
}

impl FetchOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Disabled,
    /// A fetch is in flight; the countdown holds.
    Paused,
    Counting(u32),
    /// Countdown expired while an operation was busy; reset without fetching.
    Skipped,
    Start(u64),
}

/// Monotonic fetch sequence shared with workers so that a snapshot can be
/// ordered by when its fetch began.
#[derive(Debug, Clone, Default)]
pub struct FetchSequence(Arc<AtomicU64>);

impl FetchSequence {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Debug, Clone)]
pub struct RefreshScheduler {
    interval: u32,
    remaining: u32,
    enabled: bool,
    phase: RefreshPhase,
    in_flight: Option<(u64, FetchOrigin)>,
    last_error: Option<String>,
    sequence: FetchSequence,
}

impl RefreshScheduler {
    pub fn new(interval: u32, sequence: FetchSequence) -> Self {
        Self {
            interval,
            remaining: interval,
            enabled: false,
            phase: RefreshPhase::Idle,
            in_flight: None,
            last_error: None,
            sequence,
        }
    }

    pub fn start(&mut self, interval: u32) -> Result<(), ClusterViewError> {
        if interval == 0 {
            return Err(ClusterViewError::InvalidConfig(
                "refresh interval must be at least one second".to_string(),
            ));
        }
        self.interval = interval;
        self.remaining = interval;
        self.enabled = true;
        if self.phase == RefreshPhase::Idle {
            self.phase = RefreshPhase::Waiting;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.enabled = false;
        if self.phase == RefreshPhase::Waiting {
            self.phase = RefreshPhase::Idle;
        }
    }

    pub fn tick(&mut self, busy: bool) -> TickOutcome {
        if !self.enabled {
            return TickOutcome::Disabled;
        }
        if self.in_flight.is_some() {
            return TickOutcome::Paused;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining > 0 {
            return TickOutcome::Counting(self.remaining);
        }
        if busy {
            self.remaining = self.interval;
            return TickOutcome::Skipped;
        }
        TickOutcome::Start(self.launch(FetchOrigin::Auto))
    }

    /// Starts a fetch outside the countdown. Rejected while one is in flight.
    pub fn begin_fetch(&mut self, origin: FetchOrigin) -> Result<u64, ClusterViewError> {
        if self.in_flight.is_some() {
            return Err(ClusterViewError::Busy {
                target: "cluster".to_string(),
                label: "Refreshing".to_string(),
            });
        }
        Ok(self.launch(origin))
    }

    fn launch(&mut self, origin: FetchOrigin) -> u64 {
        let seq = self.sequence.next();
        self.in_flight = Some((seq, origin));
        self.phase = RefreshPhase::Fetching;
        self.remaining = self.interval;
        seq
    }

    /// Claims the result of fetch `seq`. Returns `None` for a result this
    /// scheduler did not launch or has already settled.
    pub fn enter_applying(&mut self, seq: u64) -> Option<FetchOrigin> {
        match self.in_flight {
            Some((current, origin)) if current == seq => {
                self.phase = RefreshPhase::Applying;
                Some(origin)
            }
            _ => None,
        }
    }

    pub fn finish(&mut self, seq: u64, error: Option<String>) {
        if self.in_flight.map(|(current, _)| current) != Some(seq) {
            return;
        }
        self.in_flight = None;
        self.last_error = error;
        self.remaining = self.interval;
        self.phase = if self.enabled {
            RefreshPhase::Waiting
        } else {
            RefreshPhase::Idle
        };
    }

    /// A full snapshot arrived by another route (operation resync).
    pub fn note_external_refresh(&mut self) {
        self.remaining = self.interval;
        self.last_error = None;
    }

    pub fn phase(&self) -> RefreshPhase {
        self.phase
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn sequence(&self) -> FetchSequence {
        self.sequence.clone()
    }
}

/// Calls `on_tick` every `period` until cancelled or `on_tick` returns
/// `false`.
pub fn spawn_ticker<F>(
    ticker_id: u64,
    period: Duration,
    cancel: CancelToken,
    mut on_tick: F,
) -> thread::JoinHandle<()>
where
    F: FnMut(u64) -> bool + Send + 'static,
{
    thread::spawn(move || {
        append_run_log(
            "debug",
            "refresh.ticker.started",
            json!({ "ticker_id": ticker_id, "period_ms": period.as_millis() as u64 }),
        );
        loop {
            if cancel.wait_timeout(period) {
                break;
            }
            if !on_tick(ticker_id) {
                break;
            }
        }
        append_run_log(
            "debug",
            "refresh.ticker.stopped",
            json!({ "ticker_id": ticker_id }),
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn scheduler(interval: u32) -> RefreshScheduler {
        let mut scheduler = RefreshScheduler::new(interval, FetchSequence::default());
        scheduler.start(interval).expect("start");
        scheduler
    }

    #[test]
    fn countdown_starts_fetch_at_zero_and_resets() {
        let mut s = scheduler(3);
        assert_eq!(s.tick(false), TickOutcome::Counting(2));
        assert_eq!(s.tick(false), TickOutcome::Counting(1));
        assert_eq!(s.tick(false), TickOutcome::Start(1));
        assert_eq!(s.phase(), RefreshPhase::Fetching);
        assert_eq!(s.remaining(), 3);
    }

    #[test]
    fn countdown_holds_while_fetching() {
        let mut s = scheduler(3);
        let seq = s.begin_fetch(FetchOrigin::Manual).expect("begin");
        assert_eq!(s.tick(false), TickOutcome::Paused);
        assert_eq!(s.tick(false), TickOutcome::Paused);
        assert_eq!(s.remaining(), 3);
        assert!(s.begin_fetch(FetchOrigin::Manual).is_err());

        assert_eq!(s.enter_applying(seq), Some(FetchOrigin::Manual));
        s.finish(seq, None);
        assert_eq!(s.phase(), RefreshPhase::Waiting);
        assert_eq!(s.tick(false), TickOutcome::Counting(2));
    }

    #[test]
    fn busy_operations_skip_the_fetch_and_reset() {
        let mut s = scheduler(2);
        assert_eq!(s.tick(true), TickOutcome::Counting(1));
        assert_eq!(s.tick(true), TickOutcome::Skipped);
        assert_eq!(s.remaining(), 2);
        assert_eq!(s.phase(), RefreshPhase::Waiting);
    }

    #[test]
    fn failure_returns_to_waiting_with_error() {
        let mut s = scheduler(2);
        let seq = s.begin_fetch(FetchOrigin::Auto).expect("begin");
        assert_eq!(s.enter_applying(seq + 1), None);
        s.finish(seq, Some("transport error: boom".to_string()));
        assert_eq!(s.phase(), RefreshPhase::Waiting);
        assert_eq!(s.last_error(), Some("transport error: boom"));
    }

    #[test]
    fn stop_disables_ticks_and_zero_interval_is_rejected() {
        let mut s = scheduler(2);
        s.stop();
        assert_eq!(s.tick(false), TickOutcome::Disabled);
        assert_eq!(s.phase(), RefreshPhase::Idle);
        assert!(s.start(0).is_err());
    }

    #[test]
    fn ticker_stops_when_cancelled() {
        let cancel = CancelToken::new();
        let (tx, rx) = mpsc::channel();
        let handle = spawn_ticker(7, Duration::from_millis(5), cancel.clone(), move |id| {
            tx.send(id).is_ok()
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("tick"), 7);
        cancel.cancel();
        handle.join().expect("join");
    }
}
