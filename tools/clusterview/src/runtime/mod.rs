use crate::errors::ClusterViewError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, SystemTime};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ClusterViewError>;

    fn sleep_for(&self, duration: Duration) -> Result<(), ClusterViewError> {
        self.sleep_until(self.now() + duration)
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, ClusterViewError>;
}

pub trait Terminal: Send + Sync {
    fn stdin_is_tty(&self) -> bool;
    fn write_line(&self, line: &str) -> Result<(), ClusterViewError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ClusterViewError> {
        if let Ok(duration) = deadline.duration_since(SystemTime::now()) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ClusterViewError> {
        std::fs::read_to_string(path).map_err(|e| ClusterViewError::Io(e.to_string()))
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn stdin_is_tty(&self) -> bool {
        std::io::IsTerminal::is_terminal(&std::io::stdin())
    }

    fn write_line(&self, line: &str) -> Result<(), ClusterViewError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| ClusterViewError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    wake: Condvar,
    children: Mutex<Vec<Weak<CancelInner>>>,
}

impl CancelInner {
    fn cancel(&self) {
        if let Ok(mut flag) = self.cancelled.lock() {
            *flag = true;
        }
        self.wake.notify_all();
        let children = match self.children.lock() {
            Ok(mut children) => std::mem::take(&mut *children),
            Err(_) => Vec::new(),
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.lock().map(|flag| *flag).unwrap_or(true)
    }
}

/// Process-wide shutdown signal. Cancelling a token cancels every child
/// derived from it; cancelling a child leaves the parent running.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        let child = Self::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }
        if let Ok(mut children) = self.inner.children.lock() {
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Sleeps up to `timeout`. Returns `true` when woken by cancellation.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Ok(guard) = self.inner.cancelled.lock() else {
            return true;
        };
        match self
            .inner
            .wake
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
        {
            Ok((guard, _)) => *guard,
            Err(_) => true,
        }
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ClusterViewError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        let mut now = self.now.lock().expect("clock lock");
        if deadline > *now {
            *now = deadline;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.insert(path, contents);
        fs
    }

    pub fn insert(&self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        self.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ClusterViewError> {
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| ClusterViewError::Io(format!("missing file {}", path.display())))
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    pub is_tty: bool,
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn new(is_tty: bool) -> Self {
        Self {
            is_tty,
            ..Self::default()
        }
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn stdin_is_tty(&self) -> bool {
        self.is_tty
    }

    fn write_line(&self, line: &str) -> Result<(), ClusterViewError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }
}
