use crate::errors::ClusterViewError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

static RUN_LOG: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();

fn run_log_slot() -> &'static Mutex<Option<JsonlLogger>> {
    RUN_LOG.get_or_init(|| Mutex::new(None))
}

/// Installs the process-wide run log. Later calls replace the target file.
pub fn init_run_log(logger: JsonlLogger) {
    if let Ok(mut slot) = run_log_slot().lock() {
        *slot = Some(logger);
    }
}

/// Appends one event to the run log. A no-op until `init_run_log` is called;
/// write failures are swallowed so logging never takes down a worker.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let logger = match run_log_slot().lock() {
        Ok(slot) => slot.clone(),
        Err(_) => None,
    };
    if let Some(logger) = logger {
        let _ = logger.append(&LogEvent {
            level,
            event_type,
            payload,
        });
    }
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), ClusterViewError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ClusterViewError::Io(e.to_string()))?;
            }
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| ClusterViewError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ClusterViewError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| ClusterViewError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| ClusterViewError::Io(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = prune_to_budget(parent, &self.path, self.budget_bytes)?;
            }
        }

        Ok(())
    }
}

/// Deletes the oldest rotated copies of `active` until they fit in
/// `budget_bytes` together with it. Only files named like the active log
/// (`run.jsonl`, `run.1.jsonl`, `run-20260101.jsonl`) are considered; the
/// active file itself is never removed.
pub fn prune_to_budget(
    dir: &Path,
    active: &Path,
    budget_bytes: u64,
) -> Result<Vec<PathBuf>, ClusterViewError> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| ClusterViewError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| is_rotated_sibling(active, &entry.path()))
        .filter_map(|entry| {
            let path = entry.path();
            let meta = entry.metadata().ok()?;
            meta.is_file()
                .then(|| (path, meta.len(), meta.modified().ok()))
        })
        .collect::<Vec<_>>();

    let mut total = entries.iter().map(|(_, len, _)| *len).sum::<u64>();
    if total <= budget_bytes {
        return Ok(Vec::new());
    }

    entries.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

    let mut deleted = Vec::new();
    for (path, len, _) in entries {
        if total <= budget_bytes {
            break;
        }
        if path == active {
            continue;
        }
        fs::remove_file(&path).map_err(|e| ClusterViewError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }
    Ok(deleted)
}

fn is_rotated_sibling(active: &Path, candidate: &Path) -> bool {
    if candidate == active {
        return true;
    }
    let (Some(stem), Some(name)) = (
        active.file_stem().and_then(|stem| stem.to_str()),
        candidate.file_name().and_then(|name| name.to_str()),
    ) else {
        return false;
    };
    let extension = active.extension().and_then(|ext| ext.to_str());
    if candidate.extension().and_then(|ext| ext.to_str()) != extension {
        return false;
    }
    name.strip_prefix(stem)
        .and_then(|rest| rest.chars().next())
        .is_some_and(|sep| matches!(sep, '.' | '-' | '_'))
}

pub fn structured_fallback_line(view: &str, state: &str, message: &str) -> String {
    format!(
        "view={view} state={state} message={} ",
        message.replace('\n', "\\n")
    )
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

#[cfg(test)]
mod tests {
    use super::{prune_to_budget, structured_fallback_line, JsonlLogger, LogEvent};
    use serde_json::json;
    use std::fs;

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;
        logger.budget_bytes = 1024;

        logger
            .append(&LogEvent {
                level: "info",
                event_type: "engine.snapshot.applied",
                payload: json!({"guests": "abcdefghijklmnopqrstuvwxyz"}),
            })
            .expect("append");

        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"event_type\":\"engine.snapshot.applied\""));
        assert!(text.contains("..."));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn prune_keeps_active_file_and_drops_oldest_siblings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = dir.path().join("run.1.jsonl");
        let active = dir.path().join("run.jsonl");
        fs::write(&old, vec![b'x'; 40]).expect("old");
        std::thread::sleep(std::time::Duration::from_millis(5));
        fs::write(&active, vec![b'y'; 40]).expect("active");

        let deleted = prune_to_budget(dir.path(), &active, 50).expect("prune");
        assert_eq!(deleted, vec![old]);
        assert!(active.exists());

        let none = prune_to_budget(dir.path(), &active, 10).expect("prune again");
        assert!(none.is_empty());
    }

    #[test]
    fn append_never_prunes_files_it_did_not_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let thesis = dir.path().join("thesis.docx");
        let notes = dir.path().join("run-notes.txt");
        let runner = dir.path().join("runner.jsonl");
        fs::write(&thesis, vec![b'd'; 4096]).expect("thesis");
        fs::write(&notes, vec![b'n'; 4096]).expect("notes");
        fs::write(&runner, vec![b'r'; 4096]).expect("runner");
        let rotated = dir.path().join("run.0.jsonl");
        fs::write(&rotated, vec![b'x'; 4096]).expect("rotated");

        let mut logger = JsonlLogger::new(dir.path().join("run.jsonl"));
        logger.budget_bytes = 1024;
        logger
            .append(&LogEvent {
                level: "info",
                event_type: "run.started",
                payload: json!({}),
            })
            .expect("append");

        assert!(thesis.exists());
        assert!(notes.exists());
        assert!(runner.exists());
        assert!(!rotated.exists());
        assert!(logger.path.exists());
    }

    #[test]
    fn fallback_line_escapes_newlines() {
        let line = structured_fallback_line("guests", "running", "web-01\nnode=n2");
        assert_eq!(line, "view=guests state=running message=web-01\\nnode=n2 ");
    }
}
