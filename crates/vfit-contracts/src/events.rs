use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for the session's `events.jsonl`.
///
/// Every line is one compact JSON object with default fields `event`,
/// `run_id` and `ts`; the caller payload is merged last and may
/// override them. Appends are serialized through a mutex so clones of
/// the writer can emit from helper threads.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn append(&self, event: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut row = Map::new();
        row.insert("event".to_string(), Value::String(event.to_string()));
        row.insert("run_id".to_string(), Value::String(self.inner.run_id.clone()));
        row.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            row.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&row)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(row))
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::Value;

    use super::{EventLog, EventPayload};

    #[test]
    fn append_writes_one_compact_line_per_event() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "fit-42");

        let mut payload = EventPayload::new();
        payload.insert("garments".to_string(), Value::Number(3.into()));
        log.append("run_started", payload)?;
        log.append("run_finished", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        assert_eq!(first["event"], Value::String("run_started".to_string()));
        assert_eq!(first["run_id"], Value::String("fit-42".to_string()));
        assert_eq!(first["garments"], Value::Number(3.into()));
        DateTime::parse_from_rfc3339(first["ts"].as_str().unwrap_or(""))?;

        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(second["event"], Value::String("run_finished".to_string()));
        Ok(())
    }

    #[test]
    fn payload_can_override_default_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = EventLog::new(temp.path().join("events.jsonl"), "fit-42");

        let mut payload = EventPayload::new();
        payload.insert("run_id".to_string(), Value::String("other".to_string()));
        let row = log.append("item_queued", payload)?;
        assert_eq!(row["run_id"], Value::String("other".to_string()));
        Ok(())
    }
}
