use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type EventPayload = Map<String, Value>;

/// Append-only writer for `batch-log.jsonl`.
///
/// Default fields are `type`, `batch_id`, `ts`; the caller payload is merged
/// last and can override them. One compact JSON object per line.
#[derive(Debug, Clone)]
pub struct BatchLog {
    inner: Arc<BatchLogInner>,
}

#[derive(Debug)]
struct BatchLogInner {
    path: PathBuf,
    batch_id: String,
    lock: Mutex<()>,
}

impl BatchLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_batch_id(path, Uuid::new_v4().to_string())
    }

    pub fn with_batch_id(path: impl Into<PathBuf>, batch_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BatchLogInner {
                path: path.into(),
                batch_id: batch_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn batch_id(&self) -> &str {
        &self.inner.batch_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "batch_id".to_string(),
            Value::String(self.inner.batch_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("batch log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
