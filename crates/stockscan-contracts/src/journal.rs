use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::warn;

pub type ActivityPayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    ItemAdded,
    ItemUpdated,
    ItemDeleted,
    AttributesExtracted,
    Identified,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ItemAdded => "item_added",
            Self::ItemUpdated => "item_updated",
            Self::ItemDeleted => "item_deleted",
            Self::AttributesExtracted => "attributes_extracted",
            Self::Identified => "identified",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "item_added" => Some(Self::ItemAdded),
            "item_updated" => Some(Self::ItemUpdated),
            "item_deleted" => Some(Self::ItemDeleted),
            "attributes_extracted" => Some(Self::AttributesExtracted),
            "identified" => Some(Self::Identified),
            _ => None,
        }
    }

    /// Key of the payload field naming the inventory item the entry concerns.
    fn item_key(&self) -> Option<&'static str> {
        match self {
            Self::ItemAdded | Self::ItemUpdated | Self::ItemDeleted => Some("id"),
            Self::Identified => Some("item_id"),
            Self::AttributesExtracted => None,
        }
    }
}

/// Append-only JSONL record of store mutations and analysis outcomes.
///
/// Each line carries `event`, `session_id` and `ts`; those keys are written last so a
/// payload cannot overwrite them. Clones share one file lock.
#[derive(Debug, Clone)]
pub struct ActivityJournal {
    inner: Arc<JournalInner>,
}

#[derive(Debug)]
struct JournalInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl ActivityJournal {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(JournalInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn record(&self, kind: ActivityKind, payload: ActivityPayload) -> anyhow::Result<Value> {
        let mut entry = payload;
        entry.insert("event".to_string(), Value::String(kind.as_str().to_string()));
        entry.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        entry.insert("ts".to_string(), Value::String(now_iso()));

        if let Some(parent) = self.inner.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let line = serde_json::to_string(&entry)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("activity journal lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(entry))
    }

    /// Every entry with a known event name, oldest first. A missing file reads as empty;
    /// lines that do not parse are skipped with a warning.
    pub fn read_entries(&self) -> anyhow::Result<Vec<Value>> {
        let content = match std::fs::read_to_string(&self.inner.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(entry) if entry_kind(&entry).is_some() => entries.push(entry),
                Ok(_) => warn!(line = index + 1, "journal entry without a known event skipped"),
                Err(err) => {
                    warn!(line = index + 1, error = %err, "unreadable journal line skipped")
                }
            }
        }
        Ok(entries)
    }

    /// Lifecycle of one inventory item across sessions: its additions, updates and
    /// deletion, plus every identification linked to it.
    pub fn item_history(&self, id: &str) -> anyhow::Result<Vec<Value>> {
        Ok(self
            .read_entries()?
            .into_iter()
            .filter(|entry| {
                entry_kind(entry)
                    .and_then(|kind| kind.item_key())
                    .and_then(|key| entry.get(key))
                    .and_then(Value::as_str)
                    == Some(id)
            })
            .collect())
    }
}

fn entry_kind(entry: &Value) -> Option<ActivityKind> {
    entry
        .get("event")
        .and_then(Value::as_str)
        .and_then(ActivityKind::from_name)
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
