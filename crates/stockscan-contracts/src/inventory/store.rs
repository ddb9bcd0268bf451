use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use super::item::{InventoryItem, NewInventoryItem};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("inventory item '{0}' already exists")]
    AlreadyExists(String),
    #[error("inventory item '{0}' not found")]
    NotFound(String),
    #[error("custom identifier must not be empty")]
    EmptyIdentifier,
    #[error("item name must not be empty")]
    EmptyName,
    #[error("an item named '{0}' already exists")]
    DuplicateName(String),
    #[error("field '{0}' cannot be updated")]
    ReadOnlyField(String),
    #[error("field '{0}' must be a string")]
    NotAString(String),
    #[error("inventory store lock poisoned")]
    Poisoned,
    #[error("inventory store I/O error ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("inventory store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Document-store boundary: per-document add/get/update/delete, no transactions.
pub trait InventoryStore: Send + Sync {
    /// Adds a record under a store-generated identifier.
    fn add(&self, item: NewInventoryItem) -> Result<InventoryItem, StoreError>;

    /// Adds a record under a caller-chosen identifier, refusing to overwrite.
    fn add_with_id(&self, id: &str, item: NewInventoryItem)
        -> Result<InventoryItem, StoreError>;

    /// All records, most recent timestamp first.
    fn get_all(&self) -> Result<Vec<InventoryItem>, StoreError>;

    fn get(&self, id: &str) -> Result<Option<InventoryItem>, StoreError>;

    /// Merges `fields` into the record. A new `name` goes through the same checks as
    /// registration.
    fn update(&self, id: &str, fields: Map<String, Value>) -> Result<InventoryItem, StoreError>;

    /// Returns whether a record was removed; deleting a missing id is not an error.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;
}

/// Adds an item after the registration checks the UI applies: trimmed, non-empty,
/// and not already present by name.
pub fn register_item(
    store: &dyn InventoryStore,
    mut item: NewInventoryItem,
    custom_id: Option<&str>,
) -> Result<InventoryItem, StoreError> {
    let name = item.name.trim().to_string();
    if name.is_empty() {
        return Err(StoreError::EmptyName);
    }
    if store.get_all()?.iter().any(|existing| existing.name == name) {
        return Err(StoreError::DuplicateName(name));
    }
    item.name = name;
    match custom_id {
        Some(id) => store.add_with_id(id, item),
        None => store.add(item),
    }
}

/// Inventory collection persisted as one JSON object keyed by identifier.
///
/// Every operation re-reads the file so separate processes sharing a path see each
/// other's writes; the mutex only serialises writers inside this process.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Opens the store, failing when an existing file is not a JSON object of records.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            path: path.into(),
            lock: Mutex::new(()),
        };
        let records = store.load()?;
        info!(path = %store.path.display(), records = records.len(), "inventory store opened");
        Ok(store)
    }

    fn load(&self) -> Result<Map<String, Value>, StoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }
        let parsed: Map<String, Value> = serde_json::from_str(&raw)?;
        for value in parsed.values() {
            serde_json::from_value::<InventoryItem>(value.clone())?;
        }
        Ok(parsed)
    }

    fn save(&self, records: &Map<String, Value>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let body = serde_json::to_string_pretty(&Value::Object(records.clone()))?;
        std::fs::write(&self.path, body).map_err(io_err)
    }

    fn insert(&self, id: &str, item: NewInventoryItem) -> Result<InventoryItem, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut records = self.load()?;
        if records.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let stored = item.into_item(id);
        records.insert(id.to_string(), serde_json::to_value(&stored)?);
        self.save(&records)?;
        info!(id, name = %stored.name, "inventory item added");
        Ok(stored)
    }
}

impl InventoryStore for JsonFileStore {
    fn add(&self, item: NewInventoryItem) -> Result<InventoryItem, StoreError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.insert(&id, item)
    }

    fn add_with_id(
        &self,
        id: &str,
        item: NewInventoryItem,
    ) -> Result<InventoryItem, StoreError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(StoreError::EmptyIdentifier);
        }
        self.insert(id, item)
    }

    fn get_all(&self) -> Result<Vec<InventoryItem>, StoreError> {
        let records = self.load()?;
        let mut items = Vec::with_capacity(records.len());
        for (id, value) in records {
            let mut item: InventoryItem = serde_json::from_value(value)?;
            item.id = id;
            items.push(item);
        }
        items.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
        Ok(items)
    }

    fn get(&self, id: &str) -> Result<Option<InventoryItem>, StoreError> {
        let records = self.load()?;
        let Some(value) = records.get(id) else {
            return Ok(None);
        };
        let mut item: InventoryItem = serde_json::from_value(value.clone())?;
        item.id = id.to_string();
        Ok(Some(item))
    }

    fn update(&self, id: &str, fields: Map<String, Value>) -> Result<InventoryItem, StoreError> {
        if fields.contains_key("id") {
            return Err(StoreError::ReadOnlyField("id".to_string()));
        }
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut records = self.load()?;
        let Some(Value::Object(current)) = records.get(id).cloned() else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let mut fields = fields;
        if let Some(raw) = fields.get("name") {
            let name = checked_rename(&records, id, raw)?;
            fields.insert("name".to_string(), Value::String(name));
        }
        let mut merged = current;
        for (key, value) in fields {
            merged.insert(key, value);
        }
        let mut updated: InventoryItem = serde_json::from_value(Value::Object(merged))?;
        updated.id = id.to_string();
        records.insert(id.to_string(), serde_json::to_value(&updated)?);
        self.save(&records)?;
        info!(id, "inventory item updated");
        Ok(updated)
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut records = self.load()?;
        if records.remove(id).is_none() {
            debug!(id, "delete of missing inventory item ignored");
            return Ok(false);
        }
        self.save(&records)?;
        info!(id, "inventory item deleted");
        Ok(true)
    }
}

/// Trimmed replacement name for `id`, refused when blank or held by another record.
fn checked_rename(
    records: &Map<String, Value>,
    id: &str,
    raw: &Value,
) -> Result<String, StoreError> {
    let name = raw
        .as_str()
        .ok_or_else(|| StoreError::NotAString("name".to_string()))?
        .trim()
        .to_string();
    if name.is_empty() {
        return Err(StoreError::EmptyName);
    }
    let taken = records.iter().any(|(other_id, value)| {
        other_id != id && value.get("name").and_then(Value::as_str) == Some(name.as_str())
    });
    if taken {
        return Err(StoreError::DuplicateName(name));
    }
    Ok(name)
}
