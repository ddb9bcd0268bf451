use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A persisted inventory record.
///
/// Stored documents are flat string-keyed maps; keys other than the ones modelled
/// here survive a load/save cycle through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub analysis: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewInventoryItem {
    pub name: String,
    pub analysis: String,
    pub quantity: Option<u64>,
    pub extra: Map<String, Value>,
}

impl NewInventoryItem {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_analysis(mut self, analysis: impl Into<String>) -> Self {
        self.analysis = analysis.into();
        self
    }

    pub fn with_quantity(mut self, quantity: Option<u64>) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn into_item(self, id: impl Into<String>) -> InventoryItem {
        InventoryItem {
            id: id.into(),
            name: self.name,
            analysis: self.analysis,
            timestamp: now_iso(),
            quantity: self.quantity,
            extra: self.extra,
        }
    }
}

/// Case-insensitive substring search over item names, preserving input order.
pub fn search_items<'a>(items: &'a [InventoryItem], query: &str) -> Vec<&'a InventoryItem> {
    let needle = query.trim().to_lowercase();
    items
        .iter()
        .filter(|item| needle.is_empty() || item.name.to_lowercase().contains(&needle))
        .collect()
}

pub fn item_names(items: &[InventoryItem]) -> Vec<String> {
    items.iter().map(|item| item.name.clone()).collect()
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
