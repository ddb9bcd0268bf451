mod item;
mod store;

pub use item::{item_names, search_items, InventoryItem, NewInventoryItem};
pub use store::{register_item, InventoryStore, JsonFileStore, StoreError};
