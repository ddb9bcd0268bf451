pub mod attributes;
pub mod detection;
pub mod inventory;
pub mod journal;
pub mod matching;
pub mod models;
