//! Types shared by every component of the engine.

pub mod category;
pub mod protected_item;

pub use category::BackupCategory;
pub use protected_item::{validate_items, ItemKind, ProtectedItem};
