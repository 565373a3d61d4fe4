//! Persistence layer: node and sample storage on SQLite.

mod models;
mod store;

pub use models::*;
pub use store::*;
