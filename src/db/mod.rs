//! Database module for craftwatch.
//!
//! Provides SQLite storage for samples and player records.

mod models;
mod store;

pub use models::*;
pub use store::*;
