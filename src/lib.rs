//! Reckon — contact identity reconciliation service.
//!
//! Consolidates (email, phone) observations submitted over time into
//! canonical identity groups backed by SQLite. The flow per request:
//! query layer reads candidate matches, the reconciliation engine
//! decides (reuse, merge, or create), and the view assembler projects
//! the resulting group into the consolidated wire shape.

pub mod api;
pub mod db;
pub mod engine;
pub mod errors;
pub mod models;
pub mod server;
pub mod view;

pub use db::{ContactDb, DbHandle};
pub use errors::ReconcileError;
pub use models::{ConsolidatedContact, Contact, LinkPrecedence};
