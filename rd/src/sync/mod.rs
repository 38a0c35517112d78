//! Base-branch / working-branch synchronization

mod controller;

pub use controller::{SyncController, SyncKind, SyncResult, SyncStatus};
