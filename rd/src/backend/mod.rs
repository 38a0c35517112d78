//! Per-workspace backend pool and model validation

mod manager;

pub use manager::{BackendError, BackendManager, DEFAULT_CONNECT_TIMEOUT, DirectoryValidation};
