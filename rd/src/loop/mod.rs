//! Loop engine and manager

mod detect;
mod engine;
mod error;
mod locks;
mod manager;

pub use detect::MarkerScanner;
pub use engine::{EngineCommand, EngineHandle, LoopEngine};
pub use error::LoopError;
pub use locks::LoopLocks;
pub use manager::{CreateLoopOptions, LoopManager, LoopManagerConfig, PendingOptions, UpdateLoopOptions};

pub(crate) use engine::{DriveEnd, drive_session_iteration};
