//! Game server hosting backend.
//!
//! Supervises long-running server processes, relays console commands,
//! captures their output and manages per-instance workspaces and backups.

pub mod api;
pub mod backup;
pub mod command;
pub mod config;
pub mod console;
pub mod instance;
pub mod placeholder;
pub mod process;
pub mod status;
pub mod supervisor;

pub use instance::{InstanceRegistry, ServerInstance};

pub const APP_NAME: &str = "hoster";
