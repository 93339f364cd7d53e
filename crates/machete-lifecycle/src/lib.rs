//! Tool lifecycle management for the machete platform.
//!
//! A tool is a git repository carrying a container build file and an optional
//! `machete.yml` manifest. [`LifecycleController`] takes it from a source URL to a
//! running container and back, persisting a [`Tool`] record after every step.

pub mod build;
pub mod config;
pub mod controller;
pub mod descriptor;
pub mod error;
pub mod fetch;
mod hashing;
pub mod ids;
pub mod locks;
pub mod logs;
pub mod manifest;
mod process;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod state;
pub mod validate;

pub use config::LifecycleConfig;
pub use controller::{
    Diagnostics, HealthReport, InstallRequest, LifecycleController, OperationOutcome,
    RecoveryReport, RuntimeDetails, SettingsUpdate, StatusReport, ToolSummary,
};
pub use descriptor::{BuildMode, ToolCategory, ToolDescriptor, VolumeMapping, VolumeMode};
pub use error::{ErrorCode, ErrorDetail, Result, ToolError};
pub use logs::{LogLine, LogSink, LogStream};
pub use registry::{JsonFileRegistry, MemoryRegistry, Tool, ToolRegistry};
pub use state::LifecycleState;
