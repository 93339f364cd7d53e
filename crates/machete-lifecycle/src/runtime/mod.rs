//! Container runtime seam. [`DockerCli`] drives the `docker` binary; tests plug in fakes.

mod docker;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::logs::LogRelay;
use crate::sandbox::ResolvedMount;

pub use docker::DockerCli;

pub const TOOL_LABEL: &str = "machete.tool";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuildRequest {
    pub tool_id: String,
    pub tag: String,
    pub context: PathBuf,
    pub dockerfile: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub tool_id: String,
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<ResolvedMount>,
    pub network: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    pub tool_id: String,
    pub name: String,
    pub file: PathBuf,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Bound into the primary service on `compose_up`.
    pub mounts: Vec<ResolvedMount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" | "up" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    pub fn is_alive(self) -> bool {
        matches!(self, ContainerState::Running)
    }

    /// The container will not come up again without intervention.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ContainerState::Exited | ContainerState::Dead | ContainerState::Removing
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub state: ContainerState,
    pub exit_code: Option<i64>,
    pub started_at: Option<String>,
    pub health: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: String,
    pub container: String,
    pub state: ContainerState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub server_version: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn info(&self) -> Result<RuntimeInfo>;

    async fn build_image(&self, request: &ImageBuildRequest, relay: &mut LogRelay) -> Result<()>;
    /// Missing images count as removed.
    async fn remove_image(&self, tag: &str) -> Result<()>;
    async fn image_exists(&self, tag: &str) -> Result<bool>;

    async fn ensure_network(&self, name: &str) -> Result<()>;
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerStatus>>;
    /// Missing containers count as stopped.
    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()>;
    /// Missing containers count as removed.
    async fn remove_container(&self, name: &str) -> Result<()>;
    async fn container_logs(&self, name: &str, tail: usize) -> Result<Vec<String>>;

    async fn compose_build(&self, project: &ComposeProject, relay: &mut LogRelay) -> Result<()>;
    async fn compose_up(&self, project: &ComposeProject) -> Result<()>;
    async fn compose_down(&self, project: &ComposeProject, remove_images: bool) -> Result<()>;
    async fn compose_status(&self, project: &ComposeProject) -> Result<Vec<ServiceStatus>>;
    async fn compose_logs(&self, project: &ComposeProject, tail: usize) -> Result<Vec<String>>;
}
