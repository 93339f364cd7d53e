use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::descriptor::{BuildMode, ToolDescriptor};
use crate::error::{BuildErrorReason, Result, ToolError};
use crate::logs::{LogRelay, LogSink};
use crate::runtime::{ComposeProject, ContainerRuntime, ImageBuildRequest};
use crate::sandbox::normalize_lexically;
use crate::validate::{find_first, DOCKERFILE_CANDIDATES};

pub fn image_tag(prefix: &str, id: &str) -> String {
    format!("{prefix}-{id}:latest")
}

pub fn container_name(prefix: &str, id: &str) -> String {
    format!("{prefix}-tool-{id}")
}

pub fn compose_project_name(prefix: &str, id: &str) -> String {
    format!("{prefix}-{id}")
}

/// Output of one build call; the lines are kept (truncated) on the tool record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub lines: Vec<String>,
    pub line_count: u64,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildTarget {
    Image(ImageBuildRequest),
    Compose(ComposeProject),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub mode: BuildMode,
    pub target: BuildTarget,
}

impl BuildPlan {
    /// Image tag for single-container tools, compose project name otherwise.
    pub fn image_ref(&self) -> &str {
        match &self.target {
            BuildTarget::Image(request) => &request.tag,
            BuildTarget::Compose(project) => &project.name,
        }
    }
}

pub struct ImageBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    prefix: String,
    log_limit: usize,
}

impl ImageBuilder {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, prefix: &str, log_limit: usize) -> Self {
        ImageBuilder {
            runtime,
            prefix: prefix.to_string(),
            log_limit,
        }
    }

    /// Works out what to build without touching the runtime.
    pub fn plan(&self, root: &Path, descriptor: &ToolDescriptor) -> Result<BuildPlan> {
        let id = descriptor.id.as_str();
        match descriptor.build_mode {
            BuildMode::MultiService => {
                let declared = descriptor.build.compose_file.as_deref().ok_or_else(|| {
                    ToolError::build(
                        BuildErrorReason::DockerfileInvalid,
                        "multi-service tool has no compose file",
                    )
                })?;
                let file = contained(root, declared, "compose file")?;
                if !file.is_file() {
                    return Err(ToolError::build(
                        BuildErrorReason::DockerfileInvalid,
                        format!("compose file {} not found", declared.display()),
                    ));
                }
                Ok(BuildPlan {
                    mode: BuildMode::MultiService,
                    target: BuildTarget::Compose(compose_project(&self.prefix, root, descriptor, file)),
                })
            }
            BuildMode::SingleContainer => {
                let context = contained(root, &descriptor.build.context, "build context")?;
                if !context.is_dir() {
                    return Err(ToolError::build(
                        BuildErrorReason::DockerfileInvalid,
                        format!("build context {} is not a directory", descriptor.build.context.display()),
                    ));
                }
                let relative = match &descriptor.build.dockerfile {
                    Some(declared) => declared.clone(),
                    None => find_first(root, DOCKERFILE_CANDIDATES).ok_or_else(|| {
                        ToolError::build(BuildErrorReason::DockerfileInvalid, "no Dockerfile found")
                    })?,
                };
                let dockerfile = contained(root, &relative, "Dockerfile")?;
                check_dockerfile(&dockerfile)?;
                Ok(BuildPlan {
                    mode: BuildMode::SingleContainer,
                    target: BuildTarget::Image(ImageBuildRequest {
                        tool_id: id.to_string(),
                        tag: image_tag(&self.prefix, id),
                        context,
                        dockerfile,
                    }),
                })
            }
        }
    }

    /// Runs the build, forwarding every output line to `sink` as it is produced.
    pub async fn build(
        &self,
        plan: &BuildPlan,
        sink: Option<LogSink>,
    ) -> (Result<()>, BuildRecord) {
        let started = Instant::now();
        let mut relay = LogRelay::new(sink, self.log_limit);
        let result = match &plan.target {
            BuildTarget::Image(request) => self.runtime.build_image(request, &mut relay).await,
            BuildTarget::Compose(project) => self.runtime.compose_build(project, &mut relay).await,
        };
        let result = result.map_err(|err| match err {
            ToolError::RuntimeUnavailable(detail) => {
                ToolError::build(BuildErrorReason::DaemonUnavailable, detail)
                    .with_log(relay.recent())
            }
            other => other,
        });
        match &result {
            Ok(()) => info!("built {} in {}ms", plan.image_ref(), started.elapsed().as_millis()),
            Err(err) => warn!("build of {} failed: {err}", plan.image_ref()),
        }
        if relay.sink_closed() {
            warn!("build log consumer for {} went away; output kept on the record", plan.image_ref());
        }
        let record = BuildRecord {
            lines: relay.recent(),
            line_count: relay.line_count(),
            success: result.is_ok(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        (result, record)
    }
}

pub fn compose_project(
    prefix: &str,
    root: &Path,
    descriptor: &ToolDescriptor,
    file: PathBuf,
) -> ComposeProject {
    let mut env: Vec<(String, String)> = descriptor
        .environment
        .iter()
        .map(|var| (var.name.clone(), var.value.clone()))
        .collect();
    env.push(("MACHETE_TOOL_ID".into(), descriptor.id.clone()));
    env.push(("MACHETE_TOOL_PORT".into(), descriptor.port.to_string()));
    ComposeProject {
        tool_id: descriptor.id.clone(),
        name: compose_project_name(prefix, &descriptor.id),
        file,
        working_dir: root.to_path_buf(),
        env,
        mounts: Vec::new(),
    }
}

/// Joins `relative` onto `root`, refusing anything that lands outside it.
fn contained(root: &Path, relative: &Path, what: &str) -> Result<PathBuf> {
    let escaped = || {
        ToolError::build(
            BuildErrorReason::DockerfileInvalid,
            format!("{what} {} escapes the source tree", relative.display()),
        )
    };
    if relative.is_absolute() {
        return Err(escaped());
    }
    let joined = normalize_lexically(&root.join(relative)).ok_or_else(escaped)?;
    if !joined.starts_with(root) {
        return Err(escaped());
    }
    Ok(joined)
}

/// Rejects Dockerfiles docker would refuse anyway, before a daemon round-trip.
pub fn check_dockerfile(path: &Path) -> Result<()> {
    let text = fs::read_to_string(path).map_err(|err| {
        ToolError::build(
            BuildErrorReason::DockerfileInvalid,
            format!("cannot read {}: {err}", path.display()),
        )
    })?;
    let first = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase()
        })
        .find(|instruction| instruction != "ARG");
    match first.as_deref() {
        Some("FROM") => Ok(()),
        Some(other) => Err(ToolError::build(
            BuildErrorReason::DockerfileInvalid,
            format!("{}: first instruction is {other}, expected FROM", path.display()),
        )),
        None => Err(ToolError::build(
            BuildErrorReason::DockerfileInvalid,
            format!("{} has no instructions", path.display()),
        )),
    }
}
