//! Orchestrates install, build, start, stop and uninstall for every tool.
//!
//! All mutating operations on one tool id run under that id's lock from
//! [`ToolLocks`]; distinct ids proceed in parallel. The [`Tool`] record is
//! persisted after every completed step so an interrupted operation leaves a
//! record that [`LifecycleController::recover`] can diagnose.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::build::{
    compose_project, container_name, image_tag, BuildPlan, BuildTarget, ImageBuilder,
};
use crate::config::LifecycleConfig;
use crate::descriptor::{BuildMode, ToolDescriptor};
use crate::error::{ConflictReason, ErrorCode, ErrorDetail, Result, ToolError};
use crate::fetch::{is_partial_dir_name, validate_source_url, GitFetcher, SourceFetcher, SourceRef};
use crate::ids::{normalize_tool_id, slug_from_source, validate_tool_id};
use crate::locks::ToolLocks;
use crate::logs::LogSink;
use crate::manifest::ManifestResolver;
use crate::registry::{JsonFileRegistry, Tool, ToolRegistry};
use crate::runtime::{
    ComposeProject, ContainerRuntime, ContainerSpec, ContainerState, DockerCli, PortBinding,
    ServiceStatus,
};
use crate::sandbox::SandboxGuard;
use crate::state::LifecycleState;
use crate::validate::validate_with_build;

pub use crate::registry::ToolSummary;

const START_POLL_INTERVAL: Duration = Duration::from_millis(250);
const FAILED_START_LOG_TAIL: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SettingsUpdate {
    pub enabled: Option<bool>,
    pub auto_start: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallRequest {
    pub source_url: String,
    /// Derived from the last URL segment when absent.
    pub id: Option<String>,
    pub branch: Option<String>,
}

impl InstallRequest {
    pub fn new(source_url: impl Into<String>) -> Self {
        InstallRequest {
            source_url: source_url.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// What every mutating operation hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub id: String,
    pub operation: &'static str,
    /// Persisted state after the operation; `None` when no record exists.
    pub state: Option<LifecycleState>,
    pub error: Option<ErrorDetail>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub correlation_id: String,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|detail| detail.code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeDetails {
    pub container: String,
    pub state: ContainerState,
    pub alive: bool,
    pub exit_code: Option<i64>,
    pub started_at: Option<String>,
    pub health: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub id: String,
    /// Live state after reconciliation with the runtime.
    pub state: LifecycleState,
    /// State the record held before this call.
    pub persisted_state: LifecycleState,
    pub runtime: Option<RuntimeDetails>,
    pub runtime_error: Option<String>,
    pub last_error: Option<ErrorDetail>,
    pub reconciled: bool,
    /// Another operation held the tool, so the observed state was not written back.
    pub busy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub id: String,
    pub url: String,
    pub healthy: bool,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub runtime_available: bool,
    pub runtime_version: Option<String>,
    pub runtime_error: Option<String>,
    pub registry_available: bool,
    pub registry_error: Option<String>,
    pub tool_count: usize,
    pub fetcher_available: bool,
    pub fetcher_version: Option<String>,
    pub fetcher_error: Option<String>,
}

impl Diagnostics {
    pub fn all_available(&self) -> bool {
        self.runtime_available && self.registry_available && self.fetcher_available
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub marked_failed: Vec<String>,
    pub resumed_uninstalls: Vec<String>,
    pub reconciled: Vec<String>,
    /// Enabled `auto_start` tools launched because they were built or stopped.
    pub started: Vec<String>,
    pub skipped_busy: Vec<String>,
    pub partial_dirs_removed: usize,
    pub errors: Vec<String>,
}

/// Result of one successful step, before it is turned into an [`OperationOutcome`].
struct Step {
    state: LifecycleState,
    warnings: Vec<String>,
}

impl Step {
    fn at(state: LifecycleState) -> Self {
        Step {
            state,
            warnings: Vec::new(),
        }
    }
}

fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

pub struct LifecycleController {
    config: LifecycleConfig,
    registry: Arc<dyn ToolRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    fetcher: Arc<dyn SourceFetcher>,
    resolver: ManifestResolver,
    sandbox: SandboxGuard,
    builder: ImageBuilder,
    locks: ToolLocks,
    http: reqwest::Client,
}

impl LifecycleController {
    pub fn new(
        config: LifecycleConfig,
        registry: Arc<dyn ToolRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Result<Self> {
        let sandbox = SandboxGuard::new(&config.sandbox_root, &config.allowed_volume_roots)?;
        let builder = ImageBuilder::new(
            Arc::clone(&runtime),
            &config.image_prefix,
            config.build_log_limit,
        );
        let http = reqwest::Client::builder()
            .timeout(config.health_timeout())
            .no_proxy()
            .build()
            .map_err(|err| ToolError::InvalidArgument(format!("http client: {err}")))?;
        Ok(LifecycleController {
            locks: ToolLocks::new(config.lock_wait()),
            resolver: ManifestResolver::default(),
            config,
            registry,
            runtime,
            fetcher,
            sandbox,
            builder,
            http,
        })
    }

    /// Production wiring: docker CLI, git CLI and the JSON file registry.
    pub fn from_config(config: LifecycleConfig) -> Result<Self> {
        let registry = Arc::new(JsonFileRegistry::open(&config.registry_path)?);
        let runtime = Arc::new(DockerCli::from_config(&config));
        let fetcher = Arc::new(GitFetcher::from_config(&config));
        Self::new(config, registry, runtime, fetcher)
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn sandbox(&self) -> &SandboxGuard {
        &self.sandbox
    }

    /// Fetch, resolve, validate and build. Does not start the tool.
    pub async fn install(&self, request: InstallRequest, sink: Option<LogSink>) -> OperationOutcome {
        let cid = correlation_id();
        let raw_id = request
            .id
            .clone()
            .or_else(|| slug_from_source(&request.source_url))
            .unwrap_or_default();
        let result = self.install_entry(&request, &raw_id, sink, &cid).await;
        self.finish("install", &raw_id, cid, result)
    }

    /// [`install`](Self::install) followed by [`start`](Self::start). A failed start
    /// leaves the tool `built` and is reported as a warning.
    pub async fn install_and_start(
        &self,
        request: InstallRequest,
        sink: Option<LogSink>,
    ) -> OperationOutcome {
        let mut outcome = self.install(request, sink).await;
        if !outcome.is_success() || outcome.state != Some(LifecycleState::Built) {
            return outcome;
        }
        let started = self.start(&outcome.id).await;
        match started.error {
            None => outcome.state = started.state,
            Some(detail) => {
                outcome
                    .warnings
                    .push(format!("installed but not started: {}", detail.technical));
                outcome.state = started.state.or(outcome.state);
            }
        }
        outcome.warnings.extend(started.warnings);
        outcome
    }

    pub async fn start(&self, id: &str) -> OperationOutcome {
        let cid = correlation_id();
        let result: Result<Step> = async {
            let id = validate_tool_id(id)?;
            let _guard = self.locks.acquire(&id, "start").await?;
            let mut tool = self.load(&id)?;
            ensure_enabled(&tool, "start")?;
            self.start_tool(&mut tool, &cid).await
        }
        .await;
        self.finish("start", id, cid, result)
    }

    pub async fn stop(&self, id: &str) -> OperationOutcome {
        let cid = correlation_id();
        let result: Result<Step> = async {
            let id = validate_tool_id(id)?;
            let _guard = self.locks.acquire(&id, "stop").await?;
            let mut tool = self.load(&id)?;
            self.stop_tool(&mut tool, &cid).await
        }
        .await;
        self.finish("stop", id, cid, result)
    }

    /// Stop then start without releasing the tool's lock in between.
    pub async fn restart(&self, id: &str) -> OperationOutcome {
        let cid = correlation_id();
        let result: Result<Step> = async {
            let id = validate_tool_id(id)?;
            let _guard = self.locks.acquire(&id, "restart").await?;
            let mut tool = self.load(&id)?;
            ensure_enabled(&tool, "restart")?;
            if !tool.state.may_have_container() {
                return Err(ToolError::InvalidState {
                    id: tool.id.clone(),
                    operation: "restart",
                    state: tool.state,
                });
            }
            self.stop_tool(&mut tool, &cid).await?;
            self.start_tool(&mut tool, &cid).await
        }
        .await;
        self.finish("restart", id, cid, result)
    }

    /// Rebuilds the image from the tree already on disk.
    pub async fn rebuild(&self, id: &str, sink: Option<LogSink>) -> OperationOutcome {
        let cid = correlation_id();
        let result: Result<Step> = async {
            let id = validate_tool_id(id)?;
            let _guard = self.locks.acquire(&id, "rebuild").await?;
            let mut tool = self.load(&id)?;
            self.rebuild_tool(&mut tool, sink, &cid).await
        }
        .await;
        self.finish("rebuild", id, cid, result)
    }

    pub async fn uninstall(&self, id: &str) -> OperationOutcome {
        let cid = correlation_id();
        let result: Result<Step> = async {
            let id = validate_tool_id(id)?;
            let _guard = self.locks.acquire(&id, "uninstall").await?;
            let mut tool = self.load(&id)?;
            self.uninstall_tool(&mut tool, &cid).await
        }
        .await;
        self.finish("uninstall", id, cid, result)
    }

    /// Changes the `enabled` and `auto_start` switches; `None` leaves a switch as it is.
    /// Disabling a running tool does not stop it.
    pub async fn update_settings(&self, id: &str, update: SettingsUpdate) -> OperationOutcome {
        let cid = correlation_id();
        let result: Result<Step> = async {
            let id = validate_tool_id(id)?;
            let _guard = self.locks.acquire(&id, "settings").await?;
            let mut tool = self.load(&id)?;
            if tool.state == LifecycleState::Removed {
                return Err(ToolError::InvalidState {
                    id,
                    operation: "settings",
                    state: tool.state,
                });
            }
            if let Some(enabled) = update.enabled {
                tool.enabled = enabled;
            }
            if let Some(auto_start) = update.auto_start {
                tool.auto_start = auto_start;
            }
            tool.touch();
            self.registry.put(&tool)?;
            info!(
                "settings of {id}: enabled={} auto_start={}",
                tool.enabled, tool.auto_start
            );
            Ok(Step::at(tool.state))
        }
        .await;
        self.finish("settings", id, cid, result)
    }

    /// Reads the record, asks the runtime and heals the record if they disagree.
    ///
    /// The runtime query runs without the tool lock; only the write-back takes it, and is
    /// skipped when another operation holds the tool.
    pub async fn status(&self, id: &str) -> Result<StatusReport> {
        let id = validate_tool_id(id)?;
        let tool = self.load(&id)?;
        let mut report = self.observe(&tool).await;
        if report.state == tool.state {
            return Ok(report);
        }
        let Some(_guard) = self.locks.try_acquire(&id, "status") else {
            debug!("{id} is busy; not writing observed state {}", report.state);
            report.busy = true;
            return Ok(report);
        };
        let mut current = self.load(&id)?;
        if current.state != tool.state {
            // an operation completed between the read and the runtime query
            report.state = current.state;
            report.persisted_state = current.state;
            report.last_error = current.last_error;
            return Ok(report);
        }
        self.heal(&mut current, report.state)?;
        report.reconciled = true;
        Ok(report)
    }

    pub fn list_tools(&self, filter: Option<LifecycleState>) -> Result<Vec<ToolSummary>> {
        let mut tools = match filter {
            Some(state) => self.registry.list_by_state(state)?,
            None => self.registry.list()?,
        };
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tools.iter().map(Tool::summary).collect())
    }

    pub fn get_tool(&self, id: &str) -> Result<Tool> {
        self.load(&validate_tool_id(id)?)
    }

    /// Container (or stack) log tail; the recorded build log when nothing is deployed.
    pub async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>> {
        let tool = self.get_tool(id)?;
        if !tool.state.may_have_container() {
            let skip = tool.build_log.len().saturating_sub(tail);
            return Ok(tool.build_log[skip..].to_vec());
        }
        let descriptor = descriptor_of(&tool, "logs")?;
        match descriptor.build_mode {
            BuildMode::SingleContainer => {
                self.runtime
                    .container_logs(&self.container_name(&tool), tail)
                    .await
            }
            BuildMode::MultiService => {
                let project = self.compose_for(&tool, descriptor)?;
                self.runtime.compose_logs(&project, tail).await
            }
        }
    }

    pub async fn health_check(&self, id: &str) -> Result<HealthReport> {
        let tool = self.get_tool(id)?;
        let descriptor = descriptor_of(&tool, "health-check")?;
        let path = if descriptor.health_check.starts_with('/') {
            descriptor.health_check.clone()
        } else {
            format!("/{}", descriptor.health_check)
        };
        let url = format!("http://127.0.0.1:{}{path}", descriptor.port);
        let started = Instant::now();
        let response = self.http.get(&url).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let report = match response {
            Ok(response) => {
                let status = response.status();
                HealthReport {
                    id: tool.id.clone(),
                    url,
                    healthy: status.as_u16() == 200,
                    status_code: Some(status.as_u16()),
                    latency_ms,
                    error: None,
                }
            }
            Err(err) => HealthReport {
                id: tool.id.clone(),
                url,
                healthy: false,
                status_code: None,
                latency_ms,
                error: Some(if err.is_timeout() {
                    "health check timed out".to_string()
                } else {
                    err.to_string()
                }),
            },
        };
        machete_telemetry::event(
            "tool.health",
            &[
                ("tool_id", tool.id.as_str()),
                ("result", if report.healthy { "ok" } else { "unhealthy" }),
            ],
        );
        Ok(report)
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::default();
        match self.runtime.info().await {
            Ok(info) => {
                diagnostics.runtime_available = true;
                diagnostics.runtime_version = Some(info.server_version);
            }
            Err(err) => diagnostics.runtime_error = Some(err.to_string()),
        }
        match self.registry.health() {
            Ok(count) => {
                diagnostics.registry_available = true;
                diagnostics.tool_count = count;
            }
            Err(err) => diagnostics.registry_error = Some(err.to_string()),
        }
        match self.fetcher.version().await {
            Ok(version) => {
                diagnostics.fetcher_available = true;
                diagnostics.fetcher_version = Some(version);
            }
            Err(err) => diagnostics.fetcher_error = Some(err.to_string()),
        }
        if !diagnostics.all_available() {
            warn!(
                "diagnostics degraded: runtime={} registry={} fetcher={}",
                diagnostics.runtime_available,
                diagnostics.registry_available,
                diagnostics.fetcher_available
            );
        }
        diagnostics
    }

    /// Startup reconciliation of records left behind by an interrupted process.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut tools = self.registry.list()?;
        tools.sort_by(|a, b| a.id.cmp(&b.id));

        for mut tool in tools {
            let Some(_guard) = self.locks.try_acquire(&tool.id, "recover") else {
                report.skipped_busy.push(tool.id.clone());
                continue;
            };
            let cid = correlation_id();
            match tool.state {
                LifecycleState::Failed => {}
                LifecycleState::Pending | LifecycleState::Fetched => {
                    let err = ToolError::Interrupted {
                        id: tool.id.clone(),
                        operation: "install",
                        state: tool.state,
                    };
                    remove_source_tree(&tool.source_path);
                    tool.fail(err.to_detail(&cid));
                    self.persist_best_effort(&tool);
                    report.marked_failed.push(tool.id.clone());
                }
                LifecycleState::Removed => match self.uninstall_tool(&mut tool, &cid).await {
                    Ok(_) => report.resumed_uninstalls.push(tool.id.clone()),
                    Err(err) => report.errors.push(format!("{}: {err}", tool.id)),
                },
                _ if !tool.source_path.is_dir() => {
                    if tool.state.may_have_container() {
                        if let Err(err) = self.teardown(&tool).await {
                            warn!("teardown of {} during recovery failed: {err}", tool.id);
                        }
                    }
                    let err = ToolError::Io {
                        operation: "locate source tree",
                        path: tool.source_path.display().to_string(),
                        detail: "source tree is missing".into(),
                    };
                    tool.fail(err.to_detail(&cid));
                    self.persist_best_effort(&tool);
                    report.marked_failed.push(tool.id.clone());
                }
                state if state.may_have_container() => {
                    let observed = self.observe(&tool).await;
                    if observed.state != tool.state {
                        match self.heal(&mut tool, observed.state) {
                            Ok(()) => report.reconciled.push(tool.id.clone()),
                            Err(err) => report.errors.push(format!("{}: {err}", tool.id)),
                        }
                    }
                }
                _ => {}
            }

            let wants_start = tool.enabled
                && tool.auto_start
                && matches!(tool.state, LifecycleState::Built | LifecycleState::Stopped);
            if wants_start {
                match self.start_tool(&mut tool, &cid).await {
                    Ok(_) => report.started.push(tool.id.clone()),
                    Err(err) => report.errors.push(format!("{}: auto-start: {err}", tool.id)),
                }
            }
        }

        report.partial_dirs_removed = self.remove_partial_dirs();
        info!(
            "recovery: {} failed, {} uninstalls resumed, {} reconciled, {} started, {} partial dirs removed",
            report.marked_failed.len(),
            report.resumed_uninstalls.len(),
            report.reconciled.len(),
            report.started.len(),
            report.partial_dirs_removed
        );
        machete_telemetry::event(
            "tool.recover",
            &[("result", if report.errors.is_empty() { "ok" } else { "error" })],
        );
        Ok(report)
    }

    async fn install_entry(
        &self,
        request: &InstallRequest,
        raw_id: &str,
        sink: Option<LogSink>,
        cid: &str,
    ) -> Result<Step> {
        let url = validate_source_url(&request.source_url)?;
        if raw_id.is_empty() {
            return Err(ToolError::InvalidArgument(format!(
                "cannot derive a tool id from '{url}'"
            )));
        }
        let id = validate_tool_id(raw_id)?;
        let _guard = self.locks.acquire(&id, "install").await?;

        let mut settings = (true, false);
        if let Some(existing) = self.registry.get(&id)? {
            if !existing.state.allows_reinstall() {
                return Err(ToolError::Conflict {
                    id,
                    reason: ConflictReason::AlreadyExists,
                    detail: format!("tool is already installed (state {})", existing.state),
                });
            }
            settings = (existing.enabled, existing.auto_start);
            self.purge_residue(&existing).await;
        }

        let dest = self.sandbox.tool_dir(&id);
        let mut tool = Tool::pending(&id, &url, request.branch.clone(), dest.clone());
        (tool.enabled, tool.auto_start) = settings;
        self.registry.put(&tool)?;
        info!("installing {id} from {url}");

        // fetch
        let source = SourceRef {
            url: url.clone(),
            branch: request.branch.clone(),
        };
        let fetched = match self.fetcher.fetch(&source, &dest, sink.clone()).await {
            Ok(fetched) => fetched,
            // The fetcher never leaves a partial tree and never touches an existing one.
            Err(err) => return Err(self.abandon(&mut tool, err, cid, false)),
        };
        tool.commit = fetched.commit;
        if let Err(err) = self.advance(&mut tool, LifecycleState::Fetched) {
            return Err(self.abandon(&mut tool, err, cid, true));
        }

        // resolve + validate
        let descriptor = match self.resolver.resolve(&id, &dest) {
            Ok(descriptor) => descriptor,
            Err(err) => return Err(self.abandon(&mut tool, err, cid, true)),
        };
        tool.warnings.extend(descriptor.warnings.iter().cloned());
        let validated = validate_with_build(&dest, &descriptor.build);
        tool.descriptor = Some(descriptor);

        let report = match validated {
            Ok(report) => report,
            Err(err) => return Err(self.abandon(&mut tool, err, cid, true)),
        };
        tool.validation_score = Some(report.score);
        tool.warnings.extend(report.warnings.iter().cloned());
        if let Err(err) = report.ensure_installable() {
            return Err(self.abandon(&mut tool, err, cid, true));
        }
        if let Err(err) = self.advance(&mut tool, LifecycleState::Validated) {
            return Err(self.abandon(&mut tool, err, cid, true));
        }

        // build
        match self.build_tool(&mut tool, sink).await {
            Ok(()) => {
                tool.last_error = None;
                if let Err(err) = self.advance(&mut tool, LifecycleState::Built) {
                    if let Err(cleanup) = self.remove_images(&tool).await {
                        warn!("could not remove image of {id} after failed save: {cleanup}");
                    }
                    return Err(self.abandon(&mut tool, err, cid, true));
                }
                info!("installed {id} as {}", tool.image.as_deref().unwrap_or("-"));
                Ok(Step {
                    state: LifecycleState::Built,
                    warnings: tool.warnings.clone(),
                })
            }
            Err(err) if err.is_runtime_unavailable() && self.config.keep_on_runtime_unavailable => {
                warn!("build of {id} skipped, container runtime unavailable: {err}");
                tool.warnings
                    .push("build skipped: container runtime unavailable; run rebuild once it is reachable".into());
                tool.record_error(err.to_detail(cid));
                self.registry.put(&tool)?;
                Err(err)
            }
            Err(err) => Err(self.abandon(&mut tool, err, cid, true)),
        }
    }

    /// Clears what a failed or removed record may have left before it is replaced.
    async fn purge_residue(&self, tool: &Tool) {
        debug!("purging residue of {} ({})", tool.id, tool.state);
        if let Err(err) = self.remove_images(tool).await {
            warn!("could not remove old image for {}: {err}", tool.id);
        }
        remove_source_tree(&tool.source_path);
    }

    /// Moves an installing record to `state` and persists it.
    fn advance(&self, tool: &mut Tool, state: LifecycleState) -> Result<()> {
        tool.transition(state, "install")?;
        self.registry.put(tool)
    }

    /// Cleans up after a failed install step and records the failure.
    fn abandon(&self, tool: &mut Tool, err: ToolError, cid: &str, remove_tree: bool) -> ToolError {
        if remove_tree {
            remove_source_tree(&tool.source_path);
        }
        warn!("install of {} failed in state {}: {err}", tool.id, tool.state);
        tool.fail(err.to_detail(cid));
        self.persist_best_effort(tool);
        err
    }

    /// Plans and runs a build, leaving image and build log on `tool`.
    async fn build_tool(&self, tool: &mut Tool, sink: Option<LogSink>) -> Result<()> {
        let descriptor = descriptor_of(tool, "build")?;
        let plan = self.builder.plan(&tool.source_path, descriptor)?;
        let (result, record) = self.builder.build(&plan, sink).await;
        tool.build_log = record.lines;
        match result {
            Ok(()) => {
                tool.image = Some(plan.image_ref().to_string());
                tool.container_name = match plan.mode {
                    BuildMode::SingleContainer => Some(self.container_name(tool)),
                    BuildMode::MultiService => None,
                };
                Ok(())
            }
            Err(err) => {
                if !err.is_runtime_unavailable() {
                    self.discard_build(&plan).await;
                }
                Err(err)
            }
        }
    }

    async fn discard_build(&self, plan: &BuildPlan) {
        let removed = match &plan.target {
            BuildTarget::Image(request) => self.runtime.remove_image(&request.tag).await,
            BuildTarget::Compose(project) => self.runtime.compose_down(project, true).await,
        };
        if let Err(err) = removed {
            warn!("could not discard failed build {}: {err}", plan.image_ref());
        }
    }

    async fn rebuild_tool(
        &self,
        tool: &mut Tool,
        sink: Option<LogSink>,
        cid: &str,
    ) -> Result<Step> {
        if !matches!(
            tool.state,
            LifecycleState::Validated | LifecycleState::Built | LifecycleState::Stopped
        ) {
            return Err(ToolError::InvalidState {
                id: tool.id.clone(),
                operation: "rebuild",
                state: tool.state,
            });
        }
        if !tool.source_path.is_dir() {
            return Err(ToolError::Io {
                operation: "rebuild",
                path: tool.source_path.display().to_string(),
                detail: "source tree is missing; reinstall the tool".into(),
            });
        }
        if tool.descriptor.is_none() {
            tool.descriptor = Some(self.resolver.resolve(&tool.id, &tool.source_path)?);
        }
        match self.build_tool(tool, sink).await {
            Ok(()) => {
                tool.transition(LifecycleState::Built, "rebuild")?;
                tool.last_error = None;
                self.registry.put(tool)?;
                Ok(Step::at(LifecycleState::Built))
            }
            Err(err) => {
                tool.record_error(err.to_detail(cid));
                self.persist_best_effort(tool);
                Err(err)
            }
        }
    }

    async fn start_tool(&self, tool: &mut Tool, cid: &str) -> Result<Step> {
        match tool.state {
            LifecycleState::Running => {
                if self.primary_alive(tool).await? {
                    debug!("{} already running", tool.id);
                    return Ok(Step::at(LifecycleState::Running));
                }
                info!("{} is recorded running but its container is gone; relaunching", tool.id);
                tool.transition(LifecycleState::Stopped, "start")?;
                self.registry.put(tool)?;
            }
            LifecycleState::Built | LifecycleState::Stopped => {}
            state => {
                return Err(ToolError::InvalidState {
                    id: tool.id.clone(),
                    operation: "start",
                    state,
                })
            }
        }

        let descriptor = descriptor_of(tool, "start")?.clone();
        let launched = match descriptor.build_mode {
            BuildMode::SingleContainer => self.launch_container(tool, &descriptor).await,
            BuildMode::MultiService => self.launch_stack(tool, &descriptor).await,
        };
        match launched {
            Ok(()) => {
                tool.transition(LifecycleState::Running, "start")?;
                tool.last_error = None;
                self.registry.put(tool)?;
                info!("started {}", tool.id);
                Ok(Step::at(LifecycleState::Running))
            }
            Err(err) => {
                tool.record_error(err.to_detail(cid));
                self.persist_best_effort(tool);
                Err(err)
            }
        }
    }

    async fn launch_container(&self, tool: &mut Tool, descriptor: &ToolDescriptor) -> Result<()> {
        let mounts = self.sandbox.resolve_all(&tool.id, &descriptor.volumes)?;
        let name = self.container_name(tool);
        self.runtime.remove_container(&name).await?;
        if let Some(network) = &self.config.docker_network {
            self.runtime.ensure_network(network).await?;
        }
        let spec = ContainerSpec {
            tool_id: tool.id.clone(),
            name: name.clone(),
            image: self.image_ref(tool),
            env: tool_env(descriptor),
            ports: vec![PortBinding {
                host: descriptor.port,
                container: descriptor.port,
            }],
            mounts,
            network: self.config.docker_network.clone(),
        };
        let container_id = self.runtime.run_container(&spec).await?;
        debug!("launched {} as {container_id}", name);
        tool.container_name = Some(name.clone());

        if let Err(err) = self.await_container(&name).await {
            let log = self
                .runtime
                .container_logs(&name, FAILED_START_LOG_TAIL)
                .await
                .unwrap_or_default();
            if let Err(cleanup) = self.runtime.remove_container(&name).await {
                warn!("could not remove failed container {name}: {cleanup}");
            }
            return Err(err.with_log(log));
        }
        Ok(())
    }

    async fn await_container(&self, name: &str) -> Result<()> {
        let deadline = Instant::now() + self.config.start_timeout();
        loop {
            match self.runtime.inspect_container(name).await? {
                Some(status) if status.state.is_alive() => return Ok(()),
                Some(status) if status.state.is_terminal() => {
                    return Err(ToolError::runtime(
                        "start",
                        format!(
                            "container {name} is {:?} (exit code {})",
                            status.state,
                            status
                                .exit_code
                                .map(|code| code.to_string())
                                .unwrap_or_else(|| "unknown".into())
                        ),
                    ))
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(ToolError::runtime(
                    "start",
                    format!("container {name} did not report running in time"),
                ));
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }
    }

    async fn launch_stack(&self, tool: &Tool, descriptor: &ToolDescriptor) -> Result<()> {
        let mut project = self.compose_for(tool, descriptor)?;
        project.mounts = self.sandbox.resolve_all(&tool.id, &descriptor.volumes)?;
        if let Some(network) = &self.config.docker_network {
            self.runtime.ensure_network(network).await?;
        }
        self.runtime.compose_up(&project).await?;

        let deadline = Instant::now() + self.config.start_timeout();
        loop {
            let services = self.runtime.compose_status(&project).await?;
            if primary_service(&tool.id, &services).is_some_and(|svc| svc.state.is_alive()) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let log = self
                    .runtime
                    .compose_logs(&project, FAILED_START_LOG_TAIL)
                    .await
                    .unwrap_or_default();
                if let Err(err) = self.runtime.compose_down(&project, false).await {
                    warn!("could not tear down stack {}: {err}", project.name);
                }
                return Err(ToolError::runtime(
                    "start",
                    format!("primary service of {} did not report running in time", project.name),
                )
                .with_log(log));
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }
    }

    async fn stop_tool(&self, tool: &mut Tool, cid: &str) -> Result<Step> {
        match tool.state {
            LifecycleState::Stopped | LifecycleState::Removed => {
                return Ok(Step::at(tool.state));
            }
            LifecycleState::Running | LifecycleState::Built => {}
            // Nothing was ever launched.
            state => return Ok(Step::at(state)),
        }
        if let Err(err) = self.teardown(tool).await {
            tool.record_error(err.to_detail(cid));
            self.persist_best_effort(tool);
            return Err(err);
        }
        tool.transition(LifecycleState::Stopped, "stop")?;
        self.registry.put(tool)?;
        info!("stopped {}", tool.id);
        Ok(Step::at(LifecycleState::Stopped))
    }

    /// Stops and removes the runtime side of a tool. Missing containers are fine.
    async fn teardown(&self, tool: &Tool) -> Result<()> {
        let mode = tool
            .descriptor
            .as_ref()
            .map(|descriptor| descriptor.build_mode)
            .unwrap_or_default();
        match (mode, tool.descriptor.as_ref()) {
            (BuildMode::MultiService, Some(descriptor)) => {
                let project = self.compose_for(tool, descriptor)?;
                self.runtime.compose_down(&project, false).await
            }
            _ => {
                let name = self.container_name(tool);
                self.runtime
                    .stop_container(&name, self.config.stop_grace())
                    .await?;
                self.runtime.remove_container(&name).await
            }
        }
    }

    async fn uninstall_tool(&self, tool: &mut Tool, cid: &str) -> Result<Step> {
        if tool.state.may_have_container() {
            if let Err(err) = self.teardown(tool).await {
                tool.record_error(err.to_detail(cid));
                self.persist_best_effort(tool);
                return Err(err);
            }
            if tool.state == LifecycleState::Running {
                tool.transition(LifecycleState::Stopped, "uninstall")?;
            }
        }
        tool.transition(LifecycleState::Removed, "uninstall")?;
        self.registry.put(tool)?;

        if let Err(err) = self.remove_images(tool).await {
            warn!("image removal for {} failed, continuing: {err}", tool.id);
        }

        match fs::remove_dir_all(&tool.source_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                let err = ToolError::io("remove source tree", &tool.source_path, err);
                tool.record_error(err.to_detail(cid));
                self.persist_best_effort(tool);
                return Err(err);
            }
        }
        self.registry.delete(&tool.id)?;
        info!("uninstalled {}", tool.id);
        Ok(Step::at(LifecycleState::Removed))
    }

    /// Compares the record with the runtime; `state` of the result is the live view.
    async fn observe(&self, tool: &Tool) -> StatusReport {
        let mut report = StatusReport {
            id: tool.id.clone(),
            state: tool.state,
            persisted_state: tool.state,
            runtime: None,
            runtime_error: None,
            last_error: tool.last_error.clone(),
            reconciled: false,
            busy: false,
        };
        if !tool.state.may_have_container() {
            return report;
        }
        match self.inspect_runtime(tool).await {
            Ok(details) => {
                let alive = details.as_ref().is_some_and(|details| details.alive);
                report.state = match (tool.state, alive) {
                    (LifecycleState::Running, false) => LifecycleState::Stopped,
                    (LifecycleState::Built | LifecycleState::Stopped, true) => {
                        LifecycleState::Running
                    }
                    (state, _) => state,
                };
                report.runtime = details;
            }
            Err(err) => {
                debug!("runtime query for {} failed: {err}", tool.id);
                report.runtime_error = Some(err.to_string());
            }
        }
        report
    }

    fn heal(&self, tool: &mut Tool, live: LifecycleState) -> Result<()> {
        info!("status of {} reconciled: {} -> {live}", tool.id, tool.state);
        tool.transition(live, "status")?;
        self.registry.put(tool)
    }

    async fn inspect_runtime(&self, tool: &Tool) -> Result<Option<RuntimeDetails>> {
        let descriptor = descriptor_of(tool, "status")?;
        match descriptor.build_mode {
            BuildMode::SingleContainer => {
                let name = self.container_name(tool);
                Ok(self
                    .runtime
                    .inspect_container(&name)
                    .await?
                    .map(|status| RuntimeDetails {
                        container: status.name,
                        state: status.state,
                        alive: status.state.is_alive(),
                        exit_code: status.exit_code,
                        started_at: status.started_at,
                        health: status.health,
                        services: Vec::new(),
                    }))
            }
            BuildMode::MultiService => {
                let project = self.compose_for(tool, descriptor)?;
                let services = self.runtime.compose_status(&project).await?;
                if services.is_empty() {
                    return Ok(None);
                }
                let state = primary_service(&tool.id, &services)
                    .map(|svc| svc.state)
                    .unwrap_or(ContainerState::Unknown);
                Ok(Some(RuntimeDetails {
                    container: project.name,
                    state,
                    alive: state.is_alive(),
                    exit_code: None,
                    started_at: None,
                    health: None,
                    services,
                }))
            }
        }
    }

    async fn primary_alive(&self, tool: &Tool) -> Result<bool> {
        Ok(self.inspect_runtime(tool).await?.is_some_and(|details| details.alive))
    }

    fn load(&self, id: &str) -> Result<Tool> {
        self.registry
            .get(id)?
            .ok_or_else(|| ToolError::NotFound(id.to_string()))
    }

    fn persist_best_effort(&self, tool: &Tool) {
        if let Err(err) = self.registry.put(tool) {
            warn!("failed to persist record for {}: {err}", tool.id);
        }
    }

    fn container_name(&self, tool: &Tool) -> String {
        tool.container_name
            .clone()
            .unwrap_or_else(|| container_name(&self.config.image_prefix, &tool.id))
    }

    fn image_ref(&self, tool: &Tool) -> String {
        tool.image
            .clone()
            .unwrap_or_else(|| image_tag(&self.config.image_prefix, &tool.id))
    }

    /// Best-effort removal of whatever images a tool's builds produced.
    async fn remove_images(&self, tool: &Tool) -> Result<()> {
        match tool.descriptor.as_ref() {
            Some(descriptor) if descriptor.build_mode == BuildMode::MultiService => {
                // compose needs its file to know which images belong to the project
                if !tool.source_path.is_dir() {
                    return Ok(());
                }
                let project = self.compose_for(tool, descriptor)?;
                self.runtime.compose_down(&project, true).await
            }
            _ => self.runtime.remove_image(&self.image_ref(tool)).await,
        }
    }

    fn compose_for(&self, tool: &Tool, descriptor: &ToolDescriptor) -> Result<ComposeProject> {
        let relative = descriptor.build.compose_file.as_deref().ok_or_else(|| {
            ToolError::InvalidState {
                id: tool.id.clone(),
                operation: "compose",
                state: tool.state,
            }
        })?;
        Ok(compose_project(
            &self.config.image_prefix,
            &tool.source_path,
            descriptor,
            tool.source_path.join(relative),
        ))
    }

    fn remove_partial_dirs(&self) -> usize {
        let entries = match fs::read_dir(self.sandbox.root()) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot scan sandbox root {}: {err}", self.sandbox.root().display());
                return 0;
            }
        };
        let mut removed = 0;
        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_partial_dir_name(&name) {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!("cannot remove partial dir {name}: {err}"),
            }
        }
        removed
    }

    fn finish(
        &self,
        operation: &'static str,
        raw_id: &str,
        correlation_id: String,
        result: Result<Step>,
    ) -> OperationOutcome {
        let id = normalize_tool_id(raw_id);
        let outcome = match result {
            Ok(step) => OperationOutcome {
                id,
                operation,
                state: Some(step.state),
                error: None,
                warnings: step.warnings,
                correlation_id,
            },
            Err(err) => {
                warn!("{operation} {id} failed [{correlation_id}]: {err}");
                let state = self.registry.get(&id).ok().flatten().map(|tool| tool.state);
                OperationOutcome {
                    error: Some(err.to_detail(&correlation_id)),
                    id,
                    operation,
                    state,
                    warnings: Vec::new(),
                    correlation_id,
                }
            }
        };
        machete_telemetry::event(
            &format!("tool.{operation}"),
            &[
                ("tool_id", outcome.id.as_str()),
                ("result", if outcome.is_success() { "ok" } else { "error" }),
            ],
        );
        outcome
    }
}

fn ensure_enabled(tool: &Tool, operation: &str) -> Result<()> {
    if tool.enabled {
        return Ok(());
    }
    Err(ToolError::Conflict {
        id: tool.id.clone(),
        reason: ConflictReason::Disabled,
        detail: format!("tool is disabled; {operation} rejected"),
    })
}

fn descriptor_of<'a>(tool: &'a Tool, operation: &'static str) -> Result<&'a ToolDescriptor> {
    tool.descriptor.as_ref().ok_or_else(|| ToolError::InvalidState {
        id: tool.id.clone(),
        operation,
        state: tool.state,
    })
}

fn tool_env(descriptor: &ToolDescriptor) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = descriptor
        .environment
        .iter()
        .map(|var| (var.name.clone(), var.value.clone()))
        .collect();
    env.push(("MACHETE_TOOL_ID".into(), descriptor.id.clone()));
    env.push(("MACHETE_TOOL_PORT".into(), descriptor.port.to_string()));
    env
}

/// The service named after the tool, else the first one compose reports.
fn primary_service<'a>(id: &str, services: &'a [ServiceStatus]) -> Option<&'a ServiceStatus> {
    services
        .iter()
        .find(|svc| svc.service == id)
        .or_else(|| services.first())
}

fn remove_source_tree(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove {}: {err}", path.display()),
    }
}
