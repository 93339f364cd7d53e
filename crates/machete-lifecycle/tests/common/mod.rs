#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use machete_lifecycle::error::FetchErrorReason;
use machete_lifecycle::fetch::{FetchedSource, SourceFetcher, SourceRef};
use machete_lifecycle::logs::{LogRelay, LogStream};
use machete_lifecycle::registry::{Tool, ToolRegistry};
use machete_lifecycle::sandbox::ResolvedMount;
use machete_lifecycle::runtime::{
    ComposeProject, ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus,
    ImageBuildRequest, RuntimeInfo, ServiceStatus,
};
use machete_lifecycle::{
    LifecycleConfig, LifecycleController, LifecycleState, LogLine, LogSink, MemoryRegistry,
    Result, ToolError,
};
use tempfile::TempDir;
use walkdir::WalkDir;

pub const MANIFEST: &str = "\
name: Uptime Board
version: 1.2.0
description: Watches endpoints
machete:
  category: monitoring
  port: 9090
";
pub const DOCKERFILE: &str = "FROM alpine:3.20\nCMD [\"sleep\", \"infinity\"]\n";
pub const README: &str = "# Uptime\n\nWatches endpoints.\n";
pub const COMPOSE: &str = "services:\n  stack:\n    build: .\n";

pub const BUILD_STEPS: [&str; 3] = [
    "Step 1/3 : FROM alpine:3.20",
    "Step 2/3 : COPY . /app",
    "Step 3/3 : CMD sleep infinity",
];

#[derive(Default)]
pub struct FakeState {
    pub unavailable: bool,
    pub fail_build: bool,
    pub exit_on_start: bool,
    /// Inspect answers with the state seen on entry, after this long.
    pub inspect_delay: Option<Duration>,
    pub images: BTreeSet<String>,
    pub containers: BTreeMap<String, ContainerSpecRecord>,
    pub stacks: BTreeMap<String, ContainerState>,
    pub stack_mounts: BTreeMap<String, Vec<ResolvedMount>>,
    pub builds: usize,
    pub runs: usize,
}

#[derive(Debug, Clone)]
pub struct ContainerSpecRecord {
    pub spec: ContainerSpec,
    pub state: ContainerState,
}

/// In-memory stand-in for the docker CLI.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_available(&self, available: bool) {
        self.state().unavailable = !available;
    }

    pub fn stop_externally(&self, name: &str) {
        if let Some(record) = self.state().containers.get_mut(name) {
            record.state = ContainerState::Exited;
        }
    }

    pub fn running_containers(&self) -> usize {
        self.state()
            .containers
            .values()
            .filter(|record| record.state == ContainerState::Running)
            .count()
    }

    fn check(&self) -> Result<()> {
        if self.state().unavailable {
            return Err(ToolError::RuntimeUnavailable(
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock".into(),
            ));
        }
        Ok(())
    }

    async fn emit_build(&self, relay: &mut LogRelay) -> Result<()> {
        self.check()?;
        let fail = self.state().fail_build;
        for line in BUILD_STEPS {
            relay.push(LogStream::Stdout, line).await;
            tokio::task::yield_now().await;
        }
        if fail {
            relay.push(LogStream::Stderr, "ERROR: process did not complete successfully").await;
            return Err(ToolError::build(
                machete_lifecycle::error::BuildErrorReason::BuildFailed,
                "exit status 1",
            )
            .with_log(relay.recent()));
        }
        self.state().builds += 1;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn info(&self) -> Result<RuntimeInfo> {
        self.check()?;
        Ok(RuntimeInfo {
            server_version: "27.0.0-fake".into(),
        })
    }

    async fn build_image(&self, request: &ImageBuildRequest, relay: &mut LogRelay) -> Result<()> {
        self.emit_build(relay).await?;
        self.state().images.insert(request.tag.clone());
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        self.check()?;
        self.state().images.remove(tag);
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        self.check()?;
        Ok(self.state().images.contains(tag))
    }

    async fn ensure_network(&self, _name: &str) -> Result<()> {
        self.check()
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.check()?;
        // Widen the window in which a racing start could slip in.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut state = self.state();
        if state.containers.contains_key(&spec.name) {
            return Err(ToolError::runtime(
                "run",
                format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            ));
        }
        let container_state = if state.exit_on_start {
            ContainerState::Exited
        } else {
            ContainerState::Running
        };
        state.containers.insert(
            spec.name.clone(),
            ContainerSpecRecord {
                spec: spec.clone(),
                state: container_state,
            },
        );
        state.runs += 1;
        Ok(format!("fake-{}", state.runs))
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerStatus>> {
        self.check()?;
        let (seen, delay) = {
            let state = self.state();
            (state.containers.get(name).map(|record| record.state), state.inspect_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(seen.map(|state| ContainerStatus {
            name: name.to_string(),
            state,
            exit_code: (state == ContainerState::Exited).then_some(1),
            started_at: None,
            health: None,
        }))
    }

    async fn stop_container(&self, name: &str, _grace: Duration) -> Result<()> {
        self.check()?;
        if let Some(record) = self.state().containers.get_mut(name) {
            record.state = ContainerState::Exited;
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.check()?;
        self.state().containers.remove(name);
        Ok(())
    }

    async fn container_logs(&self, name: &str, tail: usize) -> Result<Vec<String>> {
        self.check()?;
        let lines: Vec<String> = (1..=5).map(|n| format!("{name} line {n}")).collect();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines[skip..].to_vec())
    }

    async fn compose_build(&self, project: &ComposeProject, relay: &mut LogRelay) -> Result<()> {
        self.emit_build(relay).await?;
        self.state().images.insert(project.name.clone());
        Ok(())
    }

    async fn compose_up(&self, project: &ComposeProject) -> Result<()> {
        self.check()?;
        let mut state = self.state();
        state.stacks.insert(project.name.clone(), ContainerState::Running);
        state
            .stack_mounts
            .insert(project.name.clone(), project.mounts.clone());
        state.runs += 1;
        Ok(())
    }

    async fn compose_down(&self, project: &ComposeProject, remove_images: bool) -> Result<()> {
        self.check()?;
        let mut state = self.state();
        state.stacks.remove(&project.name);
        if remove_images {
            state.images.remove(&project.name);
        }
        Ok(())
    }

    async fn compose_status(&self, project: &ComposeProject) -> Result<Vec<ServiceStatus>> {
        self.check()?;
        Ok(self
            .state()
            .stacks
            .get(&project.name)
            .map(|state| {
                vec![ServiceStatus {
                    service: project.tool_id.clone(),
                    container: format!("{}-{}-1", project.name, project.tool_id),
                    state: *state,
                }]
            })
            .unwrap_or_default())
    }

    async fn compose_logs(&self, project: &ComposeProject, _tail: usize) -> Result<Vec<String>> {
        self.check()?;
        Ok(vec![format!("{} up", project.name)])
    }
}

/// Copies `file://` trees instead of cloning, with the same destination rules as git.
pub struct DirFetcher;

#[async_trait]
impl SourceFetcher for DirFetcher {
    async fn fetch(
        &self,
        source: &SourceRef,
        dest: &Path,
        sink: Option<LogSink>,
    ) -> Result<FetchedSource> {
        let Some(path) = source.url.strip_prefix("file://") else {
            return Err(ToolError::fetch(FetchErrorReason::InvalidUrl, source.url.clone()));
        };
        let src = PathBuf::from(path);
        if dest.exists() {
            return Err(ToolError::fetch(
                FetchErrorReason::AlreadyExists,
                format!("{} already exists", dest.display()),
            ));
        }
        if !src.is_dir() {
            return Err(ToolError::fetch(
                FetchErrorReason::Unreachable,
                format!("{} does not exist", src.display()),
            ));
        }
        let mut relay = LogRelay::new(sink, 50);
        relay.system(format!("copying {}", src.display())).await;
        for entry in WalkDir::new(&src).into_iter().filter_map(|entry| entry.ok()) {
            let relative = entry.path().strip_prefix(&src).unwrap();
            let target = dest.join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target).unwrap();
            } else {
                fs::copy(entry.path(), &target).unwrap();
            }
        }
        Ok(FetchedSource {
            path: dest.to_path_buf(),
            commit: Some("0123456789abcdef".into()),
            log: relay.recent(),
        })
    }

    async fn version(&self) -> Result<String> {
        Ok("dir-fetcher 1.0".into())
    }
}

/// Registry whose writes can be made to fail for one lifecycle state.
pub struct FlakyRegistry {
    inner: Arc<MemoryRegistry>,
    fail_on: Mutex<Option<LifecycleState>>,
}

impl FlakyRegistry {
    pub fn fail_puts_in(&self, state: Option<LifecycleState>) {
        *self.fail_on.lock().unwrap() = state;
    }
}

impl ToolRegistry for FlakyRegistry {
    fn get(&self, id: &str) -> Result<Option<Tool>> {
        self.inner.get(id)
    }

    fn put(&self, tool: &Tool) -> Result<()> {
        if *self.fail_on.lock().unwrap() == Some(tool.state) {
            return Err(ToolError::Registry(format!(
                "disk full while saving {} in state {}",
                tool.id, tool.state
            )));
        }
        self.inner.put(tool)
    }

    fn list(&self) -> Result<Vec<Tool>> {
        self.inner.list()
    }

    fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub runtime: Arc<FakeRuntime>,
    pub registry: Arc<MemoryRegistry>,
    pub flaky: Arc<FlakyRegistry>,
    pub controller: Arc<LifecycleController>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut LifecycleConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LifecycleConfig::rooted_at(dir.path());
        config.start_timeout_secs = 1;
        tweak(&mut config);
        let runtime = Arc::new(FakeRuntime::default());
        let registry = Arc::new(MemoryRegistry::new());
        let flaky = Arc::new(FlakyRegistry {
            inner: registry.clone(),
            fail_on: Mutex::new(None),
        });
        let controller = LifecycleController::new(
            config,
            flaky.clone(),
            runtime.clone(),
            Arc::new(DirFetcher),
        )
        .unwrap();
        Harness {
            dir,
            runtime,
            registry,
            flaky,
            controller: Arc::new(controller),
        }
    }

    /// Writes a source tree outside the sandbox and returns its `file://` url.
    pub fn source(&self, name: &str, files: &[(&str, &str)]) -> String {
        let root = self.dir.path().join("sources").join(name);
        for (relative, contents) in files {
            let path = root.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        format!("file://{}", root.display())
    }

    /// A complete single-container tool.
    pub fn basic_source(&self, name: &str) -> String {
        self.source(
            name,
            &[
                ("machete.yml", MANIFEST),
                ("Dockerfile", DOCKERFILE),
                ("README.md", README),
            ],
        )
    }

    pub fn tool_dir(&self, id: &str) -> PathBuf {
        self.controller.sandbox().tool_dir(id)
    }
}

pub fn collect_lines(mut rx: tokio::sync::mpsc::Receiver<LogLine>) -> tokio::task::JoinHandle<Vec<LogLine>> {
    tokio::spawn(async move {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines
    })
}
