use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    ComposeProject, ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus,
    ImageBuildRequest, RuntimeInfo, ServiceStatus, TOOL_LABEL,
};
use crate::config::LifecycleConfig;
use crate::descriptor::VolumeMode;
use crate::error::{BuildErrorReason, Result, ToolError};
use crate::logs::LogRelay;
use crate::process::{describe, run_command, run_streaming, CommandError, CommandOutput};
use crate::sandbox::ResolvedMount;

/// Written next to the compose file when a stack declares volume mappings.
const COMPOSE_OVERRIDE_FILE: &str = ".machete-compose.override.yml";

/// [`ContainerRuntime`] backed by the `docker` CLI and its `compose` plugin.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
    command_timeout: Duration,
    build_timeout: Duration,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>, command_timeout: Duration, build_timeout: Duration) -> Self {
        DockerCli {
            bin: bin.into(),
            command_timeout,
            build_timeout,
        }
    }

    pub fn from_config(config: &LifecycleConfig) -> Self {
        DockerCli::new(
            config.docker_bin.clone(),
            config.runtime_timeout(),
            config.build_timeout(),
        )
    }

    fn docker(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        cmd
    }

    fn compose(&self, project: &ComposeProject, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("compose")
            .arg("-p")
            .arg(&project.name)
            .arg("-f")
            .arg(&project.file);
        let override_file = override_path(project);
        if override_file.is_file() {
            cmd.arg("-f").arg(override_file);
        }
        cmd.args(args)
            .current_dir(&project.working_dir)
            .envs(project.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    fn run_command(&self, spec: &ContainerSpec, env_file: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("run")
            .arg("-d")
            .arg("--name")
            .arg(&spec.name)
            .arg("--label")
            .arg(format!("{TOOL_LABEL}={}", spec.tool_id));
        if let Some(network) = &spec.network {
            cmd.arg("--network").arg(network);
        }
        for port in &spec.ports {
            cmd.arg("-p").arg(format!("{}:{}", port.host, port.container));
        }
        if let Some(path) = env_file {
            cmd.arg("--env-file").arg(path);
        }
        for mount in &spec.mounts {
            cmd.arg("-v").arg(mount.bind_arg());
        }
        cmd.arg(&spec.image);
        cmd
    }

    /// Binds the project's resolved mounts into its primary service through an
    /// override file; a stale override is removed first.
    async fn write_mount_override(&self, project: &ComposeProject) -> Result<()> {
        let path = override_path(project);
        match fs::remove_file(&path) {
            Ok(()) => debug!("removed stale {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(ToolError::io("compose override", &path, err)),
        }
        if project.mounts.is_empty() {
            return Ok(());
        }
        let output = self
            .exec_ok("compose config", self.compose(project, &["config", "--services"]))
            .await?;
        let services: Vec<&str> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        let service = mount_service(&project.tool_id, &services).ok_or_else(|| {
            ToolError::runtime(
                "compose config",
                format!("{} declares no services", project.file.display()),
            )
        })?;
        let text = render_mount_override(service, &project.mounts)?;
        fs::write(&path, text).map_err(|err| ToolError::io("compose override", &path, err))?;
        debug!("mounting {} volume(s) into {service}", project.mounts.len());
        Ok(())
    }

    /// Runs a short command. A non-zero exit is returned as output for the caller to classify.
    async fn exec(&self, operation: &str, cmd: Command, limit: Duration) -> Result<CommandOutput> {
        match run_command(cmd, limit).await {
            Ok(output) => Ok(output),
            Err(err) if err.is_missing_binary() => Err(ToolError::RuntimeUnavailable(err.to_string())),
            Err(err) => Err(ToolError::runtime(operation, err.to_string())),
        }
    }

    async fn exec_ok(&self, operation: &str, cmd: Command) -> Result<CommandOutput> {
        let output = self.exec(operation, cmd, self.command_timeout).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify_failure(operation, &output.diagnostic()))
        }
    }

    async fn exec_tolerating_missing(&self, operation: &str, cmd: Command) -> Result<()> {
        let output = self.exec(operation, cmd, self.command_timeout).await?;
        let diagnostic = output.diagnostic();
        if output.success() || is_not_found(&diagnostic) {
            Ok(())
        } else {
            Err(classify_failure(operation, &diagnostic))
        }
    }

    async fn stream_build(&self, cmd: Command, relay: &mut LogRelay) -> Result<()> {
        relay.system(describe(&cmd)).await;
        let status = match run_streaming(cmd, self.build_timeout, relay).await {
            Ok(status) => status,
            Err(err @ CommandError::Spawn { .. }) if err.is_missing_binary() => {
                return Err(
                    ToolError::build(BuildErrorReason::DaemonUnavailable, err.to_string())
                        .with_log(relay.recent()),
                );
            }
            Err(err) => {
                return Err(ToolError::build(BuildErrorReason::BuildFailed, err.to_string())
                    .with_log(relay.recent()));
            }
        };
        if status.success() {
            return Ok(());
        }
        let output = relay.recent().join("\n");
        let reason = if is_daemon_unavailable(&output) {
            BuildErrorReason::DaemonUnavailable
        } else if is_dockerfile_error(&output) {
            BuildErrorReason::DockerfileInvalid
        } else {
            BuildErrorReason::BuildFailed
        };
        let detail = match status.code() {
            Some(code) => format!("build exited with status {code}"),
            None => "build terminated by signal".to_string(),
        };
        Err(ToolError::build(reason, detail).with_log(relay.recent()))
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn info(&self) -> Result<RuntimeInfo> {
        let cmd = self.docker(&["version", "--format", "{{.Server.Version}}"]);
        let output = self.exec("version", cmd, self.command_timeout).await?;
        if !output.success() {
            return Err(ToolError::RuntimeUnavailable(output.diagnostic()));
        }
        Ok(RuntimeInfo {
            server_version: output.stdout.trim().to_string(),
        })
    }

    async fn build_image(&self, request: &ImageBuildRequest, relay: &mut LogRelay) -> Result<()> {
        let label = format!("{TOOL_LABEL}={}", request.tool_id);
        let mut cmd = Command::new(&self.bin);
        cmd.env("DOCKER_BUILDKIT", "1")
            .arg("build")
            .arg("--progress=plain")
            .arg("--label")
            .arg(&label)
            .arg("-t")
            .arg(&request.tag)
            .arg("-f")
            .arg(&request.dockerfile)
            .arg(&request.context);
        info!("building image {} for {}", request.tag, request.tool_id);
        self.stream_build(cmd, relay).await
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        self.exec_tolerating_missing("image removal", self.docker(&["image", "rm", "-f", tag]))
            .await
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        let cmd = self.docker(&["image", "inspect", "--format", "{{.Id}}", tag]);
        let output = self.exec("image inspect", cmd, self.command_timeout).await?;
        let diagnostic = output.diagnostic();
        if output.success() {
            Ok(true)
        } else if is_not_found(&diagnostic) {
            Ok(false)
        } else {
            Err(classify_failure("image inspect", &diagnostic))
        }
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        let inspect = self
            .exec("network inspect", self.docker(&["network", "inspect", name]), self.command_timeout)
            .await?;
        if inspect.success() {
            return Ok(());
        }
        let diagnostic = inspect.diagnostic();
        if is_daemon_unavailable(&diagnostic) {
            return Err(ToolError::RuntimeUnavailable(diagnostic));
        }
        let create = self
            .exec("network create", self.docker(&["network", "create", name]), self.command_timeout)
            .await?;
        let diagnostic = create.diagnostic();
        if create.success() || diagnostic.contains("already exists") {
            debug!("docker network {name} ready");
            Ok(())
        } else {
            Err(classify_failure("network create", &diagnostic))
        }
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        // Values go through a private file so they never show up in the process list.
        let env_file = if spec.env.is_empty() {
            None
        } else {
            Some(EnvFile::create(&spec.env)?)
        };
        let cmd = self.run_command(spec, env_file.as_ref().map(|file| file.path.as_path()));
        info!("starting container {} from {}", spec.name, spec.image);
        let output = self.exec_ok("container start", cmd).await;
        drop(env_file);
        Ok(output?.stdout.trim().to_string())
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerStatus>> {
        let cmd = self.docker(&["inspect", "--type", "container", "--format", "{{json .State}}", name]);
        let output = self.exec("container inspect", cmd, self.command_timeout).await?;
        let diagnostic = output.diagnostic();
        if !output.success() {
            if is_not_found(&diagnostic) {
                return Ok(None);
            }
            return Err(classify_failure("container inspect", &diagnostic));
        }
        parse_inspect_state(name, output.stdout.trim()).map(Some)
    }

    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        let cmd = self.docker(&["stop", "-t", &secs, name]);
        let output = self
            .exec("container stop", cmd, grace + self.command_timeout)
            .await?;
        let diagnostic = output.diagnostic();
        if output.success() || is_not_found(&diagnostic) {
            Ok(())
        } else {
            Err(classify_failure("container stop", &diagnostic))
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.exec_tolerating_missing("container removal", self.docker(&["rm", "-f", name]))
            .await
    }

    async fn container_logs(&self, name: &str, tail: usize) -> Result<Vec<String>> {
        let tail = tail.to_string();
        let output = self
            .exec_ok("container logs", self.docker(&["logs", "--tail", &tail, name]))
            .await?;
        Ok(output_lines(&output))
    }

    async fn compose_build(&self, project: &ComposeProject, relay: &mut LogRelay) -> Result<()> {
        info!("building compose project {} for {}", project.name, project.tool_id);
        let cmd = self.compose(project, &["build"]);
        self.stream_build(cmd, relay).await
    }

    async fn compose_up(&self, project: &ComposeProject) -> Result<()> {
        self.write_mount_override(project).await?;
        let cmd = self.compose(project, &["up", "-d", "--remove-orphans"]);
        let output = self.exec("compose up", cmd, self.build_timeout).await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_failure("compose up", &output.diagnostic()))
        }
    }

    async fn compose_down(&self, project: &ComposeProject, remove_images: bool) -> Result<()> {
        let mut args = vec!["down", "--remove-orphans"];
        if remove_images {
            args.extend(["--rmi", "local"]);
        }
        let output = self
            .exec("compose down", self.compose(project, &args), self.build_timeout)
            .await?;
        let diagnostic = output.diagnostic();
        if output.success() || is_not_found(&diagnostic) {
            Ok(())
        } else {
            Err(classify_failure("compose down", &diagnostic))
        }
    }

    async fn compose_status(&self, project: &ComposeProject) -> Result<Vec<ServiceStatus>> {
        let cmd = self.compose(project, &["ps", "--all", "--format", "json"]);
        let output = self.exec_ok("compose ps", cmd).await?;
        parse_compose_ps(&output.stdout)
    }

    async fn compose_logs(&self, project: &ComposeProject, tail: usize) -> Result<Vec<String>> {
        let tail = tail.to_string();
        let cmd = self.compose(project, &["logs", "--no-color", "--tail", &tail]);
        let output = self.exec_ok("compose logs", cmd).await?;
        Ok(output_lines(&output))
    }
}

fn override_path(project: &ComposeProject) -> PathBuf {
    project.working_dir.join(COMPOSE_OVERRIDE_FILE)
}

/// The service named after the tool, else the first one compose lists.
fn mount_service<'a>(tool_id: &str, services: &[&'a str]) -> Option<&'a str> {
    services
        .iter()
        .find(|service| **service == tool_id)
        .or_else(|| services.first())
        .copied()
}

#[derive(Serialize)]
struct OverrideDoc<'a> {
    services: BTreeMap<&'a str, OverrideService>,
}

#[derive(Serialize)]
struct OverrideService {
    volumes: Vec<BindVolume>,
}

#[derive(Serialize)]
struct BindVolume {
    #[serde(rename = "type")]
    kind: &'static str,
    source: String,
    target: String,
    read_only: bool,
}

fn render_mount_override(service: &str, mounts: &[ResolvedMount]) -> Result<String> {
    let volumes = mounts
        .iter()
        .map(|mount| BindVolume {
            kind: "bind",
            source: mount.host.display().to_string(),
            target: mount.container.clone(),
            read_only: mount.mode == VolumeMode::Ro,
        })
        .collect();
    let doc = OverrideDoc {
        services: BTreeMap::from([(service, OverrideService { volumes })]),
    };
    serde_yaml::to_string(&doc)
        .map_err(|err| ToolError::runtime("compose override", err.to_string()))
}

/// `--env-file` for one `docker run`, removed when dropped.
struct EnvFile {
    path: PathBuf,
}

impl EnvFile {
    fn create(env: &[(String, String)]) -> Result<Self> {
        let text = render_env_file(env)?;
        let path = std::env::temp_dir().join(format!("machete-env-{}", uuid::Uuid::new_v4()));
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = EnvFile { path };
        let mut handle = options
            .open(&file.path)
            .map_err(|err| ToolError::io("env file", &file.path, err))?;
        handle
            .write_all(text.as_bytes())
            .map_err(|err| ToolError::io("env file", &file.path, err))?;
        Ok(file)
    }
}

impl Drop for EnvFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("could not remove env file {}: {err}", self.path.display());
        }
    }
}

/// One `KEY=value` line per variable. The format has no quoting, so line breaks are refused.
fn render_env_file(env: &[(String, String)]) -> Result<String> {
    let mut text = String::new();
    for (key, value) in env {
        if key.is_empty() || key.contains(['=', '\n', '\r']) || value.contains(['\n', '\r']) {
            return Err(ToolError::InvalidArgument(format!(
                "environment variable {key:?} cannot be passed to the container"
            )));
        }
        text.push_str(key);
        text.push('=');
        text.push_str(value);
        text.push('\n');
    }
    Ok(text)
}

fn output_lines(output: &CommandOutput) -> Vec<String> {
    output
        .stdout
        .lines()
        .chain(output.stderr.lines())
        .map(str::to_string)
        .collect()
}

fn classify_failure(operation: &str, diagnostic: &str) -> ToolError {
    if is_daemon_unavailable(diagnostic) {
        warn!("docker daemon unavailable during {operation}");
        ToolError::RuntimeUnavailable(diagnostic.to_string())
    } else {
        ToolError::runtime(operation, diagnostic.to_string())
    }
}

pub(crate) fn is_daemon_unavailable(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    [
        "cannot connect to the docker daemon",
        "is the docker daemon running",
        "error during connect",
        "docker daemon is not running",
        "permission denied while trying to connect to the docker daemon",
    ]
    .iter()
    .any(|needle| text.contains(needle))
}

pub(crate) fn is_not_found(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    ["no such container", "no such object", "no such image", "no such network"]
        .iter()
        .any(|needle| text.contains(needle))
}

pub(crate) fn is_dockerfile_error(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    [
        "dockerfile parse error",
        "failed to parse dockerfile",
        "failed to read dockerfile",
        "unknown instruction",
        "no build stage in current context",
        "file with no instructions",
    ]
    .iter()
    .any(|needle| text.contains(needle))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    running: bool,
    exit_code: Option<i64>,
    started_at: Option<String>,
    health: Option<InspectHealth>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    status: String,
}

pub(crate) fn parse_inspect_state(name: &str, json: &str) -> Result<ContainerStatus> {
    let state: InspectState = serde_json::from_str(json).map_err(|err| {
        ToolError::runtime("container inspect", format!("unexpected inspect output: {err}"))
    })?;
    let parsed = ContainerState::parse(&state.status);
    let state_kind = if state.running && parsed == ContainerState::Unknown {
        ContainerState::Running
    } else {
        parsed
    };
    Ok(ContainerStatus {
        name: name.to_string(),
        state: state_kind,
        exit_code: state.exit_code,
        started_at: state.started_at.filter(|s| !s.is_empty()),
        health: state.health.map(|health| health.status),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ComposePsEntry {
    #[serde(default)]
    service: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
}

impl From<ComposePsEntry> for ServiceStatus {
    fn from(entry: ComposePsEntry) -> Self {
        ServiceStatus {
            service: entry.service,
            container: entry.name,
            state: ContainerState::parse(&entry.state),
        }
    }
}

/// `compose ps --format json` prints an array on older releases and one object per line on newer.
pub(crate) fn parse_compose_ps(text: &str) -> Result<Vec<ServiceStatus>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let bad = |err: serde_json::Error| {
        ToolError::runtime("compose ps", format!("unexpected compose ps output: {err}"))
    };
    if trimmed.starts_with('[') {
        let entries: Vec<ComposePsEntry> = serde_json::from_str(trimmed).map_err(bad)?;
        return Ok(entries.into_iter().map(ServiceStatus::from).collect());
    }
    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<ComposePsEntry>(line)
                .map(ServiceStatus::from)
                .map_err(bad)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PortBinding;

    #[test]
    fn classifies_daemon_and_missing_messages() {
        assert!(is_daemon_unavailable(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?"
        ));
        assert!(!is_daemon_unavailable("Error: No such container: x"));
        assert!(is_not_found("Error response from daemon: No such container: machete-tool-x"));
        assert!(is_not_found("Error: No such object: machete-tool-x"));
        assert!(is_dockerfile_error("dockerfile parse error on line 3: unknown instruction: RUNN"));
    }

    #[test]
    fn classify_failure_maps_unavailable() {
        assert!(matches!(
            classify_failure("container start", "error during connect: pipe not found"),
            ToolError::RuntimeUnavailable(_)
        ));
        assert!(matches!(
            classify_failure("container start", "port is already allocated"),
            ToolError::Runtime { .. }
        ));
    }

    #[test]
    fn parses_inspect_state_json() {
        let status = parse_inspect_state(
            "machete-tool-x",
            r#"{"Status":"running","Running":true,"ExitCode":0,"StartedAt":"2024-05-01T10:00:00Z","Health":{"Status":"healthy"}}"#,
        )
        .unwrap();
        assert_eq!(status.state, ContainerState::Running);
        assert_eq!(status.health.as_deref(), Some("healthy"));

        let exited =
            parse_inspect_state("x", r#"{"Status":"exited","Running":false,"ExitCode":137}"#).unwrap();
        assert_eq!(exited.state, ContainerState::Exited);
        assert_eq!(exited.exit_code, Some(137));
    }

    #[test]
    fn parses_both_compose_ps_shapes() {
        let lines = r#"{"Service":"web","Name":"machete-x-web-1","State":"running"}
{"Service":"db","Name":"machete-x-db-1","State":"exited"}"#;
        let parsed = parse_compose_ps(lines).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].state, ContainerState::Exited);

        let array = r#"[{"Service":"web","Name":"machete-x-web-1","State":"running"}]"#;
        let parsed = parse_compose_ps(array).unwrap();
        assert_eq!(parsed[0].service, "web");
        assert!(parse_compose_ps("  ").unwrap().is_empty());
    }

    fn spec_with_secret() -> ContainerSpec {
        ContainerSpec {
            tool_id: "uptime".into(),
            name: "machete-tool-uptime".into(),
            image: "machete/uptime:latest".into(),
            env: vec![
                ("API_TOKEN".into(), "hunter2".into()),
                ("MODE".into(), "a=b c".into()),
            ],
            ports: vec![PortBinding {
                host: 9090,
                container: 9090,
            }],
            mounts: Vec::new(),
            network: None,
        }
    }

    #[test]
    fn env_values_stay_out_of_run_arguments() {
        let docker = DockerCli::new("docker", Duration::from_secs(5), Duration::from_secs(5));
        let spec = spec_with_secret();
        let file = EnvFile::create(&spec.env).unwrap();
        let cmd = docker.run_command(&spec, Some(&file.path));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        assert!(args.iter().all(|arg| !arg.contains("hunter2")), "{args:?}");
        assert!(!args.iter().any(|arg| arg == "-e"));
        let at = args.iter().position(|arg| arg == "--env-file").unwrap();
        assert_eq!(Path::new(&args[at + 1]), file.path.as_path());
        assert_eq!(args.last().map(String::as_str), Some("machete/uptime:latest"));

        let text = fs::read_to_string(&file.path).unwrap();
        assert_eq!(text, "API_TOKEN=hunter2\nMODE=a=b c\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&file.path).unwrap().permissions().mode();
            assert_eq!(mode & 0o077, 0);
        }

        let path = file.path.clone();
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn multi_line_env_values_are_refused() {
        let env = vec![("CERT".to_string(), "line1\nline2".to_string())];
        assert!(matches!(render_env_file(&env), Err(ToolError::InvalidArgument(_))));
        let env = vec![("BAD=KEY".to_string(), "x".to_string())];
        assert!(render_env_file(&env).is_err());
    }

    #[test]
    fn mount_override_targets_primary_service() {
        assert_eq!(mount_service("grafana", &["db", "grafana"]), Some("grafana"));
        assert_eq!(mount_service("uptime", &["web", "db"]), Some("web"));
        assert_eq!(mount_service("uptime", &[]), None);

        let mounts = vec![
            ResolvedMount {
                host: PathBuf::from("/srv/machete/grafana/data"),
                container: "/var/lib/grafana".into(),
                mode: VolumeMode::Rw,
            },
            ResolvedMount {
                host: PathBuf::from("/srv/shared/dashboards"),
                container: "/etc/dashboards".into(),
                mode: VolumeMode::Ro,
            },
        ];
        let text = render_mount_override("grafana", &mounts).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        let volumes = doc["services"]["grafana"]["volumes"].as_sequence().unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0]["type"].as_str(), Some("bind"));
        assert_eq!(volumes[0]["source"].as_str(), Some("/srv/machete/grafana/data"));
        assert_eq!(volumes[0]["target"].as_str(), Some("/var/lib/grafana"));
        assert_eq!(volumes[0]["read_only"].as_bool(), Some(false));
        assert_eq!(volumes[1]["read_only"].as_bool(), Some(true));
    }
}
