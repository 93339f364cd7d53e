use std::process::ExitCode;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use machete_lifecycle::{
    ErrorDetail, InstallRequest, LifecycleConfig, LifecycleController, LifecycleState, LogLine,
    OperationOutcome, SettingsUpdate,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

const LOG_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "machete", version, about = "Install and run self-hosted tools")]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Clone, validate and build a tool, then start it
    Install {
        url: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        /// Stop after the build
        #[arg(long)]
        no_start: bool,
    },
    /// Start a built or stopped tool
    Start { id: String },
    /// Stop a running tool
    Stop { id: String },
    /// Stop then start a tool
    Restart { id: String },
    /// Rebuild the image from the existing source tree
    Rebuild { id: String },
    /// Remove container, image and source tree
    Uninstall { id: String },
    /// Enable or disable a tool, or toggle starting it during recover
    Settings {
        id: String,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        auto_start: Option<bool>,
    },
    /// Persisted state reconciled with the container runtime
    Status { id: String },
    /// List installed tools
    List {
        #[arg(long, value_parser = parse_state)]
        state: Option<LifecycleState>,
    },
    /// Container output, or the build log when no container exists
    Logs {
        id: String,
        #[arg(long, default_value_t = 100)]
        tail: usize,
    },
    /// Query the tool's health endpoint
    Health { id: String },
    /// Check container runtime, registry and git availability
    Diagnostics,
    /// Repair records left behind by an interrupted run
    Recover,
}

impl Cmd {
    fn name(&self) -> &'static str {
        match self {
            Cmd::Install { .. } => "install",
            Cmd::Start { .. } => "start",
            Cmd::Stop { .. } => "stop",
            Cmd::Restart { .. } => "restart",
            Cmd::Rebuild { .. } => "rebuild",
            Cmd::Uninstall { .. } => "uninstall",
            Cmd::Settings { .. } => "settings",
            Cmd::Status { .. } => "status",
            Cmd::List { .. } => "list",
            Cmd::Logs { .. } => "logs",
            Cmd::Health { .. } => "health",
            Cmd::Diagnostics => "diagnostics",
            Cmd::Recover => "recover",
        }
    }
}

fn parse_state(value: &str) -> Result<LifecycleState, String> {
    LifecycleState::parse(value).ok_or_else(|| {
        let known: Vec<&str> = LifecycleState::ALL.iter().map(|state| state.as_str()).collect();
        format!("unknown state '{value}' (expected one of: {})", known.join(", "))
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    machete_util::init_tracing()?;
    machete_util::init_cli_telemetry("machete-cli", env!("CARGO_PKG_VERSION"), cli.cmd.name());

    let controller = LifecycleController::from_config(LifecycleConfig::load())?;
    let json = cli.json;

    let ok = match cli.cmd {
        Cmd::Install {
            url,
            id,
            branch,
            no_start,
        } => {
            let mut request = InstallRequest::new(url);
            request.id = id;
            request.branch = branch;
            let (sink, printer) = stream_progress();
            let outcome = if no_start {
                controller.install(request, Some(sink)).await
            } else {
                controller.install_and_start(request, Some(sink)).await
            };
            finish_progress(printer).await;
            print_outcome(&outcome, json)?
        }
        Cmd::Start { id } => print_outcome(&controller.start(&id).await, json)?,
        Cmd::Stop { id } => print_outcome(&controller.stop(&id).await, json)?,
        Cmd::Restart { id } => print_outcome(&controller.restart(&id).await, json)?,
        Cmd::Rebuild { id } => {
            let (sink, printer) = stream_progress();
            let outcome = controller.rebuild(&id, Some(sink)).await;
            finish_progress(printer).await;
            print_outcome(&outcome, json)?
        }
        Cmd::Uninstall { id } => print_outcome(&controller.uninstall(&id).await, json)?,
        Cmd::Settings {
            id,
            enabled,
            auto_start,
        } => {
            let update = SettingsUpdate {
                enabled,
                auto_start,
            };
            print_outcome(&controller.update_settings(&id, update).await, json)?
        }
        Cmd::Status { id } => {
            let report = controller.status(&id).await?;
            if json {
                print_json(&report)?;
            } else {
                println!("id\t{}", report.id);
                println!("state\t{}", report.state);
                if report.reconciled {
                    println!("recorded\t{}", report.persisted_state);
                }
                if let Some(runtime) = &report.runtime {
                    println!(
                        "container\t{}\t{}\talive={}",
                        runtime.container,
                        serde_json::to_value(runtime.state)?.as_str().unwrap_or("unknown"),
                        runtime.alive
                    );
                    for service in &runtime.services {
                        println!(
                            "service\t{}\t{}",
                            service.service,
                            serde_json::to_value(service.state)?.as_str().unwrap_or("unknown")
                        );
                    }
                }
                if let Some(err) = &report.runtime_error {
                    println!("runtime_error\t{err}");
                }
                if report.busy {
                    println!("busy\ttrue");
                }
                if let Some(detail) = &report.last_error {
                    print_error(detail);
                }
            }
            true
        }
        Cmd::List { state } => {
            let tools = controller.list_tools(state)?;
            if json {
                print_json(&tools)?;
            } else {
                for tool in tools {
                    let port = tool.port.map(|port| port.to_string()).unwrap_or_default();
                    println!(
                        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                        tool.id,
                        tool.state,
                        if tool.enabled { "enabled" } else { "disabled" },
                        tool.category.as_str(),
                        port,
                        tool.version,
                        tool.name
                    );
                }
            }
            true
        }
        Cmd::Logs { id, tail } => {
            let lines = controller.logs(&id, tail).await?;
            if json {
                print_json(&lines)?;
            } else {
                for line in lines {
                    println!("{line}");
                }
            }
            true
        }
        Cmd::Health { id } => {
            let report = controller.health_check(&id).await?;
            if json {
                print_json(&report)?;
            } else {
                let status = report
                    .status_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{}\t{}\t{}\t{}ms",
                    report.url,
                    if report.healthy { "healthy" } else { "unhealthy" },
                    status,
                    report.latency_ms
                );
                if let Some(err) = &report.error {
                    eprintln!("error: {err}");
                }
            }
            report.healthy
        }
        Cmd::Diagnostics => {
            let diag = controller.diagnostics().await;
            if json {
                print_json(&diag)?;
            } else {
                print_check("runtime", diag.runtime_available, &diag.runtime_version, &diag.runtime_error);
                print_check(
                    "registry",
                    diag.registry_available,
                    &Some(format!("{} tools", diag.tool_count)),
                    &diag.registry_error,
                );
                print_check("git", diag.fetcher_available, &diag.fetcher_version, &diag.fetcher_error);
            }
            diag.all_available()
        }
        Cmd::Recover => {
            let report = controller.recover().await?;
            if json {
                print_json(&report)?;
            } else {
                for id in &report.marked_failed {
                    println!("failed\t{id}");
                }
                for id in &report.resumed_uninstalls {
                    println!("uninstalled\t{id}");
                }
                for id in &report.reconciled {
                    println!("reconciled\t{id}");
                }
                for id in &report.started {
                    println!("started\t{id}");
                }
                for id in &report.skipped_busy {
                    println!("busy\t{id}");
                }
                println!("partial_dirs_removed\t{}", report.partial_dirs_removed);
                for err in &report.errors {
                    eprintln!("error: {err}");
                }
            }
            report.errors.is_empty()
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Returns a sink for build and clone output plus the task echoing it to stderr.
fn stream_progress() -> (mpsc::Sender<LogLine>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<LogLine>(LOG_CHANNEL_CAPACITY);
    let printer = tokio::spawn(async move {
        let mut stream = ReceiverStream::new(rx);
        while let Some(line) = stream.next().await {
            eprintln!("[{}] {}", line.stream, line.line);
        }
    });
    (tx, printer)
}

async fn finish_progress(printer: JoinHandle<()>) {
    if let Err(err) = printer.await {
        tracing::warn!("progress printer stopped: {err}");
    }
}

fn print_outcome(outcome: &OperationOutcome, json: bool) -> Result<bool, serde_json::Error> {
    if json {
        print_json(outcome)?;
        return Ok(outcome.is_success());
    }
    let state = outcome
        .state
        .map(|state| state.as_str())
        .unwrap_or("absent");
    println!("{}\t{}\t{}", outcome.operation, outcome.id, state);
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    if let Some(detail) = &outcome.error {
        print_error(detail);
    }
    Ok(outcome.is_success())
}

fn print_error(detail: &ErrorDetail) {
    let code = serde_json::to_value(detail.code)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default();
    eprintln!("error[{code}]: {}", detail.message);
    eprintln!("  {}", detail.technical);
    for line in &detail.log_excerpt {
        eprintln!("  | {line}");
    }
    eprintln!("  correlation_id={}", detail.correlation_id);
}

fn print_check(name: &str, ok: bool, version: &Option<String>, error: &Option<String>) {
    let detail = if ok { version.as_deref() } else { error.as_deref() };
    println!(
        "{name}\t{}\t{}",
        if ok { "ok" } else { "unavailable" },
        detail.unwrap_or("")
    );
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn install_flags_parse() {
        let cli = Cli::try_parse_from([
            "machete",
            "--json",
            "install",
            "https://github.com/acme/uptime.git",
            "--id",
            "uptime",
            "--no-start",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.cmd {
            Cmd::Install {
                url, id, no_start, branch,
            } => {
                assert_eq!(url, "https://github.com/acme/uptime.git");
                assert_eq!(id.as_deref(), Some("uptime"));
                assert!(no_start);
                assert!(branch.is_none());
            }
            _ => panic!("expected install"),
        }
    }

    #[test]
    fn list_state_filter_is_validated() {
        let cli = Cli::try_parse_from(["machete", "list", "--state", "Running"]).unwrap();
        assert!(matches!(
            cli.cmd,
            Cmd::List {
                state: Some(LifecycleState::Running)
            }
        ));
        assert!(Cli::try_parse_from(["machete", "list", "--state", "asleep"]).is_err());
    }

    #[test]
    fn settings_switches_are_optional_booleans() {
        let cli = Cli::try_parse_from(["machete", "settings", "uptime", "--auto-start", "true"]).unwrap();
        match cli.cmd {
            Cmd::Settings {
                id,
                enabled,
                auto_start,
            } => {
                assert_eq!(id, "uptime");
                assert_eq!(enabled, None);
                assert_eq!(auto_start, Some(true));
            }
            _ => panic!("expected settings"),
        }
        assert!(Cli::try_parse_from(["machete", "settings", "uptime", "--enabled", "maybe"]).is_err());
    }
}
