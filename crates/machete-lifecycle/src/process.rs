use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::logs::{LogRelay, LogStream, LOG_CHANNEL_CAPACITY};

#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub(crate) status: ExitStatus,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        self.status.success()
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty.
    pub(crate) fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

#[derive(Debug)]
pub(crate) enum CommandError {
    Spawn { program: String, source: io::Error },
    TimedOut(Duration),
    Wait(io::Error),
}

impl CommandError {
    pub(crate) fn is_missing_binary(&self) -> bool {
        matches!(self, CommandError::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Spawn { program, source } => write!(f, "failed to run {program}: {source}"),
            CommandError::TimedOut(limit) => write!(f, "timed out after {}s", limit.as_secs()),
            CommandError::Wait(err) => write!(f, "failed to wait for process: {err}"),
        }
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

pub(crate) fn describe(cmd: &Command) -> String {
    let std = cmd.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().into_owned()];
    parts.extend(std.get_args().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Runs a command to completion, collecting its output. The child is killed on timeout.
pub(crate) async fn run_command(
    mut cmd: Command,
    limit: Duration,
) -> Result<CommandOutput, CommandError> {
    debug!("exec: {}", describe(&cmd));
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let program = program_name(&cmd);
    let child = cmd
        .spawn()
        .map_err(|source| CommandError::Spawn { program, source })?;
    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(err)) => Err(CommandError::Wait(err)),
        Err(_) => Err(CommandError::TimedOut(limit)),
    }
}

struct PipeLine {
    stream: LogStream,
    line: String,
}

async fn read_lines<R>(reader: R, stream: LogStream, tx: mpsc::Sender<PipeLine>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(PipeLine { stream, line }).await.is_err() {
            break;
        }
    }
}

/// Runs a command, relaying stdout and stderr line by line as they are produced.
///
/// Every line the process wrote before exiting is relayed, even if the relay's sink has
/// already gone away.
pub(crate) async fn run_streaming(
    mut cmd: Command,
    limit: Duration,
    relay: &mut LogRelay,
) -> Result<ExitStatus, CommandError> {
    debug!("exec (streaming): {}", describe(&cmd));
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let program = program_name(&cmd);
    let mut child = cmd
        .spawn()
        .map_err(|source| CommandError::Spawn { program, source })?;

    let (line_tx, mut line_rx) = mpsc::channel::<PipeLine>(LOG_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_lines(stdout, LogStream::Stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_lines(stderr, LogStream::Stderr, line_tx.clone()));
    }
    drop(line_tx);

    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);
    let mut status: Option<io::Result<ExitStatus>> = None;
    let mut pipes_open = true;

    loop {
        tokio::select! {
            line = line_rx.recv(), if pipes_open => {
                match line {
                    Some(line) => relay.push(line.stream, line.line).await,
                    None => pipes_open = false,
                }
            }
            result = child.wait(), if status.is_none() => {
                status = Some(result);
            }
            _ = &mut deadline => {
                warn!("process exceeded {}s; killing", limit.as_secs());
                let _ = child.kill().await;
                while let Ok(line) = line_rx.try_recv() {
                    relay.push(line.stream, line.line).await;
                }
                relay.system(format!("timed out after {}s", limit.as_secs())).await;
                return Err(CommandError::TimedOut(limit));
            }
        }
        if !pipes_open && status.is_some() {
            break;
        }
    }

    match status {
        Some(Ok(status)) => Ok(status),
        Some(Err(err)) => Err(CommandError::Wait(err)),
        None => Err(CommandError::Wait(io::Error::other("missing exit status"))),
    }
}
