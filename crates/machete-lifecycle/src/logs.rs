use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const RECENT_LOG_LIMIT: usize = 200;
pub const LOG_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
            LogStream::System => "machete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub seq: u64,
    pub stream: LogStream,
    pub line: String,
}

/// Consumer side of a build or clone; lines arrive in the order the process wrote them.
pub type LogSink = mpsc::Sender<LogLine>;

/// Forwards lines to an optional sink while keeping the most recent ones.
///
/// A sink that goes away mid-stream stops receiving lines, but the tail is still recorded
/// so the tool record keeps the end of the output.
pub struct LogRelay {
    sink: Option<LogSink>,
    recent: VecDeque<String>,
    limit: usize,
    next_seq: u64,
    sink_closed: bool,
}

impl LogRelay {
    pub fn new(sink: Option<LogSink>, limit: usize) -> Self {
        LogRelay {
            sink,
            recent: VecDeque::with_capacity(limit.min(RECENT_LOG_LIMIT)),
            limit: limit.max(1),
            next_seq: 0,
            sink_closed: false,
        }
    }

    pub fn detached() -> Self {
        LogRelay::new(None, RECENT_LOG_LIMIT)
    }

    pub async fn push(&mut self, stream: LogStream, line: impl Into<String>) {
        let line = line.into();
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if self.recent.len() >= self.limit {
            self.recent.pop_front();
        }
        self.recent.push_back(match stream {
            LogStream::System => format!("[{stream}] {line}"),
            _ => line.clone(),
        });

        let seq = self.next_seq;
        self.next_seq += 1;
        if self.sink_closed {
            return;
        }
        if let Some(sink) = &self.sink {
            if sink.send(LogLine { seq, stream, line }).await.is_err() {
                self.sink_closed = true;
            }
        }
    }

    pub async fn system(&mut self, line: impl Into<String>) {
        self.push(LogStream::System, line).await;
    }

    pub fn line_count(&self) -> u64 {
        self.next_seq
    }

    pub fn sink_closed(&self) -> bool {
        self.sink_closed
    }

    pub fn recent(&self) -> Vec<String> {
        self.recent.iter().cloned().collect()
    }

    /// Last `count` recorded lines, oldest first.
    pub fn tail(&self, count: usize) -> Vec<String> {
        let skip = self.recent.len().saturating_sub(count);
        self.recent.iter().skip(skip).cloned().collect()
    }
}
