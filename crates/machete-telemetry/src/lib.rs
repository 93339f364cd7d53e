//! Opt-in usage events written as JSON lines under the machete data directory.
//!
//! Nothing is recorded unless `MACHETE_TELEMETRY` is set to a truthy value. Lifecycle
//! events carry the tool id and the operation result as first-class fields so the
//! log can be grouped per tool without parsing the free-form properties.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

const QUEUE_DEPTH: usize = 256;
const DEFAULT_ROTATE_BYTES: u64 = 2 * 1024 * 1024;
const DEFAULT_GENERATIONS: usize = 2;
const EVENTS_FILE_NAME: &str = "events.jsonl";

const TOOL_KEY: &str = "tool_id";
const RESULT_KEY: &str = "result";

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub enabled: bool,
    /// Events land in `<dir>/telemetry/<app_name>/events.jsonl`.
    pub dir: PathBuf,
    pub rotate_bytes: u64,
    /// Rotated files kept next to the live one (`events.1.jsonl`, `events.2.jsonl`, ...).
    pub generations: usize,
}

impl RecorderConfig {
    pub fn new(app_name: &'static str, app_version: &'static str, dir: PathBuf) -> Self {
        RecorderConfig {
            app_name,
            app_version,
            enabled: false,
            dir,
            rotate_bytes: DEFAULT_ROTATE_BYTES,
            generations: DEFAULT_GENERATIONS,
        }
    }
}

/// Process-wide event recorder. Events are queued and appended by a writer thread,
/// so recording never blocks an operation; a full queue drops the event.
pub struct Recorder {
    app: &'static str,
    version: &'static str,
    session: String,
    enabled: AtomicBool,
    queue: SyncSender<Record>,
}

#[derive(Debug, Serialize)]
struct Record {
    at_unix_millis: i64,
    kind: String,
    app: &'static str,
    version: &'static str,
    session: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    props: BTreeMap<String, String>,
}

static RECORDER: OnceLock<Arc<Recorder>> = OnceLock::new();

/// Installs the global recorder. A second call only updates the enabled flag.
pub fn init(config: RecorderConfig) -> Arc<Recorder> {
    if let Some(existing) = RECORDER.get() {
        existing.enabled.store(config.enabled, Ordering::Relaxed);
        return Arc::clone(existing);
    }

    let (queue, pending) = sync_channel(QUEUE_DEPTH);
    let recorder = Arc::new(Recorder {
        app: config.app_name,
        version: config.app_version,
        session: session_id(),
        enabled: AtomicBool::new(config.enabled),
        queue,
    });
    let sink = EventFile {
        path: config
            .dir
            .join("telemetry")
            .join(config.app_name)
            .join(EVENTS_FILE_NAME),
        rotate_bytes: config.rotate_bytes,
        generations: config.generations,
    };
    spawn_writer(sink, pending);

    let _ = RECORDER.set(Arc::clone(&recorder));
    recorder
}

/// [`init`] with the enabled flag taken from `MACHETE_TELEMETRY`.
pub fn init_with_env(
    app_name: &'static str,
    app_version: &'static str,
    data_dir: PathBuf,
) -> Arc<Recorder> {
    let mut config = RecorderConfig::new(app_name, app_version, data_dir);
    config.enabled = truthy(std::env::var("MACHETE_TELEMETRY").ok().as_deref());
    init(config)
}

pub fn set_usage_enabled(enabled: bool) {
    if let Some(recorder) = RECORDER.get() {
        recorder.enabled.store(enabled, Ordering::Relaxed);
    }
}

/// Records an event when a recorder is installed and enabled; otherwise does nothing.
///
/// `tool_id` and `result` properties are lifted into their own fields.
pub fn event(kind: &str, properties: &[(&str, &str)]) {
    if let Some(recorder) = RECORDER.get() {
        recorder.record(kind, properties);
    }
}

impl Recorder {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn record(&self, kind: &str, properties: &[(&str, &str)]) {
        if !self.is_enabled() {
            return;
        }
        let mut record = Record::new(kind, properties);
        record.app = self.app;
        record.version = self.version;
        record.session = self.session.clone();
        let _ = self.queue.try_send(record);
    }
}

impl Record {
    fn new(kind: &str, properties: &[(&str, &str)]) -> Self {
        let mut tool = None;
        let mut result = None;
        let mut props = BTreeMap::new();
        for (key, value) in properties {
            match key.trim() {
                "" => {}
                TOOL_KEY => tool = Some(value.to_string()),
                RESULT_KEY => result = Some(value.to_string()),
                key => {
                    props.insert(key.to_string(), value.to_string());
                }
            }
        }
        Record {
            at_unix_millis: now_millis(),
            kind: kind.to_string(),
            app: "",
            version: "",
            session: String::new(),
            tool,
            result,
            props,
        }
    }
}

struct EventFile {
    path: PathBuf,
    rotate_bytes: u64,
    generations: usize,
}

impl EventFile {
    fn append(&self, record: &Record) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.rotate()?;
        let line = serde_json::to_string(record).map_err(io::Error::other)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")
    }

    /// Shifts `events.N.jsonl` up by one, dropping the oldest, once the live file is full.
    fn rotate(&self) -> io::Result<()> {
        let full = fs::metadata(&self.path).is_ok_and(|meta| meta.len() >= self.rotate_bytes);
        if !full {
            return Ok(());
        }
        if self.generations == 0 {
            return fs::remove_file(&self.path);
        }
        let _ = fs::remove_file(self.generation(self.generations));
        for n in (1..self.generations).rev() {
            let from = self.generation(n);
            if from.exists() {
                fs::rename(&from, self.generation(n + 1))?;
            }
        }
        fs::rename(&self.path, self.generation(1))
    }

    fn generation(&self, n: usize) -> PathBuf {
        self.path.with_extension(format!("{n}.jsonl"))
    }
}

fn spawn_writer(sink: EventFile, pending: Receiver<Record>) {
    std::thread::spawn(move || {
        while let Ok(record) = pending.recv() {
            if let Err(err) = sink.append(&record) {
                eprintln!("telemetry: cannot write {}: {err}", display(&sink.path));
            }
        }
    });
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn truthy(value: Option<&str>) -> bool {
    value.is_some_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn session_id() -> String {
    format!("{:x}-{:x}", now_millis(), std::process::id())
}
