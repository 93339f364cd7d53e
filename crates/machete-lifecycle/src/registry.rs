use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use machete_util::{now_millis, write_json_atomic};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::descriptor::{BuildMode, ToolCategory, ToolDescriptor};
use crate::error::{ErrorDetail, Result, ToolError};
use crate::state::LifecycleState;

const REGISTRY_FORMAT_VERSION: u32 = 1;

/// The persisted record for one tool. Only the lifecycle controller writes these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    pub descriptor: Option<ToolDescriptor>,
    pub source_url: String,
    pub source_ref: Option<String>,
    pub commit: Option<String>,
    pub source_path: PathBuf,
    pub image: Option<String>,
    pub container_name: Option<String>,
    pub state: LifecycleState,
    pub created_at_unix_millis: i64,
    pub updated_at_unix_millis: i64,
    pub last_error: Option<ErrorDetail>,
    #[serde(default)]
    pub build_log: Vec<String>,
    pub validation_score: Option<u8>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// A disabled tool keeps its record and image but refuses to start.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Started by [`recover`](crate::LifecycleController::recover) when built or stopped.
    #[serde(default)]
    pub auto_start: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub category: ToolCategory,
    pub state: LifecycleState,
    pub port: Option<u16>,
    pub build_mode: Option<BuildMode>,
    pub updated_at_unix_millis: i64,
    pub has_error: bool,
    pub enabled: bool,
    pub auto_start: bool,
}

impl Tool {
    pub fn pending(
        id: &str,
        source_url: &str,
        source_ref: Option<String>,
        source_path: PathBuf,
    ) -> Self {
        let now = now_millis();
        Tool {
            id: id.to_string(),
            descriptor: None,
            source_url: source_url.to_string(),
            source_ref,
            commit: None,
            source_path,
            image: None,
            container_name: None,
            state: LifecycleState::Pending,
            created_at_unix_millis: now,
            updated_at_unix_millis: now,
            last_error: None,
            build_log: Vec::new(),
            validation_score: None,
            warnings: Vec::new(),
            enabled: true,
            auto_start: false,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at_unix_millis = now_millis().max(self.updated_at_unix_millis);
    }

    pub fn transition(&mut self, next: LifecycleState, operation: &'static str) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ToolError::InvalidState {
                id: self.id.clone(),
                operation,
                state: self.state,
            });
        }
        if self.state != next {
            debug!("tool {} {} -> {}", self.id, self.state, next);
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    pub fn fail(&mut self, detail: ErrorDetail) {
        self.state = LifecycleState::Failed;
        self.last_error = Some(detail);
        self.touch();
    }

    pub fn record_error(&mut self, detail: ErrorDetail) {
        self.last_error = Some(detail);
        self.touch();
    }

    pub fn display_name(&self) -> &str {
        self.descriptor
            .as_ref()
            .map(|descriptor| descriptor.name.as_str())
            .unwrap_or(&self.id)
    }

    pub fn summary(&self) -> ToolSummary {
        let descriptor = self.descriptor.as_ref();
        ToolSummary {
            id: self.id.clone(),
            name: self.display_name().to_string(),
            version: descriptor
                .map(|d| d.version.clone())
                .unwrap_or_default(),
            category: descriptor.map(|d| d.category).unwrap_or_default(),
            state: self.state,
            port: descriptor.map(|d| d.port),
            build_mode: descriptor.map(|d| d.build_mode),
            updated_at_unix_millis: self.updated_at_unix_millis,
            has_error: self.last_error.is_some(),
            enabled: self.enabled,
            auto_start: self.auto_start,
        }
    }
}

/// Durable store of tool records keyed by id.
pub trait ToolRegistry: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Tool>>;
    fn put(&self, tool: &Tool) -> Result<()>;
    fn list(&self) -> Result<Vec<Tool>>;
    /// Returns whether a record was removed.
    fn delete(&self, id: &str) -> Result<bool>;

    fn list_by_state(&self, state: LifecycleState) -> Result<Vec<Tool>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|tool| tool.state == state)
            .collect())
    }

    fn health(&self) -> Result<usize> {
        self.list().map(|tools| tools.len())
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    tools: Mutex<BTreeMap<String, Tool>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Tool>>> {
        self.tools
            .lock()
            .map_err(|_| ToolError::Registry("in-memory registry lock poisoned".into()))
    }
}

impl ToolRegistry for MemoryRegistry {
    fn get(&self, id: &str) -> Result<Option<Tool>> {
        Ok(self.lock()?.get(id).cloned())
    }

    fn put(&self, tool: &Tool) -> Result<()> {
        self.lock()?.insert(tool.id.clone(), tool.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<Tool>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.lock()?.remove(id).is_some())
    }
}

#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
struct PersistedRegistry {
    version: u32,
    tools: Vec<Tool>,
}

/// One JSON document holding every record, guarded by an advisory lock file so
/// separate processes sharing the file see each other's writes.
pub struct JsonFileRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        let registry = JsonFileRegistry {
            path: path.to_path_buf(),
            lock_path: path.with_extension("lock"),
        };
        registry.with_lock(false, |_| Ok(()))?;
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn registry_error(&self, action: &str, err: impl std::fmt::Display) -> ToolError {
        ToolError::Registry(format!("{action} {}: {err}", self.path.display()))
    }

    fn lock_file(&self, exclusive: bool) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|err| self.registry_error("create directory for", err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|err| self.registry_error("open lock for", err))?;
        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|err| self.registry_error("lock", err))?;
        Ok(file)
    }

    fn load(&self) -> Result<BTreeMap<String, Tool>> {
        let data = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(self.registry_error("read", err)),
        };
        let persisted: PersistedRegistry =
            serde_json::from_slice(&data).map_err(|err| self.registry_error("parse", err))?;
        if persisted.version > REGISTRY_FORMAT_VERSION {
            return Err(self.registry_error(
                "load",
                format!("unsupported registry version {}", persisted.version),
            ));
        }
        Ok(persisted
            .tools
            .into_iter()
            .map(|tool| (tool.id.clone(), tool))
            .collect())
    }

    fn save(&self, tools: &BTreeMap<String, Tool>) -> Result<()> {
        let persisted = PersistedRegistry {
            version: REGISTRY_FORMAT_VERSION,
            tools: tools.values().cloned().collect(),
        };
        write_json_atomic(&self.path, &persisted).map_err(|err| self.registry_error("write", err))
    }

    fn with_lock<T>(
        &self,
        exclusive: bool,
        f: impl FnOnce(&mut BTreeMap<String, Tool>) -> Result<T>,
    ) -> Result<T> {
        let lock = self.lock_file(exclusive)?;
        let result = self.load().and_then(|mut tools| {
            let value = f(&mut tools)?;
            if exclusive {
                self.save(&tools)?;
            }
            Ok(value)
        });
        let _ = FileExt::unlock(&lock);
        result
    }
}

impl ToolRegistry for JsonFileRegistry {
    fn get(&self, id: &str) -> Result<Option<Tool>> {
        self.with_lock(false, |tools| Ok(tools.get(id).cloned()))
    }

    fn put(&self, tool: &Tool) -> Result<()> {
        self.with_lock(true, |tools| {
            tools.insert(tool.id.clone(), tool.clone());
            Ok(())
        })
    }

    fn list(&self) -> Result<Vec<Tool>> {
        self.with_lock(false, |tools| Ok(tools.values().cloned().collect()))
    }

    fn delete(&self, id: &str) -> Result<bool> {
        self.with_lock(true, |tools| Ok(tools.remove(id).is_some()))
    }
}
