use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::descriptor::{VolumeMapping, VolumeMode};
use crate::error::{Result, ToolError};

/// A host path that passed the sandbox checks, ready to hand to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedMount {
    pub host: PathBuf,
    pub container: String,
    pub mode: VolumeMode,
}

impl ResolvedMount {
    pub fn bind_arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host.display(),
            self.container,
            self.mode.as_str()
        )
    }
}

/// Keeps fetched sources and bind mounts under the sandbox root or an allow-listed prefix.
#[derive(Debug, Clone)]
pub struct SandboxGuard {
    root: PathBuf,
    allowed: Vec<PathBuf>,
}

impl SandboxGuard {
    pub fn new(root: &Path, allowed_prefixes: &[PathBuf]) -> Result<Self> {
        fs::create_dir_all(root).map_err(|err| ToolError::io("create sandbox root", root, err))?;
        let root = root
            .canonicalize()
            .map_err(|err| ToolError::io("resolve sandbox root", root, err))?;
        let mut allowed = Vec::new();
        for prefix in allowed_prefixes {
            let expanded = machete_util::expand_user(&prefix.to_string_lossy());
            if !expanded.is_absolute() {
                warn!("ignoring relative volume allow-list entry {}", prefix.display());
                continue;
            }
            let Some(normalized) = normalize_lexically(&expanded) else {
                warn!("ignoring volume allow-list entry {}", prefix.display());
                continue;
            };
            allowed.push(resolve_existing_prefix(&normalized).unwrap_or(normalized));
        }
        Ok(SandboxGuard { root, allowed })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn allowed_prefixes(&self) -> &[PathBuf] {
        &self.allowed
    }

    pub fn tool_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Resolves one mapping; relative directories are created on demand.
    pub fn resolve(&self, id: &str, mapping: &VolumeMapping) -> Result<ResolvedMount> {
        let mount = self.check(id, mapping)?;
        self.materialize(id, &mount)?;
        Ok(mount)
    }

    /// Resolves every mapping or none: nothing is created unless all mappings pass.
    pub fn resolve_all(&self, id: &str, mappings: &[VolumeMapping]) -> Result<Vec<ResolvedMount>> {
        let mounts = mappings
            .iter()
            .map(|mapping| self.check(id, mapping))
            .collect::<Result<Vec<_>>>()?;
        for mount in &mounts {
            self.materialize(id, mount)?;
        }
        Ok(mounts)
    }

    fn check(&self, id: &str, mapping: &VolumeMapping) -> Result<ResolvedMount> {
        let container = check_container_path(&mapping.container)?;
        let declared = mapping.host.trim();
        let tool_dir = self.tool_dir(id);

        let host = if declared == "." || declared.starts_with("./") {
            let joined = tool_dir.join(declared.trim_start_matches("./"));
            let normalized = normalize_lexically(&joined).ok_or_else(|| escape(declared))?;
            if !normalized.starts_with(&tool_dir) {
                return Err(escape(declared));
            }
            let effective = resolve_existing_prefix(&normalized).ok_or_else(|| escape(declared))?;
            if !effective.starts_with(&tool_dir) {
                return Err(ToolError::Security(format!(
                    "host path '{declared}' escapes {} through a symlink",
                    tool_dir.display()
                )));
            }
            effective
        } else {
            let expanded = machete_util::expand_user(declared);
            if !expanded.is_absolute() {
                return Err(ToolError::Security(format!(
                    "host path '{declared}' must be absolute or start with './'"
                )));
            }
            let normalized = normalize_lexically(&expanded).ok_or_else(|| escape(declared))?;
            let effective = resolve_existing_prefix(&normalized).ok_or_else(|| escape(declared))?;
            if !self.permits_absolute(id, &effective) {
                return Err(ToolError::Security(format!(
                    "host path '{declared}' resolves to {} outside the allowed roots",
                    effective.display()
                )));
            }
            effective
        };

        Ok(ResolvedMount {
            host,
            container,
            mode: mapping.mode,
        })
    }

    fn permits_absolute(&self, id: &str, path: &Path) -> bool {
        if path.starts_with(&self.root) {
            return path.starts_with(self.tool_dir(id));
        }
        self.allowed.iter().any(|prefix| path.starts_with(prefix))
    }

    /// Creates a volume directory under the tool dir one component at a time,
    /// refusing any component that is a symlink or not a directory.
    fn materialize(&self, id: &str, mount: &ResolvedMount) -> Result<()> {
        let tool_dir = self.tool_dir(id);
        let Ok(relative) = mount.host.strip_prefix(&tool_dir) else {
            return Ok(());
        };
        fs::create_dir_all(&tool_dir)
            .map_err(|err| ToolError::io("create tool directory", &tool_dir, err))?;
        let mut current = tool_dir.clone();
        ensure_plain_dir(&current)?;
        for part in relative.components() {
            current.push(part);
            match fs::create_dir(&current) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(ToolError::io("create volume directory", &current, err)),
            }
            ensure_plain_dir(&current)?;
        }
        debug!("volume {} ready for {id}", mount.host.display());
        Ok(())
    }
}

fn ensure_plain_dir(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)
        .map_err(|err| ToolError::io("inspect volume directory", path, err))?;
    if meta.file_type().is_symlink() {
        return Err(ToolError::Security(format!(
            "volume path component {} is a symlink",
            path.display()
        )));
    }
    if !meta.is_dir() {
        return Err(ToolError::Security(format!(
            "volume path component {} is not a directory",
            path.display()
        )));
    }
    Ok(())
}

/// Resolves symlinks in the longest existing prefix of a normalized absolute path and
/// re-appends the components that do not exist yet. `None` when the existing prefix
/// cannot be resolved, such as a dangling symlink.
fn resolve_existing_prefix(path: &Path) -> Option<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut missing: Vec<OsString> = Vec::new();
    while fs::symlink_metadata(&existing).is_err() {
        missing.push(existing.file_name()?.to_os_string());
        if !existing.pop() {
            return None;
        }
    }
    let mut real = existing.canonicalize().ok()?;
    for part in missing.iter().rev() {
        real.push(part);
    }
    Some(real)
}

fn escape(declared: &str) -> ToolError {
    ToolError::Security(format!("host path '{declared}' escapes the sandbox"))
}

fn check_container_path(raw: &str) -> Result<String> {
    let path = Path::new(raw.trim());
    if !path.is_absolute() {
        return Err(ToolError::Security(format!(
            "container path '{raw}' must be absolute"
        )));
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(ToolError::Security(format!(
            "container path '{raw}' contains '..'"
        )));
    }
    if path == Path::new("/") {
        return Err(ToolError::Security("container path '/' is not allowed".into()));
    }
    Ok(raw.trim().to_string())
}

/// Folds `.` and `..` without touching the filesystem. `None` when `..` climbs past the root.
pub fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}
