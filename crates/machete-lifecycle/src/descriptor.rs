use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ToolError};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HEALTH_CHECK: &str = "/health";
pub const DEFAULT_ICON: &str = "wrench";
pub const DEFAULT_COLOR: &str = "#4a5568";
pub const DEFAULT_VERSION: &str = "0.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Monitoring,
    Security,
    Development,
    Networking,
    Data,
    Productivity,
    Media,
    Utility,
    #[default]
    Other,
}

impl ToolCategory {
    pub const ALL: [ToolCategory; 9] = [
        ToolCategory::Monitoring,
        ToolCategory::Security,
        ToolCategory::Development,
        ToolCategory::Networking,
        ToolCategory::Data,
        ToolCategory::Productivity,
        ToolCategory::Media,
        ToolCategory::Utility,
        ToolCategory::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolCategory::Monitoring => "monitoring",
            ToolCategory::Security => "security",
            ToolCategory::Development => "development",
            ToolCategory::Networking => "networking",
            ToolCategory::Data => "data",
            ToolCategory::Productivity => "productivity",
            ToolCategory::Media => "media",
            ToolCategory::Utility => "utility",
            ToolCategory::Other => "other",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|category| category.as_str() == label)
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    #[default]
    SingleContainer,
    MultiService,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildMode::SingleContainer => "single-container",
            BuildMode::MultiService => "multi-service",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestFormat {
    Canonical,
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    /// Parses `KEY=value`; a bare `KEY` yields an empty value.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (name, value) = raw.split_once('=').unwrap_or((raw, ""));
        let name = name.trim();
        if name.is_empty()
            || !name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-')
        {
            return Err(ToolError::InvalidArgument(format!(
                "invalid environment entry '{raw}'"
            )));
        }
        Ok(EnvVar {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    pub fn to_arg(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeMode {
    #[default]
    Rw,
    Ro,
}

impl VolumeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeMode::Rw => "rw",
            VolumeMode::Ro => "ro",
        }
    }
}

/// A requested bind mount, exactly as declared. Resolution happens in the sandbox guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub host: String,
    pub container: String,
    #[serde(default)]
    pub mode: VolumeMode,
}

impl VolumeMapping {
    /// Parses `host:container[:rw|ro]`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let parts: Vec<&str> = raw.split(':').collect();
        let (host, container, mode) = match parts.as_slice() {
            [host, container] => (*host, *container, VolumeMode::Rw),
            [host, container, "rw"] => (*host, *container, VolumeMode::Rw),
            [host, container, "ro"] => (*host, *container, VolumeMode::Ro),
            _ => {
                return Err(ToolError::InvalidArgument(format!(
                    "invalid volume mapping '{raw}', expected host:container[:rw|ro]"
                )))
            }
        };
        if host.is_empty() || container.is_empty() {
            return Err(ToolError::InvalidArgument(format!(
                "invalid volume mapping '{raw}', empty path"
            )));
        }
        Ok(VolumeMapping {
            host: host.to_string(),
            container: container.to_string(),
            mode,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiHints {
    pub icon: String,
    pub color: String,
    #[serde(default)]
    pub routes: Vec<String>,
}

impl Default for UiHints {
    fn default() -> Self {
        UiHints {
            icon: DEFAULT_ICON.to_string(),
            color: DEFAULT_COLOR.to_string(),
            routes: Vec::new(),
        }
    }
}

/// Where to build from, relative to the source tree root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSettings {
    pub context: PathBuf,
    pub dockerfile: Option<PathBuf>,
    pub compose_file: Option<PathBuf>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        BuildSettings {
            context: PathBuf::from("."),
            dockerfile: None,
            compose_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: Option<String>,
    pub license: Option<String>,
    pub category: ToolCategory,
    pub port: u16,
    pub health_check: String,
    pub ui: UiHints,
    pub environment: Vec<EnvVar>,
    pub volumes: Vec<VolumeMapping>,
    pub dependencies: Vec<String>,
    pub build_mode: BuildMode,
    pub build: BuildSettings,
    pub manifest_format: ManifestFormat,
    pub manifest_sha256: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ToolDescriptor {
    /// Every optional field at its documented default.
    pub fn with_defaults(id: &str, manifest_format: ManifestFormat) -> Self {
        ToolDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            version: DEFAULT_VERSION.to_string(),
            description: String::new(),
            author: None,
            license: None,
            category: ToolCategory::default(),
            port: DEFAULT_PORT,
            health_check: DEFAULT_HEALTH_CHECK.to_string(),
            ui: UiHints::default(),
            environment: Vec::new(),
            volumes: Vec::new(),
            dependencies: Vec::new(),
            build_mode: BuildMode::default(),
            build: BuildSettings::default(),
            manifest_format,
            manifest_sha256: String::new(),
            warnings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_mapping_parses_modes() {
        let rw = VolumeMapping::parse("./data:/app/data").unwrap();
        assert_eq!(rw.host, "./data");
        assert_eq!(rw.container, "/app/data");
        assert_eq!(rw.mode, VolumeMode::Rw);

        let ro = VolumeMapping::parse("/srv/shared:/shared:ro").unwrap();
        assert_eq!(ro.mode, VolumeMode::Ro);

        assert!(VolumeMapping::parse("/a:/b:rx").is_err());
        assert!(VolumeMapping::parse("only-one").is_err());
        assert!(VolumeMapping::parse(":/b").is_err());
    }

    #[test]
    fn env_var_parsing() {
        let var = EnvVar::parse("LOG_LEVEL=debug=verbose").unwrap();
        assert_eq!(var.name, "LOG_LEVEL");
        assert_eq!(var.value, "debug=verbose");
        assert_eq!(EnvVar::parse("FLAG").unwrap().value, "");
        assert!(EnvVar::parse("=value").is_err());
        assert!(EnvVar::parse("BAD KEY=1").is_err());
    }

    #[test]
    fn category_labels_are_case_insensitive() {
        assert_eq!(ToolCategory::from_label("Monitoring"), Some(ToolCategory::Monitoring));
        assert_eq!(ToolCategory::from_label("games"), None);
    }
}
