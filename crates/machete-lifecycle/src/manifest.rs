use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::descriptor::{
    BuildMode, EnvVar, ManifestFormat, ToolCategory, ToolDescriptor, VolumeMapping,
    DEFAULT_HEALTH_CHECK,
};
use crate::error::{ManifestErrorReason, Result, ToolError};
use crate::hashing::sha256_hex;
use crate::validate::{find_first, COMPOSE_FILE_CANDIDATES, README_CANDIDATES};

pub const CANONICAL_MANIFEST_FILES: &[&str] = &["machete.yml", "machete.yaml"];
pub const LEGACY_MANIFEST_FILE: &str = "machete.json";
pub const SUPPORTED_MANIFEST_VERSION: u64 = 1;

const DESCRIPTION_LIMIT: usize = 280;

/// Fields a strategy pulled out of a manifest, before defaults are applied.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ManifestFields {
    pub manifest_version: Option<u64>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub category: Option<String>,
    pub port: Option<u16>,
    pub health_check: Option<String>,
    pub environment: Vec<EnvVar>,
    pub volumes: Vec<VolumeMapping>,
    pub dependencies: Vec<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub routes: Vec<String>,
    pub build_context: Option<String>,
    pub dockerfile: Option<String>,
    pub compose_file: Option<String>,
}

#[derive(Debug)]
pub enum ManifestProbe {
    Absent,
    Parsed {
        path: PathBuf,
        fields: Box<ManifestFields>,
        sha256: String,
    },
    Invalid(ToolError),
}

pub trait ManifestStrategy: Send + Sync {
    fn format(&self) -> ManifestFormat;
    fn probe(&self, root: &Path) -> ManifestProbe;
}

/// `machete.yml` / `machete.yaml` with nested `machete:` and `ui:` sections.
pub struct CanonicalYamlStrategy;

/// Flat `machete.json` carrying a subset of the canonical fields.
pub struct LegacyJsonStrategy;

pub struct ManifestResolver {
    strategies: Vec<Box<dyn ManifestStrategy>>,
}

impl Default for ManifestResolver {
    fn default() -> Self {
        ManifestResolver::new(vec![
            Box::new(CanonicalYamlStrategy),
            Box::new(LegacyJsonStrategy),
        ])
    }
}

impl ManifestResolver {
    pub fn new(strategies: Vec<Box<dyn ManifestStrategy>>) -> Self {
        ManifestResolver { strategies }
    }

    /// Tries each strategy in order. The first manifest found wins, even when it fails to parse.
    pub fn resolve(&self, id: &str, root: &Path) -> Result<ToolDescriptor> {
        for strategy in &self.strategies {
            match strategy.probe(root) {
                ManifestProbe::Absent => continue,
                ManifestProbe::Invalid(err) => return Err(err),
                ManifestProbe::Parsed {
                    path,
                    fields,
                    sha256,
                } => {
                    debug!("resolved manifest {} for {id}", path.display());
                    let mut descriptor = fields.into_descriptor(id, strategy.format(), root)?;
                    descriptor.manifest_sha256 = sha256;
                    return Ok(descriptor);
                }
            }
        }
        let expected: Vec<&str> = CANONICAL_MANIFEST_FILES
            .iter()
            .copied()
            .chain(std::iter::once(LEGACY_MANIFEST_FILE))
            .collect();
        Err(ToolError::manifest(
            ManifestErrorReason::Missing,
            format!(
                "no manifest in {} (looked for {})",
                root.display(),
                expected.join(", ")
            ),
        ))
    }
}

impl ManifestFields {
    fn into_descriptor(
        self,
        id: &str,
        format: ManifestFormat,
        root: &Path,
    ) -> Result<ToolDescriptor> {
        if let Some(version) = self.manifest_version {
            if version == 0 || version > SUPPORTED_MANIFEST_VERSION {
                return Err(ToolError::manifest(
                    ManifestErrorReason::UnsupportedVersion,
                    format!(
                        "manifest_version {version} is not supported (max {SUPPORTED_MANIFEST_VERSION})"
                    ),
                ));
            }
        }

        let mut descriptor = ToolDescriptor::with_defaults(id, format);
        if let Some(name) = non_empty(self.name) {
            descriptor.name = name;
        }
        if let Some(version) = non_empty(self.version) {
            descriptor.version = version;
        }
        descriptor.description = non_empty(self.description)
            .or_else(|| readme_summary(root))
            .unwrap_or_default();
        descriptor.author = non_empty(self.author);
        descriptor.license = non_empty(self.license);

        if let Some(label) = non_empty(self.category) {
            match ToolCategory::from_label(&label) {
                Some(category) => descriptor.category = category,
                None => {
                    warn!("unknown category '{label}' for {id}; using 'other'");
                    descriptor
                        .warnings
                        .push(format!("unknown category '{label}', using 'other'"));
                }
            }
        }
        if let Some(port) = self.port {
            descriptor.port = port;
        }
        if let Some(path) = non_empty(self.health_check) {
            descriptor.health_check = normalize_health_path(&path);
        }
        if let Some(icon) = non_empty(self.icon) {
            descriptor.ui.icon = icon;
        }
        if let Some(color) = non_empty(self.color) {
            descriptor.ui.color = color;
        }
        descriptor.ui.routes = self.routes;
        descriptor.environment = self.environment;
        descriptor.volumes = self.volumes;
        descriptor.dependencies = self.dependencies;

        if let Some(context) = non_empty(self.build_context) {
            descriptor.build.context = PathBuf::from(context);
        }
        descriptor.build.dockerfile = non_empty(self.dockerfile).map(PathBuf::from);
        descriptor.build.compose_file = non_empty(self.compose_file)
            .map(PathBuf::from)
            .or_else(|| find_first(root, COMPOSE_FILE_CANDIDATES));
        if descriptor.build.compose_file.is_some() {
            descriptor.build_mode = BuildMode::MultiService;
        }
        Ok(descriptor)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_health_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else if path.is_empty() {
        DEFAULT_HEALTH_CHECK.to_string()
    } else {
        format!("/{path}")
    }
}

/// First prose paragraph of the README, skipping headings and badge lines.
fn readme_summary(root: &Path) -> Option<String> {
    let readme = find_first(root, README_CANDIDATES)?;
    let text = fs::read_to_string(root.join(readme)).ok()?;
    let mut paragraph = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            if paragraph.is_empty() {
                continue;
            }
            break;
        }
        if line.starts_with('#')
            || line.starts_with("![")
            || line.starts_with("[![")
            || line.starts_with("===")
            || line.starts_with("---")
            || line.starts_with('<')
        {
            if paragraph.is_empty() {
                continue;
            }
            break;
        }
        paragraph.push(line);
    }
    if paragraph.is_empty() {
        return None;
    }
    let joined = paragraph.join(" ");
    if joined.chars().count() > DESCRIPTION_LIMIT {
        let cut: String = joined.chars().take(DESCRIPTION_LIMIT).collect();
        Some(format!("{}...", cut.trim_end()))
    } else {
        Some(joined)
    }
}

fn read_manifest(path: &Path) -> std::result::Result<(String, String), ToolError> {
    let bytes = fs::read(path).map_err(|err| {
        ToolError::manifest(
            ManifestErrorReason::Malformed,
            format!("{}: {err}", path.display()),
        )
    })?;
    let sha256 = sha256_hex(&bytes);
    let text = String::from_utf8(bytes).map_err(|err| {
        ToolError::manifest(
            ManifestErrorReason::Malformed,
            format!("{}: not valid UTF-8: {err}", path.display()),
        )
    })?;
    Ok((text, sha256))
}

fn malformed(path: &Path, detail: impl std::fmt::Display) -> ToolError {
    ToolError::manifest(
        ManifestErrorReason::Malformed,
        format!("{}: {detail}", path.display()),
    )
}

/// Any scalar a hand-written manifest might use where a string is expected.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Scalar::Text(text) => text,
            Scalar::Int(value) => value.to_string(),
            Scalar::Float(value) if value.fract() == 0.0 => format!("{value:.1}"),
            Scalar::Float(value) => value.to_string(),
            Scalar::Bool(value) => value.to_string(),
        }
    }

    fn into_port(self) -> std::result::Result<u16, String> {
        let parsed = match &self {
            Scalar::Int(value) => u16::try_from(*value).ok(),
            Scalar::Text(text) => text.trim().parse::<u16>().ok(),
            _ => None,
        };
        match parsed {
            Some(port) if port > 0 => Ok(port),
            _ => Err(format!(
                "port must be an integer between 1 and 65535, got '{}'",
                self.into_text()
            )),
        }
    }

    fn into_version(self) -> std::result::Result<u64, String> {
        match self {
            Scalar::Int(value) if value >= 0 => Ok(value as u64),
            Scalar::Text(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|_| format!("manifest_version must be an integer, got '{text}'")),
            other => Err(format!(
                "manifest_version must be an integer, got '{}'",
                other.into_text()
            )),
        }
    }
}

fn as_text(value: Option<Scalar>) -> Option<String> {
    value.map(Scalar::into_text)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnvironmentField {
    List(Vec<String>),
    Map(BTreeMap<String, Option<Scalar>>),
}

impl EnvironmentField {
    fn into_vars(self) -> Result<Vec<EnvVar>> {
        match self {
            EnvironmentField::List(entries) => entries.iter().map(|raw| EnvVar::parse(raw)).collect(),
            EnvironmentField::Map(entries) => entries
                .into_iter()
                .map(|(name, value)| {
                    let value = value.map(Scalar::into_text).unwrap_or_default();
                    EnvVar::parse(&format!("{name}={value}"))
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CanonicalDocument {
    manifest_version: Option<Scalar>,
    name: Option<Scalar>,
    version: Option<Scalar>,
    description: Option<Scalar>,
    author: Option<Scalar>,
    license: Option<Scalar>,
    machete: Option<MacheteSection>,
    ui: Option<UiSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MacheteSection {
    category: Option<Scalar>,
    port: Option<Scalar>,
    health_check: Option<Scalar>,
    environment: Option<EnvironmentField>,
    volumes: Vec<String>,
    dependencies: Vec<Scalar>,
    build: Option<BuildSection>,
    compose_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BuildSection {
    context: Option<String>,
    dockerfile: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UiSection {
    icon: Option<Scalar>,
    color: Option<Scalar>,
    routes: Vec<String>,
}

impl ManifestStrategy for CanonicalYamlStrategy {
    fn format(&self) -> ManifestFormat {
        ManifestFormat::Canonical
    }

    fn probe(&self, root: &Path) -> ManifestProbe {
        let Some(relative) = find_first(root, CANONICAL_MANIFEST_FILES) else {
            return ManifestProbe::Absent;
        };
        let path = root.join(relative);
        let parsed = read_manifest(&path).and_then(|(text, sha256)| {
            parse_canonical(&path, &text).map(|fields| (fields, sha256))
        });
        match parsed {
            Ok((fields, sha256)) => ManifestProbe::Parsed {
                path,
                fields: Box::new(fields),
                sha256,
            },
            Err(err) => ManifestProbe::Invalid(err),
        }
    }
}

pub fn parse_canonical(path: &Path, text: &str) -> Result<ManifestFields> {
    if text.trim().is_empty() {
        return Ok(ManifestFields::default());
    }
    let doc: CanonicalDocument =
        serde_yaml::from_str(text).map_err(|err| malformed(path, err))?;

    let mut fields = ManifestFields {
        manifest_version: doc
            .manifest_version
            .map(Scalar::into_version)
            .transpose()
            .map_err(|err| malformed(path, err))?,
        name: as_text(doc.name),
        version: as_text(doc.version),
        description: as_text(doc.description),
        author: as_text(doc.author),
        license: as_text(doc.license),
        ..ManifestFields::default()
    };

    if let Some(section) = doc.machete {
        fields.category = as_text(section.category);
        fields.port = section
            .port
            .map(Scalar::into_port)
            .transpose()
            .map_err(|err| malformed(path, err))?;
        fields.health_check = as_text(section.health_check);
        if let Some(environment) = section.environment {
            fields.environment = environment
                .into_vars()
                .map_err(|err| malformed(path, err))?;
        }
        fields.volumes = section
            .volumes
            .iter()
            .map(|raw| VolumeMapping::parse(raw))
            .collect::<Result<_>>()
            .map_err(|err| malformed(path, err))?;
        fields.dependencies = section
            .dependencies
            .into_iter()
            .map(Scalar::into_text)
            .filter(|dep| !dep.trim().is_empty())
            .collect();
        if let Some(build) = section.build {
            fields.build_context = build.context;
            fields.dockerfile = build.dockerfile;
        }
        fields.compose_file = section.compose_file;
    }

    if let Some(ui) = doc.ui {
        fields.icon = as_text(ui.icon);
        fields.color = as_text(ui.color);
        fields.routes = ui.routes;
    }
    Ok(fields)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyDocument {
    name: Option<Scalar>,
    version: Option<Scalar>,
    description: Option<Scalar>,
    author: Option<Scalar>,
    license: Option<Scalar>,
    category: Option<Scalar>,
    port: Option<Scalar>,
    health_check: Option<Scalar>,
    icon: Option<Scalar>,
    color: Option<Scalar>,
}

impl ManifestStrategy for LegacyJsonStrategy {
    fn format(&self) -> ManifestFormat {
        ManifestFormat::Legacy
    }

    fn probe(&self, root: &Path) -> ManifestProbe {
        let path = root.join(LEGACY_MANIFEST_FILE);
        if !path.is_file() {
            return ManifestProbe::Absent;
        }
        let parsed = read_manifest(&path)
            .and_then(|(text, sha256)| parse_legacy(&path, &text).map(|fields| (fields, sha256)));
        match parsed {
            Ok((fields, sha256)) => ManifestProbe::Parsed {
                path,
                fields: Box::new(fields),
                sha256,
            },
            Err(err) => ManifestProbe::Invalid(err),
        }
    }
}

pub fn parse_legacy(path: &Path, text: &str) -> Result<ManifestFields> {
    let doc: LegacyDocument = serde_json::from_str(text).map_err(|err| malformed(path, err))?;
    Ok(ManifestFields {
        name: as_text(doc.name),
        version: as_text(doc.version),
        description: as_text(doc.description),
        author: as_text(doc.author),
        license: as_text(doc.license),
        category: as_text(doc.category),
        port: doc
            .port
            .map(Scalar::into_port)
            .transpose()
            .map_err(|err| malformed(path, err))?,
        health_check: as_text(doc.health_check),
        icon: as_text(doc.icon),
        color: as_text(doc.color),
        ..ManifestFields::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_coercions() {
        assert_eq!(Scalar::Float(1.0).into_text(), "1.0");
        assert_eq!(Scalar::Float(2.5).into_text(), "2.5");
        assert_eq!(Scalar::Int(3).into_text(), "3");
        assert_eq!(Scalar::Text("9090".into()).into_port(), Ok(9090));
        assert!(Scalar::Int(0).into_port().is_err());
        assert!(Scalar::Int(70000).into_port().is_err());
        assert!(Scalar::Bool(true).into_port().is_err());
    }

    #[test]
    fn health_paths_gain_leading_slash() {
        assert_eq!(normalize_health_path("status"), "/status");
        assert_eq!(normalize_health_path("/ready"), "/ready");
    }

    #[test]
    fn readme_summary_skips_headings_and_badges() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("README.md"),
            "# Uptime\n\n[![ci](x)](y)\n\nWatches endpoints\nand alerts.\n\nMore text.\n",
        )
        .unwrap();
        assert_eq!(
            readme_summary(dir.path()).as_deref(),
            Some("Watches endpoints and alerts.")
        );
    }

    #[test]
    fn empty_canonical_manifest_is_all_defaults() {
        let fields = parse_canonical(Path::new("machete.yml"), "  \n").unwrap();
        assert_eq!(fields, ManifestFields::default());
    }
}
