use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::descriptor::BuildSettings;
use crate::error::{Result, ToolError};
use crate::manifest::{CANONICAL_MANIFEST_FILES, LEGACY_MANIFEST_FILE};

pub const DOCKERFILE_CANDIDATES: &[&str] = &["Dockerfile", "docker/Dockerfile", "build/Dockerfile"];
pub const COMPOSE_FILE_CANDIDATES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];
pub const README_CANDIDATES: &[&str] = &["README.md", "README.txt", "README.rst", "README", "readme.md"];
const LICENSE_CANDIDATES: &[&str] = &["LICENSE", "LICENSE.md", "LICENSE.txt", "COPYING"];

const REQUIRED_WEIGHT: usize = 70;
const OPTIONAL_WEIGHT: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequiredArtifact {
    BuildFile,
    Documentation,
}

impl RequiredArtifact {
    pub const ALL: [RequiredArtifact; 2] = [RequiredArtifact::BuildFile, RequiredArtifact::Documentation];

    pub fn as_str(self) -> &'static str {
        match self {
            RequiredArtifact::BuildFile => "buildFile",
            RequiredArtifact::Documentation => "documentation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OptionalArtifact {
    ComposeFile,
    Scripts,
    ConfigDir,
    Manifest,
    DockerIgnore,
    License,
}

impl OptionalArtifact {
    pub const ALL: [OptionalArtifact; 6] = [
        OptionalArtifact::ComposeFile,
        OptionalArtifact::Scripts,
        OptionalArtifact::ConfigDir,
        OptionalArtifact::Manifest,
        OptionalArtifact::DockerIgnore,
        OptionalArtifact::License,
    ];

    fn label(self) -> &'static str {
        match self {
            OptionalArtifact::ComposeFile => "multi-service definition (docker-compose.yml)",
            OptionalArtifact::Scripts => "scripts/ directory",
            OptionalArtifact::ConfigDir => "config/ directory",
            OptionalArtifact::Manifest => "machete.yml manifest",
            OptionalArtifact::DockerIgnore => ".dockerignore",
            OptionalArtifact::License => "LICENSE file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub score: u8,
    pub missing_required: Vec<RequiredArtifact>,
    pub present_optional: Vec<OptionalArtifact>,
    pub warnings: Vec<String>,
    pub dockerfile: Option<PathBuf>,
    pub compose_file: Option<PathBuf>,
    pub documentation: Option<PathBuf>,
}

impl ValidationReport {
    pub fn is_installable(&self) -> bool {
        self.missing_required.is_empty()
    }

    pub fn ensure_installable(&self) -> Result<()> {
        if self.is_installable() {
            Ok(())
        } else {
            Err(ToolError::Validation {
                missing: self.missing_required.clone(),
            })
        }
    }
}

pub fn find_first(root: &Path, candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|relative| root.join(relative).is_file())
}

fn declared_or_found(
    root: &Path,
    declared: Option<&Path>,
    candidates: &[&str],
    warnings: &mut Vec<String>,
) -> Option<PathBuf> {
    match declared {
        Some(path) if root.join(path).is_file() => Some(path.to_path_buf()),
        Some(path) => {
            warnings.push(format!("declared file {} does not exist", path.display()));
            None
        }
        None => find_first(root, candidates),
    }
}

fn dir_has_files(dir: &Path) -> bool {
    dir.is_dir()
        && WalkDir::new(dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_type().is_file())
}

/// Inspects a fetched tree for the artifacts an installable tool needs.
pub fn validate_structure(root: &Path) -> Result<ValidationReport> {
    validate_with_build(root, &BuildSettings::default())
}

/// Like [`validate_structure`], but a Dockerfile or compose file declared by the
/// manifest replaces the conventional search locations.
pub fn validate_with_build(root: &Path, build: &BuildSettings) -> Result<ValidationReport> {
    if !root.is_dir() {
        return Err(ToolError::InvalidArgument(format!(
            "source tree {} is not a directory",
            root.display()
        )));
    }

    let mut warnings = Vec::new();
    let dockerfile = declared_or_found(root, build.dockerfile.as_deref(), DOCKERFILE_CANDIDATES, &mut warnings);
    let compose_file = declared_or_found(
        root,
        build.compose_file.as_deref(),
        COMPOSE_FILE_CANDIDATES,
        &mut warnings,
    );
    let documentation = find_first(root, README_CANDIDATES);

    let mut missing_required = Vec::new();
    if dockerfile.is_none() && compose_file.is_none() {
        missing_required.push(RequiredArtifact::BuildFile);
    }
    if documentation.is_none() {
        missing_required.push(RequiredArtifact::Documentation);
    }

    let mut present_optional = Vec::new();
    for artifact in OptionalArtifact::ALL {
        let present = match artifact {
            OptionalArtifact::ComposeFile => compose_file.is_some(),
            OptionalArtifact::Scripts => dir_has_files(&root.join("scripts")),
            OptionalArtifact::ConfigDir => root.join("config").is_dir(),
            OptionalArtifact::Manifest => {
                find_first(root, CANONICAL_MANIFEST_FILES).is_some()
                    || root.join(LEGACY_MANIFEST_FILE).is_file()
            }
            OptionalArtifact::DockerIgnore => root.join(".dockerignore").is_file(),
            OptionalArtifact::License => find_first(root, LICENSE_CANDIDATES).is_some(),
        };
        if present {
            present_optional.push(artifact);
        } else {
            warnings.push(format!("optional artifact missing: {}", artifact.label()));
        }
    }

    let required_present = RequiredArtifact::ALL.len() - missing_required.len();
    let score = REQUIRED_WEIGHT * required_present / RequiredArtifact::ALL.len()
        + OPTIONAL_WEIGHT * present_optional.len() / OptionalArtifact::ALL.len();

    Ok(ValidationReport {
        score: score.min(100) as u8,
        missing_required,
        present_optional,
        warnings,
        dockerfile,
        compose_file,
        documentation,
    })
}
