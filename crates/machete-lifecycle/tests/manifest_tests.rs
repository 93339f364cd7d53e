use std::fs;
use std::path::{Path, PathBuf};

use machete_lifecycle::descriptor::{ManifestFormat, VolumeMode};
use machete_lifecycle::error::ManifestErrorReason;
use machete_lifecycle::manifest::ManifestResolver;
use machete_lifecycle::{BuildMode, ToolCategory, ToolError};
use tempfile::TempDir;

fn tree(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (relative, contents) in files {
        let path = dir.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
    dir
}

fn resolve(root: &Path) -> Result<machete_lifecycle::ToolDescriptor, ToolError> {
    ManifestResolver::default().resolve("uptime", root)
}

fn reason(err: ToolError) -> ManifestErrorReason {
    match err {
        ToolError::Manifest { reason, .. } => reason,
        other => panic!("expected a manifest error, got {other}"),
    }
}

#[test]
fn declared_port_and_category_with_default_health_check() {
    let dir = tree(&[(
        "machete.yml",
        "name: Uptime\nmachete:\n  port: 9090\n  category: monitoring\n",
    )]);
    let descriptor = resolve(dir.path()).unwrap();
    assert_eq!(descriptor.port, 9090);
    assert_eq!(descriptor.category, ToolCategory::Monitoring);
    assert_eq!(descriptor.health_check, "/health");
    assert_eq!(descriptor.manifest_format, ManifestFormat::Canonical);
}

#[test]
fn optional_fields_take_documented_defaults() {
    let dir = tree(&[("machete.yaml", "description: sniffed\n")]);
    let descriptor = resolve(dir.path()).unwrap();
    assert_eq!(descriptor.name, "uptime");
    assert_eq!(descriptor.version, "0.0.0");
    assert_eq!(descriptor.port, 8080);
    assert_eq!(descriptor.category, ToolCategory::Other);
    assert_eq!(descriptor.ui.icon, "wrench");
    assert_eq!(descriptor.ui.color, "#4a5568");
    assert_eq!(descriptor.build_mode, BuildMode::SingleContainer);
    assert_eq!(descriptor.build.context, PathBuf::from("."));
    assert!(descriptor.warnings.is_empty());
}

#[test]
fn full_canonical_manifest_is_mapped() {
    let dir = tree(&[(
        "machete.yml",
        r##"
manifest_version: 1
name: Net Scan
version: 1.0
author: Ops
license: MIT
future_key: ignored
machete:
  category: networking
  port: "8443"
  health_check: status
  environment:
    LOG_LEVEL: debug
    WORKERS: 4
  volumes:
    - ./data:/app/data
    - ./cfg:/etc/scan:ro
  dependencies: [redis]
  build:
    context: app
    dockerfile: app/Dockerfile.prod
ui:
  icon: radar
  color: "#112233"
  routes: [/scan]
"##,
    )]);
    let descriptor = resolve(dir.path()).unwrap();
    assert_eq!(descriptor.name, "Net Scan");
    assert_eq!(descriptor.version, "1.0");
    assert_eq!(descriptor.author.as_deref(), Some("Ops"));
    assert_eq!(descriptor.port, 8443);
    assert_eq!(descriptor.health_check, "/status");
    let env: Vec<String> = descriptor.environment.iter().map(|var| var.to_arg()).collect();
    assert_eq!(env, ["LOG_LEVEL=debug", "WORKERS=4"]);
    assert_eq!(descriptor.volumes.len(), 2);
    assert_eq!(descriptor.volumes[1].mode, VolumeMode::Ro);
    assert_eq!(descriptor.dependencies, ["redis"]);
    assert_eq!(descriptor.build.context, PathBuf::from("app"));
    assert_eq!(
        descriptor.build.dockerfile.as_deref(),
        Some(Path::new("app/Dockerfile.prod"))
    );
    assert_eq!(descriptor.ui.icon, "radar");
    assert_eq!(descriptor.ui.routes, ["/scan"]);
    assert_eq!(descriptor.manifest_sha256.len(), 64);
}

#[test]
fn environment_list_form_is_accepted() {
    let dir = tree(&[(
        "machete.yml",
        "machete:\n  environment:\n    - MODE=fast\n    - EMPTY=\n",
    )]);
    let descriptor = resolve(dir.path()).unwrap();
    let env: Vec<String> = descriptor.environment.iter().map(|var| var.to_arg()).collect();
    assert_eq!(env, ["MODE=fast", "EMPTY="]);
}

#[test]
fn legacy_file_is_the_fallback() {
    let dir = tree(&[(
        "machete.json",
        r#"{"name": "Old Tool", "port": 7000, "category": "SECURITY", "extra": true}"#,
    )]);
    let descriptor = resolve(dir.path()).unwrap();
    assert_eq!(descriptor.manifest_format, ManifestFormat::Legacy);
    assert_eq!(descriptor.name, "Old Tool");
    assert_eq!(descriptor.port, 7000);
    assert_eq!(descriptor.category, ToolCategory::Security);
}

#[test]
fn canonical_manifest_wins_over_legacy() {
    let dir = tree(&[
        ("machete.yml", "name: New\n"),
        ("machete.json", "{ this is not json"),
    ]);
    let descriptor = resolve(dir.path()).unwrap();
    assert_eq!(descriptor.name, "New");
    assert_eq!(descriptor.manifest_format, ManifestFormat::Canonical);
}

#[test]
fn absent_manifest_is_missing() {
    let dir = tree(&[("README.md", "# hi\n")]);
    assert_eq!(reason(resolve(dir.path()).unwrap_err()), ManifestErrorReason::Missing);
}

#[test]
fn malformed_yaml_keeps_parser_diagnostic() {
    let dir = tree(&[("machete.yml", "name: [unterminated\n")]);
    let err = resolve(dir.path()).unwrap_err();
    let text = err.to_string();
    assert!(text.contains("machete.yml"), "{text}");
    assert_eq!(reason(err), ManifestErrorReason::Malformed);
}

#[test]
fn bad_port_is_malformed() {
    let dir = tree(&[("machete.yml", "machete:\n  port: lots\n")]);
    assert_eq!(reason(resolve(dir.path()).unwrap_err()), ManifestErrorReason::Malformed);
}

#[test]
fn newer_manifest_version_is_unsupported() {
    let dir = tree(&[("machete.yml", "manifest_version: 2\nname: Future\n")]);
    assert_eq!(
        reason(resolve(dir.path()).unwrap_err()),
        ManifestErrorReason::UnsupportedVersion
    );
}

#[test]
fn unknown_category_falls_back_with_warning() {
    let dir = tree(&[("machete.yml", "machete:\n  category: astrology\n")]);
    let descriptor = resolve(dir.path()).unwrap();
    assert_eq!(descriptor.category, ToolCategory::Other);
    assert_eq!(descriptor.warnings.len(), 1);
    assert!(descriptor.warnings[0].contains("astrology"));
}

#[test]
fn compose_file_in_tree_selects_multi_service() {
    let dir = tree(&[
        ("machete.yml", "name: Stack\n"),
        ("compose.yaml", "services: {}\n"),
    ]);
    let descriptor = resolve(dir.path()).unwrap();
    assert_eq!(descriptor.build_mode, BuildMode::MultiService);
    assert_eq!(
        descriptor.build.compose_file.as_deref(),
        Some(Path::new("compose.yaml"))
    );
}

#[test]
fn description_falls_back_to_readme() {
    let dir = tree(&[
        ("machete.yml", "name: Uptime\n"),
        ("README.md", "# Uptime\n\nWatches endpoints.\n"),
    ]);
    let descriptor = resolve(dir.path()).unwrap();
    assert_eq!(descriptor.description, "Watches endpoints.");
}
