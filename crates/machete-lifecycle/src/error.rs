use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::LifecycleState;
use crate::validate::RequiredArtifact;

pub type Result<T> = std::result::Result<T, ToolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestErrorReason {
    Missing,
    Malformed,
    UnsupportedVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchErrorReason {
    InvalidUrl,
    Unreachable,
    Timeout,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildErrorReason {
    DockerfileInvalid,
    BuildFailed,
    DaemonUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictReason {
    AlreadyExists,
    OperationInProgress,
    Disabled,
}

macro_rules! kebab_display {
    ($($ty:ty => { $($variant:ident => $label:literal),+ $(,)? }),+ $(,)?) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(match self {
                    $(Self::$variant => $label),+
                })
            }
        })+
    };
}

kebab_display! {
    ManifestErrorReason => {
        Missing => "missing",
        Malformed => "malformed",
        UnsupportedVersion => "unsupported-version",
    },
    FetchErrorReason => {
        InvalidUrl => "invalid-url",
        Unreachable => "unreachable",
        Timeout => "timeout",
        AlreadyExists => "already-exists",
    },
    BuildErrorReason => {
        DockerfileInvalid => "dockerfile-invalid",
        BuildFailed => "build-failed",
        DaemonUnavailable => "daemon-unavailable",
    },
    ConflictReason => {
        AlreadyExists => "already-exists",
        OperationInProgress => "operation-in-progress",
        Disabled => "disabled",
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Manifest,
    Fetch,
    Validation,
    Build,
    Security,
    Conflict,
    Runtime,
    RuntimeUnavailable,
    NotFound,
    InvalidArgument,
    InvalidState,
    Interrupted,
    Registry,
    Io,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("manifest {reason}: {detail}")]
    Manifest {
        reason: ManifestErrorReason,
        detail: String,
    },

    #[error("fetch failed ({reason}): {detail}")]
    Fetch {
        reason: FetchErrorReason,
        detail: String,
        log: Vec<String>,
    },

    #[error("validation failed: missing required artifacts: {}", join_artifacts(.missing))]
    Validation { missing: Vec<RequiredArtifact> },

    #[error("build failed ({reason}): {detail}")]
    Build {
        reason: BuildErrorReason,
        detail: String,
        log: Vec<String>,
    },

    #[error("sandbox escape rejected: {0}")]
    Security(String),

    #[error("conflict on tool {id} ({reason}): {detail}")]
    Conflict {
        id: String,
        reason: ConflictReason,
        detail: String,
    },

    #[error("container runtime {operation} failed: {detail}")]
    Runtime {
        operation: String,
        detail: String,
        log: Vec<String>,
    },

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cannot {operation} tool {id} in state {state}")]
    InvalidState {
        id: String,
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("{operation} of tool {id} was interrupted in state {state}")]
    Interrupted {
        id: String,
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("registry operation failed: {0}")]
    Registry(String),

    #[error("{operation} failed for {path}: {detail}")]
    Io {
        operation: &'static str,
        path: String,
        detail: String,
    },
}

fn join_artifacts(missing: &[RequiredArtifact]) -> String {
    missing
        .iter()
        .map(|artifact| artifact.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ToolError {
    pub fn manifest(reason: ManifestErrorReason, detail: impl Into<String>) -> Self {
        ToolError::Manifest {
            reason,
            detail: detail.into(),
        }
    }

    pub fn fetch(reason: FetchErrorReason, detail: impl Into<String>) -> Self {
        ToolError::Fetch {
            reason,
            detail: detail.into(),
            log: Vec::new(),
        }
    }

    pub fn build(reason: BuildErrorReason, detail: impl Into<String>) -> Self {
        ToolError::Build {
            reason,
            detail: detail.into(),
            log: Vec::new(),
        }
    }

    pub fn runtime(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        ToolError::Runtime {
            operation: operation.into(),
            detail: detail.into(),
            log: Vec::new(),
        }
    }

    pub fn io(operation: &'static str, path: &std::path::Path, err: std::io::Error) -> Self {
        ToolError::Io {
            operation,
            path: path.display().to_string(),
            detail: err.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ToolError::Manifest { .. } => ErrorCode::Manifest,
            ToolError::Fetch { .. } => ErrorCode::Fetch,
            ToolError::Validation { .. } => ErrorCode::Validation,
            ToolError::Build { .. } => ErrorCode::Build,
            ToolError::Security(_) => ErrorCode::Security,
            ToolError::Conflict { .. } => ErrorCode::Conflict,
            ToolError::Runtime { .. } => ErrorCode::Runtime,
            ToolError::RuntimeUnavailable(_) => ErrorCode::RuntimeUnavailable,
            ToolError::NotFound(_) => ErrorCode::NotFound,
            ToolError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            ToolError::InvalidState { .. } => ErrorCode::InvalidState,
            ToolError::Interrupted { .. } => ErrorCode::Interrupted,
            ToolError::Registry(_) => ErrorCode::Registry,
            ToolError::Io { .. } => ErrorCode::Io,
        }
    }

    /// Short, stable summary used as the user-facing message of an [`ErrorDetail`].
    pub fn summary(&self) -> String {
        match self {
            ToolError::Manifest { reason, .. } => format!("manifest {reason}"),
            ToolError::Fetch { reason, .. } => format!("fetch {reason}"),
            ToolError::Validation { .. } => "missing required artifacts".into(),
            ToolError::Build { reason, .. } => format!("build {reason}"),
            ToolError::Security(_) => "sandbox escape".into(),
            ToolError::Conflict { reason, .. } => format!("conflict: {reason}"),
            ToolError::Runtime { operation, .. } => format!("container {operation} failed"),
            ToolError::RuntimeUnavailable(_) => "container runtime unavailable".into(),
            ToolError::NotFound(_) => "tool not found".into(),
            ToolError::InvalidArgument(_) => "invalid argument".into(),
            ToolError::InvalidState { operation, state, .. } => {
                format!("cannot {operation} from state {state}")
            }
            ToolError::Interrupted { operation, .. } => format!("{operation} interrupted"),
            ToolError::Registry(_) => "registry unavailable".into(),
            ToolError::Io { operation, .. } => format!("{operation} failed"),
        }
    }

    pub fn log_excerpt(&self) -> &[String] {
        match self {
            ToolError::Fetch { log, .. }
            | ToolError::Build { log, .. }
            | ToolError::Runtime { log, .. } => log,
            _ => &[],
        }
    }

    pub fn with_log(mut self, lines: Vec<String>) -> Self {
        match &mut self {
            ToolError::Fetch { log, .. }
            | ToolError::Build { log, .. }
            | ToolError::Runtime { log, .. } => *log = lines,
            _ => {}
        }
        self
    }

    pub fn is_runtime_unavailable(&self) -> bool {
        matches!(
            self,
            ToolError::RuntimeUnavailable(_)
                | ToolError::Build {
                    reason: BuildErrorReason::DaemonUnavailable,
                    ..
                }
        )
    }

    pub fn to_detail(&self, correlation_id: &str) -> ErrorDetail {
        ErrorDetail {
            code: self.code(),
            message: self.summary(),
            technical: self.to_string(),
            log_excerpt: self.log_excerpt().to_vec(),
            correlation_id: correlation_id.to_string(),
        }
    }
}

/// Serialised form of a [`ToolError`], kept on the tool record and returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    pub technical: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_excerpt: Vec<String>,
    pub correlation_id: String,
}
