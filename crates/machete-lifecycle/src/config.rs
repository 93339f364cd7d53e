use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use machete_util::{env_flag, env_opt, env_path_list, env_u64, expand_user, state_file_path};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::logs::RECENT_LOG_LIMIT;

pub const CONFIG_FILE_NAME: &str = "lifecycle-config.json";
pub const REGISTRY_FILE_NAME: &str = "tools.json";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    pub sandbox_root: PathBuf,
    pub registry_path: PathBuf,
    pub allowed_volume_roots: Vec<PathBuf>,
    pub image_prefix: String,
    pub docker_bin: String,
    pub git_bin: String,
    pub docker_network: Option<String>,
    pub clone_depth: u32,
    pub probe_timeout_secs: u64,
    pub clone_timeout_secs: u64,
    pub build_timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub runtime_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub lock_wait_secs: Option<u64>,
    pub build_log_limit: usize,
    pub keep_on_runtime_unavailable: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sandbox_root: machete_util::data_dir().join("tools"),
            registry_path: state_file_path(REGISTRY_FILE_NAME),
            allowed_volume_roots: Vec::new(),
            image_prefix: "machete".into(),
            docker_bin: "docker".into(),
            git_bin: "git".into(),
            docker_network: None,
            clone_depth: 1,
            probe_timeout_secs: 15,
            clone_timeout_secs: 300,
            build_timeout_secs: 300,
            start_timeout_secs: 60,
            stop_grace_secs: 10,
            runtime_timeout_secs: 30,
            health_timeout_secs: 5,
            lock_wait_secs: None,
            build_log_limit: RECENT_LOG_LIMIT,
            keep_on_runtime_unavailable: true,
        }
    }
}

impl LifecycleConfig {
    /// Defaults, then `<state_dir>/lifecycle-config.json`, then `MACHETE_*` env vars.
    pub fn load() -> Self {
        let path = config_path();
        let mut cfg = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<LifecycleConfig>(&data) {
                Ok(file_cfg) => file_cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}", path.display());
                    LifecycleConfig::default()
                }
            },
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}", path.display());
                }
                LifecycleConfig::default()
            }
        };
        cfg.apply_env();
        cfg
    }

    /// Config rooted entirely inside `dir`, used by tests and throwaway sandboxes.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            sandbox_root: dir.join("tools"),
            registry_path: dir.join("state").join(REGISTRY_FILE_NAME),
            ..Self::default()
        }
    }

    pub fn apply_env(&mut self) {
        if let Some(value) = env_opt("MACHETE_SANDBOX_ROOT") {
            self.sandbox_root = expand_user(&value);
        }
        if let Some(value) = env_opt("MACHETE_REGISTRY_PATH") {
            self.registry_path = expand_user(&value);
        }
        if let Some(paths) = env_path_list("MACHETE_ALLOWED_VOLUME_ROOTS") {
            self.allowed_volume_roots = paths;
        }
        if let Some(value) = env_opt("MACHETE_IMAGE_PREFIX") {
            self.image_prefix = value;
        }
        if let Some(value) = env_opt("MACHETE_DOCKER_BIN") {
            self.docker_bin = value;
        }
        if let Some(value) = env_opt("MACHETE_GIT_BIN") {
            self.git_bin = value;
        }
        if let Some(value) = env_opt("MACHETE_DOCKER_NETWORK") {
            self.docker_network = Some(value);
        }
        if let Some(value) = env_u64("MACHETE_PROBE_TIMEOUT_SECS") {
            self.probe_timeout_secs = value;
        }
        if let Some(value) = env_u64("MACHETE_CLONE_TIMEOUT_SECS") {
            self.clone_timeout_secs = value;
        }
        if let Some(value) = env_u64("MACHETE_BUILD_TIMEOUT_SECS") {
            self.build_timeout_secs = value;
        }
        if let Some(value) = env_u64("MACHETE_START_TIMEOUT_SECS") {
            self.start_timeout_secs = value;
        }
        if let Some(value) = env_u64("MACHETE_STOP_GRACE_SECS") {
            self.stop_grace_secs = value;
        }
        if let Some(value) = env_u64("MACHETE_RUNTIME_TIMEOUT_SECS") {
            self.runtime_timeout_secs = value;
        }
        if let Some(value) = env_u64("MACHETE_LOCK_WAIT_SECS") {
            self.lock_wait_secs = Some(value);
        }
        if let Some(value) = env_flag("MACHETE_KEEP_ON_RUNTIME_UNAVAILABLE") {
            self.keep_on_runtime_unavailable = value;
        }
    }

    pub fn save(&self) -> io::Result<()> {
        machete_util::write_json_atomic(&config_path(), self)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs.max(1))
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs.max(1))
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn runtime_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_timeout_secs.max(1))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs.max(1))
    }

    pub fn lock_wait(&self) -> Option<Duration> {
        self.lock_wait_secs.map(Duration::from_secs)
    }
}

pub fn config_path() -> PathBuf {
    state_file_path(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_config_keeps_defaults() {
        let cfg: LifecycleConfig =
            serde_json::from_str(r#"{"image_prefix": "lab", "build_timeout_secs": 900}"#).unwrap();
        assert_eq!(cfg.image_prefix, "lab");
        assert_eq!(cfg.build_timeout(), Duration::from_secs(900));
        assert_eq!(cfg.clone_depth, 1);
        assert_eq!(cfg.stop_grace(), Duration::from_secs(10));
        assert!(cfg.keep_on_runtime_unavailable);
        assert_eq!(cfg.lock_wait(), None);
    }

    #[test]
    fn rooted_config_stays_inside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LifecycleConfig::rooted_at(dir.path());
        assert!(cfg.sandbox_root.starts_with(dir.path()));
        assert!(cfg.registry_path.starts_with(dir.path()));
    }
}
