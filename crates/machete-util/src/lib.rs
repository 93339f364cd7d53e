use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use machete_telemetry as telemetry;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

pub const APP_DIR_NAME: &str = "machete";

pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn env_flag(key: &str) -> Option<bool> {
    let value = env_opt(key)?;
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn env_u64(key: &str) -> Option<u64> {
    let value = env_opt(key)?;
    match value.parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            debug!("ignoring non-numeric {key}={value}");
            None
        }
    }
}

pub fn env_path_list(key: &str) -> Option<Vec<PathBuf>> {
    let value: OsString = std::env::var_os(key)?;
    let paths: Vec<PathBuf> = std::env::split_paths(&value)
        .filter(|path| !path.as_os_str().is_empty())
        .collect();
    Some(paths)
}

pub fn data_dir() -> PathBuf {
    if let Some(dir) = env_opt("MACHETE_DATA_DIR") {
        return expand_user(&dir);
    }
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share").join(APP_DIR_NAME)
    } else {
        PathBuf::from("/tmp").join(APP_DIR_NAME)
    }
}

pub fn state_dir() -> PathBuf {
    data_dir().join("state")
}

pub fn state_file_path(file_name: &str) -> PathBuf {
    state_dir().join(file_name)
}

pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let rest = path.strip_prefix("~/").unwrap_or("");
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    if let Err(err) = fs::write(&tmp, data).and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}

pub fn init_cli_telemetry(app_name: &'static str, app_version: &'static str, command: &str) {
    telemetry::init_with_env(app_name, app_version, data_dir());
    telemetry::event("cli.command", &[("command", command)]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn expand_user_keeps_plain_paths() {
        assert_eq!(expand_user("/srv/data"), PathBuf::from("/srv/data"));
        assert_eq!(expand_user("relative/x"), PathBuf::from("relative/x"));
    }

    #[test]
    fn expand_user_resolves_home_prefix() {
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(expand_user("~/tools"), PathBuf::from(&home).join("tools"));
            assert_eq!(expand_user("~"), PathBuf::from(&home));
        }
    }

    #[test]
    fn write_json_atomic_replaces_content_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_json_atomic(&path, &Sample { name: "a".into(), count: 1 }).unwrap();
        write_json_atomic(&path, &Sample { name: "b".into(), count: 2 }).unwrap();

        let loaded: Sample = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(loaded, Sample { name: "b".into(), count: 2 });

        let entries: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .collect();
        assert_eq!(entries.len(), 1, "temporary files must be renamed away");
    }

    #[test]
    fn env_flag_parses_common_spellings() {
        std::env::set_var("MACHETE_UTIL_TEST_FLAG_ON", "Yes");
        std::env::set_var("MACHETE_UTIL_TEST_FLAG_OFF", "0");
        std::env::set_var("MACHETE_UTIL_TEST_FLAG_BAD", "maybe");
        assert_eq!(env_flag("MACHETE_UTIL_TEST_FLAG_ON"), Some(true));
        assert_eq!(env_flag("MACHETE_UTIL_TEST_FLAG_OFF"), Some(false));
        assert_eq!(env_flag("MACHETE_UTIL_TEST_FLAG_BAD"), None);
        assert_eq!(env_flag("MACHETE_UTIL_TEST_FLAG_UNSET"), None);
    }

    #[test]
    fn env_u64_ignores_garbage() {
        std::env::set_var("MACHETE_UTIL_TEST_NUM", "42");
        std::env::set_var("MACHETE_UTIL_TEST_NUM_BAD", "forty");
        assert_eq!(env_u64("MACHETE_UTIL_TEST_NUM"), Some(42));
        assert_eq!(env_u64("MACHETE_UTIL_TEST_NUM_BAD"), None);
    }
}
