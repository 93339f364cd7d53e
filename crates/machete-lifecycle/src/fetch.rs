use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::LifecycleConfig;
use crate::error::{FetchErrorReason, Result, ToolError};
use crate::logs::{LogRelay, LogSink};
use crate::process::{run_command, run_streaming, CommandError};

pub const ALLOWED_SCHEMES: &[&str] = &["https", "http", "ssh", "git", "file"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRef {
    pub url: String,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchedSource {
    pub path: PathBuf,
    pub commit: Option<String>,
    pub log: Vec<String>,
}

/// Places a source tree at `dest`. Implementations never touch an existing `dest`
/// and leave nothing behind on failure.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        source: &SourceRef,
        dest: &Path,
        sink: Option<LogSink>,
    ) -> Result<FetchedSource>;

    /// Version string of the underlying tool, for diagnostics.
    async fn version(&self) -> Result<String>;
}

/// Checks that a source URL is something git can fetch and that we are willing to fetch.
pub fn validate_source_url(raw: &str) -> Result<String> {
    let url = raw.trim();
    let invalid = |detail: String| ToolError::fetch(FetchErrorReason::InvalidUrl, detail);
    if url.is_empty() {
        return Err(invalid("source url is required".into()));
    }
    if url.starts_with('-') {
        return Err(invalid(format!("source url '{url}' must not start with '-'")));
    }
    if url.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
        return Err(invalid(format!("source url '{url}' contains whitespace")));
    }

    if !url.contains("://") {
        if is_scp_like(url) {
            return Ok(url.to_string());
        }
        return Err(invalid(format!(
            "source url '{url}' has no scheme (expected one of {})",
            ALLOWED_SCHEMES.join(", ")
        )));
    }

    let parsed = Url::parse(url).map_err(|err| invalid(format!("source url '{url}': {err}")))?;
    if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
        return Err(invalid(format!(
            "scheme '{}' is not allowed (expected one of {})",
            parsed.scheme(),
            ALLOWED_SCHEMES.join(", ")
        )));
    }
    if parsed.scheme() == "file" {
        let path = parsed
            .to_file_path()
            .map_err(|_| invalid(format!("source url '{url}' is not a local path")))?;
        if !path.is_absolute() {
            return Err(invalid(format!("source url '{url}' must be an absolute path")));
        }
    } else {
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(invalid(format!("source url '{url}' has no host")));
        }
        if parsed.path().trim_matches('/').is_empty() {
            return Err(invalid(format!("source url '{url}' has no repository path")));
        }
    }
    Ok(url.to_string())
}

/// `user@host:path`, the form ssh remotes are usually written in.
fn is_scp_like(url: &str) -> bool {
    let Some((user_host, path)) = url.split_once(':') else {
        return false;
    };
    let Some((user, host)) = user_host.split_once('@') else {
        return false;
    };
    !user.is_empty()
        && !host.is_empty()
        && !path.is_empty()
        && !path.starts_with('/')
        && host
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '.' || ch == '-')
}

fn validate_branch(branch: &str) -> Result<()> {
    let bad = branch.is_empty()
        || branch.starts_with('-')
        || branch.contains("..")
        || branch
            .chars()
            .any(|ch| ch.is_whitespace() || ch.is_control() || "~^:?*[\\".contains(ch));
    if bad {
        return Err(ToolError::fetch(
            FetchErrorReason::InvalidUrl,
            format!("invalid branch name '{branch}'"),
        ));
    }
    Ok(())
}

fn partial_dir(dest: &Path) -> Result<PathBuf> {
    let parent = dest.parent().ok_or_else(|| {
        ToolError::InvalidArgument(format!("destination {} has no parent", dest.display()))
    })?;
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "source".into());
    Ok(parent.join(format!(".{name}.partial-{}", Uuid::new_v4())))
}

pub fn is_partial_dir_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(".partial-")
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(err) = fs::remove_dir_all(path) {
            warn!("failed to remove partial clone {}: {err}", path.display());
        }
    }
}

/// Shallow, single-branch `git clone` behind an `ls-remote` reachability check.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    git_bin: String,
    depth: u32,
    probe_timeout: Duration,
    clone_timeout: Duration,
    log_limit: usize,
}

impl GitFetcher {
    pub fn new(git_bin: impl Into<String>, probe_timeout: Duration, clone_timeout: Duration) -> Self {
        GitFetcher {
            git_bin: git_bin.into(),
            depth: 1,
            probe_timeout,
            clone_timeout,
            log_limit: crate::logs::RECENT_LOG_LIMIT,
        }
    }

    pub fn from_config(config: &LifecycleConfig) -> Self {
        GitFetcher {
            depth: config.clone_depth.max(1),
            log_limit: config.build_log_limit,
            ..GitFetcher::new(
                config.git_bin.clone(),
                config.probe_timeout(),
                config.clone_timeout(),
            )
        }
    }

    fn git(&self) -> Command {
        let mut cmd = Command::new(&self.git_bin);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }

    fn spawn_error(&self, err: CommandError, what: &str) -> ToolError {
        match err {
            CommandError::TimedOut(limit) => ToolError::fetch(
                FetchErrorReason::Timeout,
                format!("{what} timed out after {}s", limit.as_secs()),
            ),
            other => ToolError::fetch(FetchErrorReason::Unreachable, format!("{what}: {other}")),
        }
    }

    /// `git ls-remote --heads`: proves the remote answers, and that a requested branch exists.
    async fn check_reachable(&self, source: &SourceRef) -> Result<()> {
        let mut cmd = self.git();
        cmd.arg("ls-remote").arg("--heads").arg("--").arg(&source.url);
        if let Some(branch) = &source.branch {
            cmd.arg(format!("refs/heads/{branch}"));
        }
        let output = run_command(cmd, self.probe_timeout)
            .await
            .map_err(|err| self.spawn_error(err, "reachability check"))?;
        if !output.success() {
            return Err(ToolError::fetch(
                FetchErrorReason::Unreachable,
                format!("{} is not reachable: {}", source.url, output.diagnostic()),
            ));
        }
        if let Some(branch) = &source.branch {
            if output.stdout.trim().is_empty() {
                return Err(ToolError::fetch(
                    FetchErrorReason::Unreachable,
                    format!("branch '{branch}' not found in {}", source.url),
                ));
            }
        }
        Ok(())
    }

    async fn head_commit(&self, repo: &Path) -> Option<String> {
        let mut cmd = self.git();
        cmd.arg("-C").arg(repo).arg("rev-parse").arg("HEAD");
        match run_command(cmd, self.probe_timeout).await {
            Ok(output) if output.success() => Some(output.stdout.trim().to_string()),
            Ok(output) => {
                warn!("git rev-parse failed in {}: {}", repo.display(), output.diagnostic());
                None
            }
            Err(err) => {
                warn!("git rev-parse failed in {}: {err}", repo.display());
                None
            }
        }
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(
        &self,
        source: &SourceRef,
        dest: &Path,
        sink: Option<LogSink>,
    ) -> Result<FetchedSource> {
        validate_source_url(&source.url)?;
        if let Some(branch) = &source.branch {
            validate_branch(branch)?;
        }
        if dest.exists() {
            return Err(ToolError::fetch(
                FetchErrorReason::AlreadyExists,
                format!("{} already exists", dest.display()),
            ));
        }

        self.check_reachable(source).await?;

        let tmp = partial_dir(dest)?;
        let mut relay = LogRelay::new(sink, self.log_limit);
        let mut cmd = self.git();
        cmd.arg("clone")
            .arg("--progress")
            .arg("--depth")
            .arg(self.depth.to_string())
            .arg("--single-branch");
        if let Some(branch) = &source.branch {
            cmd.arg("--branch").arg(branch);
        }
        cmd.arg("--").arg(&source.url).arg(&tmp);
        info!("cloning {} into {}", source.url, dest.display());

        let status = match run_streaming(cmd, self.clone_timeout, &mut relay).await {
            Ok(status) => status,
            Err(err) => {
                remove_partial(&tmp);
                return Err(self.spawn_error(err, "clone").with_log(relay.recent()));
            }
        };
        if !status.success() {
            remove_partial(&tmp);
            let detail = relay
                .tail(1)
                .pop()
                .unwrap_or_else(|| format!("git clone exited with {status}"));
            return Err(
                ToolError::fetch(FetchErrorReason::Unreachable, detail).with_log(relay.recent())
            );
        }

        let commit = self.head_commit(&tmp).await;
        if dest.exists() {
            remove_partial(&tmp);
            return Err(ToolError::fetch(
                FetchErrorReason::AlreadyExists,
                format!("{} appeared during clone", dest.display()),
            ));
        }
        if let Err(err) = fs::rename(&tmp, dest) {
            remove_partial(&tmp);
            return Err(ToolError::io("move clone into place", dest, err));
        }
        Ok(FetchedSource {
            path: dest.to_path_buf(),
            commit,
            log: relay.recent(),
        })
    }

    async fn version(&self) -> Result<String> {
        let mut cmd = self.git();
        cmd.arg("--version");
        let output = run_command(cmd, self.probe_timeout)
            .await
            .map_err(|err| self.spawn_error(err, "git --version"))?;
        if output.success() {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(ToolError::fetch(
                FetchErrorReason::Unreachable,
                format!("git --version failed: {}", output.diagnostic()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_supported_shapes() {
        for url in [
            "https://github.com/acme/uptime.git",
            "http://git.internal/tools/net-scan",
            "ssh://git@github.com/acme/uptime.git",
            "git://example.org/repo.git",
            "git@github.com:acme/uptime.git",
            "file:///srv/mirrors/uptime",
        ] {
            assert!(validate_source_url(url).is_ok(), "expected {url} to be accepted");
        }
    }

    #[test]
    fn rejects_bad_shapes() {
        for url in [
            "",
            "--upload-pack=touch /tmp/pwned",
            "ftp://example.org/repo.git",
            "https://",
            "https://github.com/",
            "not a url",
            "/srv/local/path",
            "ext::sh -c touch% /tmp/pwned",
        ] {
            let err = validate_source_url(url).unwrap_err();
            assert!(
                matches!(err, ToolError::Fetch { reason: FetchErrorReason::InvalidUrl, .. }),
                "expected {url} to be rejected, got {err}"
            );
        }
    }

    #[test]
    fn branch_names_are_checked() {
        assert!(validate_branch("main").is_ok());
        assert!(validate_branch("release/1.2").is_ok());
        assert!(validate_branch("-x").is_err());
        assert!(validate_branch("a..b").is_err());
        assert!(validate_branch("bad name").is_err());
    }

    #[test]
    fn partial_dirs_are_hidden_siblings() {
        let tmp = partial_dir(Path::new("/srv/tools/uptime")).unwrap();
        assert_eq!(tmp.parent(), Some(Path::new("/srv/tools")));
        let name = tmp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(is_partial_dir_name(&name), "{name}");
        assert!(!is_partial_dir_name("uptime"));
    }

    #[tokio::test]
    async fn existing_destination_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("uptime");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("keep.txt"), "mine").unwrap();

        let fetcher = GitFetcher::new("git", Duration::from_secs(5), Duration::from_secs(5));
        let source = SourceRef {
            url: "https://github.com/acme/uptime.git".into(),
            branch: None,
        };
        let err = fetcher.fetch(&source, &dest, None).await.unwrap_err();
        assert!(matches!(
            err,
            ToolError::Fetch { reason: FetchErrorReason::AlreadyExists, .. }
        ));
        assert_eq!(fs::read_to_string(dest.join("keep.txt")).unwrap(), "mine");
    }

    fn git_in(dir: &Path, args: &[&str]) -> Option<String> {
        let output = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=Machete Test", "-c", "user.email=test@machete.invalid"])
            .args(["-c", "commit.gpgsign=false"])
            .args(args)
            .output()
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// A one-commit repository on `main`; `None` when git is not installed.
    fn seed_repo(dir: &Path) -> Option<String> {
        fs::create_dir_all(dir).unwrap();
        git_in(dir, &["init", "-q"])?;
        fs::write(dir.join("Dockerfile"), "FROM alpine:3.20\n").unwrap();
        fs::write(dir.join("README.md"), "# uptime\n").unwrap();
        git_in(dir, &["add", "."])?;
        git_in(dir, &["commit", "-q", "-m", "initial"])?;
        git_in(dir, &["branch", "-M", "main"])?;
        git_in(dir, &["rev-parse", "HEAD"])
    }

    fn leftovers(parent: &Path) -> Vec<String> {
        fs::read_dir(parent)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| is_partial_dir_name(name))
            .collect()
    }

    fn local_fetcher() -> GitFetcher {
        GitFetcher::new("git", Duration::from_secs(30), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn clones_a_local_repository() {
        let dir = tempfile::tempdir().unwrap();
        let Some(head) = seed_repo(&dir.path().join("origin")) else {
            eprintln!("git unavailable; skipping");
            return;
        };
        let tools = dir.path().join("tools");
        fs::create_dir_all(&tools).unwrap();
        let dest = tools.join("uptime");
        let source = SourceRef {
            url: format!("file://{}", dir.path().join("origin").display()),
            branch: Some("main".into()),
        };

        let fetched = local_fetcher().fetch(&source, &dest, None).await.unwrap();
        assert_eq!(fetched.path, dest);
        assert_eq!(fetched.commit.as_deref(), Some(head.as_str()));
        assert!(dest.join("Dockerfile").is_file());
        assert!(dest.join(".git").is_dir());
        assert!(leftovers(&tools).is_empty());
    }

    #[tokio::test]
    async fn missing_branch_is_unreachable_and_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        if seed_repo(&dir.path().join("origin")).is_none() {
            eprintln!("git unavailable; skipping");
            return;
        }
        let tools = dir.path().join("tools");
        fs::create_dir_all(&tools).unwrap();
        let dest = tools.join("uptime");
        let source = SourceRef {
            url: format!("file://{}", dir.path().join("origin").display()),
            branch: Some("does-not-exist".into()),
        };

        let err = local_fetcher().fetch(&source, &dest, None).await.unwrap_err();
        assert!(
            matches!(err, ToolError::Fetch { reason: FetchErrorReason::Unreachable, .. }),
            "{err}"
        );
        assert!(!dest.exists());
        assert!(leftovers(&tools).is_empty());
    }

    #[tokio::test]
    async fn missing_remote_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        if git_in(dir.path(), &["--version"]).is_none() {
            eprintln!("git unavailable; skipping");
            return;
        }
        let dest = dir.path().join("uptime");
        let source = SourceRef {
            url: format!("file://{}", dir.path().join("nowhere").display()),
            branch: None,
        };
        let err = local_fetcher().fetch(&source, &dest, None).await.unwrap_err();
        assert!(
            matches!(err, ToolError::Fetch { reason: FetchErrorReason::Unreachable, .. }),
            "{err}"
        );
        assert!(!dest.exists());
        assert!(leftovers(dir.path()).is_empty());
    }
}
