//! Repository checkout discovery and cloning.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use crate::mode::ExecutionMode;
use crate::{AppError, Result};

/// A repository checkout the agent can run in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Checkout directory.
    pub path: PathBuf,
    /// Whether this call cloned it (or would have, in dry-run).
    pub cloned: bool,
}

/// Last path component of a project path (`group/sub/repo` → `repo`).
///
/// # Errors
///
/// Returns `AppError::Config` for an empty project path.
pub fn project_name(project_path: &str) -> Result<&str> {
    project_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::Config(format!("invalid project path: {project_path:?}")))
}

/// Clone URL for a project on the GitLab instance.
#[must_use]
pub fn clone_url(gitlab_url: &str, project_path: &str) -> String {
    format!("{}/{project_path}.git", gitlab_url.trim_end_matches('/'))
}

/// Locate the project's checkout under `root`, cloning it if missing.
///
/// `root` itself is used when its basename is the project name and it holds
/// a `.git` directory; otherwise `<root>/<name>` is used. In
/// [`ExecutionMode::DryRun`] nothing is cloned. The clone runs with terminal
/// prompts disabled into a staging directory that is renamed into place only
/// on success, and git is killed if this future is dropped.
///
/// # Errors
///
/// Returns `AppError::Io` if `git clone` cannot be started or fails.
pub async fn ensure_workspace(
    root: &Path,
    project_path: &str,
    gitlab_url: &str,
    mode: ExecutionMode,
) -> Result<Workspace> {
    let name = project_name(project_path)?;

    if root.file_name().is_some_and(|base| base == name) && root.join(".git").is_dir() {
        return Ok(Workspace {
            path: root.to_path_buf(),
            cloned: false,
        });
    }

    let path = root.join(name);
    if path.join(".git").is_dir() {
        return Ok(Workspace {
            path,
            cloned: false,
        });
    }

    let url = clone_url(gitlab_url, project_path);
    if mode == ExecutionMode::DryRun {
        info!(
            mode = mode.tag(),
            %url,
            target = %path.display(),
            "repository missing; would clone"
        );
        return Ok(Workspace { path, cloned: true });
    }

    let staging = root.join(format!(".{name}.cloning"));
    if staging.exists() {
        tokio::fs::remove_dir_all(&staging)
            .await
            .map_err(|err| AppError::Io(format!("failed to clear {}: {err}", staging.display())))?;
    }

    info!(%url, target = %path.display(), "cloning repository");
    let status = Command::new("git")
        .arg("clone")
        .arg(&url)
        .arg(&staging)
        .current_dir(root)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|err| AppError::Io(format!("failed to start git clone: {err}")))?;

    if !status.success() {
        return Err(AppError::Io(format!("git clone of {url} failed: {status}")));
    }
    tokio::fs::rename(&staging, &path)
        .await
        .map_err(|err| AppError::Io(format!("failed to move clone into {}: {err}", path.display())))?;
    Ok(Workspace { path, cloned: true })
}

/// Module name from `<dir>/go.mod`, if present.
#[must_use]
pub fn go_module_name(dir: &Path) -> Option<String> {
    let content = std::fs::read_to_string(dir.join("go.mod")).ok()?;
    content.lines().find_map(|line| {
        line.trim()
            .strip_prefix("module ")
            .map(|module| module.trim().to_owned())
            .filter(|module| !module.is_empty())
    })
}

/// Short `git status` of a checkout, for semi-dry-run reporting.
///
/// # Errors
///
/// Returns `AppError::Io` if git cannot be run.
pub async fn git_status(dir: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["status", "--short", "--branch"])
        .current_dir(dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| AppError::Io(format!("failed to run git status: {err}")))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
