//! Agent command descriptors.
//!
//! An [`AgentCommand`] is everything needed to launch the agent: program,
//! flags, prompt, optional resume target, working directory and the full
//! environment. The same descriptor yields the [`EnvironmentSnapshot`] stored
//! on completion, so a later resume reproduces the exact launch context.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::AgentConfig;
use crate::models::session::EnvironmentSnapshot;
use crate::{AppError, Result};

/// Flag that introduces the prompt argument.
const PROMPT_FLAG: &str = "-p";
/// Flag that introduces the session id to resume.
const RESUME_FLAG: &str = "-r";

/// Fully resolved agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    /// Ticket the invocation works on.
    pub ticket: u64,
    /// Agent executable.
    pub program: String,
    /// Flags placed before the resume and prompt arguments.
    pub flags: Vec<String>,
    /// Session id to resume, if any.
    pub resume: Option<String>,
    /// Prompt text.
    pub prompt: String,
    /// Directory the agent runs in.
    pub working_dir: PathBuf,
    /// Complete environment for the child; nothing else is inherited.
    pub env: BTreeMap<String, String>,
}

impl AgentCommand {
    /// Argument vector: `flags… [-r <id>] -p <prompt>`.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = self.flags.clone();
        if let Some(id) = &self.resume {
            args.push(RESUME_FLAG.to_owned());
            args.push(id.clone());
        }
        args.push(PROMPT_FLAG.to_owned());
        args.push(self.prompt.clone());
        args
    }

    /// Environment snapshot persisted with a completed session.
    #[must_use]
    pub fn snapshot(&self) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            command: self.program.clone(),
            flags: self.flags.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
        }
    }

    /// Spawn the agent with null stdin, piped stdout and the given stderr.
    ///
    /// The child is killed if its handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if the OS refuses to start the process.
    pub fn spawn(&self, stderr: Stdio) -> Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args())
            .env_clear()
            .envs(&self.env)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true);

        cmd.spawn().map_err(|err| {
            AppError::Launch(format!(
                "failed to spawn {} in {}: {err}",
                self.program,
                self.working_dir.display()
            ))
        })
    }
}

/// Build a fresh-run descriptor from the current process environment.
///
/// # Errors
///
/// Returns `AppError::Config` when `HOME` is not set; agents need it to
/// locate their own configuration.
pub fn prepare(
    ticket: u64,
    working_dir: &Path,
    program: &str,
    flags: &[String],
    prompt: String,
) -> Result<AgentCommand> {
    let env = current_env();
    if env.get("HOME").is_none_or(String::is_empty) {
        return Err(AppError::Config("HOME environment variable not set".into()));
    }

    Ok(AgentCommand {
        ticket,
        program: program.to_owned(),
        flags: flags.to_vec(),
        resume: None,
        prompt,
        working_dir: working_dir.to_path_buf(),
        env,
    })
}

/// Build a resume descriptor from a stored snapshot.
///
/// Empty stored values fall back to the configured command and flags and to
/// the current process environment.
#[must_use]
pub fn prepare_resume(
    ticket: u64,
    snapshot: &EnvironmentSnapshot,
    fallback: &AgentConfig,
    session_id: &str,
    prompt: String,
) -> AgentCommand {
    let program = if snapshot.command.is_empty() {
        fallback.command.clone()
    } else {
        snapshot.command.clone()
    };
    let flags = if snapshot.flags.is_empty() {
        fallback.flags.clone()
    } else {
        snapshot.flags.clone()
    };
    let env = if snapshot.env.is_empty() {
        current_env()
    } else {
        snapshot.env.clone()
    };

    AgentCommand {
        ticket,
        program,
        flags,
        resume: Some(session_id.to_owned()),
        prompt,
        working_dir: snapshot.working_dir.clone(),
        env,
    }
}

fn current_env() -> BTreeMap<String, String> {
    env::vars().collect()
}
