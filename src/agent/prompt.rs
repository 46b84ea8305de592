//! Prompt text handed to the agent.

use std::fmt::Write as _;
use std::path::Path;

use chrono::SecondsFormat;

use crate::models::ticket::Note;

/// Facts about the workspace the default task prompt embeds.
#[derive(Debug, Clone)]
pub struct TaskContext<'a> {
    /// Ticket sequence number.
    pub ticket: u64,
    /// Tracker project path.
    pub project_path: &'a str,
    /// Service account handle the agent acts as.
    pub username: &'a str,
    /// Repository checkout the agent runs in.
    pub working_dir: &'a Path,
    /// Go module name when the repository has a `go.mod`.
    pub go_module: Option<&'a str>,
}

/// Default prompt for a fresh run on a ticket.
#[must_use]
pub fn task_prompt(ctx: &TaskContext<'_>) -> String {
    let username = if ctx.username.is_empty() {
        "user"
    } else {
        ctx.username
    };
    let ticket = ctx.ticket;

    let mut out = String::new();
    let _ = writeln!(out, "# Look at issue {ticket} and fix it\n");
    let _ = writeln!(out, "## Project Information");
    let _ = writeln!(out, "- **GitLab Project Path**: `{}`", ctx.project_path);
    let _ = writeln!(out, "- **Your Username**: @{username}");
    let _ = writeln!(
        out,
        "- **Current Working Directory**: `{}`",
        ctx.working_dir.display()
    );
    if let Some(module) = ctx.go_module {
        let _ = writeln!(out, "- **Go Module**: `{module}`");
    }
    out.push_str(
        "\nUse the GitLab MCP tools for anything that touches GitLab and plain git for \
         commits and pushes. The repository is already checked out and you are inside it.\n\n",
    );
    out.push_str("## Required workflow\n\n");
    out.push_str(
        "1. **Read the issue**: fetch it with GitLab MCP, read the description and every \
         existing comment, and work out the acceptance criteria.\n",
    );
    out.push_str(
        "2. **Post a plan**: before touching code, comment on the issue with a summary, the \
         files you expect to change, the steps you will take and how you will test.\n",
    );
    out.push_str("3. **Sync**: run `git status` and `git pull`.\n");
    let _ = writeln!(
        out,
        "4. **Branch**: `git checkout -b issue-{ticket}`."
    );
    out.push_str("5. **Implement**: follow the plan, test locally, commit with clear messages.\n");
    let _ = writeln!(
        out,
        "6. **Push and open an MR**: `git push -u origin issue-{ticket}`, then create a merge \
         request with GitLab MCP that references the issue."
    );
    out.push_str(
        "7. **Report**: comment on the issue with the MR link and a short status.\n\n",
    );
    out.push_str(
        "When you finish, the issue moves to human review. Any new comment a reviewer \
         leaves will resume this conversation so you can iterate. Reviewers close the loop \
         by marking the issue solved.\n",
    );
    out
}

/// Follow-up prompt for resuming a session with new reviewer comments.
#[must_use]
pub fn resume_prompt(ticket: u64, notes: &[Note]) -> String {
    let mut out = format!("# New Comments on Issue #{ticket}\n\n");
    out.push_str("The following comments were added after you completed this issue:\n\n");

    for (index, note) in notes.iter().enumerate() {
        let _ = writeln!(out, "## Comment {} by @{}", index + 1, note.author.username);
        let _ = writeln!(
            out,
            "**Posted:** {}\n",
            note.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let _ = writeln!(out, "{}\n", note.body);
        out.push_str("---\n\n");
    }

    out.push_str(
        "Please review these comments and take any necessary follow-up actions. \
         You can update your previous work, answer questions, or make additional changes \
         as needed.",
    );
    out
}
