//! Thin wrapper around the `git` binary on `PATH` (spec §6 "External
//! services"). All git state changes in this crate go through here so the
//! workspace manager's contract — synchronous, exclusive-access, always
//! leaving a clean tree on error — has one place to enforce it.

use crate::error::WorkspaceError;
use std::path::Path;
use std::process::Output;
use tracing::debug;

pub struct Git {
    root: std::path::PathBuf,
}

impl Git {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn command(&self, args: &[&str]) -> std::process::Command {
        let mut cmd = std::process::Command::new("git");
        cmd.current_dir(&self.root).args(args);
        cmd
    }

    fn run(&self, args: &[&str]) -> Result<Output, WorkspaceError> {
        debug!(args = ?args, "git");
        let output = self.command(args).output()?;
        Ok(output)
    }

    fn run_checked(&self, args: &[&str]) -> Result<String, WorkspaceError> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(WorkspaceError::Command {
                command: args.join(" "),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Runs a command outside `self.root`, used to clone into a path that
    /// does not exist yet.
    fn run_checked_in(&self, dir: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
        debug!(args = ?args, dir = %dir.display(), "git");
        let output = std::process::Command::new("git")
            .current_dir(dir)
            .args(args)
            .output()?;
        if !output.status.success() {
            return Err(WorkspaceError::Command {
                command: args.join(" "),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub fn clone(&self, url: &str, branch: &str) -> Result<(), WorkspaceError> {
        let parent = self.root.parent().unwrap_or_else(|| Path::new("."));
        let dest = self.root.to_string_lossy().to_string();
        self.run_checked_in(
            parent,
            &["clone", "--branch", branch, "--single-branch", url, &dest],
        )?;
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.root.join(".git").exists()
    }

    pub fn config_author(&self, name: &str, email: &str) -> Result<(), WorkspaceError> {
        self.run_checked(&["config", "user.name", name])?;
        self.run_checked(&["config", "user.email", email])?;
        Ok(())
    }

    pub fn fetch(&self, refspec: &str) -> Result<(), WorkspaceError> {
        self.run_checked(&["fetch", "origin", refspec])?;
        Ok(())
    }

    pub fn reset_hard(&self, target: &str) -> Result<(), WorkspaceError> {
        self.run_checked(&["reset", "--hard", target])?;
        Ok(())
    }

    pub fn checkout(&self, branch: &str) -> Result<(), WorkspaceError> {
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    pub fn checkout_new_branch(&self, branch: &str, from: &str) -> Result<(), WorkspaceError> {
        self.run_checked(&["checkout", "-b", branch, from])?;
        Ok(())
    }

    /// Creates `branch` if it doesn't exist locally, or resets it in place
    /// if it does, pointing it at `start_point` either way, and checks it
    /// out. Used after a plain `fetch` (which only populates `FETCH_HEAD`,
    /// not a local or remote-tracking ref) so that checking out a branch
    /// this worker did not itself create with `checkout_new_branch` — e.g.
    /// another worker's owned PR branch — doesn't require that ref to
    /// already exist locally.
    pub fn checkout_reset_branch(&self, branch: &str, start_point: &str) -> Result<(), WorkspaceError> {
        self.run_checked(&["checkout", "-B", branch, start_point])?;
        Ok(())
    }

    pub fn clean(&self) -> Result<(), WorkspaceError> {
        self.run_checked(&["reset", "--hard", "HEAD"])?;
        self.run_checked(&["clean", "-fdx"])?;
        Ok(())
    }

    pub fn add_all(&self) -> Result<(), WorkspaceError> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    pub fn commit_allow_empty(&self, message: &str) -> Result<(), WorkspaceError> {
        self.run_checked(&["commit", "--allow-empty", "-m", message])?;
        Ok(())
    }

    pub fn push(&self, url: &str, branch: &str, force_with_lease: bool) -> Result<(), WorkspaceError> {
        let mut args = vec!["push"];
        if force_with_lease {
            args.push("--force-with-lease");
        }
        args.push(url);
        let refspec = format!("HEAD:refs/heads/{branch}");
        args.push(&refspec);
        self.run_checked(&args)?;
        Ok(())
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String, WorkspaceError> {
        Ok(self.run_checked(&["rev-parse", rev])?.trim().to_string())
    }

    pub fn has_changes_since(&self, base: &str) -> Result<bool, WorkspaceError> {
        let head = self.rev_parse("HEAD")?;
        let base_sha = self.rev_parse(base)?;
        Ok(head != base_sha)
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool, WorkspaceError> {
        let status = self.run_checked(&["status", "--porcelain"])?;
        Ok(!status.trim().is_empty())
    }

    pub fn rebase(&self, onto: &str) -> Result<bool, WorkspaceError> {
        let output = self.run(&["rebase", onto])?;
        Ok(output.status.success())
    }

    pub fn rebase_in_progress(&self) -> bool {
        self.root.join(".git/rebase-merge").exists() || self.root.join(".git/rebase-apply").exists()
    }

    pub fn rebase_abort(&self) -> Result<(), WorkspaceError> {
        self.run_checked(&["rebase", "--abort"])?;
        Ok(())
    }

    pub fn rebase_continue(&self) -> Result<bool, WorkspaceError> {
        let output = self.run(&["rebase", "--continue"])?;
        Ok(output.status.success())
    }

    pub fn list_conflicted_paths(&self) -> Result<Vec<String>, WorkspaceError> {
        let raw = self.run_checked(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(raw.lines().map(|s| s.to_string()).filter(|s| !s.is_empty()).collect())
    }

    pub fn checkout_ours(&self, path: &str) -> Result<(), WorkspaceError> {
        self.run_checked(&["checkout", "--ours", path])?;
        self.run_checked(&["add", path])?;
        Ok(())
    }
}
