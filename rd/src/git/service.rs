//! Shell-level git operations behind the command executor

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::exec::{CommandExecutor, ExecError, ExecResult, LocalExecutor};

/// Git operation errors
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git {op} failed: {stderr}")]
    CommandFailed { op: String, stderr: String },

    #[error("executor error: {0}")]
    Exec(#[from] ExecError),
}

/// Outcome of merging a remote branch into the current branch
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// Nothing to merge
    AlreadyUpToDate,
    /// Merge (or fast-forward) committed cleanly
    Clean,
    /// Merge stopped on conflicts; the index holds the conflicted paths
    Conflicts { files: Vec<String> },
}

impl MergeOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean | Self::AlreadyUpToDate)
    }
}

/// Git service over a command executor
#[derive(Clone)]
pub struct GitService {
    exec: Arc<dyn CommandExecutor>,
}

impl GitService {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec }
    }

    /// Service backed by the local subprocess executor
    pub fn local() -> Self {
        Self::new(Arc::new(LocalExecutor::new()))
    }

    pub fn executor(&self) -> Arc<dyn CommandExecutor> {
        self.exec.clone()
    }

    async fn git(&self, repo: &Path, args: &[&str]) -> Result<ExecResult, GitError> {
        debug!(repo = %repo.display(), ?args, "git: running");
        Ok(self.exec.exec("git", args, Some(repo)).await?)
    }

    async fn git_ok(&self, repo: &Path, args: &[&str]) -> Result<ExecResult, GitError> {
        let result = self.git(repo, args).await?;
        if !result.success {
            return Err(GitError::CommandFailed {
                op: args.first().copied().unwrap_or("?").to_string(),
                stderr: if result.stderr.is_empty() {
                    result.stdout.clone()
                } else {
                    result.stderr.clone()
                },
            });
        }
        Ok(result)
    }

    pub async fn current_branch(&self, repo: &Path) -> Result<String, GitError> {
        let result = self.git_ok(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(result.stdout.trim().to_string())
    }

    pub async fn head_commit(&self, repo: &Path) -> Result<String, GitError> {
        let result = self.git_ok(repo, &["rev-parse", "HEAD"]).await?;
        Ok(result.stdout.trim().to_string())
    }

    pub async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool, GitError> {
        let result = self
            .git(repo, &["show-ref", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .await?;
        Ok(result.success)
    }

    pub async fn remote_branch_exists(&self, repo: &Path, branch: &str) -> Result<bool, GitError> {
        let result = self.git(repo, &["ls-remote", "--heads", "origin", branch]).await?;
        Ok(result.success && !result.stdout.trim().is_empty())
    }

    pub async fn has_uncommitted_changes(&self, repo: &Path) -> Result<bool, GitError> {
        let result = self.git_ok(repo, &["status", "--porcelain"]).await?;
        Ok(!result.stdout.trim().is_empty())
    }

    pub async fn add_all(&self, repo: &Path) -> Result<(), GitError> {
        self.git_ok(repo, &["add", "-A"]).await?;
        Ok(())
    }

    /// Commit staged changes, returning the new commit hash
    pub async fn commit(&self, repo: &Path, message: &str) -> Result<String, GitError> {
        self.git_ok(repo, &["commit", "-m", message]).await?;
        self.head_commit(repo).await
    }

    pub async fn checkout(&self, repo: &Path, branch: &str, create: bool) -> Result<(), GitError> {
        if create {
            self.git_ok(repo, &["checkout", "-b", branch]).await?;
        } else {
            self.git_ok(repo, &["checkout", branch]).await?;
        }
        Ok(())
    }

    /// Create a linked worktree at `path` on a new branch forked from `base`
    pub async fn create_worktree(&self, repo: &Path, path: &Path, branch: &str, base: &str) -> Result<(), GitError> {
        let path_str = path.to_string_lossy();
        self.git_ok(repo, &["worktree", "add", &path_str, "-b", branch, base])
            .await?;
        info!(worktree = %path.display(), %branch, %base, "Created worktree");
        Ok(())
    }

    /// Re-link a worktree for an existing branch (recovery after the
    /// worktree directory disappeared)
    pub async fn attach_worktree(&self, repo: &Path, path: &Path, branch: &str) -> Result<(), GitError> {
        let path_str = path.to_string_lossy();
        self.git_ok(repo, &["worktree", "add", &path_str, branch]).await?;
        info!(worktree = %path.display(), %branch, "Reattached worktree");
        Ok(())
    }

    pub async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), GitError> {
        let path_str = path.to_string_lossy();
        let result = self.git(repo, &["worktree", "remove", &path_str, "--force"]).await?;
        if !result.success && !result.stderr.contains("is not a working tree") {
            return Err(GitError::CommandFailed {
                op: "worktree remove".to_string(),
                stderr: result.stderr,
            });
        }
        Ok(())
    }

    pub async fn list_worktrees(&self, repo: &Path) -> Result<Vec<PathBuf>, GitError> {
        let result = self.git_ok(repo, &["worktree", "list", "--porcelain"]).await?;
        Ok(result
            .stdout
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }

    /// Repository default branch: prefers `main`, falls back to `master`
    pub async fn default_branch(&self, repo: &Path) -> Result<String, GitError> {
        if self.branch_exists(repo, "main").await? {
            return Ok("main".to_string());
        }
        if self.branch_exists(repo, "master").await? {
            return Ok("master".to_string());
        }
        // Fresh repository without commits: whatever HEAD points at
        self.current_branch(repo).await
    }

    pub async fn fetch(&self, repo: &Path, remote: &str, branch: &str) -> Result<(), GitError> {
        self.git_ok(repo, &["fetch", remote, branch]).await?;
        Ok(())
    }

    /// Merge `origin/<branch>` into the current branch
    pub async fn merge_from_remote(&self, repo: &Path, branch: &str) -> Result<MergeOutcome, GitError> {
        let remote_ref = format!("origin/{}", branch);
        let result = self.git(repo, &["merge", &remote_ref, "--no-edit"]).await?;

        if result.success {
            if result.stdout.contains("Already up to date") {
                debug!(%remote_ref, "merge_from_remote: already up to date");
                return Ok(MergeOutcome::AlreadyUpToDate);
            }
            return Ok(MergeOutcome::Clean);
        }

        let combined = format!("{}{}", result.stdout, result.stderr);
        if combined.contains("CONFLICT") || combined.contains("Automatic merge failed") {
            let files = self.conflicted_files(repo).await?;
            warn!(%remote_ref, ?files, "merge_from_remote: conflicts");
            return Ok(MergeOutcome::Conflicts { files });
        }

        Err(GitError::CommandFailed {
            op: "merge".to_string(),
            stderr: combined,
        })
    }

    async fn conflicted_files(&self, repo: &Path) -> Result<Vec<String>, GitError> {
        let result = self
            .git_ok(repo, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(result
            .stdout
            .lines()
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub async fn abort_merge(&self, repo: &Path) -> Result<(), GitError> {
        let _ = self.git(repo, &["merge", "--abort"]).await?;
        Ok(())
    }

    /// Merge a local branch into the current branch
    pub async fn merge_branch(&self, repo: &Path, branch: &str) -> Result<MergeOutcome, GitError> {
        let result = self.git(repo, &["merge", branch, "--no-edit"]).await?;
        if result.success {
            if result.stdout.contains("Already up to date") {
                return Ok(MergeOutcome::AlreadyUpToDate);
            }
            return Ok(MergeOutcome::Clean);
        }
        let combined = format!("{}{}", result.stdout, result.stderr);
        if combined.contains("CONFLICT") || combined.contains("Automatic merge failed") {
            let files = self.conflicted_files(repo).await?;
            return Ok(MergeOutcome::Conflicts { files });
        }
        Err(GitError::CommandFailed {
            op: "merge".to_string(),
            stderr: combined,
        })
    }

    pub async fn push(&self, repo: &Path, branch: &str, set_upstream: bool) -> Result<(), GitError> {
        if set_upstream {
            self.git_ok(repo, &["push", "--set-upstream", "origin", branch]).await?;
        } else {
            self.git_ok(repo, &["push", "origin", branch]).await?;
        }
        info!(%branch, "Pushed branch");
        Ok(())
    }

    /// Detach HEAD in a worktree so its branch can be deleted while the
    /// worktree itself stays on disk
    pub async fn detach_head(&self, worktree: &Path) -> Result<(), GitError> {
        self.git_ok(worktree, &["checkout", "--detach"]).await?;
        Ok(())
    }

    /// Best-effort removal of a branch on the remote
    pub async fn delete_remote_branch(&self, repo: &Path, name: &str) -> Result<(), GitError> {
        let result = self.git(repo, &["push", "origin", "--delete", name]).await?;
        if !result.success {
            debug!(branch = %name, stderr = %result.stderr.trim(), "delete_remote_branch: ignored failure");
        }
        Ok(())
    }

    pub async fn delete_branch(&self, repo: &Path, name: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        let result = self.git(repo, &["branch", flag, name]).await?;
        if !result.success && !result.stderr.contains("not found") {
            return Err(GitError::CommandFailed {
                op: "branch delete".to_string(),
                stderr: result.stderr,
            });
        }
        Ok(())
    }

    /// Stash uncommitted changes in the working tree
    pub async fn stash(&self, repo: &Path) -> Result<(), GitError> {
        self.git_ok(repo, &["stash", "push", "--include-untracked"]).await?;
        Ok(())
    }

    /// Ensure `.git/info/exclude` contains `entry`. Idempotent.
    pub async fn ensure_exclude_entry(&self, repo: &Path, entry: &str) -> Result<(), GitError> {
        let exclude_path = repo.join(".git").join("info").join("exclude");
        let exclude_str = exclude_path.to_string_lossy().to_string();

        let current = self.exec.read_file(&exclude_str).await?.unwrap_or_default();
        if current.lines().any(|line| line.trim() == entry) {
            return Ok(());
        }

        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(entry);
        updated.push('\n');
        self.exec.write_file(&exclude_str, &updated).await?;
        debug!(%entry, "ensure_exclude_entry: added entry");
        Ok(())
    }

    /// Set local `pull.rebase=false` only when it is not already configured
    pub async fn ensure_merge_strategy(&self, repo: &Path) -> Result<(), GitError> {
        let existing = self.git(repo, &["config", "--local", "--get", "pull.rebase"]).await?;
        if existing.success {
            debug!(value = %existing.stdout.trim(), "ensure_merge_strategy: already configured");
            return Ok(());
        }
        self.git_ok(repo, &["config", "--local", "pull.rebase", "false"]).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    use tokio::process::Command;

    /// Initialize a git repository with one commit on `main`
    pub async fn setup_git_repo(dir: &Path) {
        run(dir, &["init", "-b", "main"]).await;
        run(dir, &["config", "user.email", "test@test.com"]).await;
        run(dir, &["config", "user.name", "Test"]).await;
        run(dir, &["commit", "--allow-empty", "-m", "initial"]).await;
    }

    /// Add a bare origin remote and push `main` to it
    pub async fn setup_origin(repo: &Path, bare: &Path) {
        Command::new("git")
            .args(["init", "--bare", "-b", "main", bare.to_str().unwrap()])
            .output()
            .await
            .unwrap();
        run(repo, &["remote", "add", "origin", bare.to_str().unwrap()]).await;
        run(repo, &["push", "origin", "main"]).await;
    }

    pub async fn run(dir: &Path, args: &[&str]) {
        let output = Command::new("git").args(args).current_dir(dir).output().await.unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    pub async fn write_and_commit(dir: &Path, file: &str, content: &str, message: &str) {
        tokio::fs::write(dir.join(file), content).await.unwrap();
        run(dir, &["add", "-A"]).await;
        run(dir, &["commit", "-m", message]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_current_and_default_branch() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let git = GitService::local();

        assert_eq!(git.current_branch(temp.path()).await.unwrap(), "main");
        assert_eq!(git.default_branch(temp.path()).await.unwrap(), "main");
    }

    #[tokio::test]
    async fn test_default_branch_falls_back_to_master() {
        let temp = tempdir().unwrap();
        run(temp.path(), &["init", "-b", "master"]).await;
        run(temp.path(), &["config", "user.email", "t@t.com"]).await;
        run(temp.path(), &["config", "user.name", "T"]).await;
        run(temp.path(), &["commit", "--allow-empty", "-m", "init"]).await;

        let git = GitService::local();
        assert_eq!(git.default_branch(temp.path()).await.unwrap(), "master");
    }

    #[tokio::test]
    async fn test_branch_exists() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let git = GitService::local();

        assert!(git.branch_exists(temp.path(), "main").await.unwrap());
        assert!(!git.branch_exists(temp.path(), "nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_flow() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let git = GitService::local();

        assert!(!git.has_uncommitted_changes(temp.path()).await.unwrap());
        tokio::fs::write(temp.path().join("a.txt"), "hello").await.unwrap();
        assert!(git.has_uncommitted_changes(temp.path()).await.unwrap());

        git.add_all(temp.path()).await.unwrap();
        let hash = git.commit(temp.path(), "ralph: iteration 1").await.unwrap();
        assert_eq!(hash.len(), 40);
        assert!(!git.has_uncommitted_changes(temp.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_worktree_create_list_remove() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let git = GitService::local();

        let wt_path = temp.path().join(".ralph-worktrees").join("ralph-task");
        git.create_worktree(temp.path(), &wt_path, "ralph/task", "main")
            .await
            .unwrap();
        assert!(wt_path.exists());
        assert!(git.branch_exists(temp.path(), "ralph/task").await.unwrap());

        let listed = git.list_worktrees(temp.path()).await.unwrap();
        assert_eq!(listed.len(), 2);

        git.remove_worktree(temp.path(), &wt_path).await.unwrap();
        assert!(!wt_path.exists());

        git.delete_branch(temp.path(), "ralph/task", true).await.unwrap();
        assert!(!git.branch_exists(temp.path(), "ralph/task").await.unwrap());
    }

    #[tokio::test]
    async fn test_worktree_isolated_from_main_checkout() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let git = GitService::local();

        // Dirty the main checkout
        tokio::fs::write(temp.path().join("dirty.txt"), "uncommitted").await.unwrap();

        let wt_path = temp.path().join(".ralph-worktrees").join("ralph-iso");
        git.create_worktree(temp.path(), &wt_path, "ralph/iso", "main")
            .await
            .unwrap();

        // Fresh worktree does not inherit the dirty file
        assert!(!wt_path.join("dirty.txt").exists());
        assert!(!git.has_uncommitted_changes(&wt_path).await.unwrap());

        // Work in the worktree does not touch the main checkout
        tokio::fs::write(wt_path.join("work.txt"), "change").await.unwrap();
        assert!(!temp.path().join("work.txt").exists());
    }

    #[tokio::test]
    async fn test_merge_from_remote_already_up_to_date() {
        let repo = tempdir().unwrap();
        let bare = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        setup_origin(repo.path(), &bare.path().join("origin.git")).await;
        let git = GitService::local();

        git.fetch(repo.path(), "origin", "main").await.unwrap();
        let outcome = git.merge_from_remote(repo.path(), "main").await.unwrap();
        assert!(matches!(outcome, MergeOutcome::AlreadyUpToDate));
    }

    #[tokio::test]
    async fn test_merge_from_remote_conflict_and_abort() {
        let repo = tempdir().unwrap();
        let bare = tempdir().unwrap();
        let other = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        write_and_commit(repo.path(), "shared.txt", "base\n", "base").await;
        let origin_path = bare.path().join("origin.git");
        setup_origin(repo.path(), &origin_path).await;

        // A second clone pushes a conflicting change to origin/main
        run(other.path(), &["clone", origin_path.to_str().unwrap(), "clone"]).await;
        let clone = other.path().join("clone");
        run(&clone, &["config", "user.email", "o@o.com"]).await;
        run(&clone, &["config", "user.name", "O"]).await;
        write_and_commit(&clone, "shared.txt", "theirs\n", "theirs").await;
        run(&clone, &["push", "origin", "main"]).await;

        // Local diverges on the same file
        write_and_commit(repo.path(), "shared.txt", "ours\n", "ours").await;

        let git = GitService::local();
        git.fetch(repo.path(), "origin", "main").await.unwrap();
        let outcome = git.merge_from_remote(repo.path(), "main").await.unwrap();
        match outcome {
            MergeOutcome::Conflicts { files } => assert_eq!(files, vec!["shared.txt".to_string()]),
            other => panic!("expected conflicts, got {:?}", other),
        }

        git.abort_merge(repo.path()).await.unwrap();
        assert!(!git.has_uncommitted_changes(repo.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_push_and_remote_branch_exists() {
        let repo = tempdir().unwrap();
        let bare = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        setup_origin(repo.path(), &bare.path().join("origin.git")).await;
        let git = GitService::local();

        git.checkout(repo.path(), "feature", true).await.unwrap();
        assert!(!git.remote_branch_exists(repo.path(), "feature").await.unwrap());

        git.push(repo.path(), "feature", true).await.unwrap();
        assert!(git.remote_branch_exists(repo.path(), "feature").await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_exclude_entry_idempotent() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let git = GitService::local();

        git.ensure_exclude_entry(temp.path(), ".ralph-worktrees").await.unwrap();
        git.ensure_exclude_entry(temp.path(), ".ralph-worktrees").await.unwrap();

        let exclude = tokio::fs::read_to_string(temp.path().join(".git/info/exclude"))
            .await
            .unwrap();
        let count = exclude.lines().filter(|l| l.trim() == ".ralph-worktrees").count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_ensure_merge_strategy_does_not_overwrite() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let git = GitService::local();

        run(temp.path(), &["config", "--local", "pull.rebase", "true"]).await;
        git.ensure_merge_strategy(temp.path()).await.unwrap();

        let result = git.git(temp.path(), &["config", "--local", "--get", "pull.rebase"]).await.unwrap();
        assert_eq!(result.stdout.trim(), "true");
    }

    #[tokio::test]
    async fn test_ensure_merge_strategy_sets_when_unset() {
        let temp = tempdir().unwrap();
        setup_git_repo(temp.path()).await;
        let git = GitService::local();

        git.ensure_merge_strategy(temp.path()).await.unwrap();

        let result = git.git(temp.path(), &["config", "--local", "--get", "pull.rebase"]).await.unwrap();
        assert_eq!(result.stdout.trim(), "false");
    }
}
