//! Branch and worktree naming
//!
//! Working branches are `<prefix><sanitized(name)>-<YYYY-MM-DD>-<id8>`;
//! worktrees live under `<repo>/.ralph-worktrees/<sanitized(branch)>`.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::domain::{sanitize_name, short_id};

/// Directory under the repository root holding all loop worktrees
pub const WORKTREE_DIR: &str = ".ralph-worktrees";

/// Build the working branch name for a loop
pub fn working_branch_name(prefix: &str, name: &str, loop_id: &str, date: NaiveDate) -> String {
    format!(
        "{}{}-{}-{}",
        prefix,
        sanitize_name(name),
        date.format("%Y-%m-%d"),
        short_id(loop_id)
    )
}

/// Directory name a branch's worktree uses (slashes are not valid here)
pub fn worktree_dir_name(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect()
}

/// Deterministic worktree path for a working branch
pub fn worktree_path(repo: &Path, branch: &str) -> PathBuf {
    repo.join(WORKTREE_DIR).join(worktree_dir_name(branch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 1).unwrap()
    }

    #[test]
    fn test_working_branch_name() {
        let branch = working_branch_name("ralph/", "Fix Login Bug", "0194a2f3-9999-7000-8000-000000000000", date());
        assert_eq!(branch, "ralph/fix-login-bug-2026-08-01-0194a2f3");
    }

    #[test]
    fn test_worktree_dir_name_replaces_slashes() {
        assert_eq!(
            worktree_dir_name("ralph/fix-login-bug-2026-08-01-0194a2f3"),
            "ralph-fix-login-bug-2026-08-01-0194a2f3"
        );
    }

    #[test]
    fn test_worktree_path_under_repo() {
        let path = worktree_path(Path::new("/repo"), "ralph/task-2026-08-01-abcd1234");
        assert_eq!(
            path,
            Path::new("/repo/.ralph-worktrees/ralph-task-2026-08-01-abcd1234")
        );
    }
}
