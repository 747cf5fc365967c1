//! Git and GitHub operations, shelling out to `git` and `gh`.
//!
//! The [`GitOps`] trait is the seam the job processor depends on, so tests
//! can substitute a scripted implementation without touching a real
//! repository.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::GitError;
use crate::util::truncate;

/// Branch name derived from a job id: a fixed prefix plus a short,
/// lowercased id fragment.
pub fn branch_name_for_job(job_id: &str) -> String {
    format!("shipwright/{}", truncate(&job_id.to_lowercase(), 12))
}

#[async_trait]
pub trait GitOps: Send + Sync {
    /// Clone `repo_url` into `dest` at `default_branch`, or refresh an
    /// existing clone to the branch tip.
    async fn clone_or_pull(
        &self,
        repo_url: &str,
        dest: &Path,
        default_branch: &str,
    ) -> Result<(), GitError>;

    async fn create_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError>;

    /// Stage and commit everything. Returns the resulting commit sha.
    /// A clean tree is not an error: the current HEAD sha is returned
    /// without creating a commit.
    async fn commit_all(&self, repo: &Path, message: &str) -> Result<String, GitError>;

    async fn push(&self, repo: &Path, branch: &str) -> Result<(), GitError>;

    /// Open a pull request for `branch` against `base`. Returns the PR URL.
    async fn create_pull_request(
        &self,
        repo: &Path,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String, GitError>;
}

/// Production implementation backed by the `git` and `gh` binaries.
pub struct SystemGit;

impl SystemGit {
    async fn run_git(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                op: args.first().copied().unwrap_or("git").to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl GitOps for SystemGit {
    async fn clone_or_pull(
        &self,
        repo_url: &str,
        dest: &Path,
        default_branch: &str,
    ) -> Result<(), GitError> {
        if dest.join(".git").is_dir() {
            self.run_git(dest, &["fetch", "origin"]).await?;
            self.run_git(dest, &["checkout", default_branch]).await?;
            self.run_git(dest, &["pull", "--ff-only", "origin", default_branch])
                .await?;
            return Ok(());
        }

        let parent = dest.parent().unwrap_or(dest);
        let dest_str = dest.to_string_lossy();
        self.run_git(
            parent,
            &["clone", "--branch", default_branch, repo_url, &dest_str],
        )
        .await?;
        Ok(())
    }

    async fn create_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        self.run_git(repo, &["checkout", "-b", branch]).await?;
        Ok(())
    }

    async fn commit_all(&self, repo: &Path, message: &str) -> Result<String, GitError> {
        let dirty = self.run_git(repo, &["status", "--porcelain"]).await?;
        if dirty.is_empty() {
            // Nothing to commit; report the current head
            return self.run_git(repo, &["rev-parse", "HEAD"]).await;
        }

        self.run_git(repo, &["add", "-A"]).await?;
        self.run_git(repo, &["commit", "-m", message]).await?;
        self.run_git(repo, &["rev-parse", "HEAD"]).await
    }

    async fn push(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        self.run_git(repo, &["push", "-u", "origin", branch]).await?;
        Ok(())
    }

    async fn create_pull_request(
        &self,
        repo: &Path,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String, GitError> {
        let output = Command::new("gh")
            .args([
                "pr", "create", "--title", title, "--body", body, "--base", base, "--head", branch,
            ])
            .current_dir(repo)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                op: "pr create".to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Scripted [`GitOps`] for tests: records calls and returns canned results.
#[cfg(test)]
pub struct FakeGit {
    pub calls: std::sync::Mutex<Vec<String>>,
    pub commit_sha: String,
    pub pr_url: Option<String>,
    pub fail_op: Option<String>,
}

#[cfg(test)]
impl Default for FakeGit {
    fn default() -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
            commit_sha: "deadbeef0000".to_string(),
            pr_url: Some("https://github.com/acme/demo/pull/1".to_string()),
            fail_op: None,
        }
    }
}

#[cfg(test)]
impl FakeGit {
    fn record(&self, op: &str) -> Result<(), GitError> {
        self.calls
            .lock()
            .map_err(|_| GitError::CommandFailed {
                op: op.to_string(),
                detail: "lock poisoned".to_string(),
            })?
            .push(op.to_string());
        if self.fail_op.as_deref() == Some(op) {
            return Err(GitError::CommandFailed {
                op: op.to_string(),
                detail: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    pub fn ops(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
#[async_trait]
impl GitOps for FakeGit {
    async fn clone_or_pull(&self, _: &str, dest: &Path, _: &str) -> Result<(), GitError> {
        self.record("clone")?;
        std::fs::create_dir_all(dest).map_err(GitError::Io)?;
        Ok(())
    }

    async fn create_branch(&self, _: &Path, _: &str) -> Result<(), GitError> {
        self.record("branch")
    }

    async fn commit_all(&self, _: &Path, _: &str) -> Result<String, GitError> {
        self.record("commit")?;
        Ok(self.commit_sha.clone())
    }

    async fn push(&self, _: &Path, _: &str) -> Result<(), GitError> {
        self.record("push")
    }

    async fn create_pull_request(
        &self,
        _: &Path,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<String, GitError> {
        self.record("pr")?;
        self.pr_url.clone().ok_or(GitError::CommandFailed {
            op: "pr create".to_string(),
            detail: "no PR configured".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn branch_name_uses_short_lowered_id() {
        let name = branch_name_for_job("B9E1C0FF-1234-5678-ABCD-000000000000");
        assert_eq!(name, "shipwright/b9e1c0ff-123");
    }

    #[test]
    fn branch_name_handles_short_ids() {
        assert_eq!(branch_name_for_job("abc"), "shipwright/abc");
    }

    async fn git(cwd: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    /// Bare origin repo seeded with one commit on `main`.
    async fn seed_origin(root: &Path) -> PathBuf {
        let origin = root.join("origin.git");
        let seed = root.join("seed");
        git(root, &["init", "--bare", "-b", "main", origin.to_str().unwrap()]).await;
        git(root, &["init", "-b", "main", seed.to_str().unwrap()]).await;
        git(&seed, &["config", "user.email", "ci@example.com"]).await;
        git(&seed, &["config", "user.name", "ci"]).await;
        std::fs::write(seed.join("README.md"), "seed\n").unwrap();
        git(&seed, &["add", "-A"]).await;
        git(&seed, &["commit", "-m", "seed"]).await;
        git(&seed, &["remote", "add", "origin", origin.to_str().unwrap()]).await;
        git(&seed, &["push", "origin", "main"]).await;
        origin
    }

    #[tokio::test]
    async fn clone_branch_commit_push_against_local_origin() {
        let dir = tempfile::tempdir().unwrap();
        let origin = seed_origin(dir.path()).await;
        let work = dir.path().join("work");

        let sys = SystemGit;
        sys.clone_or_pull(origin.to_str().unwrap(), &work, "main")
            .await
            .unwrap();
        assert!(work.join("README.md").exists());

        git(&work, &["config", "user.email", "ci@example.com"]).await;
        git(&work, &["config", "user.name", "ci"]).await;

        sys.create_branch(&work, "shipwright/test").await.unwrap();
        std::fs::write(work.join("new.txt"), "hello\n").unwrap();
        let sha = sys.commit_all(&work, "shipwright: test change").await.unwrap();
        assert_eq!(sha.len(), 40);

        sys.push(&work, "shipwright/test").await.unwrap();
    }

    #[tokio::test]
    async fn commit_all_on_clean_tree_returns_head_sha() {
        let dir = tempfile::tempdir().unwrap();
        let origin = seed_origin(dir.path()).await;
        let work = dir.path().join("work");

        let sys = SystemGit;
        sys.clone_or_pull(origin.to_str().unwrap(), &work, "main")
            .await
            .unwrap();

        let head = sys.commit_all(&work, "nothing to do").await.unwrap();
        let again = sys.commit_all(&work, "still nothing").await.unwrap();
        assert_eq!(head, again);
    }

    #[tokio::test]
    async fn clone_or_pull_refreshes_existing_clone() {
        let dir = tempfile::tempdir().unwrap();
        let origin = seed_origin(dir.path()).await;
        let work = dir.path().join("work");

        let sys = SystemGit;
        let url = origin.to_str().unwrap().to_string();
        sys.clone_or_pull(&url, &work, "main").await.unwrap();
        // Second call takes the fetch/pull path
        sys.clone_or_pull(&url, &work, "main").await.unwrap();
        assert!(work.join("README.md").exists());
    }

    #[tokio::test]
    async fn clone_failure_surfaces_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let sys = SystemGit;
        let err = sys
            .clone_or_pull(
                dir.path().join("no-such-origin").to_str().unwrap(),
                &dir.path().join("work"),
                "main",
            )
            .await
            .unwrap_err();
        match err {
            GitError::CommandFailed { op, .. } => assert_eq!(op, "clone"),
            other => panic!("Expected CommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fake_git_records_and_scripts_failures() {
        let fake = FakeGit {
            fail_op: Some("push".to_string()),
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        fake.clone_or_pull("url", &dir.path().join("w"), "main")
            .await
            .unwrap();
        fake.create_branch(dir.path(), "b").await.unwrap();
        assert!(fake.push(dir.path(), "b").await.is_err());
        assert_eq!(fake.ops(), vec!["clone", "branch", "push"]);
    }
}
