//! Isolated workspaces for job execution.
//!
//! A sandbox is a private workspace directory plus the process group of
//! whatever command is currently running inside it. Commands run via
//! [`SandboxManager::exec`] get the workspace as their working directory,
//! a fresh process group, piped output streamed line by line, and a hard
//! wall-clock timeout enforced with SIGTERM followed by SIGKILL after a
//! grace window.
//!
//! Destroying a sandbox kills its process group and removes the workspace.
//! The registry entry is removed atomically, so concurrent destroy calls
//! tear down at most once; later calls are no-ops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::config::SandboxSettings;
use crate::errors::SandboxError;
use crate::util::generate_id;

/// Outcome of a command that ran to completion inside a sandbox.
///
/// A nonzero exit code is not an error at this layer; callers decide what
/// it means.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone)]
struct SandboxEntry {
    workspace: PathBuf,
    /// Process group of the currently running exec, if any.
    current_pgid: Arc<Mutex<Option<u32>>>,
}

pub struct SandboxManager {
    workspace_root: PathBuf,
    timeout: Duration,
    kill_grace: Duration,
    sandboxes: DashMap<String, SandboxEntry>,
}

impl SandboxManager {
    pub fn new(settings: &SandboxSettings) -> Result<Self, SandboxError> {
        let workspace_root = PathBuf::from(&settings.workspace_dir);
        std::fs::create_dir_all(&workspace_root)?;
        Ok(Self {
            workspace_root,
            timeout: Duration::from_secs(settings.timeout_seconds),
            kill_grace: Duration::from_secs(settings.kill_grace_seconds),
            sandboxes: DashMap::new(),
        })
    }

    /// Create a sandbox with an empty workspace directory. Returns its id.
    pub fn create(&self) -> Result<String, SandboxError> {
        let id = generate_id();
        let workspace = self.workspace_root.join(&id);
        std::fs::create_dir_all(&workspace)?;
        self.sandboxes.insert(
            id.clone(),
            SandboxEntry {
                workspace,
                current_pgid: Arc::new(Mutex::new(None)),
            },
        );
        tracing::debug!(sandbox_id = %id, "Sandbox created");
        Ok(id)
    }

    /// Workspace directory of a live sandbox.
    pub fn workspace(&self, id: &str) -> Result<PathBuf, SandboxError> {
        self.sandboxes
            .get(id)
            .map(|entry| entry.workspace.clone())
            .ok_or_else(|| SandboxError::NotFound { id: id.to_string() })
    }

    pub fn active_count(&self) -> usize {
        self.sandboxes.len()
    }

    /// Run a command inside the sandbox workspace, streaming each stdout
    /// line to `on_line` as it arrives. Enforces the configured timeout;
    /// on expiry the whole process group is terminated and
    /// [`SandboxError::Timeout`] is returned.
    pub async fn exec<F>(
        &self,
        id: &str,
        program: &str,
        args: &[String],
        env: &HashMap<String, String>,
        on_line: F,
    ) -> Result<ExecResult, SandboxError>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        // Clone entry data out of the map so no shard lock is held across awaits
        let entry = self
            .sandboxes
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| SandboxError::NotFound { id: id.to_string() })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .current_dir(&entry.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(SandboxError::Spawn)?;
        let pid = child.id();
        set_pgid(&entry, pid);

        let on_line = Arc::new(on_line);
        let stdout_task = child.stdout.take().map(|stdout| {
            let on_line = on_line.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut collected = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    on_line(&line);
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut collected = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(result) => {
                set_pgid(&entry, None);
                result?
            }
            Err(_) => {
                tracing::warn!(sandbox_id = %id, "Sandbox command timed out, terminating process group");
                terminate_group(pid, &mut child, self.kill_grace).await;
                set_pgid(&entry, None);
                return Err(SandboxError::Timeout {
                    id: id.to_string(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(ExecResult {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    /// Tear down a sandbox: kill its process group and delete the
    /// workspace. Safe to call for ids that were already destroyed or
    /// never existed.
    pub async fn destroy(&self, id: &str) -> Result<(), SandboxError> {
        let Some((_, entry)) = self.sandboxes.remove(id) else {
            return Ok(());
        };

        let pgid = entry
            .current_pgid
            .lock()
            .map(|guard| *guard)
            .unwrap_or(None);
        if let Some(pgid) = pgid {
            signal_group(pgid, TERM);
            tokio::time::sleep(self.kill_grace).await;
            signal_group(pgid, KILL);
        }

        match tokio::fs::remove_dir_all(&entry.workspace).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(sandbox_id = %id, "Sandbox destroyed");
        Ok(())
    }
}

fn set_pgid(entry: &SandboxEntry, pid: Option<u32>) {
    if let Ok(mut guard) = entry.current_pgid.lock() {
        *guard = pid;
    }
}

#[cfg(unix)]
const TERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const KILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const TERM: i32 = 0;
#[cfg(not(unix))]
const KILL: i32 = 0;

/// Signal every process in the group. The child was spawned with
/// `process_group(0)`, so its pid doubles as the pgid.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: i32) {
    unsafe {
        libc::kill(-(pgid as i32), signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: i32) {}

/// SIGTERM the group, give it the grace window to exit, then SIGKILL.
async fn terminate_group(pid: Option<u32>, child: &mut Child, grace: Duration) {
    match pid {
        Some(pgid) => {
            signal_group(pgid, TERM);
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                signal_group(pgid, KILL);
                let _ = child.wait().await;
            }
        }
        // Already reaped; nothing to signal
        None => {
            let _ = child.kill().await;
        }
    }
}
