// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! The runner capability: executing one builder.
//!
//! A runner is handed an expanded derivation (all placeholders
//! substituted), runs the builder with the build directory as its working
//! directory and TMPDIR, and must produce files at exactly the declared
//! output paths in the real store directory. User-attributable results
//! (non-zero exit) are [`RunnerError::Builder`]; anything else is an
//! internal backend fault.
//!
//! Backends are a tagged variant: the subprocess runner below, a
//! sandboxed runner (namespace/bind-mount construction lives outside this
//! crate), and in-process builtins. All are interchangeable behind
//! [`RunnerKind::run`].

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use zb_store_core::derivation::{Derivation, OutputName};
use zb_store_core::store_path::{StoreDir, StorePath};

use crate::build_log::LogSink;
use crate::build_users::UserLease;

/// Everything a runner needs for one builder invocation.
pub struct Invocation<'a> {
    /// The expanded derivation: no placeholders remain.
    pub derivation: &'a Derivation,
    pub drv_path: &'a StorePath,
    /// Output name → the store path the builder must produce.
    pub output_paths: &'a BTreeMap<OutputName, StorePath>,
    pub store_dir: &'a StoreDir,
    pub real_store_dir: &'a Path,
    pub build_dir: &'a Path,
    pub log: LogSink,
    pub user: Option<&'a UserLease>,
    pub cores: usize,
    pub ctx: &'a CancellationToken,
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// User-attributable failure; the build ends `fail`.
    #[error("{0}")]
    Builder(String),
    #[error("builder cancelled")]
    Cancelled,
    /// Backend fault; the build ends `error`.
    #[error("{0}")]
    Internal(String),
}

/// Wall-clock and silence limits for one builder run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunLimits {
    pub timeout: Option<Duration>,
    pub max_silent: Option<Duration>,
}

/// Which backend executes a derivation.
pub enum RunnerKind {
    Subprocess(SubprocessRunner),
    Builtin(Builtin),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Fetchurl,
    Extract,
}

impl RunnerKind {
    /// Select the backend for a derivation.
    pub fn for_derivation(drv: &Derivation, limits: RunLimits) -> Result<RunnerKind, RunnerError> {
        match drv.builder.strip_prefix("builtin:") {
            Some("fetchurl") => Ok(RunnerKind::Builtin(Builtin::Fetchurl)),
            Some("extract") => Ok(RunnerKind::Builtin(Builtin::Extract)),
            Some(other) => Err(RunnerError::Builder(format!(
                "unsupported builtin builder 'builtin:{other}'"
            ))),
            None => Ok(RunnerKind::Subprocess(SubprocessRunner { limits })),
        }
    }

    pub async fn run(&self, inv: Invocation<'_>) -> Result<(), RunnerError> {
        match self {
            RunnerKind::Subprocess(runner) => runner.run(inv).await,
            RunnerKind::Builtin(builtin) => {
                // Builtins run in-process; the fetch/extract backends plug
                // in from outside the store core.
                Err(RunnerError::Internal(format!(
                    "no backend configured for builtin:{}",
                    match builtin {
                        Builtin::Fetchurl => "fetchurl",
                        Builtin::Extract => "extract",
                    }
                )))
            }
        }
    }
}

/// Runs the builder as a plain child process in its own process group.
pub struct SubprocessRunner {
    limits: RunLimits,
}

/// Environment exported to builders.
///
/// Derivation-declared variables are never overwritten by the defaults.
pub fn build_environment(inv: &Invocation<'_>) -> BTreeMap<String, String> {
    let build_dir = inv.build_dir.to_string_lossy().to_string();
    let mut env: BTreeMap<String, String> = BTreeMap::from([
        ("HOME".to_owned(), "/home-not-set".to_owned()),
        ("PATH".to_owned(), "/path-not-set".to_owned()),
        ("PWD".to_owned(), build_dir.clone()),
        ("TEMP".to_owned(), build_dir.clone()),
        ("TEMPDIR".to_owned(), build_dir.clone()),
        ("TMP".to_owned(), build_dir.clone()),
        ("TMPDIR".to_owned(), build_dir.clone()),
        ("TERM".to_owned(), "xterm-256color".to_owned()),
        ("ZB_BUILD_CORES".to_owned(), inv.cores.to_string()),
        ("ZB_BUILD_TOP".to_owned(), build_dir),
        ("ZB_STORE".to_owned(), inv.store_dir.to_string()),
    ]);
    for (key, value) in &inv.derivation.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

impl SubprocessRunner {
    async fn run(&self, inv: Invocation<'_>) -> Result<(), RunnerError> {
        let env = build_environment(&inv);

        let mut command = tokio::process::Command::new(&inv.derivation.builder);
        command
            .args(&inv.derivation.args)
            .env_clear()
            .envs(&env)
            .current_dir(inv.build_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            command.process_group(0);
            if let Some(user) = inv.user {
                command.uid(user.uid());
            }
        }

        let mut child = command.spawn().map_err(|e| {
            RunnerError::Builder(format!(
                "failed to start builder '{}': {e}",
                inv.derivation.builder
            ))
        })?;
        let child_pid = child.id();

        // Drain stdout and stderr line by line into the shared log sink.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let last_output = std::sync::Arc::new(std::sync::Mutex::new(tokio::time::Instant::now()));

        let mut drains = Vec::new();
        for stream in [stdout.map(either_out), stderr.map(either_err)]
            .into_iter()
            .flatten()
        {
            let sink = inv.log.clone();
            let last = std::sync::Arc::clone(&last_output);
            drains.push(tokio::spawn(async move {
                let mut lines = stream.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    *last.lock().unwrap() = tokio::time::Instant::now();
                    let mut sink = sink.lock().unwrap();
                    let _ = writeln!(sink, "{line}");
                }
            }));
        }

        let status = self
            .wait_with_limits(&mut child, child_pid, &last_output, inv.ctx)
            .await;

        for drain in drains {
            let _ = drain.await;
        }

        match status {
            Wait::Exited(status) if status.success() => Ok(()),
            Wait::Exited(status) => Err(RunnerError::Builder(format!(
                "builder for '{}' failed with exit status {}",
                inv.drv_path,
                status.code().unwrap_or(-1)
            ))),
            Wait::TimedOut => Err(RunnerError::Builder(format!(
                "builder for '{}' timed out",
                inv.drv_path
            ))),
            Wait::Cancelled => Err(RunnerError::Cancelled),
            Wait::Failed(message) => Err(RunnerError::Internal(message)),
        }
    }

    async fn wait_with_limits(
        &self,
        child: &mut tokio::process::Child,
        child_pid: Option<u32>,
        last_output: &std::sync::Arc<std::sync::Mutex<tokio::time::Instant>>,
        ctx: &CancellationToken,
    ) -> Wait {
        let wall_deadline = self.limits.timeout.map(|d| tokio::time::Instant::now() + d);
        let poll = Duration::from_millis(100);

        loop {
            tokio::select! {
                result = child.wait() => {
                    return match result {
                        Ok(status) => Wait::Exited(status),
                        Err(e) => Wait::Failed(format!("wait error: {e}")),
                    };
                }
                _ = ctx.cancelled() => {
                    terminate_group(child_pid);
                    // Grace period, then hard kill.
                    if tokio::time::timeout(Duration::from_secs(5), child.wait()).await.is_err() {
                        kill_group(child_pid);
                        let _ = child.wait().await;
                    }
                    return Wait::Cancelled;
                }
                _ = tokio::time::sleep(poll) => {
                    let timed_out = wall_deadline
                        .is_some_and(|deadline| tokio::time::Instant::now() >= deadline)
                        || self.limits.max_silent.is_some_and(|max_silent| {
                            last_output.lock().unwrap().elapsed() >= max_silent
                        });
                    if timed_out {
                        kill_group(child_pid);
                        let _ = child.wait().await;
                        return Wait::TimedOut;
                    }
                }
            }
        }
    }
}

enum Wait {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
    Failed(String),
}

fn either_out(
    stream: tokio::process::ChildStdout,
) -> tokio::io::BufReader<Box<dyn tokio::io::AsyncRead + Send + Unpin>> {
    tokio::io::BufReader::new(Box::new(stream) as _)
}

fn either_err(
    stream: tokio::process::ChildStderr,
) -> tokio::io::BufReader<Box<dyn tokio::io::AsyncRead + Send + Unpin>> {
    tokio::io::BufReader::new(Box::new(stream) as _)
}

/// Send SIGTERM to the process group rooted at `pid`.
#[allow(unsafe_code)]
fn terminate_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: standard POSIX signal call; the group was created by us
        // via process_group(0).
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Send SIGKILL to the process group rooted at `pid`.
#[allow(unsafe_code)]
fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: as above.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// The system string a derivation must declare to run on this host.
pub fn host_system() -> String {
    let arch = std::env::consts::ARCH;
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    format!("{arch}-{os}")
}

/// Whether the host can run builders for `system`.
pub fn can_build_locally(system: &str) -> bool {
    if system == host_system() {
        return true;
    }
    // Builtins carry a pseudo-system and run anywhere.
    if system == "builtin" {
        return true;
    }
    if cfg!(target_os = "macos") && system.ends_with("-darwin") {
        warn!("sandboxed execution is unavailable on darwin; using the subprocess runner");
    }
    false
}
