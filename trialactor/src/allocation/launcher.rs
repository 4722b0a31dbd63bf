/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Launching tasks on granted resources.
//!
//! A [`TaskLauncher`] turns a [`TaskSpec`] and a [`ResourceGrant`] into
//! a running task, and reports the task's progress as [`TaskEvent`]s.
//! Every launched task eventually produces exactly one
//! [`TaskEvent::Stopped`].

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use enum_as_inner::EnumAsInner;
use nix::sys::signal;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::oneshot;

use super::AllocationSignal;
use crate::logging::LogLevel;
use crate::logging::TaskLog;
use crate::mailbox::PortHandle;
use crate::reference::AllocationId;
use crate::resource::ResourceGrant;
use crate::task_spec::TaskSpec;

/// The reason a task stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumAsInner)]
pub enum StopReason {
    /// The task exited successfully.
    Stopped,
    /// The task exited with the provided error code.
    Exited(i32),
    /// The task was killed. The signal number is indicated;
    /// the flags determines whether there was a core dump.
    Killed(i32, bool),
    /// The workload stopped because its user asked it to.
    UserRequested,
    /// The infrastructure running the task failed.
    Failed(String),
    /// The task stopped for an unknown reason.
    Unknown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Killed(signal, dumped) => {
                write!(f, "killed with signal {} (core dumped={})", signal, dumped)
            }
            Self::UserRequested => write!(f, "stopped by user request"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Progress of a launched task.
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum TaskEvent {
    /// The task is being started.
    Starting,
    /// The task is running.
    Running,
    /// The task produced a line of output.
    Output(TaskLog),
    /// The task stopped. Always the last event of a task.
    Stopped(StopReason),
}

/// Errors launching or signalling a task.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("the task has no entrypoint")]
    MissingEntrypoint,

    #[error("failed to spawn task: {0}")]
    Spawn(#[from] io::Error),

    #[error("no running task for allocation {0}")]
    NotRunning(AllocationId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Launches and signals tasks.
#[async_trait]
pub trait TaskLauncher: Send + Sync {
    /// Launch the task of `spec` on `grant`, reporting progress to
    /// `events`.
    async fn launch(
        &self,
        spec: TaskSpec,
        grant: ResourceGrant,
        events: PortHandle<TaskEvent>,
    ) -> Result<(), LaunchError>;

    /// Deliver a stop signal to a launched task.
    async fn signal(
        &self,
        allocation_id: &AllocationId,
        signal: AllocationSignal,
    ) -> Result<(), LaunchError>;
}

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Child {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
}

/// Runs each task as a local child process. `Terminate` delivers
/// `SIGTERM`; `Kill` kills the process outright.
#[derive(Default)]
pub struct ProcessLauncher {
    children: Arc<Mutex<HashMap<AllocationId, Child>>>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn exit_status_to_reason(result: io::Result<ExitStatus>) -> StopReason {
        match result {
            Ok(status) if status.success() => StopReason::Stopped,
            Ok(status) => {
                if let Some(signal) = status.signal() {
                    StopReason::Killed(signal, status.core_dumped())
                } else if let Some(code) = status.code() {
                    StopReason::Exited(code)
                } else {
                    StopReason::Unknown
                }
            }
            Err(e) => {
                tracing::error!("error waiting for process: {}", e);
                StopReason::Unknown
            }
        }
    }

    fn tail(
        stream: impl AsyncRead + Unpin + Send + 'static,
        std_type: &'static str,
        allocation_id: AllocationId,
        events: PortHandle<TaskEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let log = TaskLog {
                            allocation_id: Some(allocation_id.clone()),
                            timestamp: Some(Utc::now()),
                            level: Some(if std_type == "stderr" {
                                LogLevel::Error
                            } else {
                                LogLevel::Info
                            }),
                            std_type: Some(std_type.to_string()),
                            ..TaskLog::new(line)
                        };
                        if events.send(TaskEvent::Output(log)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(%allocation_id, "error reading task {}: {}", std_type, err);
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl TaskLauncher for ProcessLauncher {
    async fn launch(
        &self,
        spec: TaskSpec,
        grant: ResourceGrant,
        events: PortHandle<TaskEvent>,
    ) -> Result<(), LaunchError> {
        let (program, args) = spec
            .base
            .entrypoint
            .split_first()
            .ok_or(LaunchError::MissingEntrypoint)?;
        let allocation_id = spec.allocation_id.clone();

        let _ = events.send(TaskEvent::Starting);
        let mut process = Command::new(program)
            .args(args)
            .envs(spec.environment(&grant))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut tails = Vec::new();
        if let Some(stdout) = process.stdout.take() {
            tails.push(Self::tail(
                stdout,
                "stdout",
                allocation_id.clone(),
                events.clone(),
            ));
        }
        if let Some(stderr) = process.stderr.take() {
            tails.push(Self::tail(
                stderr,
                "stderr",
                allocation_id.clone(),
                events.clone(),
            ));
        }

        let (kill, killed) = oneshot::channel();
        self.children.lock().expect("launcher state poisoned").insert(
            allocation_id.clone(),
            Child {
                pid: process.id(),
                kill: Some(kill),
            },
        );
        tracing::info!(%allocation_id, pid = ?process.id(), "launched task");
        let _ = events.send(TaskEvent::Running);

        let children = Arc::clone(&self.children);
        tokio::spawn(async move {
            let reason = tokio::select! {
                Ok(()) = killed => {
                    match process.kill().await {
                        Err(e) => {
                            tracing::error!("error killing process: {}", e);
                            StopReason::Unknown
                        }
                        Ok(_) => Self::exit_status_to_reason(process.wait().await),
                    }
                }
                result = process.wait() => Self::exit_status_to_reason(result),
            };
            // Deliver the output before the stop, unless a descendant of the
            // task keeps its pipes open.
            for tail in tails {
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, tail).await.is_err() {
                    tracing::warn!(%allocation_id, "task output still open after exit");
                }
            }
            children
                .lock()
                .expect("launcher state poisoned")
                .remove(&allocation_id);
            tracing::info!(%allocation_id, %reason, "task stopped");
            let _ = events.send(TaskEvent::Stopped(reason));
        });
        Ok(())
    }

    async fn signal(
        &self,
        allocation_id: &AllocationId,
        stop: AllocationSignal,
    ) -> Result<(), LaunchError> {
        let mut children = self.children.lock().expect("launcher state poisoned");
        let child = children
            .get_mut(allocation_id)
            .ok_or_else(|| LaunchError::NotRunning(allocation_id.clone()))?;
        match stop {
            AllocationSignal::Terminate => {
                let pid = child
                    .pid
                    .ok_or_else(|| LaunchError::NotRunning(allocation_id.clone()))?;
                signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                    .map_err(|err| anyhow::anyhow!("failed to terminate {}: {}", pid, err))?;
            }
            AllocationSignal::Kill => {
                if let Some(kill) = child.kill.take() {
                    let _ = kill.send(());
                }
            }
        }
        Ok(())
    }
}
