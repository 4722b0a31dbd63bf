/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Logging.
//!
//! Two separate streams live here. Diagnostics go through `tracing`
//! and are installed by [`initialize_logging`]. Task logs are
//! user-visible, per-task records ([`TaskLog`]) that the
//! [`TaskLogger`] writes to a [`LogBackend`] in batches, off the
//! caller's path.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

use crate::config::TaskLogConfig;
use crate::reference::AllocationId;
use crate::reference::TaskId;

/// Install a global `tracing` subscriber that writes formatted events
/// to stderr, filtered by `RUST_LOG` (default `info`). Calling it again
/// is a no-op.
pub fn initialize_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        tracing::debug!("logging already initialized: {}", err);
    }
}

/// Severity of a task log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// A user-visible log line attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    pub task_id: Option<TaskId>,
    pub allocation_id: Option<AllocationId>,
    pub container_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Option<LogLevel>,
    pub log: String,
    pub source: Option<String>,
    pub std_type: Option<String>,
}

impl TaskLog {
    /// A log line with no metadata.
    pub fn new(log: impl Into<String>) -> Self {
        Self {
            log: log.into(),
            ..Default::default()
        }
    }

    /// Set the log's level.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }
}

/// Where task logs are stored.
#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Store a batch of logs.
    async fn add_task_logs(&self, logs: Vec<TaskLog>) -> Result<(), anyhow::Error>;
}

/// `tokio::time::interval` rejects a zero period.
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

enum Command {
    Insert(TaskLog),
    Flush(oneshot::Sender<()>),
}

/// Batches task logs and writes them to a [`LogBackend`] from a
/// background task. Insertion never blocks; write failures are logged
/// and the batch is dropped.
#[derive(Debug, Clone)]
pub struct TaskLogger {
    sender: mpsc::UnboundedSender<Command>,
}

impl TaskLogger {
    /// Start a logger writing to `backend`. Must be called from within a
    /// tokio runtime.
    pub fn new(backend: Arc<dyn LogBackend>, config: &TaskLogConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(
            flush_loop(
                backend,
                receiver,
                config.batch_size.max(1),
                config.flush_interval.max(MIN_FLUSH_INTERVAL),
            )
            .in_current_span(),
        );
        Self { sender }
    }

    /// Queue a log for writing.
    pub fn insert(&self, log: TaskLog) {
        if self.sender.send(Command::Insert(log)).is_err() {
            tracing::warn!("task logger stopped; dropping task log");
        }
    }

    /// Write everything queued so far, returning once the backend has
    /// been called.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

async fn flush_loop(
    backend: Arc<dyn LogBackend>,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buffer = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(Command::Insert(log)) => {
                    buffer.push(log);
                    if buffer.len() >= batch_size {
                        write_batch(&*backend, &mut buffer).await;
                    }
                }
                Some(Command::Flush(done)) => {
                    write_batch(&*backend, &mut buffer).await;
                    let _ = done.send(());
                }
                None => {
                    write_batch(&*backend, &mut buffer).await;
                    break;
                }
            },
            _ = ticker.tick() => write_batch(&*backend, &mut buffer).await,
        }
    }
}

async fn write_batch(backend: &dyn LogBackend, buffer: &mut Vec<TaskLog>) {
    if buffer.is_empty() {
        return;
    }
    let batch = mem::take(buffer);
    let count = batch.len();
    if let Err(err) = backend.add_task_logs(batch).await {
        tracing::warn!(count, "failed to write task logs: {:#}", err);
    }
}
