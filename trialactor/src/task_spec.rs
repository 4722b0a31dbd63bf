/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The launch specification of one run of a trial.
//!
//! A [`TaskSpec`] is built by the trial, on request of its allocation
//! ([`BuildTaskSpec`]), once resources have been granted. Building it is
//! where a trial first becomes durable, and it fails with
//! [`TaskSpecError::AlreadyCancelled`] if the trial is no longer active,
//! so that stale work is never launched.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::config::TrialConfig;
use crate::db::DbError;
use crate::mailbox::OncePortHandle;
use crate::reference::AllocationId;
use crate::reference::ExperimentId;
use crate::reference::TaskId;
use crate::reference::TrialId;
use crate::resource::ResourceGrant;

/// A host path made available to the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// The parts of a task spec shared by every run of every trial of an
/// experiment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBase {
    pub image: String,
    /// The command the task runs.
    pub entrypoint: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub user: Option<String>,
}

/// An SSH key pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKeys {
    pub private_key: String,
    pub public_key: String,
}

impl fmt::Debug for SshKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshKeys")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generates the SSH keys a trial's containers use to reach each other.
#[cfg_attr(test, mockall::automock)]
pub trait KeyGenerator: Send + Sync {
    /// Generate an RSA key pair of `bits` bits.
    fn generate(&self, bits: usize) -> Result<SshKeys, anyhow::Error>;
}

/// Everything needed to launch one run of a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub base: TaskBase,
    pub task_id: TaskId,
    pub allocation_id: AllocationId,
    pub experiment_id: ExperimentId,
    pub trial_id: TrialId,
    pub trial_run_id: u32,
    pub trial_config: TrialConfig,
    pub hparams: serde_json::Value,
    pub trial_seed: u64,
    pub steps_completed: u64,
    /// UUID of the checkpoint to start from.
    pub latest_checkpoint: Option<String>,
    pub keys: SshKeys,
}

impl TaskSpec {
    /// The environment of the task's process when running on `grant`.
    pub fn environment(&self, grant: &ResourceGrant) -> BTreeMap<String, String> {
        let mut environment = self.base.environment.clone();
        environment.extend([
            ("TRIAL_TASK_ID".to_string(), self.task_id.to_string()),
            (
                "TRIAL_ALLOCATION_ID".to_string(),
                self.allocation_id.to_string(),
            ),
            (
                "TRIAL_EXPERIMENT_ID".to_string(),
                self.experiment_id.to_string(),
            ),
            ("TRIAL_ID".to_string(), self.trial_id.to_string()),
            ("TRIAL_RUN_ID".to_string(), self.trial_run_id.to_string()),
            ("TRIAL_SEED".to_string(), self.trial_seed.to_string()),
            ("TRIAL_HPARAMS".to_string(), self.hparams.to_string()),
            (
                "TRIAL_STEPS_COMPLETED".to_string(),
                self.steps_completed.to_string(),
            ),
            ("TRIAL_SLOTS".to_string(), grant.slots().to_string()),
        ]);
        if let Some(checkpoint) = &self.latest_checkpoint {
            environment.insert("TRIAL_LATEST_CHECKPOINT".to_string(), checkpoint.clone());
        }
        environment
    }
}

/// Errors building a task spec.
#[derive(Debug, thiserror::Error)]
pub enum TaskSpecError {
    /// The trial stopped being active after the allocation was
    /// requested. The allocation should exit without launching.
    #[error("trial was cancelled before its allocation launched")]
    AlreadyCancelled,

    #[error("failed to generate keys for trial: {0:#}")]
    KeyGeneration(anyhow::Error),

    #[error("failed to save trial to database: {0}")]
    AddTrial(#[source] DbError),

    #[error("failed to save trial run ID: {0}")]
    UpdateRunId(#[source] DbError),

    #[error("failed to query latest checkpoint for trial: {0}")]
    LatestCheckpoint(#[source] DbError),
}

/// Asks a trial to build the spec for its current allocation.
#[derive(Debug)]
pub struct BuildTaskSpec {
    pub reply: OncePortHandle<Result<TaskSpec, TaskSpecError>>,
}
