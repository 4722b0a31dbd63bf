/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The trial actor.
//!
//! A trial is one hyperparameter configuration of an experiment, run
//! to completion (or failure) through a sequence of allocations. The
//! trial owns the desired [`TrialState`]; it reconciles its single
//! live allocation against that state every time either changes:
//!
//! * While `Active` and the searcher wants more work, it keeps exactly
//!   one allocation requested, rescheduling after failures within the
//!   restart budget.
//! * `Paused` terminates the live allocation and requests no new one.
//! * The `Stopping*` states signal the live allocation (if any) and
//!   resolve to their terminal state once it has exited.
//! * Terminal states stop the actor.
//!
//! Every state change is persisted once the trial has an id. A trial
//! gets its id lazily, when its first allocation asks for a task spec,
//! so a trial canceled before it ever ran leaves no record behind.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::actor;
use crate::actor::Actor;
use crate::actor::ActorHandle;
use crate::actor::Context;
use crate::actor::Handler;
use crate::allocation::AllocationExited;
use crate::allocation::AllocationOwner;
use crate::allocation::AllocationRef;
use crate::allocation::AllocationSignal;
use crate::allocation::Allocator;
use crate::allocation::ChangeResourcePool;
use crate::config::global;
use crate::config::Config;
use crate::config::TrialConfig;
use crate::db::AllocationRecord;
use crate::db::Checkpoint;
use crate::db::DbError;
use crate::db::NewTrial;
use crate::db::Persistence;
use crate::db::TaskRecord;
use crate::db::TaskType;
use crate::db::CURRENT_TASK_LOG_VERSION;
use crate::logging::LogLevel;
use crate::logging::TaskLog;
use crate::logging::TaskLogger;
use crate::mailbox::OncePortHandle;
use crate::mailbox::PortHandle;
use crate::reference::AllocationId;
use crate::reference::ExperimentId;
use crate::reference::JobId;
use crate::reference::RequestId;
use crate::reference::TaskId;
use crate::reference::TrialId;
use crate::resource::AllocateRequest;
use crate::resource::FittingRequirements;
use crate::resource::ResourceManager;
use crate::state::ExitedReason;
use crate::state::TrialState;
use crate::task_spec::BuildTaskSpec;
use crate::task_spec::KeyGenerator;
use crate::task_spec::SshKeys;
use crate::task_spec::TaskBase;
use crate::task_spec::TaskSpec;
use crate::task_spec::TaskSpecError;

/// What the searcher asked for when it created the trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherCreate {
    pub request_id: RequestId,
    pub hparams: serde_json::Value,
    pub trial_seed: u64,
}

/// The searcher's view of a trial, pushed by the orchestrator whenever
/// it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherState {
    pub create: SearcherCreate,
    /// The searcher has no more work for the trial.
    pub complete: bool,
    /// The searcher will never give the trial more work.
    pub closed: bool,
}

/// Notifications a trial sends its orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialNotification {
    /// The trial was persisted for the first time.
    Created {
        request_id: RequestId,
        trial_id: TrialId,
    },
    /// The trial ended before the searcher said it was done.
    EarlyExit {
        request_id: RequestId,
        reason: ExitedReason,
    },
    /// The trial actor stopped. Always the last notification.
    Stopped {
        request_id: RequestId,
        state: TrialState,
    },
}

/// Requests that the trial be killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillTrial;

/// Reported by the workload when it exits early of its own accord.
#[derive(Debug)]
pub struct UserInitiatedEarlyExit {
    pub reason: ExitedReason,
    pub reply: OncePortHandle<Result<(), TrialError>>,
}

/// A snapshot of a trial's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialSnapshot {
    pub state: TrialState,
    pub trial_id: Option<TrialId>,
    pub run_id: u32,
    pub restarts: u32,
    pub allocation_id: Option<AllocationId>,
}

/// Asks a trial for a [`TrialSnapshot`].
#[derive(Debug)]
pub struct GetTrialSnapshot {
    pub reply: OncePortHandle<TrialSnapshot>,
}

/// Errors of trial operations.
#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    #[error("should not report special exit reason {0} to the master")]
    ReservedExitReason(ExitedReason),

    #[error("discovered {count} open allocations on restore: {allocation_ids}")]
    AmbiguousRestore {
        count: usize,
        /// Up to three of the open allocations, space separated.
        allocation_ids: String,
    },

    #[error("cannot handle trial log before ID is set")]
    NoTrialId,

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Parameters of a [`Trial`].
pub struct TrialParams {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub job_submission_time: DateTime<Utc>,
    pub experiment_id: ExperimentId,
    /// Set when the trial was persisted before, i.e. when it is being
    /// recovered after a restart.
    pub trial_id: Option<TrialId>,
    /// Whether the trial is being recovered after a restart, and may
    /// reattach to an allocation that survived it.
    pub restored: bool,
    pub initial_state: TrialState,
    pub searcher: SearcherState,
    pub trial_config: TrialConfig,
    /// Process configuration; `None` takes a snapshot of the
    /// [`global`] configuration when the trial is created.
    pub config: Option<Config>,
    pub task_base: TaskBase,
    pub warm_start_checkpoint: Option<Checkpoint>,
    pub orchestrator: PortHandle<TrialNotification>,
    pub allocator: Arc<dyn Allocator>,
    pub resource_manager: Arc<dyn ResourceManager>,
    pub db: Arc<dyn Persistence>,
    pub task_logger: TaskLogger,
    pub key_generator: Arc<dyn KeyGenerator>,
}

/// The trial actor.
pub struct Trial {
    task_id: TaskId,
    job_id: JobId,
    job_submission_time: DateTime<Utc>,
    experiment_id: ExperimentId,
    id: Option<TrialId>,
    restored: bool,

    state: TrialState,
    searcher: SearcherState,
    restarts: u32,
    run_id: u32,
    allocation: Option<AllocationRef>,
    user_initiated_exit: Option<ExitedReason>,

    trial_config: TrialConfig,
    config: Config,
    task_base: TaskBase,
    warm_start_checkpoint: Option<Checkpoint>,
    generated_keys: Option<SshKeys>,

    orchestrator: PortHandle<TrialNotification>,
    allocator: Arc<dyn Allocator>,
    resource_manager: Arc<dyn ResourceManager>,
    db: Arc<dyn Persistence>,
    task_logger: TaskLogger,
    key_generator: Arc<dyn KeyGenerator>,
}

/// Spawn a trial actor.
pub async fn spawn_trial(params: TrialParams) -> Result<ActorHandle<Trial>, anyhow::Error> {
    let name = format!("trial[{}]", params.task_id);
    actor::spawn::<Trial>(&name, params).await
}

impl Trial {
    fn notify(&self, notification: TrialNotification) {
        if let Err(err) = self.orchestrator.send(notification) {
            tracing::warn!(task_id = %self.task_id, "orchestrator unreachable: {}", err);
        }
    }

    fn report_early_exit(&self, reason: ExitedReason) {
        self.notify(TrialNotification::EarlyExit {
            request_id: self.searcher.create.request_id.clone(),
            reason,
        });
    }

    fn snapshot(&self) -> TrialSnapshot {
        TrialSnapshot {
            state: self.state,
            trial_id: self.id,
            run_id: self.run_id,
            restarts: self.restarts,
            allocation_id: self
                .allocation
                .as_ref()
                .map(|allocation| allocation.allocation_id().clone()),
        }
    }

    fn signal_allocation(&self, signal: AllocationSignal) {
        if let Some(allocation) = &self.allocation {
            if let Err(err) = allocation.signal(signal) {
                tracing::warn!(
                    allocation_id = %allocation.allocation_id(),
                    %signal,
                    "failed to signal allocation: {}",
                    err
                );
            }
        }
    }

    /// Reload the run ID and restart count of a trial that was persisted
    /// before.
    async fn recover(&mut self, id: TrialId) -> Result<(), anyhow::Error> {
        let (run_id, restarts) = self
            .db
            .trial_run_id_and_restarts(id)
            .await
            .context("restoring old trial state")?;
        self.run_id = run_id;
        self.restarts = restarts;
        tracing::info!(trial_id = %id, run_id, restarts, "recovered trial");
        Ok(())
    }

    /// Validate a requested state change and apply it.
    async fn patch_state(
        &mut self,
        cx: &Context<Self>,
        requested: TrialState,
    ) -> Result<(), anyhow::Error> {
        if self.state.is_terminal() {
            tracing::info!(
                "ignoring transition in terminal state ({} -> {})",
                self.state,
                requested
            );
            Ok(())
        } else if requested.is_terminal() {
            tracing::info!("ignoring patch to terminal state {}", requested);
            Ok(())
        } else if self.state == requested {
            // Checked before severity, so repeated kills are resent.
            tracing::info!("resending actions for transition for {}", self.state);
            self.transition(cx, requested).await
        } else if self.state.is_stopping() && !self.state.can_transition_to(requested) {
            tracing::info!("ignoring patch to less severe stopping state ({})", requested);
            Ok(())
        } else {
            tracing::debug!("patching state after request ({})", requested);
            self.transition(cx, requested).await
        }
    }

    /// Move to `state`, persisting it, and bring the live allocation in
    /// line with it. A stopping state with no live allocation resolves
    /// to its terminal state straight away.
    async fn transition(
        &mut self,
        cx: &Context<Self>,
        state: TrialState,
    ) -> Result<(), anyhow::Error> {
        let mut next = state;
        loop {
            if self.state != next {
                tracing::info!("trial changed from state {} to {}", self.state, next);
                if let Some(id) = self.id {
                    self.db
                        .update_trial(id, next)
                        .await
                        .context("updating trial with end state")?;
                }
                self.state = next;
            }

            if let Some(terminal) = self.state.terminal_state() {
                let Some(allocation) = &self.allocation else {
                    tracing::info!("stopping trial before resources are requested");
                    next = terminal;
                    continue;
                };
                let signal = match self.state {
                    TrialState::StoppingCanceled => Some(AllocationSignal::Terminate),
                    TrialState::StoppingKilled | TrialState::StoppingError => {
                        Some(AllocationSignal::Kill)
                    }
                    _ => None,
                };
                if let Some(signal) = signal {
                    tracing::info!(
                        allocation_id = %allocation.allocation_id(),
                        "decided to {} trial",
                        signal
                    );
                    self.signal_allocation(signal);
                }
                return Ok(());
            }

            return match self.state {
                TrialState::Active => self.maybe_allocate_task(cx).await,
                TrialState::Paused => {
                    if self.allocation.is_some() {
                        tracing::info!(
                            "decided to {} trial due to pause",
                            AllocationSignal::Terminate
                        );
                        self.signal_allocation(AllocationSignal::Terminate);
                    }
                    Ok(())
                }
                _ => {
                    if self.state == TrialState::Errored {
                        self.report_early_exit(ExitedReason::Errored);
                    }
                    cx.stop();
                    Ok(())
                }
            };
        }
    }

    async fn add_task(&self) -> Result<(), DbError> {
        self.db
            .add_task(TaskRecord {
                task_id: self.task_id.clone(),
                task_type: TaskType::Trial,
                start_time: self.job_submission_time,
                end_time: None,
                job_id: Some(self.job_id.clone()),
                log_version: CURRENT_TASK_LOG_VERSION,
            })
            .await
    }

    /// Request an allocation if the trial is active, the searcher wants
    /// more work, and none is live.
    async fn maybe_allocate_task(&mut self, cx: &Context<Self>) -> Result<(), anyhow::Error> {
        if !(self.allocation.is_none()
            && !self.searcher.complete
            && self.state == TrialState::Active)
        {
            return Ok(());
        }

        let name = match self.id {
            Some(id) => format!("Trial {} (Experiment {})", id, self.experiment_id),
            None => format!("Trial (Experiment {})", self.experiment_id),
        };
        tracing::info!(run_id = self.run_id, "decided to allocate trial");
        self.add_task().await?;

        let restored = match self.maybe_restore_allocation().await {
            Ok(restored) => restored,
            Err(err) => {
                tracing::warn!("failed to restore trial allocation: {}", err);
                None
            }
        };
        let (allocation_id, resource_pool, restore) = match restored {
            Some(record) => {
                tracing::info!(
                    allocation_id = %record.allocation_id,
                    "starting restored trial allocation"
                );
                (record.allocation_id, record.resource_pool, true)
            }
            None => {
                self.run_id += 1;
                let allocation_id = AllocationId::new(&self.task_id, self.run_id);
                tracing::debug!(%allocation_id, "starting new trial allocation");
                (
                    allocation_id,
                    self.trial_config.resources.resource_pool.clone(),
                    false,
                )
            }
        };

        let request = AllocateRequest {
            allocation_id,
            task_id: self.task_id.clone(),
            job_id: self.job_id.clone(),
            job_submission_time: self.job_submission_time,
            is_user_visible: true,
            name,
            slots_needed: self.trial_config.resources.slots_per_trial,
            label: self.trial_config.resources.agent_label.clone(),
            resource_pool,
            fitting_requirements: FittingRequirements {
                single_agent: false,
            },
            preemptible: true,
            restore,
        };
        let owner = AllocationOwner {
            exited: cx.port(),
            build_task_spec: cx.port(),
            logs: cx.port(),
        };
        let allocation = self
            .allocator
            .allocate(request, self.run_id, owner)
            .await?;
        self.allocation = Some(allocation);
        Ok(())
    }

    /// The allocation to reattach to, if the trial is being recovered,
    /// reattachment is enabled, and exactly one allocation of its task
    /// was left open.
    async fn maybe_restore_allocation(&self) -> Result<Option<AllocationRecord>, TrialError> {
        if !self.restored || !self.config.reattach.enabled {
            return Ok(None);
        }
        let open = self.db.open_allocations(self.task_id.clone()).await?;
        match open.as_slice() {
            [] => Ok(None),
            [record] => {
                if !self.config.reattach.is_enabled_for_pool(&record.resource_pool) {
                    return Ok(None);
                }
                Ok(Some(record.clone()))
            }
            _ => Err(TrialError::AmbiguousRestore {
                count: open.len(),
                allocation_ids: open
                    .iter()
                    .take(3)
                    .map(|record| record.allocation_id.to_string())
                    .collect::<Vec<_>>()
                    .join(" "),
            }),
        }
    }

    /// Build the spec of the live allocation's task, persisting the
    /// trial first if this is its first run.
    async fn build_task_spec(&mut self) -> Result<TaskSpec, TaskSpecError> {
        // The trial may have been stopped between requesting the
        // allocation and the allocation receiving its resources.
        if self.state != TrialState::Active {
            return Err(TaskSpecError::AlreadyCancelled);
        }
        let Some(allocation_id) = self
            .allocation
            .as_ref()
            .map(|allocation| allocation.allocation_id().clone())
        else {
            return Err(TaskSpecError::AlreadyCancelled);
        };

        let keys = match &self.generated_keys {
            Some(keys) => keys.clone(),
            None => {
                let keys = self
                    .key_generator
                    .generate(self.config.ssh_rsa_size)
                    .map_err(TaskSpecError::KeyGeneration)?;
                self.generated_keys = Some(keys.clone());
                keys
            }
        };

        let trial_id = match self.id {
            Some(id) => id,
            None => self.add_trial().await?,
        };

        self.db
            .update_trial_run_id(trial_id, self.run_id)
            .await
            .map_err(TaskSpecError::UpdateRunId)?;

        let (latest_checkpoint, steps_completed) = match self
            .db
            .latest_checkpoint_for_trial(trial_id)
            .await
            .map_err(TaskSpecError::LatestCheckpoint)?
        {
            Some(checkpoint) => (Some(checkpoint.uuid), checkpoint.steps_completed),
            None => (
                self.warm_start_checkpoint
                    .as_ref()
                    .map(|checkpoint| checkpoint.uuid.clone()),
                0,
            ),
        };

        Ok(TaskSpec {
            base: self.task_base.clone(),
            task_id: self.task_id.clone(),
            allocation_id,
            experiment_id: self.experiment_id,
            trial_id,
            trial_run_id: self.run_id,
            trial_config: self.trial_config.clone(),
            hparams: self.searcher.create.hparams.clone(),
            trial_seed: self.searcher.create.trial_seed,
            steps_completed,
            latest_checkpoint,
            keys,
        })
    }

    async fn add_trial(&mut self) -> Result<TrialId, TaskSpecError> {
        let id = self
            .db
            .add_trial(NewTrial {
                task_id: self.task_id.clone(),
                job_id: self.job_id.clone(),
                request_id: self.searcher.create.request_id.clone(),
                experiment_id: self.experiment_id,
                state: self.state,
                hparams: self.searcher.create.hparams.clone(),
                warm_start_checkpoint: self
                    .warm_start_checkpoint
                    .as_ref()
                    .map(|checkpoint| checkpoint.uuid.clone()),
                seed: self.searcher.create.trial_seed,
            })
            .await
            .map_err(TaskSpecError::AddTrial)?;
        self.id = Some(id);
        tracing::info!(trial_id = %id, "trial persisted");

        let name = format!("Trial {} (Experiment {})", id, self.experiment_id);
        if let Err(err) = self
            .resource_manager
            .set_task_name(&self.task_id, &name)
            .await
        {
            tracing::warn!("failed to set task name: {}", err);
        }
        self.notify(TrialNotification::Created {
            request_id: self.searcher.create.request_id.clone(),
            trial_id: id,
        });
        Ok(id)
    }

    /// Decide what an allocation's exit means for the trial: stop for
    /// good, or reschedule.
    async fn allocation_exited(
        &mut self,
        cx: &Context<Self>,
        exit: AllocationExited,
    ) -> Result<(), anyhow::Error> {
        self.allocation = None;

        if let Some(terminal) = self.state.terminal_state() {
            let next = match exit.err {
                Some(_) => TrialState::Errored,
                None => terminal,
            };
            return self.transition(cx, next).await;
        }
        if self.searcher.complete && self.searcher.closed {
            let next = match exit.err {
                Some(_) => TrialState::Errored,
                None => TrialState::Completed,
            };
            return self.transition(cx, next).await;
        }

        match &exit.err {
            Some(err) if err.is_unrecoverable() => {
                tracing::error!("trial encountered unrecoverable failure: {}", err);
                return self.transition(cx, TrialState::Errored).await;
            }
            Some(err) if err.is_transient() => {
                tracing::error!("trial encountered transient system error: {}", err);
            }
            Some(err) => {
                tracing::error!(
                    "trial failed (restart {}/{}): {}",
                    self.restarts,
                    self.trial_config.max_restarts,
                    err
                );
                self.restarts += 1;
                if let Some(id) = self.id {
                    self.db.update_trial_restarts(id, self.restarts).await?;
                }
                if self.restarts > self.trial_config.max_restarts {
                    return self.transition(cx, TrialState::Errored).await;
                }
            }
            None if exit.user_requested_stop => {
                self.report_early_exit(ExitedReason::UserCanceled);
                return self.transition(cx, TrialState::Completed).await;
            }
            None => {
                if let Some(reason) = self.user_initiated_exit {
                    self.report_early_exit(reason);
                    return self.transition(cx, TrialState::Completed).await;
                }
            }
        }

        self.maybe_allocate_task(cx)
            .await
            .context("failed to reschedule trial")
    }

    fn enrich_task_log(&self, mut log: TaskLog) -> Result<TaskLog, TrialError> {
        if self.id.is_none() {
            return Err(TrialError::NoTrialId);
        }
        log.task_id = Some(self.task_id.clone());
        log.timestamp.get_or_insert_with(Utc::now);
        log.level.get_or_insert(LogLevel::Info);
        log.source.get_or_insert_with(|| "master".to_string());
        log.std_type.get_or_insert_with(|| "stdout".to_string());
        if !log.log.ends_with('\n') {
            log.log.push('\n');
        }
        Ok(log)
    }
}

#[async_trait]
impl Actor for Trial {
    type Params = TrialParams;

    async fn new(params: TrialParams) -> Result<Self, anyhow::Error> {
        Ok(Self {
            task_id: params.task_id,
            job_id: params.job_id,
            job_submission_time: params.job_submission_time,
            experiment_id: params.experiment_id,
            id: params.trial_id,
            restored: params.restored,
            state: params.initial_state,
            searcher: params.searcher,
            restarts: 0,
            run_id: 0,
            allocation: None,
            user_initiated_exit: None,
            trial_config: params.trial_config,
            config: params.config.unwrap_or_else(global::get),
            task_base: params.task_base,
            warm_start_checkpoint: params.warm_start_checkpoint,
            generated_keys: None,
            orchestrator: params.orchestrator,
            allocator: params.allocator,
            resource_manager: params.resource_manager,
            db: params.db,
            task_logger: params.task_logger,
            key_generator: params.key_generator,
        })
    }

    async fn init(&mut self, cx: &Context<Self>) -> Result<(), anyhow::Error> {
        if let Some(id) = self.id {
            self.recover(id).await?;
        }
        self.maybe_allocate_task(cx).await
    }

    async fn cleanup(
        &mut self,
        cx: &Context<Self>,
        failure: Option<&anyhow::Error>,
    ) -> Result<(), anyhow::Error> {
        if let Some(failure) = failure {
            tracing::error!("trial failed: {:#}", failure);
        }
        // Nothing else will ever reap a live allocation.
        if self.allocation.is_some() {
            self.signal_allocation(AllocationSignal::Kill);
            self.allocation = None;
        }
        let result = if self.id.is_some() && !self.state.is_terminal() {
            self.transition(cx, TrialState::Errored).await
        } else {
            Ok(())
        };
        self.notify(TrialNotification::Stopped {
            request_id: self.searcher.create.request_id.clone(),
            state: self.state,
        });
        result
    }
}

#[async_trait]
impl Handler<TrialState> for Trial {
    async fn handle(&mut self, cx: &Context<Self>, state: TrialState) -> Result<(), anyhow::Error> {
        self.patch_state(cx, state).await
    }
}

#[async_trait]
impl Handler<KillTrial> for Trial {
    async fn handle(&mut self, cx: &Context<Self>, _kill: KillTrial) -> Result<(), anyhow::Error> {
        if let Ok(log) = self.enrich_task_log(
            TaskLog::new("Someone is requesting to kill this trial").with_level(LogLevel::Warning),
        ) {
            self.task_logger.insert(log);
        }
        self.patch_state(cx, TrialState::StoppingKilled).await
    }
}

#[async_trait]
impl Handler<SearcherState> for Trial {
    async fn handle(
        &mut self,
        cx: &Context<Self>,
        searcher: SearcherState,
    ) -> Result<(), anyhow::Error> {
        self.searcher = searcher;
        if !self.searcher.complete {
            self.maybe_allocate_task(cx).await
        } else if self.searcher.closed {
            self.patch_state(cx, TrialState::StoppingCompleted).await
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Handler<ChangeResourcePool> for Trial {
    async fn handle(
        &mut self,
        _cx: &Context<Self>,
        change: ChangeResourcePool,
    ) -> Result<(), anyhow::Error> {
        tracing::info!(pool = %change.resource_pool, "changing resource pool");
        self.trial_config.resources.resource_pool = change.resource_pool.clone();
        if let Some(allocation) = &self.allocation {
            if let Err(err) = allocation.change_resource_pool(&change.resource_pool) {
                tracing::warn!(
                    allocation_id = %allocation.allocation_id(),
                    "failed to move allocation: {}",
                    err
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<BuildTaskSpec> for Trial {
    async fn handle(
        &mut self,
        _cx: &Context<Self>,
        request: BuildTaskSpec,
    ) -> Result<(), anyhow::Error> {
        let spec = self.build_task_spec().await;
        if let Err(err) = &spec {
            tracing::warn!("failed to build task spec: {}", err);
        }
        if request.reply.send(spec).is_err() {
            tracing::debug!("allocation went away before its task spec was built");
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<UserInitiatedEarlyExit> for Trial {
    async fn handle(
        &mut self,
        cx: &Context<Self>,
        exit: UserInitiatedEarlyExit,
    ) -> Result<(), anyhow::Error> {
        let result = match exit.reason {
            ExitedReason::InvalidHp | ExitedReason::InitInvalidHp => {
                tracing::info!(reason = %exit.reason, "workload reported early exit");
                self.user_initiated_exit = Some(exit.reason);
                // Force cleanup if the workload does not exit in time.
                cx.notify_after(self.config.invalid_hp_kill_delay, TrialState::StoppingKilled);
                Ok(())
            }
            ExitedReason::UserCanceled | ExitedReason::Errored => {
                Err(TrialError::ReservedExitReason(exit.reason))
            }
        };
        let _ = exit.reply.send(result);
        Ok(())
    }
}

#[async_trait]
impl Handler<AllocationExited> for Trial {
    async fn handle(
        &mut self,
        cx: &Context<Self>,
        exit: AllocationExited,
    ) -> Result<(), anyhow::Error> {
        if self.allocation.is_none() || exit.run_id != self.run_id {
            tracing::debug!(
                run_id = exit.run_id,
                current_run_id = self.run_id,
                "ignoring exit of stale allocation"
            );
            return Ok(());
        }
        self.allocation_exited(cx, exit).await
    }
}

#[async_trait]
impl Handler<TaskLog> for Trial {
    async fn handle(&mut self, _cx: &Context<Self>, log: TaskLog) -> Result<(), anyhow::Error> {
        match self.enrich_task_log(log) {
            Ok(log) => self.task_logger.insert(log),
            Err(err) => tracing::warn!("dropping trial log: {}", err),
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<GetTrialSnapshot> for Trial {
    async fn handle(
        &mut self,
        _cx: &Context<Self>,
        request: GetTrialSnapshot,
    ) -> Result<(), anyhow::Error> {
        let _ = request.reply.send(self.snapshot());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::actor::ActorStatus;
    use crate::allocation::ExitError;
    use crate::db::MockPersistence;
    use crate::mailbox::open_once_port;
    use crate::mailbox::PortReceiver;
    use crate::task_spec::MockKeyGenerator;
    use crate::test_utils::recv;
    use crate::test_utils::RecordingAllocator;
    use crate::test_utils::SpawnedAllocation;
    use crate::test_utils::TestEnv;

    struct Running {
        env: TestEnv,
        allocator: Arc<RecordingAllocator>,
        handle: ActorHandle<Trial>,
        notifications: PortReceiver<TrialNotification>,
    }

    impl Running {
        async fn start() -> Self {
            Self::start_with(|_| {}).await
        }

        async fn start_with(configure: impl FnOnce(&mut TrialParams)) -> Self {
            let env = TestEnv::new();
            let allocator = RecordingAllocator::new();
            let (mut params, notifications) =
                env.trial_params(Config::default(), allocator.clone());
            configure(&mut params);
            let handle = spawn_trial(params).await.unwrap();
            Self {
                env,
                allocator,
                handle,
                notifications,
            }
        }

        /// The next allocation, after it has built its task spec.
        async fn launched(&self) -> SpawnedAllocation {
            let allocation = self.allocator.next().await;
            allocation.build_task_spec().await.unwrap();
            allocation
        }

        async fn snapshot(&self) -> TrialSnapshot {
            let (reply, receiver) = open_once_port();
            self.handle.send(GetTrialSnapshot { reply }).unwrap();
            receiver.recv().await.unwrap()
        }

        async fn stopped(self) -> (TrialState, Vec<TrialNotification>) {
            let Running {
                handle,
                mut notifications,
                ..
            } = self;
            assert_eq!(handle.await, ActorStatus::Stopped);
            let all = notifications.drain();
            match all.last() {
                Some(TrialNotification::Stopped { state, .. }) => (*state, all),
                other => panic!("unexpected last notification: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_first_spec_persists_trial() {
        let mut running = Running::start().await;
        let allocation = running.allocator.next().await;
        assert_eq!(allocation.run_id, 1);
        assert_eq!(allocation.request.name, "Trial (Experiment 1)");
        assert_eq!(
            allocation.allocation_id(),
            &AllocationId::new(&running.env.task_id, 1)
        );
        assert!(allocation.request.preemptible);
        assert!(!allocation.request.restore);
        assert!(!allocation.request.fitting_requirements.single_agent);
        assert!(running.env.db.task(&running.env.task_id).is_some());

        let spec = allocation.build_task_spec().await.unwrap();
        let trial_id = spec.trial_id;
        assert_eq!(spec.trial_run_id, 1);
        assert_eq!(spec.steps_completed, 0);
        assert_eq!(spec.trial_seed, 42);
        assert!(matches!(
            recv(&mut running.notifications).await,
            TrialNotification::Created { trial_id: id, .. } if id == trial_id
        ));
        let record = running.env.db.trial(trial_id).unwrap();
        assert_eq!(record.state, TrialState::Active);
        assert_eq!(record.run_id, 1);
        assert_eq!(
            running.env.resource_manager.task_name(&running.env.task_id),
            Some(format!("Trial {} (Experiment 1)", trial_id))
        );

        // Keys are generated once, and the trial persisted once.
        let again = allocation.build_task_spec().await.unwrap();
        assert_eq!(again.trial_id, trial_id);
        assert_eq!(running.env.keys.calls(), 1);
        assert!(running.notifications.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_completes_when_searcher_closes() {
        let running = Running::start().await;
        let allocation = running.launched().await;
        running
            .handle
            .send(SearcherState {
                create: SearcherCreate {
                    request_id: RequestId::from("request"),
                    hparams: serde_json::json!({"learning_rate": 0.01}),
                    trial_seed: 42,
                },
                complete: true,
                closed: true,
            })
            .unwrap();
        assert_eq!(running.snapshot().await.state, TrialState::StoppingCompleted);

        allocation.exit_cleanly();
        let db = running.env.db.clone();
        let (state, _) = running.stopped().await;
        assert_eq!(state, TrialState::Completed);
        let record = db.trial(TrialId(1)).unwrap();
        assert_eq!(record.state, TrialState::Completed);
        assert!(record.end_time.is_some());
    }

    #[tokio::test]
    async fn test_ordinary_failures_exhaust_restarts() {
        let running = Running::start_with(|params| params.trial_config.max_restarts = 1).await;
        let first = running.launched().await;
        first.exit_with(ExitError::ordinary("exit code 1"));

        let second = running.launched().await;
        assert_eq!(second.run_id, 2);
        assert_eq!(running.snapshot().await.restarts, 1);
        second.exit_with(ExitError::ordinary("exit code 1"));

        let db = running.env.db.clone();
        let (state, notifications) = running.stopped().await;
        assert_eq!(state, TrialState::Errored);
        assert!(notifications.iter().any(|notification| matches!(
            notification,
            TrialNotification::EarlyExit {
                reason: ExitedReason::Errored,
                ..
            }
        )));
        let record = db.trial(TrialId(1)).unwrap();
        assert_eq!(record.restarts, 2);
        assert_eq!(record.state, TrialState::Errored);
    }

    #[tokio::test]
    async fn test_transient_failures_do_not_count() {
        let running = Running::start_with(|params| params.trial_config.max_restarts = 0).await;
        for run_id in 1..=3 {
            let allocation = running.launched().await;
            assert_eq!(allocation.run_id, run_id);
            allocation.exit_with(ExitError::transient("agent lost"));
        }
        running.launched().await;
        let snapshot = running.snapshot().await;
        assert_eq!(snapshot.state, TrialState::Active);
        assert_eq!(snapshot.restarts, 0);
        assert_eq!(snapshot.run_id, 4);
    }

    #[tokio::test]
    async fn test_unrecoverable_failure_errors() {
        let running = Running::start().await;
        let allocation = running.launched().await;
        allocation.exit_with(ExitError::unrecoverable("image not found"));
        let (state, _) = running.stopped().await;
        assert_eq!(state, TrialState::Errored);
    }

    #[tokio::test]
    async fn test_kill() {
        let running = Running::start().await;
        let mut allocation = running.launched().await;

        running.handle.send(KillTrial).unwrap();
        assert_eq!(allocation.next_signal().await, AllocationSignal::Kill);
        // Killing again resends the signal.
        running.handle.send(KillTrial).unwrap();
        assert_eq!(allocation.next_signal().await, AllocationSignal::Kill);

        allocation.exit_with(ExitError::ordinary("killed with signal 9"));
        let env_logs = running.env.logs.clone();
        let task_logger = running.env.task_logger.clone();
        let (state, _) = running.stopped().await;
        // An error while stopping overrides the stopping state.
        assert_eq!(state, TrialState::Errored);

        task_logger.flush().await;
        let logs = env_logs.logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].log, "Someone is requesting to kill this trial\n");
        assert_eq!(logs[0].level, Some(LogLevel::Warning));
    }

    #[tokio::test]
    async fn test_cancel_gracefully() {
        let running = Running::start().await;
        let mut allocation = running.launched().await;

        running.handle.send(TrialState::StoppingCanceled).unwrap();
        assert_eq!(allocation.next_signal().await, AllocationSignal::Terminate);
        // A cancellation arriving with the grant is refused.
        assert!(matches!(
            allocation.build_task_spec().await,
            Err(TaskSpecError::AlreadyCancelled)
        ));
        // Less severe than the current stopping state.
        running.handle.send(TrialState::StoppingCompleted).unwrap();
        // Terminal states cannot be requested.
        running.handle.send(TrialState::Completed).unwrap();
        assert_eq!(running.snapshot().await.state, TrialState::StoppingCanceled);
        assert!(allocation.signals.try_recv().is_none());

        allocation.exit_cleanly();
        let (state, _) = running.stopped().await;
        assert_eq!(state, TrialState::Canceled);
    }

    #[tokio::test]
    async fn test_stop_without_allocation() {
        let running = Running::start_with(|params| params.searcher.complete = true).await;
        assert_eq!(running.allocator.count(), 0);

        running.handle.send(TrialState::StoppingKilled).unwrap();
        let (state, notifications) = running.stopped().await;
        assert_eq!(state, TrialState::Canceled);
        // Never persisted, so never created.
        assert_eq!(notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_kill_while_paused() {
        let running =
            Running::start_with(|params| params.initial_state = TrialState::Paused).await;
        running.handle.send(KillTrial).unwrap();
        let (state, _) = running.stopped().await;
        assert_eq!(state, TrialState::Canceled);
    }

    #[tokio::test]
    async fn test_searcher_closes_before_allocation() {
        let running = Running::start_with(|params| params.searcher.complete = true).await;
        running
            .handle
            .send(SearcherState {
                create: SearcherCreate {
                    request_id: RequestId::from("request"),
                    hparams: serde_json::json!({}),
                    trial_seed: 42,
                },
                complete: true,
                closed: true,
            })
            .unwrap();
        let allocator = running.allocator.clone();
        let (state, _) = running.stopped().await;
        assert_eq!(state, TrialState::Completed);
        assert_eq!(allocator.count(), 0);
    }

    #[tokio::test]
    async fn test_searcher_wants_more_work() {
        let running = Running::start_with(|params| params.searcher.complete = true).await;
        running.snapshot().await;
        assert_eq!(running.allocator.count(), 0);

        running
            .handle
            .send(SearcherState {
                create: SearcherCreate {
                    request_id: RequestId::from("request"),
                    hparams: serde_json::json!({}),
                    trial_seed: 42,
                },
                complete: false,
                closed: false,
            })
            .unwrap();
        let allocation = running.allocator.next().await;
        assert_eq!(allocation.run_id, 1);
        assert_eq!(running.snapshot().await.state, TrialState::Active);
    }

    #[tokio::test]
    async fn test_resumes_from_latest_checkpoint() {
        let warm_start = Checkpoint {
            uuid: "warm".to_string(),
            trial_id: TrialId(99),
            steps_completed: 50,
            report_time: Utc::now(),
        };
        let running =
            Running::start_with(|params| params.warm_start_checkpoint = Some(warm_start)).await;

        // Nothing of its own yet: start from the warm start, at step 0.
        let first = running.allocator.next().await;
        let spec = first.build_task_spec().await.unwrap();
        assert_eq!(spec.latest_checkpoint.as_deref(), Some("warm"));
        assert_eq!(spec.steps_completed, 0);

        running.env.db.add_checkpoint(Checkpoint {
            uuid: "own".to_string(),
            trial_id: spec.trial_id,
            steps_completed: 100,
            report_time: Utc::now(),
        });
        first.exit_with(ExitError::ordinary("exit code 1"));

        let second = running.allocator.next().await;
        assert_eq!(second.run_id, 2);
        let spec = second.build_task_spec().await.unwrap();
        assert_eq!(spec.latest_checkpoint.as_deref(), Some("own"));
        assert_eq!(spec.steps_completed, 100);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let running = Running::start().await;
        let mut allocation = running.launched().await;

        running.handle.send(TrialState::Paused).unwrap();
        assert_eq!(allocation.next_signal().await, AllocationSignal::Terminate);
        allocation.exit_cleanly();
        let snapshot = running.snapshot().await;
        assert_eq!(snapshot.state, TrialState::Paused);
        assert_eq!(snapshot.allocation_id, None);
        assert!(running.allocator.try_next().is_none());

        running.handle.send(TrialState::Active).unwrap();
        let resumed = running.launched().await;
        assert_eq!(resumed.run_id, 2);
        assert_eq!(
            running.env.db.trial(TrialId(1)).unwrap().state,
            TrialState::Active
        );
    }

    #[tokio::test]
    async fn test_stale_exit_is_ignored() {
        let running = Running::start().await;
        let allocation = running.launched().await;
        allocation.report(AllocationExited::failed(0, ExitError::unrecoverable("old")));
        let snapshot = running.snapshot().await;
        assert_eq!(snapshot.state, TrialState::Active);
        assert_eq!(snapshot.allocation_id, Some(allocation.allocation_id().clone()));
    }

    #[tokio::test]
    async fn test_user_requested_stop() {
        let running = Running::start().await;
        let allocation = running.launched().await;
        allocation.report(AllocationExited {
            run_id: 1,
            err: None,
            user_requested_stop: true,
        });
        let (state, notifications) = running.stopped().await;
        assert_eq!(state, TrialState::Completed);
        assert!(notifications.iter().any(|notification| matches!(
            notification,
            TrialNotification::EarlyExit {
                reason: ExitedReason::UserCanceled,
                ..
            }
        )));
    }

    async fn early_exit(
        handle: &ActorHandle<Trial>,
        reason: ExitedReason,
    ) -> Result<(), TrialError> {
        let (reply, receiver) = open_once_port();
        handle.send(UserInitiatedEarlyExit { reason, reply }).unwrap();
        receiver.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_invalid_hp_exit_completes() {
        let running = Running::start().await;
        let allocation = running.launched().await;
        early_exit(&running.handle, ExitedReason::InvalidHp)
            .await
            .unwrap();
        allocation.exit_cleanly();

        let (state, notifications) = running.stopped().await;
        assert_eq!(state, TrialState::Completed);
        assert!(notifications.iter().any(|notification| matches!(
            notification,
            TrialNotification::EarlyExit {
                reason: ExitedReason::InvalidHp,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_hp_kills_after_delay() {
        let running = Running::start().await;
        let mut allocation = running.launched().await;
        early_exit(&running.handle, ExitedReason::InitInvalidHp)
            .await
            .unwrap();
        assert!(allocation.signals.try_recv().is_none());

        tokio::time::advance(Config::default().invalid_hp_kill_delay + Duration::from_secs(1))
            .await;
        assert_eq!(allocation.next_signal().await, AllocationSignal::Kill);
        allocation.exit_cleanly();
        let (state, _) = running.stopped().await;
        assert_eq!(state, TrialState::Canceled);
    }

    #[tokio::test]
    async fn test_reserved_exit_reasons_are_rejected() {
        let running = Running::start().await;
        for reason in [ExitedReason::UserCanceled, ExitedReason::Errored] {
            let err = early_exit(&running.handle, reason).await.unwrap_err();
            assert!(matches!(err, TrialError::ReservedExitReason(r) if r == reason));
        }
        assert_eq!(running.snapshot().await.state, TrialState::Active);
    }

    #[tokio::test]
    async fn test_change_resource_pool() {
        let running = Running::start().await;
        let mut allocation = running.allocator.next().await;
        running
            .handle
            .send(ChangeResourcePool {
                resource_pool: "gpu".to_string(),
            })
            .unwrap();
        assert_eq!(
            recv(&mut allocation.pool_changes).await.resource_pool,
            "gpu"
        );

        allocation.exit_with(ExitError::transient("moved"));
        let next = running.allocator.next().await;
        assert_eq!(next.request.resource_pool, "gpu");
    }

    #[tokio::test]
    async fn test_stop_marks_persisted_trial_errored() {
        let running = Running::start().await;
        let mut allocation = running.launched().await;
        running.handle.stop().unwrap();

        let db = running.env.db.clone();
        let (state, _) = running.stopped().await;
        assert_eq!(state, TrialState::Errored);
        assert_eq!(allocation.next_signal().await, AllocationSignal::Kill);
        assert_eq!(db.trial(TrialId(1)).unwrap().state, TrialState::Errored);
    }

    #[tokio::test]
    async fn test_restore_reattaches_single_open_allocation() {
        let env = TestEnv::new();
        let trial_id = env
            .db
            .add_trial(NewTrial {
                task_id: env.task_id.clone(),
                job_id: JobId::from("job-1"),
                request_id: RequestId::from("request"),
                experiment_id: ExperimentId(1),
                state: TrialState::Active,
                hparams: serde_json::json!({}),
                warm_start_checkpoint: None,
                seed: 0,
            })
            .await
            .unwrap();
        env.db.update_trial_run_id(trial_id, 3).await.unwrap();
        env.db.update_trial_restarts(trial_id, 2).await.unwrap();
        let allocation_id = AllocationId::new(&env.task_id, 3);
        env.db
            .add_allocation(AllocationRecord {
                allocation_id: allocation_id.clone(),
                task_id: env.task_id.clone(),
                resource_pool: "gpu".to_string(),
                start_time: Some(Utc::now()),
                end_time: None,
            })
            .await
            .unwrap();

        let mut config = Config::default();
        config.reattach.enabled = true;
        let allocator = RecordingAllocator::new();
        let (mut params, _notifications) = env.trial_params(config, allocator.clone());
        params.trial_id = Some(trial_id);
        params.restored = true;
        let _handle = spawn_trial(params).await.unwrap();

        let allocation = allocator.next().await;
        assert!(allocation.request.restore);
        assert_eq!(allocation.allocation_id(), &allocation_id);
        assert_eq!(allocation.request.resource_pool, "gpu");
        assert_eq!(allocation.run_id, 3);
        assert_eq!(
            allocation.request.name,
            format!("Trial {} (Experiment 1)", trial_id)
        );
    }

    #[traced_test]
    #[tokio::test]
    async fn test_ambiguous_restore_allocates_fresh() {
        let env = TestEnv::new();
        let trial_id = env
            .db
            .add_trial(NewTrial {
                task_id: env.task_id.clone(),
                job_id: JobId::from("job-1"),
                request_id: RequestId::from("request"),
                experiment_id: ExperimentId(1),
                state: TrialState::Active,
                hparams: serde_json::json!({}),
                warm_start_checkpoint: None,
                seed: 0,
            })
            .await
            .unwrap();
        env.db.update_trial_run_id(trial_id, 4).await.unwrap();
        for run_id in 1..=4 {
            env.db
                .add_allocation(AllocationRecord {
                    allocation_id: AllocationId::new(&env.task_id, run_id),
                    task_id: env.task_id.clone(),
                    resource_pool: "default".to_string(),
                    start_time: Some(Utc::now()),
                    end_time: None,
                })
                .await
                .unwrap();
        }

        let mut config = Config::default();
        config.reattach.enabled = true;
        let allocator = RecordingAllocator::new();
        let (mut params, _notifications) = env.trial_params(config, allocator.clone());
        params.trial_id = Some(trial_id);
        params.restored = true;
        let _handle = spawn_trial(params).await.unwrap();

        let allocation = allocator.next().await;
        assert!(!allocation.request.restore);
        assert_eq!(allocation.run_id, 5);
        assert!(logs_contain("discovered 4 open allocations on restore"));
    }

    /// A trial recovered with `open_run_ids` allocations of its task
    /// left open in `pool`, last run `run_id`.
    async fn restored_trial(
        config: Config,
        run_id: u32,
        open_run_ids: &[u32],
        pool: &str,
    ) -> SpawnedAllocation {
        let env = TestEnv::new();
        let trial_id = env
            .db
            .add_trial(NewTrial {
                task_id: env.task_id.clone(),
                job_id: JobId::from("job-1"),
                request_id: RequestId::from("request"),
                experiment_id: ExperimentId(1),
                state: TrialState::Active,
                hparams: serde_json::json!({}),
                warm_start_checkpoint: None,
                seed: 0,
            })
            .await
            .unwrap();
        env.db.update_trial_run_id(trial_id, run_id).await.unwrap();
        for open_run_id in open_run_ids {
            env.db
                .add_allocation(AllocationRecord {
                    allocation_id: AllocationId::new(&env.task_id, *open_run_id),
                    task_id: env.task_id.clone(),
                    resource_pool: pool.to_string(),
                    start_time: Some(Utc::now()),
                    end_time: None,
                })
                .await
                .unwrap();
        }

        let allocator = RecordingAllocator::new();
        let (mut params, _notifications) = env.trial_params(config, allocator.clone());
        params.trial_id = Some(trial_id);
        params.restored = true;
        let _handle = spawn_trial(params).await.unwrap();
        allocator.next().await
    }

    #[tokio::test]
    async fn test_restore_skips_pool_without_reattach() {
        let mut config = Config::default();
        config.reattach.enabled = true;
        config.reattach.resource_pools = vec!["cpu".to_string()];
        let allocation = restored_trial(config, 3, &[3], "gpu").await;
        assert!(!allocation.request.restore);
        assert_eq!(allocation.run_id, 4);
        assert_eq!(allocation.request.resource_pool, "default");
    }

    #[tokio::test]
    async fn test_restore_without_open_allocations() {
        let mut config = Config::default();
        config.reattach.enabled = true;
        let allocation = restored_trial(config, 2, &[], "default").await;
        assert!(!allocation.request.restore);
        assert_eq!(allocation.run_id, 3);
    }

    #[tokio::test]
    async fn test_persistence_failure_fails_spec() {
        let mut db = MockPersistence::new();
        db.expect_add_task().returning(|_| Ok(()));
        db.expect_add_trial()
            .times(1)
            .returning(|_| Err(DbError::Other(anyhow::anyhow!("database unavailable"))));
        let running = Running::start_with(|params| params.db = Arc::new(db)).await;

        let allocation = running.allocator.next().await;
        let err = allocation.build_task_spec().await.unwrap_err();
        assert!(matches!(err, TaskSpecError::AddTrial(_)));
        assert_eq!(running.snapshot().await.trial_id, None);
    }

    #[tokio::test]
    async fn test_key_generation_failure_fails_spec() {
        let mut keys = MockKeyGenerator::new();
        keys.expect_generate()
            .withf(|bits| *bits == 1024)
            .returning(|_| Err(anyhow::anyhow!("entropy exhausted")));
        let running = Running::start_with(|params| {
            params.config = Some(Config {
                ssh_rsa_size: 1024,
                ..Config::default()
            });
            params.key_generator = Arc::new(keys);
        })
        .await;

        let allocation = running.allocator.next().await;
        assert!(matches!(
            allocation.build_task_spec().await,
            Err(TaskSpecError::KeyGeneration(_))
        ));
        assert_eq!(running.snapshot().await.trial_id, None);
    }

    #[tokio::test]
    async fn test_logs_before_id_are_dropped() {
        let running = Running::start().await;
        running.handle.send(TaskLog::new("too early")).unwrap();
        let allocation = running.launched().await;
        allocation.owner.logs.send(TaskLog::new("step 1")).unwrap();
        running.snapshot().await;

        running.env.task_logger.flush().await;
        let logs = running.env.logs.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].log, "step 1\n");
        assert_eq!(logs[0].task_id, Some(running.env.task_id.clone()));
        assert_eq!(logs[0].source.as_deref(), Some("master"));
    }
}
