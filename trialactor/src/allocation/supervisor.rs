/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The allocation supervisor: an actor that drives one run attempt of a
//! trial from its resource request, through launch, to its single exit
//! report.
//!
//! ```text
//!  init ──allocate──▶ RM ──Granted──▶ BuildTaskSpec ──▶ launch ──▶ Stopped
//!    │                 │                   │                         │
//!    └─ error          └─ Failed/stop      └─ AlreadyCancelled       │
//!         ▼                  ▼                   ▼                   ▼
//!                     AllocationExited (exactly once)
//! ```
//!
//! Whichever path ends the allocation, [`Allocation::exit`] records the
//! end time, releases the resources and reports to the owning trial.
//! The `exited` flag makes it at-most-once; [`Actor::cleanup`] makes it
//! at-least-once.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::launcher::LaunchError;
use super::launcher::StopReason;
use super::launcher::TaskEvent;
use super::launcher::TaskLauncher;
use super::registry::AllocationRegistry;
use super::AllocationExited;
use super::AllocationOwner;
use super::AllocationRef;
use super::AllocationSignal;
use super::Allocator;
use super::AllocatorError;
use super::ChangeResourcePool;
use super::ExitError;
use crate::actor;
use crate::actor::Actor;
use crate::actor::Context;
use crate::actor::Handler;
use crate::db::AllocationRecord;
use crate::db::Persistence;
use crate::mailbox::open_once_port;
use crate::reference::AllocationId;
use crate::resource::AllocateRequest;
use crate::resource::ResourceEvent;
use crate::resource::ResourceGrant;
use crate::resource::ResourceManager;
use crate::task_spec::BuildTaskSpec;
use crate::task_spec::TaskSpecError;

/// Parameters of an [`Allocation`].
pub struct AllocationParams {
    pub request: AllocateRequest,
    pub run_id: u32,
    pub owner: AllocationOwner,
    pub resource_manager: Arc<dyn ResourceManager>,
    pub launcher: Arc<dyn TaskLauncher>,
    pub db: Arc<dyn Persistence>,
    pub registry: Arc<AllocationRegistry>,
}

/// Supervises one run attempt.
pub struct Allocation {
    request: AllocateRequest,
    run_id: u32,
    owner: AllocationOwner,
    resource_manager: Arc<dyn ResourceManager>,
    launcher: Arc<dyn TaskLauncher>,
    db: Arc<dyn Persistence>,
    registry: Arc<AllocationRegistry>,

    grant: Option<ResourceGrant>,
    launched: bool,
    // The strongest stop signal sent to the task, if any.
    stop_requested: Option<AllocationSignal>,
    exited: bool,
}

impl Allocation {
    fn allocation_id(&self) -> &AllocationId {
        &self.request.allocation_id
    }

    /// End the allocation: close its record, release its resources and
    /// report the exit to the trial. Only the first call has an effect.
    async fn exit(
        &mut self,
        cx: &Context<Self>,
        err: Option<ExitError>,
        user_requested_stop: bool,
    ) {
        if self.exited {
            return;
        }
        self.exited = true;
        let allocation_id = self.allocation_id().clone();

        if self.grant.is_some() {
            if let Err(err) = self
                .db
                .complete_allocation(allocation_id.clone(), Utc::now())
                .await
            {
                tracing::warn!(%allocation_id, "failed to record allocation end: {}", err);
            }
        }
        if let Err(err) = self.resource_manager.release(&allocation_id).await {
            tracing::warn!(%allocation_id, "failed to release resources: {}", err);
        }

        match &err {
            Some(err) => tracing::info!(%allocation_id, "allocation exited with error: {}", err),
            None => tracing::info!(%allocation_id, user_requested_stop, "allocation exited"),
        }
        let exited = AllocationExited {
            run_id: self.run_id,
            err,
            user_requested_stop,
        };
        if let Err(err) = self.owner.exited.send(exited) {
            tracing::warn!(%allocation_id, "trial did not receive exit: {}", err);
        }
        cx.stop();
    }

    async fn launch(&mut self, cx: &Context<Self>, grant: ResourceGrant) {
        let allocation_id = self.allocation_id().clone();
        if let Err(err) = self
            .db
            .add_allocation(AllocationRecord {
                allocation_id: allocation_id.clone(),
                task_id: self.request.task_id.clone(),
                resource_pool: grant.resource_pool.clone(),
                start_time: Some(Utc::now()),
                end_time: None,
            })
            .await
        {
            tracing::warn!(%allocation_id, "failed to record allocation start: {}", err);
        }
        self.grant = Some(grant.clone());

        let (reply, spec) = open_once_port();
        let spec = match self.owner.build_task_spec.send(BuildTaskSpec { reply }) {
            Ok(()) => spec.recv().await.map_err(anyhow::Error::from),
            Err(err) => Err(anyhow::Error::from(err)),
        };
        let spec = match spec {
            Ok(Ok(spec)) => spec,
            Ok(Err(TaskSpecError::AlreadyCancelled)) => {
                tracing::info!(%allocation_id, "trial was cancelled before launch");
                return self.exit(cx, None, false).await;
            }
            Ok(Err(err)) => {
                return self.exit(cx, Some(ExitError::ordinary(err)), false).await;
            }
            Err(err) => {
                let err =
                    ExitError::ordinary(format!("trial did not provide a task spec: {}", err));
                return self.exit(cx, Some(err), false).await;
            }
        };

        match self.launcher.launch(spec, grant, cx.port()).await {
            Ok(()) => self.launched = true,
            Err(err) => {
                let err = ExitError::ordinary(format!("failed to launch task: {}", err));
                self.exit(cx, Some(err), false).await;
            }
        }
    }

    async fn stop(&mut self, cx: &Context<Self>, signal: AllocationSignal) {
        let allocation_id = self.allocation_id().clone();
        if !self.launched {
            tracing::info!(%allocation_id, %signal, "stopping allocation before launch");
            return self.exit(cx, None, false).await;
        }
        if self.stop_requested == Some(AllocationSignal::Kill) {
            return;
        }
        if self.stop_requested == Some(signal) {
            tracing::debug!(%allocation_id, %signal, "resending stop signal");
        }
        self.stop_requested = Some(signal);
        match self.launcher.signal(&allocation_id, signal).await {
            Ok(()) => {}
            Err(LaunchError::NotRunning(_)) => {
                tracing::debug!(%allocation_id, %signal, "task already stopped");
            }
            Err(err) => tracing::warn!(%allocation_id, %signal, "failed to signal task: {}", err),
        }
    }

    fn exit_for(&self, reason: &StopReason) -> (Option<ExitError>, bool) {
        match reason {
            StopReason::Stopped => (None, false),
            StopReason::UserRequested => (None, true),
            StopReason::Exited(_) | StopReason::Killed(..) if self.stop_requested.is_some() => {
                (None, false)
            }
            StopReason::Exited(_) | StopReason::Killed(..) | StopReason::Unknown => {
                (Some(ExitError::ordinary(format!("task {}", reason))), false)
            }
            StopReason::Failed(message) => (Some(ExitError::transient(message)), false),
        }
    }
}

#[async_trait]
impl Actor for Allocation {
    type Params = AllocationParams;

    async fn new(params: AllocationParams) -> Result<Self, anyhow::Error> {
        Ok(Self {
            request: params.request,
            run_id: params.run_id,
            owner: params.owner,
            resource_manager: params.resource_manager,
            launcher: params.launcher,
            db: params.db,
            registry: params.registry,
            grant: None,
            launched: false,
            stop_requested: None,
            exited: false,
        })
    }

    async fn init(&mut self, cx: &Context<Self>) -> Result<(), anyhow::Error> {
        self.registry.register(AllocationRef::new(
            self.allocation_id().clone(),
            cx.port(),
            cx.port(),
        ));
        tracing::info!(
            allocation_id = %self.allocation_id(),
            run_id = self.run_id,
            restore = self.request.restore,
            "requesting resources"
        );
        if let Err(err) = self
            .resource_manager
            .allocate(self.request.clone(), cx.port())
            .await
        {
            let err = ExitError::unrecoverable(format!("failed to request resources: {}", err));
            self.exit(cx, Some(err), false).await;
        }
        Ok(())
    }

    async fn cleanup(
        &mut self,
        cx: &Context<Self>,
        failure: Option<&anyhow::Error>,
    ) -> Result<(), anyhow::Error> {
        if !self.exited {
            if self.launched {
                let _ = self
                    .launcher
                    .signal(self.allocation_id(), AllocationSignal::Kill)
                    .await;
            }
            let err = match failure {
                Some(failure) => ExitError::ordinary(format!("allocation failed: {:#}", failure)),
                None => ExitError::ordinary("allocation exited without reporting"),
            };
            self.exit(cx, Some(err), false).await;
        }
        self.registry.deregister(self.allocation_id());
        Ok(())
    }
}

#[async_trait]
impl Handler<ResourceEvent> for Allocation {
    async fn handle(
        &mut self,
        cx: &Context<Self>,
        event: ResourceEvent,
    ) -> Result<(), anyhow::Error> {
        if self.exited {
            return Ok(());
        }
        match event {
            ResourceEvent::Granted(grant) => {
                if self.grant.is_some() {
                    tracing::warn!(
                        allocation_id = %self.allocation_id(),
                        "ignoring duplicate grant"
                    );
                    return Ok(());
                }
                tracing::info!(
                    allocation_id = %self.allocation_id(),
                    pool = %grant.resource_pool,
                    slots = grant.slots(),
                    "resources granted"
                );
                self.launch(cx, grant).await;
            }
            ResourceEvent::Preempted => {
                tracing::info!(allocation_id = %self.allocation_id(), "allocation preempted");
                self.stop(cx, AllocationSignal::Terminate).await;
            }
            ResourceEvent::Failed(err) => {
                self.exit(cx, Some(err), false).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<AllocationSignal> for Allocation {
    async fn handle(
        &mut self,
        cx: &Context<Self>,
        signal: AllocationSignal,
    ) -> Result<(), anyhow::Error> {
        if !self.exited {
            self.stop(cx, signal).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<TaskEvent> for Allocation {
    async fn handle(&mut self, cx: &Context<Self>, event: TaskEvent) -> Result<(), anyhow::Error> {
        match event {
            event @ (TaskEvent::Starting | TaskEvent::Running) => {
                tracing::debug!(allocation_id = %self.allocation_id(), ?event, "task state");
            }
            TaskEvent::Output(mut log) => {
                log.allocation_id.get_or_insert_with(|| self.request.allocation_id.clone());
                let _ = self.owner.logs.send(log);
            }
            TaskEvent::Stopped(reason) => {
                tracing::info!(allocation_id = %self.allocation_id(), %reason, "task stopped");
                let (err, user_requested_stop) = self.exit_for(&reason);
                self.exit(cx, err, user_requested_stop).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<ChangeResourcePool> for Allocation {
    async fn handle(
        &mut self,
        cx: &Context<Self>,
        change: ChangeResourcePool,
    ) -> Result<(), anyhow::Error> {
        if self.exited {
            return Ok(());
        }
        if self.grant.is_none() {
            if let Err(err) = self
                .resource_manager
                .change_resource_pool(&self.request.task_id, &change.resource_pool)
                .await
            {
                tracing::warn!(
                    allocation_id = %self.allocation_id(),
                    pool = %change.resource_pool,
                    "failed to change resource pool: {}",
                    err
                );
                return Ok(());
            }
            self.request.resource_pool = change.resource_pool;
        } else {
            tracing::info!(
                allocation_id = %self.allocation_id(),
                pool = %change.resource_pool,
                "resource pool changed; terminating running allocation"
            );
            self.stop(cx, AllocationSignal::Terminate).await;
        }
        Ok(())
    }
}

/// An [`Allocator`] that runs each allocation under an [`Allocation`]
/// supervisor.
pub struct SupervisedAllocator {
    resource_manager: Arc<dyn ResourceManager>,
    launcher: Arc<dyn TaskLauncher>,
    db: Arc<dyn Persistence>,
    registry: Arc<AllocationRegistry>,
}

impl SupervisedAllocator {
    pub fn new(
        resource_manager: Arc<dyn ResourceManager>,
        launcher: Arc<dyn TaskLauncher>,
        db: Arc<dyn Persistence>,
        registry: Arc<AllocationRegistry>,
    ) -> Self {
        Self {
            resource_manager,
            launcher,
            db,
            registry,
        }
    }
}

#[async_trait]
impl Allocator for SupervisedAllocator {
    async fn allocate(
        &self,
        request: AllocateRequest,
        run_id: u32,
        owner: AllocationOwner,
    ) -> Result<AllocationRef, AllocatorError> {
        let allocation_id = request.allocation_id.clone();
        let handle = actor::spawn::<Allocation>(
            &format!("allocation[{}]", allocation_id),
            AllocationParams {
                request,
                run_id,
                owner,
                resource_manager: Arc::clone(&self.resource_manager),
                launcher: Arc::clone(&self.launcher),
                db: Arc::clone(&self.db),
                registry: Arc::clone(&self.registry),
            },
        )
        .await
        .map_err(|err| AllocatorError::Spawn(allocation_id.clone(), err))?;
        Ok(AllocationRef::new(
            allocation_id,
            handle.port(),
            handle.port(),
        ))
    }
}
