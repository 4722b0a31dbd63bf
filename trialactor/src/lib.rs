/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Trialactor drives the lifecycle of training trials.
//!
//! A _trial_ is one hyperparameter configuration of an experiment. Over
//! its lifetime a trial is executed by a sequence of _allocations_ (run
//! attempts): each allocation acquires resources from a resource manager,
//! launches the trial's task on them, and reports exactly one exit back
//! to the trial. The trial decides, from that exit and from the state it
//! has been asked to reach, whether to reschedule or to finish.
//!
//! Both trials and allocations are actors: each owns its state and
//! processes one message at a time from its own mailbox. All the
//! lifecycle invariants (a single live allocation per trial, a
//! monotonically increasing run ID, a single terminal transition) follow
//! from that sequential processing.
//!
//! | Component            | Module                            |
//! |----------------------|-----------------------------------|
//! | Actor runtime        | [`actor`], [`mailbox`]            |
//! | Trial state machine  | [`trial`], [`state`]              |
//! | Allocation supervisor| [`allocation::supervisor`]        |
//! | Handle registry      | [`allocation::registry`]          |
//! | Resource manager     | [`resource`]                      |
//! | Task spec            | [`task_spec`]                     |
//! | Persistence          | [`db`]                            |
//! | Task logs            | [`logging`]                       |

pub mod actor;
pub mod allocation;
pub mod config;
pub mod db;
pub mod logging;
pub mod mailbox;
pub mod reference;
pub mod resource;
pub mod state;
pub mod task_spec;
pub mod test_utils;
pub mod trial;

pub use actor::Actor;
pub use actor::ActorHandle;
pub use actor::ActorStatus;
pub use actor::Context;
pub use actor::Handler;
pub use allocation::AllocationExited;
pub use allocation::AllocationSignal;
pub use allocation::ExitError;
pub use allocation::ExitKind;
pub use mailbox::PortHandle;
pub use reference::AllocationId;
pub use reference::TaskId;
pub use reference::TrialId;
pub use state::TrialState;
pub use trial::spawn_trial;
pub use trial::Trial;
pub use trial::TrialNotification;
pub use trial::TrialParams;
