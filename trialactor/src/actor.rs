/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! This module contains the core actor runtime: the [`Actor`] and
//! [`Handler`] traits, the per-actor [`Context`], and [`ActorHandle`],
//! through which actors are addressed and joined.
//!
//! Every actor runs a single loop that processes one message at a time,
//! in the order the messages were enqueued. A handler that returns an
//! error (or panics) fails the actor: the loop stops, [`Actor::cleanup`]
//! runs with the failure, and the actor's status becomes
//! [`ActorStatus::Failed`].

use std::any::type_name;
use std::fmt;
use std::future::IntoFuture;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use enum_as_inner::EnumAsInner;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::Instrument;

use crate::mailbox::MailboxSenderError;
use crate::mailbox::Message;
use crate::mailbox::PortHandle;

/// An Actor is an independent, asynchronous thread of execution. Each
/// actor instance has a mailbox, whose messages are delivered through
/// the method [`Handler::handle`].
#[async_trait]
pub trait Actor: Sized + Send + 'static {
    /// The type of initialization parameters accepted by this actor.
    type Params: Send + 'static;

    /// Creates a new actor instance given its instantiation parameters.
    async fn new(params: Self::Params) -> Result<Self, anyhow::Error>;

    /// Initialize the actor, after the runtime has been fully
    /// initialized. An error fails the actor before any message is
    /// handled.
    async fn init(&mut self, _cx: &Context<Self>) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Runs exactly once after the message loop has ended, whether the
    /// actor was stopped or failed. `failure` carries the error that
    /// failed the actor, if any.
    async fn cleanup(
        &mut self,
        _cx: &Context<Self>,
        _failure: Option<&anyhow::Error>,
    ) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// A Handler allows an actor to handle a specific message type.
#[async_trait]
pub trait Handler<M: Message>: Actor {
    /// Handle the next M-typed message.
    async fn handle(&mut self, cx: &Context<Self>, message: M) -> Result<(), anyhow::Error>;
}

/// A unique identifier for a spawned actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    fn unique(name: &str) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(format!("{}[{}]", name, NEXT.fetch_add(1, Ordering::Relaxed)))
    }

    /// The actor's name, including its uniquifying index.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The runtime status of an actor.
#[derive(Debug, Clone, PartialEq, Eq, EnumAsInner, Serialize, Deserialize)]
pub enum ActorStatus {
    /// The actor has been created but not yet started.
    Created,
    /// The actor is running [`Actor::init`].
    Initializing,
    /// The actor is waiting for messages.
    Idle,
    /// The actor is handling a message.
    Processing,
    /// The actor's loop has ended and it is running [`Actor::cleanup`].
    Stopping,
    /// The actor stopped normally.
    Stopped,
    /// The actor failed with the provided reason.
    Failed(String),
}

impl ActorStatus {
    /// Tells whether the status is terminal: the actor will never
    /// process another message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }
}

impl fmt::Display for ActorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Initializing => write!(f, "initializing"),
            Self::Idle => write!(f, "idle"),
            Self::Processing => write!(f, "processing"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// A type-erased message, bound to the actor that will handle it.
trait Envelope<A: Actor>: Send {
    fn deliver<'a>(
        self: Box<Self>,
        actor: &'a mut A,
        cx: &'a Context<A>,
    ) -> BoxFuture<'a, Result<(), anyhow::Error>>;

    fn message_type(&self) -> &'static str;
}

struct Typed<M>(M);

impl<A, M> Envelope<A> for Typed<M>
where
    A: Handler<M>,
    M: Message,
{
    fn deliver<'a>(
        self: Box<Self>,
        actor: &'a mut A,
        cx: &'a Context<A>,
    ) -> BoxFuture<'a, Result<(), anyhow::Error>> {
        actor.handle(cx, self.0)
    }

    fn message_type(&self) -> &'static str {
        type_name::<M>()
    }
}

enum Signal<A: Actor> {
    Message(Box<dyn Envelope<A>>),
    Stop,
}

/// A handle to a running actor. Handles are cloneable; they are used
/// to send messages, to obtain typed ports, and to join the actor:
/// awaiting a handle resolves to the actor's terminal status.
pub struct ActorHandle<A: Actor> {
    actor_id: ActorId,
    sender: mpsc::UnboundedSender<Signal<A>>,
    status: watch::Receiver<ActorStatus>,
}

impl<A: Actor> ActorHandle<A> {
    /// The actor's id.
    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    /// Enqueue a message for the actor.
    pub fn send<M: Message>(&self, message: M) -> Result<(), MailboxSenderError>
    where
        A: Handler<M>,
    {
        self.sender
            .send(Signal::Message(Box::new(Typed(message))))
            .map_err(|_| MailboxSenderError::closed::<M>())
    }

    /// Return a port for the provided message type handled by the
    /// actor.
    pub fn port<M: Message>(&self) -> PortHandle<M>
    where
        A: Handler<M>,
    {
        let sender = self.sender.clone();
        PortHandle::new(move |message: M| {
            sender
                .send(Signal::Message(Box::new(Typed(message))))
                .map_err(|_| MailboxSenderError::closed::<M>())
        })
    }

    /// The actor's current status.
    pub fn status(&self) -> ActorStatus {
        self.status.borrow().clone()
    }

    /// Stop the actor after it has processed the messages that were
    /// enqueued before this call.
    pub fn stop(&self) -> Result<(), MailboxSenderError> {
        self.sender
            .send(Signal::Stop)
            .map_err(|_| MailboxSenderError::closed::<Signal<A>>())
    }
}

impl<A: Actor> Clone for ActorHandle<A> {
    fn clone(&self) -> Self {
        Self {
            actor_id: self.actor_id.clone(),
            sender: self.sender.clone(),
            status: self.status.clone(),
        }
    }
}

impl<A: Actor> fmt::Debug for ActorHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle")
            .field("actor_id", &self.actor_id)
            .field("actor_type", &type_name::<A>())
            .finish()
    }
}

impl<A: Actor> IntoFuture for ActorHandle<A> {
    type Output = ActorStatus;
    type IntoFuture = BoxFuture<'static, ActorStatus>;

    fn into_future(self) -> Self::IntoFuture {
        let mut status = self.status.clone();
        async move {
            let terminal = status
                .wait_for(ActorStatus::is_terminal)
                .await
                .map(|status| status.clone());
            match terminal {
                Ok(terminal) => terminal,
                // The serve loop always publishes a terminal status
                // before dropping its sender.
                Err(_) => status.borrow().clone(),
            }
        }
        .boxed()
    }
}

/// The runtime context of a running actor, passed to every handler.
pub struct Context<A: Actor> {
    handle: ActorHandle<A>,
    stopping: AtomicBool,
}

impl<A: Actor> Context<A> {
    /// A handle to this actor.
    pub fn handle(&self) -> &ActorHandle<A> {
        &self.handle
    }

    /// This actor's id.
    pub fn actor_id(&self) -> &ActorId {
        self.handle.actor_id()
    }

    /// Stop the actor once the current message has been handled.
    /// Messages still in the mailbox are discarded.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Whether [`Context::stop`] has been called.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// A port for messages handled by this actor.
    pub fn port<M: Message>(&self) -> PortHandle<M>
    where
        A: Handler<M>,
    {
        self.handle.port()
    }

    /// Deliver `message` to this actor after `delay` has elapsed. The
    /// message is dropped if the actor is no longer running by then.
    pub fn notify_after<M: Message>(&self, delay: Duration, message: M)
    where
        A: Handler<M>,
    {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = handle.send(message) {
                tracing::debug!(actor_id = %handle.actor_id(), "dropping delayed message: {}", err);
            }
        });
    }
}

/// Create and spawn a new actor of type `A` from its parameters.
pub async fn spawn<A: Actor>(
    name: &str,
    params: A::Params,
) -> Result<ActorHandle<A>, anyhow::Error> {
    let actor = A::new(params).await?;
    Ok(spawn_actor(name, actor))
}

/// Spawn an already-constructed actor.
pub fn spawn_actor<A: Actor>(name: &str, actor: A) -> ActorHandle<A> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ActorStatus::Created);
    let handle = ActorHandle {
        actor_id: ActorId::unique(name),
        sender,
        status: status_rx,
    };
    let cx = Context {
        handle: handle.clone(),
        stopping: AtomicBool::new(false),
    };
    let span = tracing::info_span!("actor", actor_id = %handle.actor_id());
    tokio::spawn(serve(actor, cx, receiver, status_tx).instrument(span));
    handle
}

fn into_failure(
    result: Result<Result<(), anyhow::Error>, Box<dyn std::any::Any + Send>>,
) -> Option<anyhow::Error> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Some(anyhow::anyhow!("panic: {}", message))
        }
    }
}

async fn serve<A: Actor>(
    mut actor: A,
    cx: Context<A>,
    mut receiver: mpsc::UnboundedReceiver<Signal<A>>,
    status: watch::Sender<ActorStatus>,
) {
    status.send_replace(ActorStatus::Initializing);
    let mut failure = into_failure(AssertUnwindSafe(actor.init(&cx)).catch_unwind().await);
    if let Some(err) = &failure {
        tracing::error!("actor failed to initialize: {:#}", err);
    }

    if failure.is_none() {
        status.send_replace(ActorStatus::Idle);
        while !cx.is_stopping() {
            let Some(signal) = receiver.recv().await else {
                break;
            };
            let envelope = match signal {
                Signal::Stop => break,
                Signal::Message(envelope) => envelope,
            };
            let message_type = envelope.message_type();
            status.send_replace(ActorStatus::Processing);
            let result = AssertUnwindSafe(envelope.deliver(&mut actor, &cx))
                .catch_unwind()
                .await;
            if let Some(err) = into_failure(result) {
                tracing::error!(message_type, "handler failed: {:#}", err);
                failure = Some(err);
                break;
            }
            status.send_replace(ActorStatus::Idle);
        }
    }

    receiver.close();
    status.send_replace(ActorStatus::Stopping);
    let cleanup = AssertUnwindSafe(actor.cleanup(&cx, failure.as_ref()))
        .catch_unwind()
        .await;
    if let Some(err) = into_failure(cleanup) {
        tracing::warn!("cleanup failed: {:#}", err);
        failure.get_or_insert(err);
    }

    let terminal = match failure {
        Some(err) => ActorStatus::Failed(format!("{:#}", err)),
        None => ActorStatus::Stopped,
    };
    tracing::debug!(status = %terminal, "actor terminated");
    status.send_replace(terminal);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;
    use crate::mailbox::open_once_port;
    use crate::mailbox::OncePortHandle;

    #[derive(Debug)]
    struct Counter {
        count: u64,
        cleaned_up: Arc<Mutex<Option<Option<String>>>>,
    }

    #[async_trait]
    impl Actor for Counter {
        type Params = Arc<Mutex<Option<Option<String>>>>;

        async fn new(cleaned_up: Self::Params) -> Result<Self, anyhow::Error> {
            Ok(Self {
                count: 0,
                cleaned_up,
            })
        }

        async fn cleanup(
            &mut self,
            _cx: &Context<Self>,
            failure: Option<&anyhow::Error>,
        ) -> Result<(), anyhow::Error> {
            *self.cleaned_up.lock().unwrap() = Some(failure.map(|err| err.to_string()));
            Ok(())
        }
    }

    #[async_trait]
    impl Handler<u64> for Counter {
        async fn handle(&mut self, cx: &Context<Self>, n: u64) -> Result<(), anyhow::Error> {
            match n {
                0 => cx.stop(),
                13 => anyhow::bail!("unlucky"),
                99 => panic!("overflow"),
                n => self.count += n,
            }
            Ok(())
        }
    }

    struct GetCount(OncePortHandle<u64>);

    #[async_trait]
    impl Handler<GetCount> for Counter {
        async fn handle(
            &mut self,
            _cx: &Context<Self>,
            GetCount(reply): GetCount,
        ) -> Result<(), anyhow::Error> {
            reply.send(self.count)?;
            Ok(())
        }
    }

    async fn get_count(handle: &ActorHandle<Counter>) -> u64 {
        let (reply, receiver) = open_once_port();
        handle.send(GetCount(reply)).unwrap();
        receiver.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_messages_processed_in_order() {
        let cleaned_up = Arc::new(Mutex::new(None));
        let handle = spawn::<Counter>("counter", cleaned_up.clone()).await.unwrap();
        handle.send(1u64).unwrap();
        handle.port::<u64>().send(2).unwrap();
        assert_eq!(get_count(&handle).await, 3);

        handle.stop().unwrap();
        assert_eq!(handle.clone().await, ActorStatus::Stopped);
        assert_eq!(*cleaned_up.lock().unwrap(), Some(None));
        assert!(handle.send(1u64).is_err());
    }

    #[tokio::test]
    async fn test_stop_from_handler_discards_mailbox() {
        let cleaned_up = Arc::new(Mutex::new(None));
        let handle = spawn::<Counter>("counter", cleaned_up).await.unwrap();
        handle.send(0u64).unwrap();
        handle.send(5u64).unwrap();
        assert_eq!(handle.clone().await, ActorStatus::Stopped);
    }

    #[tokio::test]
    async fn test_handler_error_fails_actor() {
        let cleaned_up = Arc::new(Mutex::new(None));
        let handle = spawn::<Counter>("counter", cleaned_up.clone()).await.unwrap();
        handle.send(13u64).unwrap();
        let status = handle.clone().await;
        assert_eq!(status, ActorStatus::Failed("unlucky".to_string()));
        assert_eq!(
            *cleaned_up.lock().unwrap(),
            Some(Some("unlucky".to_string()))
        );
    }

    #[tokio::test]
    async fn test_panic_fails_actor() {
        let cleaned_up = Arc::new(Mutex::new(None));
        let handle = spawn::<Counter>("counter", cleaned_up).await.unwrap();
        handle.send(99u64).unwrap();
        let status = handle.await;
        assert!(status.as_failed().unwrap().contains("overflow"));
    }

    struct Delayed;

    #[async_trait]
    impl Actor for Delayed {
        type Params = ();
        async fn new(_params: ()) -> Result<Self, anyhow::Error> {
            Ok(Self)
        }
        async fn init(&mut self, cx: &Context<Self>) -> Result<(), anyhow::Error> {
            cx.notify_after(Duration::from_secs(10), "wake");
            Ok(())
        }
    }

    #[async_trait]
    impl Handler<&'static str> for Delayed {
        async fn handle(
            &mut self,
            cx: &Context<Self>,
            _message: &'static str,
        ) -> Result<(), anyhow::Error> {
            cx.stop();
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_after() {
        let handle = spawn::<Delayed>("delayed", ()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!handle.status().is_terminal());
        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap();
        assert_eq!(status, ActorStatus::Stopped);
    }
}
