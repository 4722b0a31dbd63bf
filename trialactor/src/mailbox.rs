/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Typed ports. A [`PortHandle`] is the sending side of a typed
//! message channel; it may deliver into an actor's mailbox (see
//! [`crate::ActorHandle::port`]) or into a free-standing
//! [`PortReceiver`] opened with [`open_port`]. One-shot replies use
//! [`OncePortHandle`].

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;

/// Messages are the values delivered through ports.
pub trait Message: Send + 'static {}

impl<M: Send + 'static> Message for M {}

/// An error that occured while sending a message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to send {message_type}: port closed")]
pub struct MailboxSenderError {
    message_type: &'static str,
}

impl MailboxSenderError {
    pub(crate) fn closed<M>() -> Self {
        Self {
            message_type: type_name::<M>(),
        }
    }

    /// The name of the type of the message that could not be sent.
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }
}

/// An error that occured while receiving a message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// All senders of the port were dropped.
    #[error("port for {0} is closed")]
    Closed(&'static str),
}

type SendFn<M> = dyn Fn(M) -> Result<(), MailboxSenderError> + Send + Sync;

/// A cloneable, typed sending port.
pub struct PortHandle<M: Message> {
    sender: Arc<SendFn<M>>,
}

impl<M: Message> PortHandle<M> {
    pub(crate) fn new(
        sender: impl Fn(M) -> Result<(), MailboxSenderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Send a message to this port.
    pub fn send(&self, message: M) -> Result<(), MailboxSenderError> {
        (self.sender)(message)
    }

    /// A contravariant map: using the provided function to translate
    /// `R`-typed messages to `M`-typed ones, delivered on this port.
    pub fn contramap<R, F>(&self, unmap: F) -> PortHandle<R>
    where
        R: Message,
        F: Fn(R) -> M + Send + Sync + 'static,
    {
        let port = self.clone();
        PortHandle::new(move |message| port.send(unmap(message)))
    }
}

impl<M: Message> Clone for PortHandle<M> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<M: Message> fmt::Debug for PortHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortHandle<{}>", type_name::<M>())
    }
}

/// The receiving side of a port opened with [`open_port`].
#[derive(Debug)]
pub struct PortReceiver<M> {
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M: Message> PortReceiver<M> {
    /// Receive the next message. Fails once every sender is dropped and
    /// the port is drained.
    pub async fn recv(&mut self) -> Result<M, MailboxError> {
        self.receiver
            .recv()
            .await
            .ok_or(MailboxError::Closed(type_name::<M>()))
    }

    /// Receive a message if one is immediately available.
    pub fn try_recv(&mut self) -> Option<M> {
        self.receiver.try_recv().ok()
    }

    /// Drain all messages that are immediately available.
    pub fn drain(&mut self) -> Vec<M> {
        let mut messages = Vec::new();
        while let Some(message) = self.try_recv() {
            messages.push(message);
        }
        messages
    }
}

/// Open a new port, returning its (cloneable) sending handle and its
/// receiver.
pub fn open_port<M: Message>() -> (PortHandle<M>, PortReceiver<M>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let handle = PortHandle::new(move |message| {
        sender
            .send(message)
            .map_err(|_| MailboxSenderError::closed::<M>())
    });
    (handle, PortReceiver { receiver })
}

/// A port that accepts exactly one message; used for replies.
pub struct OncePortHandle<M: Message> {
    sender: oneshot::Sender<M>,
}

impl<M: Message> OncePortHandle<M> {
    /// Send the reply, consuming the port.
    pub fn send(self, message: M) -> Result<(), MailboxSenderError> {
        self.sender
            .send(message)
            .map_err(|_| MailboxSenderError::closed::<M>())
    }
}

impl<M: Message> fmt::Debug for OncePortHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OncePortHandle<{}>", type_name::<M>())
    }
}

/// The receiving side of a port opened with [`open_once_port`].
#[derive(Debug)]
pub struct OncePortReceiver<M> {
    receiver: oneshot::Receiver<M>,
}

impl<M: Message> OncePortReceiver<M> {
    /// Wait for the reply. Fails if the handle was dropped without
    /// sending.
    pub async fn recv(self) -> Result<M, MailboxError> {
        self.receiver
            .await
            .map_err(|_| MailboxError::Closed(type_name::<M>()))
    }
}

/// Open a one-shot port.
pub fn open_once_port<M: Message>() -> (OncePortHandle<M>, OncePortReceiver<M>) {
    let (sender, receiver) = oneshot::channel();
    (OncePortHandle { sender }, OncePortReceiver { receiver })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_delivers_in_order() {
        let (port, mut receiver) = open_port::<u64>();
        for i in 0..3 {
            port.send(i).unwrap();
        }
        assert_eq!(receiver.recv().await.unwrap(), 0);
        assert_eq!(receiver.drain(), vec![1, 2]);
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_contramap() {
        let (port, mut receiver) = open_port::<String>();
        let mapped = port.contramap(|n: u64| format!("n={}", n));
        mapped.send(7).unwrap();
        assert_eq!(receiver.recv().await.unwrap(), "n=7");
    }

    #[tokio::test]
    async fn test_send_to_closed_port() {
        let (port, receiver) = open_port::<u64>();
        drop(receiver);
        let err = port.send(1).unwrap_err();
        assert_eq!(err.message_type(), "u64");
    }

    #[tokio::test]
    async fn test_once_port() {
        let (port, receiver) = open_once_port::<&'static str>();
        port.send("done").unwrap();
        assert_eq!(receiver.recv().await.unwrap(), "done");

        let (port, receiver) = open_once_port::<u64>();
        drop(port);
        assert_eq!(receiver.recv().await, Err(MailboxError::Closed("u64")));
    }
}
