//! The transport seam: session channels move messages through a
//! [ChannelBinder] and never touch the network themselves.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::msgs::Message;
use crate::token::SessionToken;
use crate::{Result, SessionError};

/// A received message, together with the way back to its sender when it was
/// sent as a request
#[derive(Debug)]
pub struct RequestContext {
    pub message: Message,
    replier: Option<oneshot::Sender<Message>>,
}

impl RequestContext {
    /// A one-way message; replies have to be sent through the binder
    pub fn new(message: Message) -> Self {
        Self {
            message,
            replier: None,
        }
    }

    pub fn with_replier(message: Message, replier: oneshot::Sender<Message>) -> Self {
        Self {
            message,
            replier: Some(replier),
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.replier.is_some()
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Split off the message while keeping the reply path
    pub fn take(self) -> (Message, ReplyHandle) {
        (self.message, ReplyHandle(self.replier))
    }
}

/// The reply path of a [RequestContext] whose message was taken out
#[derive(Debug)]
pub struct ReplyHandle(Option<oneshot::Sender<Message>>);

impl ReplyHandle {
    /// For messages sent on our own initiative
    pub fn none() -> Self {
        Self(None)
    }

    pub fn expects_reply(&self) -> bool {
        self.0.is_some()
    }

    pub fn reply(self, message: Message) -> Result<()> {
        match self.0 {
            Some(tx) => tx
                .send(message)
                .map_err(|_| SessionError::Communication("requestor went away".to_owned())),
            None => Err(SessionError::Communication(
                "message was not sent as a request".to_owned(),
            )),
        }
    }

    pub fn into_context(self, message: Message) -> RequestContext {
        RequestContext {
            message,
            replier: self.0,
        }
    }
}

/// Outcome of [ChannelBinder::try_receive]
#[derive(Debug)]
pub enum TryReceive {
    Received(RequestContext),
    /// Nothing arrived before the timeout
    TimedOut,
    /// The peer closed its side of the transport; nothing will arrive anymore
    Closed,
}

/// A duplex or request-reply message transport.
///
/// Every operation is bounded by its timeout; exceeding it yields
/// [SessionError::Timeout] except for [ChannelBinder::try_receive], which
/// reports [TryReceive::TimedOut].
#[async_trait]
pub trait ChannelBinder: Send + Sync + Debug {
    async fn open(&self, timeout: Duration) -> Result<()>;
    async fn close(&self, timeout: Duration) -> Result<()>;
    fn abort(&self);
    async fn send(&self, message: Message, timeout: Duration) -> Result<()>;
    async fn try_receive(&self, timeout: Duration) -> Result<TryReceive>;
    async fn request(&self, message: Message, timeout: Duration) -> Result<Message>;

    /// Resolves with the cause once the transport underneath has faulted
    async fn faulted(&self) -> SessionError {
        std::future::pending().await
    }
}

/// Creates the server side binder for a freshly issued session
#[async_trait]
pub trait ChannelBinderFactory: Send + Sync + Debug {
    async fn create_binder(
        &self,
        token: &SessionToken,
        requestor: &str,
    ) -> Result<Arc<dyn ChannelBinder>>;
}
