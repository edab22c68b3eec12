use std::time::Duration;

use async_trait::async_trait;

use crate::state::CommunicationState;
use crate::token::ContextId;
use crate::{Result, SessionError};

/// Capabilities shared by every kind of session channel
#[async_trait]
pub trait SessionChannel: Send + Sync {
    /// `None` until a client channel obtained its first token
    fn session_id(&self) -> Option<ContextId>;

    fn state(&self) -> CommunicationState;

    /// Why the channel faulted, if it did
    fn fault_cause(&self) -> Option<SessionError>;

    async fn open(&self, timeout: Duration) -> Result<()>;

    /// Run the close handshake and release the transport
    async fn close(&self, timeout: Duration) -> Result<()>;

    /// Tear the channel down immediately, waking every waiter
    fn abort(&self);
}
