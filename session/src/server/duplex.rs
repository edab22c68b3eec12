use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use secure_session_util::time::Deadline;

use crate::channel::SessionChannel;
use crate::msgs::Message;
use crate::server::channel::ServerSessionCore;
use crate::state::CommunicationState;
use crate::token::ContextId;
use crate::{Result, SessionError};

/// Duplex server session; the peer is a [crate::client::DuplexSessionChannel]
#[derive(Clone, Debug)]
pub struct ServerDuplexSessionChannel {
    core: Arc<ServerSessionCore>,
}

impl ServerDuplexSessionChannel {
    pub(crate) fn new(core: Arc<ServerSessionCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<ServerSessionCore> {
        &self.core
    }

    pub async fn send(&self, message: Message, timeout: Duration) -> Result<()> {
        let deadline = Deadline::after(timeout);
        let res = async {
            let secured = self.core.secure_application(message, &deadline).await?;
            self.core.binder.send(secured, deadline.remaining()).await
        }
        .await;
        self.core.guard(res)
    }

    /// The next application message, or `None` once the client closed its
    /// session
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>> {
        let res = self.core.receive_request(timeout).await;
        Ok(self.core.guard(res)?.map(|(message, _)| message))
    }
}

#[async_trait]
impl SessionChannel for ServerDuplexSessionChannel {
    fn session_id(&self) -> Option<ContextId> {
        Some(self.core.session_id())
    }

    fn state(&self) -> CommunicationState {
        self.core.state()
    }

    fn fault_cause(&self) -> Option<SessionError> {
        self.core.fault_cause()
    }

    async fn open(&self, _timeout: Duration) -> Result<()> {
        self.core.open()
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.core.close(timeout).await
    }

    fn abort(&self) {
        self.core.abort()
    }
}
