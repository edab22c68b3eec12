use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use secure_session_util::time::Deadline;

use crate::binder::ReplyHandle;
use crate::channel::SessionChannel;
use crate::msgs::Message;
use crate::server::channel::ServerSessionCore;
use crate::state::CommunicationState;
use crate::token::ContextId;
use crate::{Result, SessionError};

/// Simplex server session: answers the requests of a [crate::client::RequestSessionChannel]
#[derive(Clone, Debug)]
pub struct ReplySessionChannel {
    core: Arc<ServerSessionCore>,
}

/// A verified request waiting for its reply
#[derive(Debug)]
pub struct SessionRequest {
    core: Arc<ServerSessionCore>,
    message: Message,
    reply: ReplyHandle,
}

impl SessionRequest {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn expects_reply(&self) -> bool {
        self.reply.expects_reply()
    }

    /// Protect `message` under the current key and send it as the reply
    pub async fn reply(self, message: Message, timeout: Duration) -> Result<()> {
        let deadline = Deadline::after(timeout);
        let message = message.in_reply_to(&self.message);
        let res = async {
            let secured = self.core.secure_application(message, &deadline).await?;
            self.core.deliver(self.reply, secured, &deadline).await
        }
        .await;
        self.core.guard(res)
    }
}

impl ReplySessionChannel {
    pub(crate) fn new(core: Arc<ServerSessionCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<ServerSessionCore> {
        &self.core
    }

    /// The next request, or `None` once the client closed the session
    pub async fn receive_request(&self, timeout: Duration) -> Result<Option<SessionRequest>> {
        let res = self.core.receive_request(timeout).await;
        let received = self.core.guard(res)?;
        Ok(received.map(|(message, reply)| SessionRequest {
            core: self.core.clone(),
            message,
            reply,
        }))
    }
}

#[async_trait]
impl SessionChannel for ReplySessionChannel {
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
