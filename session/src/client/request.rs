use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use secure_session_util::time::Deadline;

use crate::channel::SessionChannel;
use crate::client::channel::{ClientSessionCore, Incoming};
use crate::msgs::Message;
use crate::state::CommunicationState;
use crate::token::ContextId;
use crate::{Result, SessionError};

/// Simplex client session: every message is a request answered by a reply
#[derive(Clone, Debug)]
pub struct RequestSessionChannel {
    core: Arc<ClientSessionCore>,
}

impl RequestSessionChannel {
    pub(crate) fn new(core: ClientSessionCore) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    /// Send `message` and return the verified reply.
    ///
    /// A renew-needed fault from the peer is not returned; the key is renewed
    /// and the request sent once more.
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<Message> {
        let res = self.request_inner(message, timeout).await;
        self.core.guard(res)
    }

    async fn request_inner(&self, message: Message, timeout: Duration) -> Result<Message> {
        let deadline = Deadline::after(timeout);
        for attempt in 0..2 {
            let (secured, correlation) = self
                .core
                .secure_application(message.clone(), &deadline)
                .await?;
            let reply = self.core.binder.request(secured, deadline.remaining()).await?;
            match self
                .core
                .process_incoming(reply, &deadline, Some(correlation))
                .await?
            {
                Incoming::Application(reply) => return Ok(reply),
                Incoming::RenewNeeded => {
                    debug!("request attempt {attempt} needs a renewed key, retrying");
                }
                Incoming::CloseHandshake => {
                    return Err(SessionError::ProtocolViolation(
                        "request was answered by a close handshake message".to_owned(),
                    ))
                }
            }
        }
        Err(SessionError::SessionKeyExpired(
            "peer still asks for key renewal after the key was renewed".to_owned(),
        ))
    }

    /// Renew the session key right away
    pub async fn renew_key(&self, timeout: Duration) -> Result<()> {
        let res = self.core.scheduler.renew(timeout).await;
        self.core.guard(res)
    }
}

#[async_trait]
impl SessionChannel for RequestSessionChannel {
    fn session_id(&self) -> Option<ContextId> {
        self.core.session_id()
    }

    fn state(&self) -> CommunicationState {
        self.core.state()
    }

    fn fault_cause(&self) -> Option<SessionError> {
        self.core.fault_cause()
    }

    async fn open(&self, timeout: Duration) -> Result<()> {
        self.core.open(timeout).await
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.core.close_simplex(timeout).await
    }

    fn abort(&self) {
        self.core.abort()
    }
}
