//! Client side of secure sessions.
//!
//! [ClientSessionSettings] is created once and hands out channels over
//! binders supplied by the caller:
//!
//! - [RequestSessionChannel] for request-reply traffic
//! - [DuplexSessionChannel] when both sides send on their own

mod channel;
mod duplex;
pub mod renewal;
mod request;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use secure_session_util::time::Clock;

use crate::binder::ChannelBinder;
use crate::channel::SessionChannel;
use crate::config::{ClientChannelKind, ClientSessionConfig};
use crate::protocol::SecurityProtocolFactory;
use crate::provider::SessionTokenProvider;
use crate::state::CommunicationState;
use crate::token::ContextId;
use crate::{Result, SessionError};

use channel::ClientSessionCore;
pub use duplex::DuplexSessionChannel;
pub use request::RequestSessionChannel;

#[derive(Clone, Debug)]
pub struct ClientSessionSettings {
    config: ClientSessionConfig,
    provider: Arc<dyn SessionTokenProvider>,
    protocol_factory: Arc<dyn SecurityProtocolFactory>,
    clock: Arc<dyn Clock>,
}

impl ClientSessionSettings {
    pub fn new(
        config: ClientSessionConfig,
        provider: Arc<dyn SessionTokenProvider>,
        protocol_factory: Arc<dyn SecurityProtocolFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SessionError::Config(format!("{e:#}")))?;
        Ok(Self {
            config,
            provider,
            protocol_factory,
            clock,
        })
    }

    pub fn config(&self) -> &ClientSessionConfig {
        &self.config
    }

    fn core(&self, expect_close: bool, binder: Arc<dyn ChannelBinder>) -> ClientSessionCore {
        ClientSessionCore::new(
            self.config.clone(),
            expect_close,
            binder,
            self.protocol_factory.create_protocol(),
            self.provider.clone(),
            self.clock.clone(),
        )
    }

    pub fn create_request_channel(&self, binder: Arc<dyn ChannelBinder>) -> RequestSessionChannel {
        RequestSessionChannel::new(self.core(false, binder))
    }

    pub fn create_duplex_channel(&self, binder: Arc<dyn ChannelBinder>) -> DuplexSessionChannel {
        DuplexSessionChannel::new(self.core(true, binder))
    }

    /// A channel of the configured [ClientChannelKind]
    pub fn create_channel(&self, binder: Arc<dyn ChannelBinder>) -> ClientSessionChannel {
        match self.config.channel_kind {
            ClientChannelKind::Request => {
                ClientSessionChannel::Request(self.create_request_channel(binder))
            }
            ClientChannelKind::Duplex => {
                ClientSessionChannel::Duplex(self.create_duplex_channel(binder))
            }
        }
    }
}

#[derive(Clone, Debug)]
pub enum ClientSessionChannel {
    Request(RequestSessionChannel),
    Duplex(DuplexSessionChannel),
}

impl ClientSessionChannel {
    fn inner(&self) -> &dyn SessionChannel {
        match self {
            Self::Request(ch) => ch,
            Self::Duplex(ch) => ch,
        }
    }
}

#[async_trait]
impl SessionChannel for ClientSessionChannel {
    fn session_id(&self) -> Option<ContextId> {
        self.inner().session_id()
    }

    fn state(&self) -> CommunicationState {
        self.inner().state()
    }

    fn fault_cause(&self) -> Option<SessionError> {
        self.inner().fault_cause()
    }

    async fn open(&self, timeout: Duration) -> Result<()> {
        self.inner().open(timeout).await
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.inner().close(timeout).await
    }

    fn abort(&self) {
        self.inner().abort()
    }
}
