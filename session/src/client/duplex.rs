use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;

use secure_session_util::time::Deadline;

use crate::binder::TryReceive;
use crate::channel::SessionChannel;
use crate::client::channel::{ClientSessionCore, Incoming};
use crate::msgs::Message;
use crate::state::CommunicationState;
use crate::token::ContextId;
use crate::{Result, SessionError};

/// How long one receive of the background pump may block
const RECEIVE_POLL: Duration = Duration::from_secs(1);

type Inbox = UnboundedReceiver<Result<Message>>;

/// Duplex client session: either side sends whenever it likes.
///
/// A background task receives and verifies incoming messages; the
/// application picks them up with [DuplexSessionChannel::receive].
#[derive(Clone, Debug)]
pub struct DuplexSessionChannel {
    core: Arc<ClientSessionCore>,
    inbox: Arc<AsyncMutex<Option<Inbox>>>,
}

impl DuplexSessionChannel {
    pub(crate) fn new(core: ClientSessionCore) -> Self {
        Self {
            core: Arc::new(core),
            inbox: Arc::new(AsyncMutex::new(None)),
        }
    }

    pub async fn send(&self, message: Message, timeout: Duration) -> Result<()> {
        let res = async {
            let deadline = Deadline::after(timeout);
            let (secured, _) = self.core.secure_application(message, &deadline).await?;
            self.core.binder.send(secured, deadline.remaining()).await
        }
        .await;
        self.core.guard(res)
    }

    /// The next application message, or `None` once the peer closed its
    /// session. Fails with [SessionError::Aborted] if the channel was aborted
    /// instead.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Deadline::after(timeout);
        let mut inbox = match tokio::time::timeout(timeout, self.inbox.lock()).await {
            Ok(inbox) => inbox,
            Err(_) => return Err(SessionError::timeout("receive", timeout)),
        };
        let inbox = inbox
            .as_mut()
            .ok_or_else(|| SessionError::InvalidState(self.core.state().to_string()))?;
        match tokio::time::timeout(deadline.remaining(), inbox.recv()).await {
            Err(_) => Err(SessionError::timeout("receive", timeout)),
            Ok(Some(msg)) => msg.map(Some),
            Ok(None) if self.core.peer_closed() => Ok(None),
            Ok(None) => Err(self.core.fault_cause().unwrap_or(SessionError::Aborted)),
        }
    }

    pub async fn renew_key(&self, timeout: Duration) -> Result<()> {
        let res = self.core.scheduler.renew(timeout).await;
        self.core.guard(res)
    }

    fn start_receiving(&self, inbox: &mut Option<Inbox>) {
        if inbox.is_some() {
            return;
        }
        let (tx, rx) = unbounded_channel();
        *inbox = Some(rx);
        let weak = Arc::downgrade(&self.core);
        let handle = tokio::spawn(receive_loop(weak, tx)).abort_handle();
        self.core.register_task(handle);
    }
}

/// Feed verified application messages into the inbox until the peer closes
/// its session or the channel goes away
async fn receive_loop(weak: Weak<ClientSessionCore>, inbox: UnboundedSender<Result<Message>>) {
    loop {
        let Some(core) = weak.upgrade() else {
            break;
        };
        if core.lifecycle.is_terminal() || core.input_closed.is_set() {
            break;
        }

        let received = core.binder.try_receive(RECEIVE_POLL).await;
        let ctx = match received {
            Ok(TryReceive::Received(ctx)) => ctx,
            Ok(TryReceive::TimedOut) => continue,
            Ok(TryReceive::Closed) => {
                if !core.input_closed.is_set() {
                    let err = SessionError::Communication(
                        "peer closed the transport without closing the session".to_owned(),
                    );
                    end_input(&core, &inbox, err);
                }
                break;
            }
            Err(e) if e.is_transport() && core.config.tolerate_transport_failures => {
                if core.lifecycle.is_terminal() {
                    break;
                }
                debug!("ignoring failed receive on client session {:?}: {e}", core.session_id());
                tokio::task::yield_now().await;
                continue;
            }
            Err(e) => {
                end_input(&core, &inbox, e);
                break;
            }
        };

        let deadline = Deadline::after(RECEIVE_POLL);
        match core.process_incoming(ctx.into_message(), &deadline, None).await {
            Ok(Incoming::Application(msg)) => {
                if inbox.send(Ok(msg)).is_err() {
                    break;
                }
            }
            Ok(Incoming::RenewNeeded) | Ok(Incoming::CloseHandshake) => {}
            Err(e) => {
                warn!("client session {:?}: incoming message failed: {e}", core.session_id());
                end_input(&core, &inbox, e);
                break;
            }
        }
    }
}

/// The pump stops on `err`; nothing receives for the channel after this, so
/// it faults. Errors of a channel that already ended are left to
/// [DuplexSessionChannel::receive], which reports how it ended.
fn end_input(core: &ClientSessionCore, inbox: &UnboundedSender<Result<Message>>, err: SessionError) {
    if core.lifecycle.is_terminal() {
        return;
    }
    core.fault(err.clone());
    let _ = inbox.send(Err(err));
}

#[async_trait]
impl SessionChannel for DuplexSessionChannel {
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
        self.core.open(timeout).await?;
        let mut inbox = self.inbox.lock().await;
        self.start_receiving(&mut inbox);
        Ok(())
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.core.close_duplex(timeout).await
    }

    fn abort(&self) {
        self.core.abort()
    }
}
