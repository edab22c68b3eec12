//! State shared by both kinds of server session channel.
//!
//! The server side differs from the client in three ways: its first token
//! comes from the listener rather than a provider, it has to track renewed
//! keys the client has not used yet, and it plays either role of the close
//! handshake. A close received before the application closes the channel is
//! answered only once the channel itself closes; the response waits in a
//! single staging slot until then.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::AbortHandle;

use secure_session_util::sync::MutexExt;
use secure_session_util::time::{Clock, Deadline};

use crate::binder::{ChannelBinder, ReplyHandle, RequestContext, TryReceive};
use crate::close::{check_close_target, CloseHandshake, CloseStep};
use crate::config::{ServerChannelKind, ServerSessionConfig};
use crate::msgs::{Action, Message, MessageId, SessionFault};
use crate::protocol::{ProtectionError, SecurityProtocol};
use crate::server::active::ActiveSessionRegistry;
use crate::server::rollover::{IncomingCheck, RolloverPolicy, ServerTokenState};
use crate::server::token_cache::SessionTokenCache;
use crate::state::{CommunicationState, Lifecycle};
use crate::token::{ContextId, KeyIdentifier, SessionToken};
use crate::wait::WaitObject;
use crate::{Result, SessionError};

/// A close-response computed when the peer's close arrived
#[derive(Debug)]
struct StagedResponse {
    reply: ReplyHandle,
    response: Message,
}

#[derive(Debug)]
struct ServerSessionState {
    tokens: ServerTokenState,
    close: CloseHandshake,
    staged: Option<StagedResponse>,
}

/// Shared between a server channel, the listener and the active registry
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: ServerSessionConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cache: Arc<SessionTokenCache>,
    pub(crate) active: Arc<ActiveSessionRegistry>,
}

#[derive(Debug)]
pub(crate) struct ServerSessionCore {
    session_id: ContextId,
    kind: ServerChannelKind,
    shared: Arc<Shared>,
    policy: RolloverPolicy,
    pub(crate) binder: Arc<dyn ChannelBinder>,
    protocol: Arc<dyn SecurityProtocol>,
    lifecycle: Lifecycle,
    state: Mutex<ServerSessionState>,
    /// Receives are processed one at a time
    receive_lock: AsyncMutex<()>,
    /// Released on abort or fault; blocked receives and closes end with it
    terminated: WaitObject,
    /// The message that promoted the session from pending to active
    initial: Mutex<Option<RequestContext>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl ServerSessionCore {
    pub(crate) fn new(
        kind: ServerChannelKind,
        shared: Arc<Shared>,
        token: SessionToken,
        binder: Arc<dyn ChannelBinder>,
        protocol: Arc<dyn SecurityProtocol>,
        initial: RequestContext,
    ) -> Self {
        Self {
            session_id: token.context_id(),
            kind,
            policy: RolloverPolicy::from(&shared.config),
            shared,
            binder,
            protocol,
            lifecycle: Lifecycle::default(),
            state: Mutex::new(ServerSessionState {
                tokens: ServerTokenState::new(token),
                close: CloseHandshake::default(),
                staged: None,
            }),
            receive_lock: AsyncMutex::new(()),
            terminated: WaitObject::new(false),
            initial: Mutex::new(Some(initial)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn session_id(&self) -> ContextId {
        self.session_id
    }

    pub(crate) fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    pub(crate) fn fault_cause(&self) -> Option<SessionError> {
        self.lifecycle.fault_cause()
    }

    pub(crate) fn current_key(&self) -> KeyIdentifier {
        self.state.lock_unpoisoned().tokens.current().id()
    }

    /// The binder is already open when the listener creates the channel
    pub(crate) fn open_accepted(self: &Arc<Self>) -> Result<()> {
        self.lifecycle.begin_open()?;
        self.lifecycle.opened()?;
        self.watch_binder();
        Ok(())
    }

    /// Opening an accepted channel again is a no-op
    pub(crate) fn open(&self) -> Result<()> {
        match self.lifecycle.state() {
            CommunicationState::Opened => Ok(()),
            _ => self.lifecycle.ensure_usable(false),
        }
    }

    fn watch_binder(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let binder = self.binder.clone();
        let handle = tokio::spawn(async move {
            let err = binder.faulted().await;
            if let Some(core) = weak.upgrade() {
                warn!("transport of server session {} faulted: {err}", core.session_id);
                core.fault(err);
            }
        })
        .abort_handle();
        self.tasks.lock_unpoisoned().push(handle);
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock_unpoisoned().drain(..) {
            task.abort();
        }
    }

    /// Forget the session in the listener's shared state
    fn release(&self) {
        self.shared.cache.remove_all_contexts(self.session_id);
        self.shared.active.remove(self.session_id);
    }

    pub(crate) fn fault(&self, err: SessionError) {
        if !self.lifecycle.fault(err.clone()) {
            return;
        }
        error!("server session {} faulted: {err}", self.session_id);
        self.terminated.fault(err);
        self.binder.abort();
        self.stop_tasks();
        self.release();
    }

    pub(crate) fn abort(&self) {
        if !self.lifecycle.abort() {
            return;
        }
        debug!("server session {} aborted", self.session_id);
        self.terminated.abort();
        self.binder.abort();
        self.stop_tasks();
        self.release();
    }

    /// Why the channel can no longer be used, once it was aborted or faulted
    fn terminal_cause(&self) -> Option<SessionError> {
        match self.lifecycle.is_terminal() {
            true => self.lifecycle.ensure_usable(true).err(),
            false => None,
        }
    }

    pub(crate) fn guard<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if e.faults_channel() {
                self.fault(e.clone());
            }
        }
        res
    }

    /// Register a key the client renewed out of band
    pub(crate) fn renew_session_token(&self, new: SessionToken, old: &KeyIdentifier) -> Result<()> {
        self.lifecycle.ensure_usable(true)?;
        self.state
            .lock_unpoisoned()
            .tokens
            .renew(new.clone(), old, &self.policy)?;
        self.shared.cache.add(new);
        Ok(())
    }

    /// Protect an application message under the current key, which must not
    /// be stale
    pub(crate) async fn secure_application(
        &self,
        message: Message,
        deadline: &Deadline,
    ) -> Result<Message> {
        self.lifecycle.ensure_usable(true)?;
        let token = {
            let state = self.state.lock_unpoisoned();
            state.close.ensure_output_open()?;
            state
                .tokens
                .check_outgoing(self.shared.clock.now(), &self.policy)?;
            state.tokens.current().clone()
        };
        let (secured, _) = self
            .protocol
            .secure_outgoing(message, &token, deadline.remaining())
            .await?;
        Ok(secured)
    }

    /// Protect a session layer message. These go out even under a stale key
    /// so that the peer learns it has to renew or that the session ends.
    async fn secure_control(&self, message: Message, deadline: &Deadline) -> Result<Message> {
        let token = self.state.lock_unpoisoned().tokens.current().clone();
        let (secured, _) = self
            .protocol
            .secure_outgoing(message, &token, deadline.remaining())
            .await?;
        Ok(secured)
    }

    /// Answer a request through its reply path, or one-way if the peer sent
    /// it without waiting for a reply
    pub(crate) async fn deliver(
        &self,
        reply: ReplyHandle,
        message: Message,
        deadline: &Deadline,
    ) -> Result<()> {
        match reply.expects_reply() {
            true => reply.reply(message),
            false => self.binder.send(message, deadline.remaining()).await,
        }
    }

    /// Session layer replies are best effort; the peer times out otherwise
    async fn send_control(
        &self,
        reply: ReplyHandle,
        message: Message,
        secured: bool,
        deadline: &Deadline,
    ) {
        let action = message.action.clone();
        let res = async {
            let message = match secured {
                true => self.secure_control(message, deadline).await?,
                false => message,
            };
            self.deliver(reply, message, deadline).await
        }
        .await;
        match res {
            Ok(()) => debug!("server session {}: sent {action:?}", self.session_id),
            Err(e) => warn!("server session {}: sending {action:?} failed: {e}", self.session_id),
        }
    }

    async fn send_fault(
        &self,
        reply: ReplyHandle,
        fault: SessionFault,
        request_id: MessageId,
        secured: bool,
        deadline: &Deadline,
    ) {
        let mut message = Message::fault(fault);
        message.relates_to = Some(request_id);
        self.send_control(reply, message, secured, deadline).await
    }

    /// The next application message, or `None` once the peer closed its
    /// session. Session layer messages are handled on the way.
    pub(crate) async fn receive_request(
        &self,
        timeout: Duration,
    ) -> Result<Option<(Message, ReplyHandle)>> {
        self.lifecycle.ensure_usable(true)?;
        let deadline = Deadline::after(timeout);
        let _receiving = tokio::select! {
            locked = tokio::time::timeout(timeout, self.receive_lock.lock()) => match locked {
                Ok(guard) => guard,
                Err(_) => return Err(SessionError::timeout("receive", timeout)),
            },
            err = self.terminated.terminated() => return Err(err),
        };

        loop {
            self.lifecycle.ensure_usable(true)?;
            if self.state.lock_unpoisoned().close.input_closed {
                return Ok(None);
            }
            let ctx = match self.next_context(&deadline).await {
                Ok(Some(ctx)) => ctx,
                Ok(None) => continue,
                Err(e) => return Err(self.terminal_cause().unwrap_or(e)),
            };
            if let Some(request) = self.process_request(ctx, &deadline).await? {
                return Ok(Some(request));
            }
        }
    }

    /// `None` when a failed receive was tolerated
    async fn next_context(&self, deadline: &Deadline) -> Result<Option<RequestContext>> {
        if let Some(ctx) = self.initial.lock_unpoisoned().take() {
            return Ok(Some(ctx));
        }
        if deadline.expired() {
            return Err(SessionError::Timeout("no message received".to_owned()));
        }
        let received = tokio::select! {
            received = self.binder.try_receive(deadline.remaining()) => received,
            err = self.terminated.terminated() => return Err(err),
        };
        match received {
            Ok(TryReceive::Received(ctx)) => Ok(Some(ctx)),
            Ok(TryReceive::TimedOut) => Err(SessionError::Timeout("no message received".to_owned())),
            Ok(TryReceive::Closed) => Err(SessionError::Communication(
                "peer closed the transport without closing the session".to_owned(),
            )),
            Err(e)
                if e.is_transport()
                    && !e.is_timeout()
                    && self.shared.config.tolerate_transport_failures
                    && !self.lifecycle.is_terminal() =>
            {
                debug!("ignoring failed receive on server session {}: {e}", self.session_id);
                tokio::task::yield_now().await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Verify a received message and run the session layer's part.
    ///
    /// Returns the message if it is meant for the application.
    async fn process_request(
        &self,
        ctx: RequestContext,
        deadline: &Deadline,
    ) -> Result<Option<(Message, ReplyHandle)>> {
        let (message, reply) = ctx.take();
        let request_id = message.message_id;
        let is_close = message.action == Action::Close;
        let now = self.shared.clock.now();
        let trusted = self.shared.cache.live_tokens(self.session_id, now);

        let verified = match self
            .protocol
            .verify_incoming(message, &trusted, deadline.remaining(), None)
            .await
        {
            Ok(verified) => verified,
            Err(ProtectionError::Timeout(what)) => return Err(SessionError::Timeout(what)),
            Err(ProtectionError::UnknownKey(key)) if key.context_id == self.session_id => {
                info!(
                    "server session {}: key {} is unknown or retired, asking for renewal",
                    self.session_id, key.key_generation
                );
                self.send_fault(reply, SessionFault::renew_needed(), request_id, true, deadline)
                    .await;
                return Ok(None);
            }
            Err(e) => {
                warn!(
                    "server session {}: dropping message that failed verification: {e}",
                    self.session_id
                );
                self.send_fault(reply, SessionFault::security_error(), request_id, false, deadline)
                    .await;
                return Ok(None);
            }
        };

        let token = trusted
            .iter()
            .find(|t| t.matches(&verified.key))
            .ok_or_else(|| {
                SessionError::MessageSecurity(format!("message verified under untrusted key {}", verified.key))
            })?;
        let check = self
            .state
            .lock_unpoisoned()
            .tokens
            .check_incoming(token, is_close, now, &self.policy);
        match check {
            Ok(IncomingCheck::Accept) => {}
            Ok(IncomingCheck::Promoted(promotion)) => {
                let cache = &self.shared.cache;
                cache.update_caching_time(&promotion.retired, promotion.retire_at);
                for key in &promotion.discarded {
                    cache.remove_context(key);
                }
            }
            Ok(IncomingCheck::RenewNeeded) => {
                info!(
                    "server session {}: key {} expired, asking for renewal",
                    self.session_id,
                    token.key_generation()
                );
                self.send_fault(reply, SessionFault::renew_needed(), request_id, true, deadline)
                    .await;
                return Ok(None);
            }
            Err(e) => {
                self.send_fault(reply, SessionFault::session_aborted(), request_id, true, deadline)
                    .await;
                return Err(e);
            }
        }

        let message = verified.message;
        match &message.action {
            Action::Close => {
                self.on_close(message, reply, deadline).await?;
                Ok(None)
            }
            Action::CloseResponse => {
                let first = self
                    .state
                    .lock_unpoisoned()
                    .close
                    .on_close_response_received()?;
                if first {
                    info!("server session {}: close response received", self.session_id);
                }
                Ok(None)
            }
            Action::Application(_) | Action::Fault => Ok(Some((message, reply))),
        }
    }

    async fn on_close(&self, close: Message, reply: ReplyHandle, deadline: &Deadline) -> Result<()> {
        check_close_target(&close, self.session_id)?;
        let response = Message::close_response(&close, true);
        let send_now = {
            let mut state = self.state.lock_unpoisoned();
            if !state.close.on_close_received(true)? {
                return Ok(());
            }
            match state.close.output_closed {
                // Both sides closed at once; ours is already out
                true => Some((reply, response)),
                false => {
                    state.staged = Some(StagedResponse { reply, response });
                    None
                }
            }
        };
        info!("server session {}: close received", self.session_id);
        if let Some((reply, response)) = send_now {
            self.send_control(reply, response, true, deadline).await;
        }
        Ok(())
    }

    /// Close the output side: flush a staged close-response or, on duplex
    /// channels, send our own close
    async fn close_output_session(&self, deadline: &Deadline) {
        let outgoing = {
            let mut state = self.state.lock_unpoisoned();
            match state.close.close_output() {
                CloseStep::Nothing => None,
                CloseStep::SendCloseResponse => state
                    .staged
                    .take()
                    .map(|staged| (staged.reply, staged.response)),
                CloseStep::SendClose => match self.kind {
                    ServerChannelKind::Duplex => {
                        let target = state.tokens.current().id();
                        Some((ReplyHandle::none(), Message::close(target, None)))
                    }
                    // A reply channel cannot send on its own
                    ServerChannelKind::Reply => None,
                },
            }
        };
        if let Some((reply, message)) = outgoing {
            self.send_control(reply, message, true, deadline).await;
        }
    }

    /// Receive until the peer's session is closed; any further application
    /// message is a violation of the close handshake
    async fn wait_for_input_session_close(&self, deadline: &Deadline) -> Result<()> {
        match self.receive_request(deadline.remaining()).await? {
            None => Ok(()),
            Some(_) => Err(SessionError::ProtocolViolation(
                "receive-shutdown-returned-non-null".to_owned(),
            )),
        }
    }

    pub(crate) async fn close(&self, timeout: Duration) -> Result<()> {
        if !self.lifecycle.begin_close()? {
            return Ok(());
        }
        let deadline = Deadline::after(timeout);
        let res: Result<()> = async {
            match self.kind {
                ServerChannelKind::Reply => {
                    self.wait_for_input_session_close(&deadline).await?;
                    self.close_output_session(&deadline).await;
                }
                ServerChannelKind::Duplex => {
                    self.close_output_session(&deadline).await;
                    self.wait_for_input_session_close(&deadline).await?;
                }
            }
            self.binder.close(deadline.remaining()).await?;
            self.stop_tasks();
            self.release();
            self.lifecycle.closed();
            info!("server session {} closed", self.session_id);
            Ok(())
        }
        .await;

        match res {
            Ok(()) => Ok(()),
            Err(_) if self.lifecycle.state() == CommunicationState::Closed => Ok(()),
            Err(e) => {
                match e.faults_channel() {
                    true => self.fault(e.clone()),
                    false => self.abort(),
                }
                Err(e)
            }
        }
    }
}
