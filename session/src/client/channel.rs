//! State shared by both kinds of client session channel: opening, securing
//! outgoing messages, verifying incoming ones and the client side of the
//! close handshake.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::OnceCell;
use tokio::task::AbortHandle;

use secure_session_util::sync::MutexExt;
use secure_session_util::time::{Clock, Deadline};

use crate::binder::ChannelBinder;
use crate::client::renewal::{ClientSessionState, KeyRenewalScheduler, RenewalPolicy};
use crate::close::{check_close_response, check_close_target, CloseStep};
use crate::config::ClientSessionConfig;
use crate::msgs::{Action, FaultCode, Message};
use crate::protocol::{Correlation, SecurityProtocol};
use crate::provider::SessionTokenProvider;
use crate::state::{CommunicationState, Lifecycle};
use crate::token::ContextId;
use crate::wait::WaitObject;
use crate::{with_timeout, Result, SessionError};

/// What an incoming message turned out to be after verification
#[derive(Debug)]
pub(crate) enum Incoming {
    /// To be handed to the application; includes faults the session layer
    /// does not interpret
    Application(Message),
    /// The peer asked for a fresh key; it will be renewed before the next send
    RenewNeeded,
    /// A close or close-response, consumed by the handshake
    CloseHandshake,
}

#[derive(Debug)]
pub(crate) struct ClientSessionCore {
    pub(crate) config: ClientSessionConfig,
    /// Duplex channels expect the peer to close as well; request channels
    /// only ever receive a close-response
    expect_close: bool,
    pub(crate) binder: Arc<dyn ChannelBinder>,
    protocol: Arc<dyn SecurityProtocol>,
    provider: Arc<dyn SessionTokenProvider>,
    pub(crate) lifecycle: Lifecycle,
    state: Arc<Mutex<ClientSessionState>>,
    pub(crate) scheduler: KeyRenewalScheduler,
    /// The peer will send nothing more
    pub(crate) input_closed: WaitObject,
    /// Our close or close-response went out
    output_closed: WaitObject,
    opened: OnceCell<Result<()>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl ClientSessionCore {
    pub(crate) fn new(
        config: ClientSessionConfig,
        expect_close: bool,
        binder: Arc<dyn ChannelBinder>,
        protocol: Arc<dyn SecurityProtocol>,
        provider: Arc<dyn SessionTokenProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = Arc::new(Mutex::new(ClientSessionState::default()));
        let scheduler = KeyRenewalScheduler::new(
            RenewalPolicy::from(&config),
            clock,
            provider.clone(),
            state.clone(),
        );
        Self {
            config,
            expect_close,
            binder,
            protocol,
            provider,
            lifecycle: Lifecycle::default(),
            state,
            scheduler,
            input_closed: WaitObject::new(false),
            output_closed: WaitObject::new(false),
            opened: OnceCell::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn session_id(&self) -> Option<ContextId> {
        self.scheduler.session_id()
    }

    /// Whether the peer closed its side of the session, as opposed to the
    /// input ending because the channel was aborted or faulted
    pub(crate) fn peer_closed(&self) -> bool {
        self.state.lock_unpoisoned().close.input_closed
    }

    pub(crate) fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    pub(crate) fn fault_cause(&self) -> Option<SessionError> {
        self.lifecycle.fault_cause()
    }

    /// Obtain the first token and open the transport.
    ///
    /// Concurrent and repeated calls share the outcome of the first one.
    pub(crate) async fn open(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        self.opened
            .get_or_init(|| self.open_once(timeout))
            .await
            .clone()
    }

    async fn open_once(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        self.lifecycle.begin_open()?;
        let deadline = Deadline::after(timeout);

        let res = async {
            let remaining = deadline.remaining();
            let token = with_timeout(
                "obtaining the session token",
                remaining,
                self.provider.get_token(remaining),
            )
            .await?;
            self.scheduler.install(token);
            self.binder.open(deadline.remaining()).await?;
            self.lifecycle.opened()
        }
        .await;

        match res {
            Ok(()) => {
                self.watch_binder();
                info!("client session {:?} opened", self.session_id());
                Ok(())
            }
            Err(e) => {
                warn!("opening client session failed: {e}");
                self.abort();
                Err(e)
            }
        }
    }

    fn watch_binder(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let binder = self.binder.clone();
        let handle = tokio::spawn(async move {
            let err = binder.faulted().await;
            if let Some(core) = weak.upgrade() {
                warn!("transport of client session {:?} faulted: {err}", core.session_id());
                core.fault(err);
            }
        })
        .abort_handle();
        self.register_task(handle);
    }

    pub(crate) fn register_task(&self, handle: AbortHandle) {
        self.tasks.lock_unpoisoned().push(handle);
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock_unpoisoned().drain(..) {
            task.abort();
        }
    }

    pub(crate) fn fault(&self, err: SessionError) {
        if !self.lifecycle.fault(err.clone()) {
            return;
        }
        error!("client session {:?} faulted: {err}", self.session_id());
        self.binder.abort();
        self.scheduler.fault(err.clone());
        self.input_closed.fault(err.clone());
        self.output_closed.fault(err);
        self.stop_tasks();
    }

    pub(crate) fn abort(&self) {
        if !self.lifecycle.abort() {
            return;
        }
        debug!("client session {:?} aborted", self.session_id());
        self.binder.abort();
        self.scheduler.abort();
        self.input_closed.abort();
        self.output_closed.abort();
        self.stop_tasks();
    }

    /// Fault the channel on errors other than transport and usage errors
    pub(crate) fn guard<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if e.faults_channel() {
                self.fault(e.clone());
            }
        }
        res
    }

    /// Protect an application message; fails once the output side is closed
    pub(crate) async fn secure_application(
        &self,
        message: Message,
        deadline: &Deadline,
    ) -> Result<(Message, Correlation)> {
        self.lifecycle.ensure_usable(false)?;
        self.state.lock_unpoisoned().close.ensure_output_open()?;
        self.secure(message, deadline).await
    }

    async fn secure(&self, message: Message, deadline: &Deadline) -> Result<(Message, Correlation)> {
        let token = self.scheduler.outgoing_token(deadline.remaining()).await?;
        let secured = self
            .protocol
            .secure_outgoing(message, &token, deadline.remaining())
            .await?;
        Ok(secured)
    }

    /// Verify a message from the peer and let the session layer handle the
    /// parts that concern it
    pub(crate) async fn process_incoming(
        &self,
        message: Message,
        deadline: &Deadline,
        correlation: Option<Correlation>,
    ) -> Result<Incoming> {
        let trusted = self.scheduler.incoming_tokens();

        // The peer could not verify something we sent and told us so, unsecured
        let unsecured_security_fault = match (&message.security, message.as_fault()) {
            (None, Some(fault)) if fault.code == FaultCode::SecurityError => {
                Some(fault.reason.clone())
            }
            _ => None,
        };

        let verified = match self
            .protocol
            .verify_incoming(message, &trusted, deadline.remaining(), correlation)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                return Err(match unsecured_security_fault {
                    Some(reason) => SessionError::SecurityFault(reason),
                    None => e.into(),
                })
            }
        };
        let message = verified.message;

        match &message.action {
            Action::CloseResponse => {
                check_close_response(&message)?;
                let first = self
                    .state
                    .lock_unpoisoned()
                    .close
                    .on_close_response_received()?;
                if first {
                    info!("client session {:?}: close response received", self.session_id());
                    self.input_closed.set();
                }
                Ok(Incoming::CloseHandshake)
            }
            Action::Close => {
                let session = self
                    .session_id()
                    .ok_or_else(|| SessionError::InvalidState("not opened".to_owned()))?;
                check_close_target(&message, session)?;
                let first = {
                    let mut state = self.state.lock_unpoisoned();
                    let first = state.close.on_close_received(self.expect_close)?;
                    if first {
                        state.peer_close = Some(message.clone());
                    }
                    first
                };
                if first {
                    info!("client session {session}: close received");
                    self.input_closed.set();
                }
                Ok(Incoming::CloseHandshake)
            }
            Action::Fault => match message.as_fault() {
                Some(fault) if fault.code == FaultCode::RenewNeeded => {
                    info!(
                        "client session {:?}: peer asks for key renewal",
                        self.session_id()
                    );
                    self.scheduler.force_renewal();
                    Ok(Incoming::RenewNeeded)
                }
                Some(fault) if fault.code == FaultCode::SessionAborted => {
                    warn!("client session {:?} aborted by peer", self.session_id());
                    Err(SessionError::SessionAborted(fault.reason.clone()))
                }
                _ => Ok(Incoming::Application(message)),
            },
            Action::Application(_) => Ok(Incoming::Application(message)),
        }
    }

    /// Close the output session, returning the message that needs to go out
    fn next_close_message(&self) -> Result<Option<Message>> {
        let mut state = self.state.lock_unpoisoned();
        let msg = match state.close.close_output() {
            CloseStep::Nothing => None,
            CloseStep::SendClose => {
                let key = state
                    .keys
                    .as_ref()
                    .map(|k| k.current.id())
                    .ok_or_else(|| SessionError::InvalidState("not opened".to_owned()))?;
                Some(Message::close(key, None))
            }
            CloseStep::SendCloseResponse => match &state.peer_close {
                Some(close) => Some(Message::close_response(close, true)),
                None => {
                    return Err(SessionError::InvalidState(
                        "closing without the received close".to_owned(),
                    ))
                }
            },
        };
        Ok(msg)
    }

    /// Send close or close-response one-way, as duplex channels do
    async fn close_output_session(&self, deadline: &Deadline) -> Result<()> {
        if let Some(msg) = self.next_close_message()? {
            let action = msg.action.clone();
            let (secured, _) = self.secure(msg, deadline).await?;
            self.binder.send(secured, deadline.remaining()).await?;
            debug!("client session {:?}: sent {action:?}", self.session_id());
        }
        self.output_closed.set();
        Ok(())
    }

    /// Send the close as a request and expect the close-response as its reply
    async fn close_with_request(&self, deadline: &Deadline) -> Result<()> {
        if let Some(msg) = self.next_close_message()? {
            let (secured, correlation) = self.secure(msg, deadline).await?;
            let reply = self.binder.request(secured, deadline.remaining()).await?;
            let incoming = self
                .process_incoming(reply, deadline, Some(correlation))
                .await?;
            if !matches!(incoming, Incoming::CloseHandshake) || !self.input_closed.is_set() {
                return Err(SessionError::ProtocolViolation(
                    "receive-shutdown-returned-non-null".to_owned(),
                ));
            }
        }
        self.output_closed.set();
        Ok(())
    }

    async fn wait_for_input_close(&self, deadline: &Deadline) -> Result<()> {
        match self.input_closed.wait(deadline.remaining()).await? {
            true => Ok(()),
            false => Err(SessionError::Timeout(
                "waiting for the peer to close its session".to_owned(),
            )),
        }
    }

    async fn close_core(&self, deadline: &Deadline) -> Result<()> {
        match self.output_closed.wait(deadline.remaining()).await? {
            true => {}
            false => {
                return Err(SessionError::Timeout(
                    "waiting for the output session to close".to_owned(),
                ))
            }
        }
        self.binder.close(deadline.remaining()).await?;
        self.stop_tasks();
        self.lifecycle.closed();
        info!("client session {:?} closed", self.session_id());
        Ok(())
    }

    /// Close a duplex session: send our part and wait for the peer's
    pub(crate) async fn close_duplex(&self, timeout: Duration) -> Result<()> {
        if !self.lifecycle.begin_close()? {
            return Ok(());
        }
        let deadline = Deadline::after(timeout);
        let res = async {
            self.close_output_session(&deadline).await?;
            self.wait_for_input_close(&deadline).await?;
            self.close_core(&deadline).await
        }
        .await;
        self.finish_close(res)
    }

    /// Close a request session through a close request and its response
    pub(crate) async fn close_simplex(&self, timeout: Duration) -> Result<()> {
        if !self.lifecycle.begin_close()? {
            return Ok(());
        }
        let deadline = Deadline::after(timeout);
        let res = async {
            self.close_with_request(&deadline).await?;
            self.close_core(&deadline).await
        }
        .await;
        self.finish_close(res)
    }

    fn finish_close(&self, res: Result<()>) -> Result<()> {
        match res {
            Ok(()) => Ok(()),
            // Aborted concurrently; the channel ended up closed anyway
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
