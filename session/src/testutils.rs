//! In-process collaborators for tests and the demo: a token service, a keyed
//! hash security protocol and a loopback transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use blake2::digest::crypto_common::typenum::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{oneshot, watch};

use secure_session_util::sync::MutexExt;
use secure_session_util::time::{Clock, Deadline, Timing};

pub use secure_session_util::time::ManualClock;

use crate::binder::{ChannelBinder, ChannelBinderFactory, RequestContext, TryReceive};
use crate::msgs::{Action, Message, SecurityHeader};
use crate::protocol::{
    Correlation, ProtectionError, SecurityProtocol, SecurityProtocolFactory, Verified,
};
use crate::provider::SessionTokenProvider;
use crate::server::ServerSessionSettings;
use crate::token::{ContextId, KeyGeneration, SessionToken};
use crate::{Result, SessionError};

/// Issues tokens valid for `lifetime` seconds from the current time.
///
/// With a listener attached, every issued and renewed token is reported to
/// it the way a real issuance service would.
#[derive(Debug)]
pub struct TestTokenService {
    clock: Arc<dyn Clock>,
    lifetime: Timing,
    renew_delay: Duration,
    fail_renewals: AtomicBool,
    renew_calls: AtomicUsize,
    issued: Mutex<Vec<SessionToken>>,
    listener: Option<ServerSessionSettings>,
}

impl TestTokenService {
    pub fn new<C: Clock + 'static>(clock: C, lifetime: Timing) -> Self {
        Self {
            clock: Arc::new(clock),
            lifetime,
            renew_delay: Duration::ZERO,
            fail_renewals: AtomicBool::new(false),
            renew_calls: AtomicUsize::new(0),
            issued: Mutex::new(Vec::new()),
            listener: None,
        }
    }

    pub fn with_renew_delay(mut self, delay: Duration) -> Self {
        self.renew_delay = delay;
        self
    }

    pub fn with_listener(mut self, listener: ServerSessionSettings) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn fail_renewals(&self, fail: bool) {
        self.fail_renewals.store(fail, Ordering::SeqCst);
    }

    /// Renewals requested so far, including failed ones
    pub fn renew_calls(&self) -> usize {
        self.renew_calls.load(Ordering::SeqCst)
    }

    /// Every token issued or renewed so far, oldest first
    pub fn issued_tokens(&self) -> Vec<SessionToken> {
        self.issued.lock_unpoisoned().clone()
    }

    pub fn issue(&self, context_id: ContextId, key_generation: KeyGeneration) -> Result<SessionToken> {
        let now = self.clock.now();
        let key: [u8; 32] = rand::random();
        let token =
            SessionToken::new(context_id, key_generation, now, now + self.lifetime, key.to_vec())?;
        self.issued.lock_unpoisoned().push(token.clone());
        Ok(token)
    }
}

#[async_trait]
impl SessionTokenProvider for TestTokenService {
    async fn get_token(&self, _timeout: Duration) -> Result<SessionToken> {
        let token = self.issue(ContextId(rand::random()), KeyGeneration(1))?;
        if let Some(listener) = &self.listener {
            listener.on_token_issued(token.clone(), "loopback").await?;
        }
        Ok(token)
    }

    async fn renew_token(&self, _timeout: Duration, current: &SessionToken) -> Result<SessionToken> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        if !self.renew_delay.is_zero() {
            tokio::time::sleep(self.renew_delay).await;
        }
        if self.fail_renewals.load(Ordering::SeqCst) {
            return Err(SessionError::Communication(
                "token service refused the renewal".to_owned(),
            ));
        }
        let next = KeyGeneration(current.key_generation().0 + 1);
        let token = self.issue(current.context_id(), next)?;
        if let Some(listener) = &self.listener {
            listener.on_token_renewed(token.clone(), current)?;
        }
        Ok(token)
    }
}

type TagMac = Blake2bMac<U32>;

/// Authenticates messages with a keyed BLAKE2b MAC over their postcard
/// encoding. Nothing is encrypted.
#[derive(Debug, Default)]
pub struct TagProtocol;

fn tag_mac(key: &[u8], message: &Message) -> Result<TagMac, ProtectionError> {
    let bytes =
        postcard::to_allocvec(message).map_err(|e| ProtectionError::Malformed(e.to_string()))?;
    let mut mac = TagMac::new_from_slice(key)
        .map_err(|_| ProtectionError::Rejected("unusable session key".to_owned()))?;
    mac.update(&bytes);
    Ok(mac)
}

#[async_trait]
impl SecurityProtocol for TagProtocol {
    async fn secure_outgoing(
        &self,
        message: Message,
        token: &SessionToken,
        _timeout: Duration,
    ) -> Result<(Message, Correlation), ProtectionError> {
        let mut message = message.unsecured();
        let tag = tag_mac(token.key(), &message)?.finalize().into_bytes().to_vec();
        let correlation = Correlation {
            request_id: Some(message.message_id),
        };
        message.security = Some(SecurityHeader {
            key: token.id(),
            tag,
        });
        Ok((message, correlation))
    }

    async fn verify_incoming(
        &self,
        message: Message,
        trusted: &[SessionToken],
        _timeout: Duration,
        correlation: Option<Correlation>,
    ) -> Result<Verified, ProtectionError> {
        let header = message
            .security
            .clone()
            .ok_or_else(|| ProtectionError::Rejected("message is not secured".to_owned()))?;
        let token = trusted
            .iter()
            .find(|t| t.matches(&header.key))
            .ok_or(ProtectionError::UnknownKey(header.key))?;
        let message = message.unsecured();
        tag_mac(token.key(), &message)?
            .verify_slice(&header.tag)
            .map_err(|_| ProtectionError::Rejected("bad message tag".to_owned()))?;
        if let Some(Correlation {
            request_id: Some(id),
        }) = correlation
        {
            if message.relates_to != Some(id) {
                return Err(ProtectionError::Rejected(
                    "reply does not answer the request".to_owned(),
                ));
            }
        }
        Ok(Verified {
            message,
            key: header.key,
        })
    }
}

#[derive(Debug, Default)]
pub struct TagProtocolFactory;

impl SecurityProtocolFactory for TagProtocolFactory {
    fn create_protocol(&self) -> Arc<dyn SecurityProtocol> {
        Arc::new(TagProtocol)
    }
}

/// One end of an in-memory transport.
///
/// Closing or aborting an end drops its sender, so the peer's receives report
/// [TryReceive::Closed].
#[derive(Debug)]
pub struct LoopbackBinder {
    tx: Mutex<Option<UnboundedSender<RequestContext>>>,
    rx: AsyncMutex<UnboundedReceiver<RequestContext>>,
    shut: watch::Sender<bool>,
    fault: watch::Sender<Option<SessionError>>,
    fail_close: AtomicBool,
    failing_receives: AtomicUsize,
    closes: AtomicUsize,
    aborts: AtomicUsize,
    sent: Mutex<Vec<Action>>,
}

impl LoopbackBinder {
    fn new(tx: UnboundedSender<RequestContext>, rx: UnboundedReceiver<RequestContext>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            shut: watch::Sender::new(false),
            fault: watch::Sender::new(None),
            fail_close: AtomicBool::new(false),
            failing_receives: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Make the next `count` receives fail with a communication error
    pub fn fail_receives(&self, count: usize) {
        self.failing_receives.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Actions of every message sent or requested through this end
    pub fn sent_actions(&self) -> Vec<Action> {
        self.sent.lock_unpoisoned().clone()
    }

    /// Make the transport report a fault
    pub fn inject_fault(&self, err: SessionError) {
        self.fault.send_replace(Some(err));
    }

    fn shut_down(&self) {
        self.shut.send_replace(true);
        self.tx.lock_unpoisoned().take();
    }

    fn is_shut(&self) -> bool {
        *self.shut.borrow()
    }

    fn deliver(&self, ctx: RequestContext) -> Result<()> {
        self.sent.lock_unpoisoned().push(ctx.message.action.clone());
        match &*self.tx.lock_unpoisoned() {
            Some(tx) => tx
                .send(ctx)
                .map_err(|_| SessionError::Communication("peer went away".to_owned())),
            None => Err(SessionError::Communication("transport is closed".to_owned())),
        }
    }
}

/// Two connected ends
pub fn loopback_pair() -> (Arc<LoopbackBinder>, Arc<LoopbackBinder>) {
    let (a_tx, b_rx) = unbounded_channel();
    let (b_tx, a_rx) = unbounded_channel();
    (
        Arc::new(LoopbackBinder::new(a_tx, a_rx)),
        Arc::new(LoopbackBinder::new(b_tx, b_rx)),
    )
}

#[async_trait]
impl ChannelBinder for LoopbackBinder {
    async fn open(&self, _timeout: Duration) -> Result<()> {
        match self.is_shut() {
            true => Err(SessionError::Communication("transport is closed".to_owned())),
            false => Ok(()),
        }
    }

    async fn close(&self, _timeout: Duration) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(SessionError::Communication("close failed".to_owned()));
        }
        self.shut_down();
        Ok(())
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.shut_down();
    }

    async fn send(&self, message: Message, _timeout: Duration) -> Result<()> {
        self.deliver(RequestContext::new(message))
    }

    async fn try_receive(&self, timeout: Duration) -> Result<TryReceive> {
        let failing = self
            .failing_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SessionError::Communication("receive failed".to_owned()));
        }
        let deadline = Deadline::after(timeout);
        let mut shut = self.shut.subscribe();
        if *shut.borrow() {
            return Ok(TryReceive::Closed);
        }
        let mut rx = match tokio::time::timeout(timeout, self.rx.lock()).await {
            Ok(rx) => rx,
            Err(_) => return Ok(TryReceive::TimedOut),
        };
        tokio::select! {
            received = rx.recv() => Ok(match received {
                Some(ctx) => TryReceive::Received(ctx),
                None => TryReceive::Closed,
            }),
            _ = shut.wait_for(|s| *s) => Ok(TryReceive::Closed),
            _ = tokio::time::sleep_until(deadline.instant()) => Ok(TryReceive::TimedOut),
        }
    }

    async fn request(&self, message: Message, timeout: Duration) -> Result<Message> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.deliver(RequestContext::with_replier(message, reply_tx))?;
        let mut shut = self.shut.subscribe();
        tokio::select! {
            reply = reply_rx => reply.map_err(|_| {
                SessionError::Communication("request was dropped without a reply".to_owned())
            }),
            _ = shut.wait_for(|s| *s) => Err(SessionError::Communication("transport is closed".to_owned())),
            _ = tokio::time::sleep(timeout) => Err(SessionError::timeout("request", timeout)),
        }
    }

    async fn faulted(&self) -> SessionError {
        let mut rx = self.fault.subscribe();
        let cause = rx.wait_for(|f| f.is_some()).await.ok().and_then(|f| f.clone());
        match cause {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }
}

/// Hands the server end of each [LoopbackNetwork::connect] to the listener,
/// in connection order
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    server_ends: Mutex<VecDeque<Arc<LoopbackBinder>>>,
    accepted: Mutex<Vec<Arc<LoopbackBinder>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the client end
    pub fn connect(&self) -> Arc<LoopbackBinder> {
        let (client, server) = loopback_pair();
        self.server_ends.lock_unpoisoned().push_back(server);
        client
    }

    /// Server ends handed out so far
    pub fn server_binders(&self) -> Vec<Arc<LoopbackBinder>> {
        self.accepted.lock_unpoisoned().clone()
    }
}

#[async_trait]
impl ChannelBinderFactory for LoopbackNetwork {
    async fn create_binder(
        &self,
        token: &SessionToken,
        requestor: &str,
    ) -> Result<Arc<dyn ChannelBinder>> {
        let server = self.server_ends.lock_unpoisoned().pop_front().ok_or_else(|| {
            SessionError::Communication(format!(
                "no connection from {requestor} for session {}",
                token.context_id()
            ))
        })?;
        self.accepted.lock_unpoisoned().push(server.clone());
        Ok(server)
    }
}
