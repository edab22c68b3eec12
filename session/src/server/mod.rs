//! Server side of secure sessions.
//!
//! A [ServerSessionSettings] is the listener of one endpoint. The token
//! issuance collaborator reports every issued and renewed token to it. A
//! freshly issued session stays pending until its first message arrives; it
//! then becomes an active [ServerSessionChannel] and is handed out by
//! [ServerSessionSettings::accept_channel].

mod active;
mod channel;
mod duplex;
pub mod pending;
mod reply;
pub mod rollover;
pub mod token_cache;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{AbortHandle, JoinSet};

use secure_session_util::sync::MutexExt;
use secure_session_util::time::{dur, Clock};

use crate::binder::{ChannelBinder, ChannelBinderFactory, RequestContext, TryReceive};
use crate::channel::SessionChannel;
use crate::config::{ServerChannelKind, ServerSessionConfig};
use crate::protocol::SecurityProtocolFactory;
use crate::state::CommunicationState;
use crate::token::{ContextId, KeyIdentifier, SessionToken};
use crate::{Result, SessionError};

pub use active::ActiveSessionRegistry;
use channel::{ServerSessionCore, Shared};
pub use duplex::ServerDuplexSessionChannel;
use pending::PendingSessionRegistry;
pub use reply::{ReplySessionChannel, SessionRequest};
use token_cache::SessionTokenCache;

/// How long one receive for the first message of a pending session may block
const FIRST_MESSAGE_POLL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub enum ServerSessionChannel {
    Reply(ReplySessionChannel),
    Duplex(ServerDuplexSessionChannel),
}

impl ServerSessionChannel {
    fn from_core(kind: ServerChannelKind, core: Arc<ServerSessionCore>) -> Self {
        match kind {
            ServerChannelKind::Reply => Self::Reply(ReplySessionChannel::new(core)),
            ServerChannelKind::Duplex => Self::Duplex(ServerDuplexSessionChannel::new(core)),
        }
    }

    fn core(&self) -> &Arc<ServerSessionCore> {
        match self {
            Self::Reply(ch) => ch.core(),
            Self::Duplex(ch) => ch.core(),
        }
    }

    fn inner(&self) -> &dyn SessionChannel {
        match self {
            Self::Reply(ch) => ch,
            Self::Duplex(ch) => ch,
        }
    }

    /// Add a key renewed by the client; `old` must name the current key
    pub fn renew_session_token(&self, new: SessionToken, old: &KeyIdentifier) -> Result<()> {
        self.core().renew_session_token(new, old)
    }

    /// The key replies are currently protected with
    pub fn current_key(&self) -> KeyIdentifier {
        self.core().current_key()
    }

    pub fn into_reply(self) -> Option<ReplySessionChannel> {
        match self {
            Self::Reply(ch) => Some(ch),
            Self::Duplex(_) => None,
        }
    }

    pub fn into_duplex(self) -> Option<ServerDuplexSessionChannel> {
        match self {
            Self::Duplex(ch) => Some(ch),
            Self::Reply(_) => None,
        }
    }
}

#[async_trait]
impl SessionChannel for ServerSessionChannel {
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

#[derive(Debug)]
struct Listener {
    shared: Arc<Shared>,
    protocol_factory: Arc<dyn SecurityProtocolFactory>,
    binder_factory: Arc<dyn ChannelBinderFactory>,
    pending: PendingSessionRegistry,
    accepting: AtomicBool,
    accept_tx: Mutex<Option<UnboundedSender<ServerSessionChannel>>>,
    accept_rx: AsyncMutex<UnboundedReceiver<ServerSessionChannel>>,
    initiations: Mutex<JoinSet<()>>,
    sweeper: Mutex<Option<AbortHandle>>,
}

impl Listener {
    fn close_timeout(&self) -> Duration {
        dur(self.shared.config.close_timeout)
    }

    async fn sweep(&self) -> usize {
        self.pending
            .sweep(self.close_timeout(), &self.shared.cache)
            .await
    }

    fn enqueue(&self, channel: ServerSessionChannel) -> bool {
        match &*self.accept_tx.lock_unpoisoned() {
            Some(tx) => tx.send(channel).is_ok(),
            None => false,
        }
    }

    fn spawn_initiation(self: &Arc<Self>, token: SessionToken, binder: Arc<dyn ChannelBinder>) {
        let weak = Arc::downgrade(self);
        let mut initiations = self.initiations.lock_unpoisoned();
        // reap finished handlers
        while initiations.try_join_next().is_some() {}
        initiations.spawn(initiate_session(weak, token, binder));
    }

    fn stop_background_tasks(&self) {
        if let Some(sweeper) = self.sweeper.lock_unpoisoned().take() {
            sweeper.abort();
        }
        self.initiations.lock_unpoisoned().abort_all();
    }

    /// Abort the channels promoted but never accepted
    async fn drop_unclaimed(&self) {
        self.accept_tx.lock_unpoisoned().take();
        let mut rx = self.accept_rx.lock().await;
        while let Ok(channel) = rx.try_recv() {
            self.pending.claimed();
            channel.abort();
        }
    }
}

/// Wait for the first message of a pending session and turn the session
/// into an active channel
async fn initiate_session(weak: Weak<Listener>, token: SessionToken, binder: Arc<dyn ChannelBinder>) {
    let session = token.context_id();
    let Err(e) = promote_on_first_message(&weak, token, binder.clone()).await else {
        return;
    };
    match e {
        SessionError::NotPending(_) => debug!("session {session} expired before its first message"),
        _ => warn!("initiating session {session} failed: {e}"),
    }
    binder.abort();
    if let Some(listener) = weak.upgrade() {
        listener.pending.remove(session);
        if !matches!(e, SessionError::AlreadyActive(_)) {
            listener.shared.cache.remove_all_contexts(session);
        }
    }
}

async fn first_message(
    weak: &Weak<Listener>,
    session: ContextId,
    binder: &Arc<dyn ChannelBinder>,
) -> Result<RequestContext> {
    let still_pending = || {
        let listener = weak.upgrade().ok_or(SessionError::Aborted)?;
        match listener.pending.contains(session) {
            true => Ok(()),
            false => Err(SessionError::NotPending(session)),
        }
    };
    loop {
        match binder.try_receive(FIRST_MESSAGE_POLL).await? {
            TryReceive::Received(ctx) => return Ok(ctx),
            TryReceive::TimedOut => still_pending()?,
            TryReceive::Closed => {
                // closed by the sweep, or by the peer
                still_pending()?;
                return Err(SessionError::Communication(
                    "transport closed before the first message".to_owned(),
                ));
            }
        }
    }
}

async fn promote_on_first_message(
    weak: &Weak<Listener>,
    token: SessionToken,
    binder: Arc<dyn ChannelBinder>,
) -> Result<()> {
    let session = token.context_id();
    let ctx = first_message(weak, session, &binder).await?;

    let listener = weak.upgrade().ok_or(SessionError::Aborted)?;
    // The sweep may have claimed the session in the meantime
    if !listener.pending.promote(session) {
        return Err(SessionError::NotPending(session));
    }

    let kind = listener.shared.config.channel_kind;
    let core = Arc::new(ServerSessionCore::new(
        kind,
        listener.shared.clone(),
        token,
        binder,
        listener.protocol_factory.create_protocol(),
        ctx,
    ));
    let channel = ServerSessionChannel::from_core(kind, core.clone());
    if let Err(e) = listener.shared.active.insert(session, channel.clone()) {
        listener.pending.claimed();
        return Err(e);
    }
    if let Err(e) = core.open_accepted() {
        listener.pending.claimed();
        listener.shared.active.remove(session);
        return Err(e);
    }
    if !listener.enqueue(channel) {
        listener.pending.claimed();
        core.abort();
        return Err(SessionError::ListenerClosing);
    }
    info!("session {session} is active");
    Ok(())
}

/// The server side listener: routes token issuance events to sessions and
/// hands out channels once their first message arrived
#[derive(Clone, Debug)]
pub struct ServerSessionSettings {
    inner: Arc<Listener>,
}

impl ServerSessionSettings {
    pub fn new(
        config: ServerSessionConfig,
        protocol_factory: Arc<dyn SecurityProtocolFactory>,
        binder_factory: Arc<dyn ChannelBinderFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SessionError::Config(format!("{e:#}")))?;
        let (accept_tx, accept_rx) = unbounded_channel();
        let pending = PendingSessionRegistry::new(config.maximum_pending_sessions);
        let shared = Arc::new(Shared {
            config,
            clock,
            cache: Arc::new(SessionTokenCache::new()),
            active: Arc::new(ActiveSessionRegistry::new()),
        });
        Ok(Self {
            inner: Arc::new(Listener {
                shared,
                protocol_factory,
                binder_factory,
                pending,
                accepting: AtomicBool::new(true),
                accept_tx: Mutex::new(Some(accept_tx)),
                accept_rx: AsyncMutex::new(accept_rx),
                initiations: Mutex::new(JoinSet::new()),
                sweeper: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &ServerSessionConfig {
        &self.inner.shared.config
    }

    /// Start sweeping pending sessions every inactivity period
    pub fn open(&self) {
        let mut sweeper = self.inner.sweeper.lock_unpoisoned();
        if sweeper.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.shared.config.inactivity_period();
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            // the first tick fires right away
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let Some(listener) = weak.upgrade() else {
                    break;
                };
                listener.sweep().await;
            }
        });
        *sweeper = Some(handle.abort_handle());
        info!(
            "session listener open, sweeping pending sessions every {:?}",
            period
        );
    }

    /// A token was issued to `requestor`; the session stays pending until its
    /// first message arrives
    pub async fn on_token_issued(&self, token: SessionToken, requestor: &str) -> Result<()> {
        let listener = &self.inner;
        let session = token.context_id();
        if !listener.accepting.load(Ordering::Acquire) {
            return Err(SessionError::ListenerClosing);
        }
        if listener.shared.active.get(session).is_some() {
            return Err(SessionError::AlreadyActive(session));
        }

        let binder = listener.binder_factory.create_binder(&token, requestor).await?;
        if let Err(e) = binder.open(dur(listener.shared.config.open_timeout)).await {
            binder.abort();
            return Err(e);
        }
        if let Err(e) = listener.pending.add(session, binder.clone()) {
            warn!("rejecting session {session} from {requestor}: {e}");
            binder.abort();
            return Err(e);
        }
        // stop_accepting_new_work may have drained the registry meanwhile
        if !listener.accepting.load(Ordering::Acquire) {
            listener.pending.remove(session);
            binder.abort();
            return Err(SessionError::ListenerClosing);
        }

        listener.shared.cache.add(token.clone());
        info!("session {session} issued to {requestor}, waiting for its first message");
        listener.spawn_initiation(token, binder);
        Ok(())
    }

    /// The client renewed the key of an active session
    pub fn on_token_renewed(&self, new: SessionToken, old: &SessionToken) -> Result<()> {
        let session = new.context_id();
        let channel = self
            .inner
            .shared
            .active
            .get(session)
            .ok_or(SessionError::SessionNotFound(session))?;
        channel.renew_session_token(new, &old.id())
    }

    /// The next session that received its first message; `None` once the
    /// listener is closed
    pub async fn accept_channel(&self, timeout: Duration) -> Result<Option<ServerSessionChannel>> {
        let accept = async {
            let mut rx = self.inner.accept_rx.lock().await;
            rx.recv().await
        };
        match tokio::time::timeout(timeout, accept).await {
            Err(_) => Err(SessionError::timeout("accepting a session", timeout)),
            Ok(None) => Ok(None),
            Ok(Some(channel)) => {
                self.inner.pending.claimed();
                Ok(Some(channel))
            }
        }
    }

    /// Close pending sessions that stayed idle for a whole inactivity period.
    ///
    /// Runs periodically once the listener is open.
    pub async fn sweep_pending_sessions(&self) -> usize {
        self.inner.sweep().await
    }

    pub fn active_session(&self, session: ContextId) -> Option<ServerSessionChannel> {
        self.inner.shared.active.get(session)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.shared.active.len()
    }

    /// Refuse new sessions; established ones are unaffected
    pub fn stop_accepting_new_work(&self) {
        if self.inner.accepting.swap(false, Ordering::AcqRel) {
            info!("session listener stopped accepting new sessions");
        }
    }

    /// Stop accepting and close every pending session. Accepted channels
    /// belong to the application and stay open.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        self.stop_accepting_new_work();
        self.inner.stop_background_tasks();
        let listener = &self.inner;
        let pending = listener.pending.drain();
        let res = crate::with_timeout("closing the session listener", timeout, async {
            for (session, binder) in pending {
                listener.shared.cache.remove_all_contexts(session);
                if let Err(e) = binder.close(timeout).await {
                    warn!("closing pending session {session} failed: {e}");
                    binder.abort();
                }
            }
            Ok(())
        })
        .await;
        listener.drop_unclaimed().await;
        info!("session listener closed");
        res
    }

    pub async fn abort(&self) {
        self.stop_accepting_new_work();
        self.inner.stop_background_tasks();
        for (session, binder) in self.inner.pending.drain() {
            self.inner.shared.cache.remove_all_contexts(session);
            binder.abort();
        }
        self.inner.drop_unclaimed().await;
        debug!("session listener aborted");
    }
}
