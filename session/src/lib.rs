//! Secure conversation sessions.
//!
//! A session layers a long-lived security context on top of a message
//! [binder::ChannelBinder]. Every message is protected under the current
//! [token::SessionToken] by an external [protocol::SecurityProtocol]; keys are
//! renewed while traffic keeps flowing and sessions end with a cooperative
//! close/close-response handshake.
//!
//! The client side lives in [client], the server side (including the pending
//! and active session registries) in [server].

pub mod binder;
pub mod channel;
pub mod cli;
pub mod client;
pub mod close;
pub mod cmd;
pub mod config;
pub mod msgs;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod state;
pub mod testutils;
pub mod token;
pub mod wait;

use token::ContextId;

/// Errors produced by the session layer
///
/// Errors are [Clone] because a faulted channel reports its fault cause to
/// every subsequent call.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("maximum number of pending sessions ({max}) reached")]
    CapacityExceeded { max: usize },
    #[error("session {0} is already pending")]
    AlreadyPending(ContextId),
    #[error("session {0} is not pending")]
    NotPending(ContextId),
    #[error("session {0} is already active")]
    AlreadyActive(ContextId),
    #[error("session key expired: {0}")]
    SessionKeyExpired(String),
    #[error("session was aborted by the peer: {0}")]
    SessionAborted(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("message security check failed: {0}")]
    MessageSecurity(String),
    #[error("message security verification failed: {0}")]
    VerificationFailed(String),
    #[error("security fault received from peer: {0}")]
    SecurityFault(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("communication failure: {0}")]
    Communication(String),
    #[error("too many pending keys for one session (maximum is {max})")]
    TooManyPendingKeys { max: usize },
    #[error("renewed token does not prove possession of the current session token")]
    TokenNotCurrent,
    #[error("no active session {0}")]
    SessionNotFound(ContextId),
    #[error("listener is no longer accepting new sessions")]
    ListenerClosing,
    #[error("invalid session token: {0}")]
    InvalidToken(String),
    #[error("close message carries no close target")]
    NoCloseTarget,
    #[error("close target {found} does not belong to session {expected}")]
    BadCloseTarget {
        expected: ContextId,
        found: ContextId,
    },
    #[error("close response did not confirm that the session token was closed")]
    SessionTokenNotClosed,
    #[error("output session is already closed")]
    OutputClosed,
    #[error("channel is {0}")]
    InvalidState(String),
    #[error("channel was aborted")]
    Aborted,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SessionError {
    /// Failures of the underlying transport; these propagate unchanged and
    /// never fault a channel
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Communication(_) | Self::Timeout(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether this error, observed at a channel boundary, should move the
    /// channel to the faulted state
    pub fn faults_channel(&self) -> bool {
        !matches!(
            self,
            Self::Communication(_)
                | Self::Timeout(_)
                | Self::Aborted
                | Self::InvalidState(_)
                | Self::OutputClosed
        )
    }

    pub(crate) fn timeout(what: &str, timeout: std::time::Duration) -> Self {
        Self::Timeout(format!("{what} did not complete within {timeout:?}"))
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;

/// Await `fut`, failing with [SessionError::Timeout] once `timeout` elapses
pub(crate) async fn with_timeout<T, F>(what: &str, timeout: std::time::Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(SessionError::timeout(what, timeout)),
    }
}
