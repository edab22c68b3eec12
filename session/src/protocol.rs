//! Per-message protection. Signing, encryption and their verification are
//! performed by a [SecurityProtocol]; channels only decide which tokens to
//! use and how to react to failures.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::msgs::{Message, MessageId};
use crate::token::{KeyIdentifier, SessionToken};
use crate::SessionError;

/// State linking a secured request to its reply
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Correlation {
    pub request_id: Option<MessageId>,
}

#[derive(Debug)]
pub struct Verified {
    /// The message with its security header stripped
    pub message: Message,
    /// The key the message was protected with
    pub key: KeyIdentifier,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtectionError {
    /// The message could not even be parsed
    #[error("malformed message: {0}")]
    Malformed(String),
    /// The message names a key that is not among the trusted tokens
    #[error("no trusted token for key {0}")]
    UnknownKey(KeyIdentifier),
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("message protection timed out: {0}")]
    Timeout(String),
}

impl From<ProtectionError> for SessionError {
    /// Only parse failures become [SessionError::VerificationFailed]; genuine
    /// rejections stay security errors
    fn from(err: ProtectionError) -> Self {
        match err {
            ProtectionError::Malformed(_) => SessionError::VerificationFailed(err.to_string()),
            ProtectionError::Timeout(what) => SessionError::Timeout(what),
            ProtectionError::UnknownKey(_) | ProtectionError::Rejected(_) => {
                SessionError::MessageSecurity(err.to_string())
            }
        }
    }
}

#[async_trait]
pub trait SecurityProtocol: Send + Sync + Debug {
    /// Protect `message` under `token`
    async fn secure_outgoing(
        &self,
        message: Message,
        token: &SessionToken,
        timeout: Duration,
    ) -> Result<(Message, Correlation), ProtectionError>;

    /// Check that `message` is protected under one of the `trusted` tokens and,
    /// given a `correlation`, that it answers the corresponding request
    async fn verify_incoming(
        &self,
        message: Message,
        trusted: &[SessionToken],
        timeout: Duration,
        correlation: Option<Correlation>,
    ) -> Result<Verified, ProtectionError>;
}

/// Shared by all channels created from one settings object
pub trait SecurityProtocolFactory: Send + Sync + Debug {
    fn create_protocol(&self) -> Arc<dyn SecurityProtocol>;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::token::{ContextId, KeyGeneration};

    #[test]
    fn only_parse_errors_are_wrapped() {
        let malformed: SessionError = ProtectionError::Malformed("truncated".into()).into();
        assert!(matches!(malformed, SessionError::VerificationFailed(_)));

        let key = KeyIdentifier {
            context_id: ContextId(1),
            key_generation: KeyGeneration(3),
        };
        let unknown: SessionError = ProtectionError::UnknownKey(key).into();
        assert!(matches!(unknown, SessionError::MessageSecurity(_)));

        let rejected: SessionError = ProtectionError::Rejected("bad tag".into()).into();
        assert!(matches!(rejected, SessionError::MessageSecurity(_)));

        let timeout: SessionError = ProtectionError::Timeout("verify".into()).into();
        assert!(timeout.is_timeout());
    }
}
