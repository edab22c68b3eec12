//! Session tokens: the key material of one session key generation together
//! with its validity window.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use secure_session_util::time::{has_happened, Timing};

use crate::{Result, SessionError};

/// Identifies a session for its whole lifetime
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx:{:016x}", self.0)
    }
}

/// Distinguishes successive keys of one session; issued in increasing order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyGeneration(pub u64);

impl fmt::Display for KeyGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Reference to one key generation of one session, as carried in message
/// security headers and close targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyIdentifier {
    pub context_id: ContextId,
    pub key_generation: KeyGeneration,
}

impl fmt::Display for KeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.context_id, self.key_generation)
    }
}

/// A session key with its validity window.
///
/// Tokens are never mutated; renewal produces a new token with the same
/// [ContextId] and a later [KeyGeneration].
#[derive(Clone)]
pub struct SessionToken {
    context_id: ContextId,
    key_generation: KeyGeneration,
    valid_from: Timing,
    valid_to: Timing,
    key: Zeroizing<Vec<u8>>,
}

impl SessionToken {
    pub fn new(
        context_id: ContextId,
        key_generation: KeyGeneration,
        valid_from: Timing,
        valid_to: Timing,
        key: Vec<u8>,
    ) -> Result<Self> {
        if !(valid_from <= valid_to) {
            return Err(SessionError::InvalidToken(format!(
                "token {context_id}/{key_generation} is valid from {valid_from} but only until {valid_to}"
            )));
        }
        Ok(Self {
            context_id,
            key_generation,
            valid_from,
            valid_to,
            key: Zeroizing::new(key),
        })
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn key_generation(&self) -> KeyGeneration {
        self.key_generation
    }

    pub fn id(&self) -> KeyIdentifier {
        KeyIdentifier {
            context_id: self.context_id,
            key_generation: self.key_generation,
        }
    }

    pub fn valid_from(&self) -> Timing {
        self.valid_from
    }

    pub fn valid_to(&self) -> Timing {
        self.valid_to
    }

    /// Key material; only the security protocol looks at this
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Point in time from which the key must no longer be used:
    /// `threshold_percent` of the validity window, but no later than
    /// `max_renewal_interval` after `valid_from`.
    pub fn key_expiration_time(&self, threshold_percent: u8, max_renewal_interval: Timing) -> Timing {
        let lifetime = self.valid_to - self.valid_from;
        let by_threshold = lifetime * (threshold_percent as Timing) / 100.0;
        self.valid_from + by_threshold.min(max_renewal_interval)
    }

    pub fn is_expired(&self, now: Timing, threshold_percent: u8, max_renewal_interval: Timing) -> bool {
        has_happened(
            self.key_expiration_time(threshold_percent, max_renewal_interval),
            now,
        )
    }

    pub fn matches(&self, id: &KeyIdentifier) -> bool {
        self.id() == *id
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("id", &self.id())
            .field("valid_from", &self.valid_from)
            .field("valid_to", &self.valid_to)
            .finish_non_exhaustive()
    }
}
