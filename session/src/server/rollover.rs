//! Server side key rollover.
//!
//! The server learns about renewed keys before the client starts using them.
//! Renewed keys wait in a list of future tokens; the first message protected
//! with one of them promotes it to the current token. The key it replaces is
//! still accepted for the rollover interval.

use std::mem;

use log::info;

use secure_session_util::time::{has_happened, Timing};

use crate::config::ServerSessionConfig;
use crate::token::{KeyIdentifier, SessionToken};
use crate::{Result, SessionError};

#[derive(Clone, Copy, Debug)]
pub struct RolloverPolicy {
    pub maximum_key_renewal_interval: Timing,
    pub key_rollover_interval: Timing,
    pub maximum_pending_keys: usize,
    pub can_renew_session: bool,
}

impl From<&ServerSessionConfig> for RolloverPolicy {
    fn from(cfg: &ServerSessionConfig) -> Self {
        Self {
            maximum_key_renewal_interval: cfg.maximum_key_renewal_interval,
            key_rollover_interval: cfg.key_rollover_interval,
            maximum_pending_keys: cfg.maximum_pending_keys_per_session,
            can_renew_session: cfg.can_renew_session,
        }
    }
}

impl RolloverPolicy {
    pub fn is_expired(&self, token: &SessionToken, now: Timing) -> bool {
        token.is_expired(now, 100, self.maximum_key_renewal_interval)
    }
}

#[derive(Debug, PartialEq)]
pub struct Promotion {
    /// The former current key, to be evicted at `retire_at`
    pub retired: KeyIdentifier,
    pub retire_at: Timing,
    /// Future keys issued before the promoted one; they will never be used
    pub discarded: Vec<KeyIdentifier>,
}

#[derive(Debug, PartialEq)]
pub enum IncomingCheck {
    Accept,
    Promoted(Promotion),
    /// Reject the message and ask the peer to renew its key
    RenewNeeded,
}

#[derive(Debug)]
pub struct ServerTokenState {
    current: SessionToken,
    future: Vec<SessionToken>,
    /// Superseded keys and the time until which they are accepted
    retired: Vec<(KeyIdentifier, Timing)>,
}

impl ServerTokenState {
    pub fn new(current: SessionToken) -> Self {
        Self {
            current,
            future: Vec::new(),
            retired: Vec::new(),
        }
    }

    pub fn current(&self) -> &SessionToken {
        &self.current
    }

    pub fn future_tokens(&self) -> &[SessionToken] {
        &self.future
    }

    /// Register a renewed key; `proving_old` must be the current one
    pub fn renew(
        &mut self,
        new: SessionToken,
        proving_old: &KeyIdentifier,
        policy: &RolloverPolicy,
    ) -> Result<()> {
        if !self.current.matches(proving_old) {
            return Err(SessionError::TokenNotCurrent);
        }
        if self.future.len() >= policy.maximum_pending_keys {
            return Err(SessionError::TooManyPendingKeys {
                max: policy.maximum_pending_keys,
            });
        }
        info!(
            "session {}: key {} issued, current key is {}",
            new.context_id(),
            new.key_generation(),
            self.current.key_generation()
        );
        self.future.push(new);
        Ok(())
    }

    /// Decide whether a message protected with `incoming` is acceptable,
    /// promoting a future key if this is its first use.
    ///
    /// Close messages are accepted under an expired key so that a session can
    /// always be shut down.
    pub fn check_incoming(
        &mut self,
        incoming: &SessionToken,
        is_close: bool,
        now: Timing,
        policy: &RolloverPolicy,
    ) -> Result<IncomingCheck> {
        if !is_close && policy.is_expired(incoming, now) {
            return match policy.can_renew_session {
                true => Ok(IncomingCheck::RenewNeeded),
                false => Err(SessionError::SessionKeyExpired(format!(
                    "key {} expired and the session may not be renewed",
                    incoming.id()
                ))),
            };
        }

        let id = incoming.id();
        if self.current.matches(&id) {
            return Ok(IncomingCheck::Accept);
        }

        if let Some(pos) = self.future.iter().position(|t| t.matches(&id)) {
            let promoted = self.future.remove(pos);
            let discarded = self.future.drain(..pos).map(|t| t.id()).collect();
            let retired = mem::replace(&mut self.current, promoted).id();
            let retire_at = now + policy.key_rollover_interval;
            self.retired.push((retired, retire_at));
            info!(
                "session {}: key {} in use, key {} retires at {retire_at}",
                id.context_id, id.key_generation, retired.key_generation
            );
            return Ok(IncomingCheck::Promoted(Promotion {
                retired,
                retire_at,
                discarded,
            }));
        }

        self.retired.retain(|(_, at)| !has_happened(*at, now));
        if self.retired.iter().any(|(key, _)| *key == id) {
            return Ok(IncomingCheck::Accept);
        }
        Ok(IncomingCheck::RenewNeeded)
    }

    /// The current key must not be stale when protecting an outgoing message
    pub fn check_outgoing(&self, now: Timing, policy: &RolloverPolicy) -> Result<()> {
        match policy.is_expired(&self.current, now) {
            true => Err(SessionError::SessionKeyExpired(format!(
                "the session key {} is stale",
                self.current.id()
            ))),
            false => Ok(()),
        }
    }
}
