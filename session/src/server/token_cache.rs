//! Tokens the server currently trusts, per session.
//!
//! Entries can be given a caching deadline; a superseded key stays usable
//! until its deadline passes and is then dropped on the next lookup.

use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;

use secure_session_util::sync::MutexExt;
use secure_session_util::time::{has_happened, Timing};

use crate::token::{ContextId, KeyIdentifier, SessionToken};

#[derive(Debug)]
struct Entry {
    token: SessionToken,
    expires_at: Option<Timing>,
}

#[derive(Debug, Default)]
pub struct SessionTokenCache {
    sessions: Mutex<HashMap<ContextId, Vec<Entry>>>,
}

impl SessionTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, token: SessionToken) {
        let mut sessions = self.sessions.lock_unpoisoned();
        let entries = sessions.entry(token.context_id()).or_default();
        entries.retain(|e| !e.token.matches(&token.id()));
        entries.push(Entry {
            token,
            expires_at: None,
        });
    }

    /// Keep `key` only until `expires_at`
    pub fn update_caching_time(&self, key: &KeyIdentifier, expires_at: Timing) {
        let mut sessions = self.sessions.lock_unpoisoned();
        if let Some(entry) = sessions
            .get_mut(&key.context_id)
            .and_then(|entries| entries.iter_mut().find(|e| e.token.matches(key)))
        {
            entry.expires_at = Some(expires_at);
        }
    }

    pub fn remove_context(&self, key: &KeyIdentifier) {
        let mut sessions = self.sessions.lock_unpoisoned();
        if let Some(entries) = sessions.get_mut(&key.context_id) {
            entries.retain(|e| !e.token.matches(key));
            if entries.is_empty() {
                sessions.remove(&key.context_id);
            }
        }
    }

    pub fn remove_all_contexts(&self, session: ContextId) {
        if self.sessions.lock_unpoisoned().remove(&session).is_some() {
            debug!("dropped all cached tokens of session {session}");
        }
    }

    /// Tokens of `session` that may still be used at `now`
    pub fn live_tokens(&self, session: ContextId, now: Timing) -> Vec<SessionToken> {
        let mut sessions = self.sessions.lock_unpoisoned();
        let Some(entries) = sessions.get_mut(&session) else {
            return Vec::new();
        };
        entries.retain(|e| match e.expires_at {
            Some(at) => !has_happened(at, now),
            None => true,
        });
        entries.iter().map(|e| e.token.clone()).collect()
    }

    pub fn contains_session(&self, session: ContextId) -> bool {
        self.sessions.lock_unpoisoned().contains_key(&session)
    }
}
