use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;

use secure_session_util::sync::MutexExt;

use crate::server::ServerSessionChannel;
use crate::token::ContextId;
use crate::{Result, SessionError};

/// Sessions that processed their first message, by session id.
///
/// Channels remove themselves once they are closed, aborted or faulted.
#[derive(Debug, Default)]
pub struct ActiveSessionRegistry {
    sessions: Mutex<HashMap<ContextId, ServerSessionChannel>>,
}

impl ActiveSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: ContextId, channel: ServerSessionChannel) -> Result<()> {
        let mut sessions = self.sessions.lock_unpoisoned();
        if sessions.contains_key(&session) {
            return Err(SessionError::AlreadyActive(session));
        }
        sessions.insert(session, channel);
        debug!("session {session} active ({} in total)", sessions.len());
        Ok(())
    }

    pub fn get(&self, session: ContextId) -> Option<ServerSessionChannel> {
        self.sessions.lock_unpoisoned().get(&session).cloned()
    }

    pub fn remove(&self, session: ContextId) -> Option<ServerSessionChannel> {
        self.sessions.lock_unpoisoned().remove(&session)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock_unpoisoned().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&self) -> Vec<ServerSessionChannel> {
        self.sessions
            .lock_unpoisoned()
            .drain()
            .map(|(_, channel)| channel)
            .collect()
    }
}
