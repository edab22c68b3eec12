//! Sessions that were issued a token but have not delivered a message yet.
//!
//! Pending sessions are kept in two generations. Every sweep closes whatever
//! is left in the old generation and turns the young one into the old one, so
//! a pending session lives between one and two sweep periods without any per
//! session timer.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use secure_session_util::sync::MutexExt;

use crate::binder::ChannelBinder;
use crate::server::token_cache::SessionTokenCache;
use crate::token::ContextId;
use crate::{Result, SessionError};

type Generation = HashMap<ContextId, Arc<dyn ChannelBinder>>;

#[derive(Debug, Default)]
struct Generations {
    young: Generation,
    old: Generation,
    /// Promoted sessions waiting in the accept queue
    unclaimed: usize,
}

impl Generations {
    fn count(&self) -> usize {
        self.young.len() + self.old.len() + self.unclaimed
    }
}

#[derive(Debug)]
pub struct PendingSessionRegistry {
    max: usize,
    inner: Mutex<Generations>,
}

impl PendingSessionRegistry {
    pub fn new(maximum_pending_sessions: usize) -> Self {
        Self {
            max: maximum_pending_sessions,
            inner: Mutex::new(Generations::default()),
        }
    }

    pub fn add(&self, session: ContextId, binder: Arc<dyn ChannelBinder>) -> Result<()> {
        let mut inner = self.inner.lock_unpoisoned();
        if inner.young.contains_key(&session) || inner.old.contains_key(&session) {
            return Err(SessionError::AlreadyPending(session));
        }
        if inner.count() + 1 > self.max {
            return Err(SessionError::CapacityExceeded { max: self.max });
        }
        inner.young.insert(session, binder);
        debug!("session {session} pending ({} of {})", inner.count(), self.max);
        Ok(())
    }

    /// Returns `false` if the session is no longer pending, e.g. because the
    /// sweep got to it first
    pub fn remove(&self, session: ContextId) -> bool {
        let mut inner = self.inner.lock_unpoisoned();
        inner.young.remove(&session).is_some() || inner.old.remove(&session).is_some()
    }

    /// Like [Self::remove], but the session keeps counting against the quota
    /// until [Self::claimed] is called
    pub fn promote(&self, session: ContextId) -> bool {
        let mut inner = self.inner.lock_unpoisoned();
        let found = inner.young.remove(&session).is_some() || inner.old.remove(&session).is_some();
        if found {
            inner.unclaimed += 1;
        }
        found
    }

    /// A promoted session was accepted by the application or dropped
    pub fn claimed(&self) {
        let mut inner = self.inner.lock_unpoisoned();
        inner.unclaimed = inner.unclaimed.saturating_sub(1);
    }

    pub fn contains(&self, session: ContextId) -> bool {
        let inner = self.inner.lock_unpoisoned();
        inner.young.contains_key(&session) || inner.old.contains_key(&session)
    }

    pub fn len(&self) -> usize {
        self.inner.lock_unpoisoned().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand out the old generation and make the young one old
    fn rotate(&self) -> Generation {
        let mut inner = self.inner.lock_unpoisoned();
        let young = mem::take(&mut inner.young);
        mem::replace(&mut inner.old, young)
    }

    /// Close the sessions that stayed pending for a whole period.
    ///
    /// Closing is best effort: a binder that fails to close is aborted and
    /// the sweep goes on. Returns the number of sessions reaped.
    pub async fn sweep(&self, timeout: Duration, cache: &SessionTokenCache) -> usize {
        let stale = self.rotate();
        let reaped = stale.len();
        for (session, binder) in stale {
            cache.remove_all_contexts(session);
            if let Err(e) = binder.close(timeout).await {
                warn!("closing stale pending session {session} failed: {e}");
                binder.abort();
            }
        }
        if reaped > 0 {
            info!("closed {reaped} pending sessions that never sent a message");
        }
        reaped
    }

    /// Remove every pending session, e.g. when the listener shuts down
    pub fn drain(&self) -> Vec<(ContextId, Arc<dyn ChannelBinder>)> {
        let mut inner = self.inner.lock_unpoisoned();
        let young = mem::take(&mut inner.young);
        let old = mem::take(&mut inner.old);
        old.into_iter().chain(young).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutils::{loopback_pair, LoopbackBinder};

    fn binder() -> Arc<LoopbackBinder> {
        loopback_pair().1
    }

    #[test]
    fn quota_is_enforced() {
        let reg = PendingSessionRegistry::new(3);
        for i in 0..3 {
            reg.add(ContextId(i), binder()).unwrap();
        }
        assert_eq!(
            reg.add(ContextId(3), binder()),
            Err(SessionError::CapacityExceeded { max: 3 })
        );
        assert!(reg.remove(ContextId(0)));
        reg.add(ContextId(3), binder()).unwrap();
    }

    #[test]
    fn duplicate_session_is_rejected() {
        let reg = PendingSessionRegistry::new(3);
        reg.add(ContextId(1), binder()).unwrap();
        assert_eq!(
            reg.add(ContextId(1), binder()),
            Err(SessionError::AlreadyPending(ContextId(1)))
        );
        assert!(reg.remove(ContextId(1)));
        assert!(!reg.remove(ContextId(1)));
    }

    #[test]
    fn duplicate_is_reported_even_when_full() {
        let reg = PendingSessionRegistry::new(1);
        reg.add(ContextId(1), binder()).unwrap();
        assert_eq!(
            reg.add(ContextId(1), binder()),
            Err(SessionError::AlreadyPending(ContextId(1)))
        );
        assert_eq!(
            reg.add(ContextId(2), binder()),
            Err(SessionError::CapacityExceeded { max: 1 })
        );
    }

    #[test]
    fn unclaimed_sessions_count_against_the_quota() {
        let reg = PendingSessionRegistry::new(1);
        reg.add(ContextId(1), binder()).unwrap();
        assert!(reg.promote(ContextId(1)));
        assert!(!reg.contains(ContextId(1)));
        assert_eq!(reg.len(), 1);
        assert!(reg.add(ContextId(2), binder()).is_err());
        reg.claimed();
        reg.add(ContextId(2), binder()).unwrap();
    }

    #[tokio::test]
    async fn pending_session_is_closed_on_the_second_sweep() {
        let reg = PendingSessionRegistry::new(8);
        let cache = SessionTokenCache::new();
        let b = binder();
        reg.add(ContextId(1), b.clone()).unwrap();

        assert_eq!(reg.sweep(Duration::from_secs(1), &cache).await, 0);
        assert!(reg.contains(ContextId(1)));
        assert_eq!(b.close_count(), 0);

        assert_eq!(reg.sweep(Duration::from_secs(1), &cache).await, 1);
        assert!(!reg.contains(ContextId(1)));
        assert_eq!(b.close_count(), 1);
    }

    #[tokio::test]
    async fn failed_close_does_not_stop_the_sweep() {
        let reg = PendingSessionRegistry::new(8);
        let cache = SessionTokenCache::new();
        let failing = binder();
        failing.set_fail_close(true);
        let fine = binder();
        reg.add(ContextId(1), failing.clone()).unwrap();
        reg.add(ContextId(2), fine.clone()).unwrap();

        reg.sweep(Duration::from_secs(1), &cache).await;
        assert_eq!(reg.sweep(Duration::from_secs(1), &cache).await, 2);
        assert_eq!(failing.abort_count(), 1);
        assert_eq!(fine.close_count(), 1);
        assert!(reg.is_empty());
    }
}
