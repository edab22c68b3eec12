//! Client side key renewal and rollover.
//!
//! The scheduler decides when the current key is due for renewal, performs the
//! renewal through the [SessionTokenProvider] and makes sure that concurrent
//! callers share a single in-flight renewal.

use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};

use secure_session_util::sync::MutexExt;
use secure_session_util::time::{has_happened, Clock, Deadline, Timing};

use crate::close::CloseHandshake;
use crate::config::ClientSessionConfig;
use crate::msgs::Message;
use crate::provider::SessionTokenProvider;
use crate::token::{ContextId, SessionToken};
use crate::wait::WaitObject;
use crate::{with_timeout, Result, SessionError};

/// Keys of one client channel
#[derive(Debug)]
pub struct ClientKeys {
    pub current: SessionToken,
    /// Superseded key, still trusted for incoming messages until
    /// `key_rollover_time`
    pub previous: Option<SessionToken>,
    pub key_renewal_time: Timing,
    pub key_rollover_time: Timing,
}

/// Everything a client channel guards with its one lock
#[derive(Debug, Default)]
pub struct ClientSessionState {
    pub keys: Option<ClientKeys>,
    pub renewal_ongoing: bool,
    pub close: CloseHandshake,
    /// The peer's close, answered by our close-response
    pub peer_close: Option<Message>,
}

/// Renewal timing policy derived from [ClientSessionConfig]
#[derive(Clone, Copy, Debug)]
pub struct RenewalPolicy {
    pub key_renewal_interval: Timing,
    pub key_rollover_interval: Timing,
    pub renewal_threshold_percent: u8,
    pub can_renew_session: bool,
}

impl From<&ClientSessionConfig> for RenewalPolicy {
    fn from(cfg: &ClientSessionConfig) -> Self {
        Self {
            key_renewal_interval: cfg.key_renewal_interval,
            key_rollover_interval: cfg.key_rollover_interval,
            renewal_threshold_percent: cfg.renewal_threshold_percent,
            can_renew_session: cfg.can_renew_session,
        }
    }
}

impl RenewalPolicy {
    pub fn key_renewal_time(&self, token: &SessionToken) -> Timing {
        token.key_expiration_time(self.renewal_threshold_percent, self.key_renewal_interval)
    }
}

/// Clears the in-flight flag and wakes the waiters however the renewal ends,
/// including when the renewing future is dropped
struct RenewalGuard<'a> {
    state: &'a Mutex<ClientSessionState>,
    done: &'a WaitObject,
}

impl Drop for RenewalGuard<'_> {
    fn drop(&mut self) {
        // a new renewal may reset the signal as soon as the flag is clear
        let mut state = self.state.lock_unpoisoned();
        state.renewal_ongoing = false;
        self.done.set();
        drop(state);
    }
}

#[derive(Debug)]
pub struct KeyRenewalScheduler {
    policy: RenewalPolicy,
    clock: Arc<dyn Clock>,
    provider: Arc<dyn SessionTokenProvider>,
    state: Arc<Mutex<ClientSessionState>>,
    /// Set whenever no renewal is in flight
    renewal_done: WaitObject,
}

impl KeyRenewalScheduler {
    pub fn new(
        policy: RenewalPolicy,
        clock: Arc<dyn Clock>,
        provider: Arc<dyn SessionTokenProvider>,
        state: Arc<Mutex<ClientSessionState>>,
    ) -> Self {
        Self {
            policy,
            clock,
            provider,
            state,
            renewal_done: WaitObject::new(true),
        }
    }

    /// Install the first token of the session
    pub fn install(&self, token: SessionToken) {
        let keys = ClientKeys {
            key_renewal_time: self.policy.key_renewal_time(&token),
            key_rollover_time: self.clock.now(),
            previous: None,
            current: token,
        };
        debug!(
            "session {} opened with key {}, renewal due at {}",
            keys.current.context_id(),
            keys.current.key_generation(),
            keys.key_renewal_time
        );
        self.state.lock_unpoisoned().keys = Some(keys);
    }

    pub fn session_id(&self) -> Option<ContextId> {
        let state = self.state.lock_unpoisoned();
        state.keys.as_ref().map(|k| k.current.context_id())
    }

    fn needs_renewal_locked(&self, state: &ClientSessionState) -> bool {
        match &state.keys {
            Some(keys) => has_happened(keys.key_renewal_time, self.clock.now()),
            None => false,
        }
    }

    pub fn needs_renewal(&self) -> bool {
        self.needs_renewal_locked(&self.state.lock_unpoisoned())
    }

    /// Make the next outgoing message renew the key first
    pub fn force_renewal(&self) {
        let now = self.clock.now();
        if let Some(keys) = self.state.lock_unpoisoned().keys.as_mut() {
            keys.key_renewal_time = now;
        }
    }

    pub fn key_renewal_time(&self) -> Option<Timing> {
        let state = self.state.lock_unpoisoned();
        state.keys.as_ref().map(|k| k.key_renewal_time)
    }

    /// Drop the previous key once its rollover time has passed
    pub fn roll_over_if_needed(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock_unpoisoned();
        if let Some(keys) = state.keys.as_mut() {
            if keys.previous.is_some() && has_happened(keys.key_rollover_time, now) {
                if let Some(prev) = keys.previous.take() {
                    info!(
                        "session {}: previous key {} discarded",
                        prev.context_id(),
                        prev.key_generation()
                    );
                }
            }
        }
    }

    /// Tokens incoming messages may be protected with: the current one and,
    /// during rollover, the previous one
    pub fn incoming_tokens(&self) -> Vec<SessionToken> {
        self.roll_over_if_needed();
        let state = self.state.lock_unpoisoned();
        match &state.keys {
            Some(keys) => keys
                .previous
                .iter()
                .cloned()
                .chain(std::iter::once(keys.current.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// The token to protect an outgoing message with, renewing first if due
    pub async fn outgoing_token(&self, timeout: Duration) -> Result<SessionToken> {
        self.renew_if_needed(timeout).await?;
        let state = self.state.lock_unpoisoned();
        if self.needs_renewal_locked(&state) {
            return Err(SessionError::SessionKeyExpired(
                "the renewed session key is already due for renewal".to_owned(),
            ));
        }
        state
            .keys
            .as_ref()
            .map(|k| k.current.clone())
            .ok_or_else(|| SessionError::InvalidState("not opened".to_owned()))
    }

    pub async fn renew_if_needed(&self, timeout: Duration) -> Result<()> {
        self.renew_inner(timeout, false).await
    }

    /// Renew the session key, or join a renewal that is already running
    pub async fn renew(&self, timeout: Duration) -> Result<()> {
        self.renew_inner(timeout, true).await
    }

    async fn renew_inner(&self, timeout: Duration, force: bool) -> Result<()> {
        let deadline = Deadline::after(timeout);

        enum Role {
            Renewer(SessionToken),
            Waiter,
        }

        let role = {
            let mut state = self.state.lock_unpoisoned();
            if state.renewal_ongoing {
                Role::Waiter
            } else if !force && !self.needs_renewal_locked(&state) {
                return Ok(());
            } else if !self.policy.can_renew_session {
                return Err(SessionError::SessionKeyExpired(
                    "session key renewal is disabled for this session".to_owned(),
                ));
            } else {
                let current = state
                    .keys
                    .as_ref()
                    .map(|k| k.current.clone())
                    .ok_or_else(|| SessionError::InvalidState("not opened".to_owned()))?;
                state.renewal_ongoing = true;
                self.renewal_done.reset();
                Role::Renewer(current)
            }
        };

        match role {
            Role::Renewer(current) => {
                let _guard = RenewalGuard {
                    state: &self.state,
                    done: &self.renewal_done,
                };
                let remaining = deadline.remaining();
                let renewed = with_timeout(
                    "session key renewal",
                    remaining,
                    self.provider.renew_token(remaining, &current),
                );
                let token = tokio::select! {
                    token = renewed => token?,
                    err = self.renewal_done.terminated() => return Err(err),
                };
                self.update_session_tokens(token)
            }
            Role::Waiter => {
                let completed = self.renewal_done.wait(deadline.remaining()).await?;
                if !completed {
                    return Err(SessionError::SessionKeyExpired(
                        "timed out waiting for an ongoing session key renewal".to_owned(),
                    ));
                }
                if self.needs_renewal() {
                    return Err(SessionError::SessionKeyExpired(
                        "unable to renew the session key".to_owned(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn update_session_tokens(&self, token: SessionToken) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock_unpoisoned();
        let keys = state
            .keys
            .as_mut()
            .ok_or_else(|| SessionError::InvalidState("not opened".to_owned()))?;
        if token.context_id() != keys.current.context_id() {
            return Err(SessionError::InvalidToken(format!(
                "renewed token belongs to session {} instead of {}",
                token.context_id(),
                keys.current.context_id()
            )));
        }
        let old = mem::replace(&mut keys.current, token);
        keys.key_rollover_time = now + self.policy.key_rollover_interval;
        keys.key_renewal_time = self.policy.key_renewal_time(&keys.current);
        info!(
            "session {}: key renewed from {} to {}, next renewal at {}",
            keys.current.context_id(),
            old.key_generation(),
            keys.current.key_generation(),
            keys.key_renewal_time
        );
        keys.previous = Some(old);
        Ok(())
    }

    /// Wake all renewal waiters
    pub fn abort(&self) {
        self.renewal_done.abort();
    }

    pub fn fault(&self, err: SessionError) {
        self.renewal_done.fault(err);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutils::TestTokenService;
    use secure_session_util::time::ManualClock;

    const T: Timing = 1_000_000.0;

    fn policy(key_renewal_interval: Timing) -> RenewalPolicy {
        RenewalPolicy {
            key_renewal_interval,
            key_rollover_interval: 300.0,
            renewal_threshold_percent: 80,
            can_renew_session: true,
        }
    }

    async fn scheduler(
        policy: RenewalPolicy,
        clock: &ManualClock,
        service: &Arc<TestTokenService>,
    ) -> Arc<KeyRenewalScheduler> {
        let sched = KeyRenewalScheduler::new(
            policy,
            Arc::new(clock.clone()),
            service.clone(),
            Arc::new(Mutex::new(ClientSessionState::default())),
        );
        let token = service.get_token(Duration::from_secs(1)).await.unwrap();
        sched.install(token);
        Arc::new(sched)
    }

    #[tokio::test]
    async fn renewal_time_is_the_earlier_bound() {
        let clock = ManualClock::new(T);
        let service = Arc::new(TestTokenService::new(clock.clone(), 100.0 * 60.0));
        let sched = scheduler(policy(10.0 * 60.0), &clock, &service).await;

        assert_eq!(sched.key_renewal_time(), Some(T + 10.0 * 60.0));
        clock.advance(10.0 * 60.0 - 1.0);
        assert!(!sched.needs_renewal());
        clock.advance(1.0);
        assert!(sched.needs_renewal());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_renewal() -> anyhow::Result<()> {
        let clock = ManualClock::new(T);
        let service = Arc::new(
            TestTokenService::new(clock.clone(), 6000.0)
                .with_renew_delay(Duration::from_millis(50)),
        );
        let sched = scheduler(policy(600.0), &clock, &service).await;
        clock.advance(600.0);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let sched = sched.clone();
                tokio::spawn(async move { sched.outgoing_token(Duration::from_secs(5)).await })
            })
            .collect();

        let mut generations = Vec::new();
        for t in tasks {
            generations.push(t.await??.key_generation());
        }
        assert_eq!(service.renew_calls(), 1);
        assert!(generations.iter().all(|g| g.0 == 2));
        Ok(())
    }

    #[tokio::test]
    async fn previous_key_is_kept_for_the_rollover_interval() {
        let clock = ManualClock::new(T);
        let service = Arc::new(TestTokenService::new(clock.clone(), 6000.0));
        let sched = scheduler(policy(600.0), &clock, &service).await;

        sched.renew(Duration::from_secs(1)).await.unwrap();
        let gens: Vec<_> = sched.incoming_tokens().iter().map(|t| t.key_generation().0).collect();
        assert_eq!(gens, vec![1, 2]);

        clock.advance(299.0);
        assert_eq!(sched.incoming_tokens().len(), 2);
        clock.advance(1.0);
        let gens: Vec<_> = sched.incoming_tokens().iter().map(|t| t.key_generation().0).collect();
        assert_eq!(gens, vec![2]);
    }

    #[tokio::test]
    async fn disabled_renewal_fails_with_key_expired() {
        let clock = ManualClock::new(T);
        let service = Arc::new(TestTokenService::new(clock.clone(), 6000.0));
        let mut p = policy(600.0);
        p.can_renew_session = false;
        let sched = scheduler(p, &clock, &service).await;
        clock.advance(600.0);

        let res = sched.outgoing_token(Duration::from_secs(1)).await;
        assert!(matches!(res, Err(SessionError::SessionKeyExpired(_))));
        assert_eq!(service.renew_calls(), 0);
    }

    #[tokio::test]
    async fn waiter_timeout_means_key_expired() {
        let clock = ManualClock::new(T);
        let service = Arc::new(
            TestTokenService::new(clock.clone(), 6000.0)
                .with_renew_delay(Duration::from_millis(300)),
        );
        let sched = scheduler(policy(600.0), &clock, &service).await;
        clock.advance(600.0);

        let renewer = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.renew_if_needed(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waited = sched.renew_if_needed(Duration::from_millis(20)).await;
        assert!(matches!(waited, Err(SessionError::SessionKeyExpired(_))));

        // the renewer is unaffected and still finishes
        renewer.await.unwrap().unwrap();
        assert!(!sched.needs_renewal());
        assert_eq!(service.renew_calls(), 1);
    }

    #[tokio::test]
    async fn failed_renewal_releases_waiters() {
        let clock = ManualClock::new(T);
        let service = Arc::new(
            TestTokenService::new(clock.clone(), 6000.0)
                .with_renew_delay(Duration::from_millis(50)),
        );
        service.fail_renewals(true);
        let sched = scheduler(policy(600.0), &clock, &service).await;
        clock.advance(600.0);

        let renewer = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.renew_if_needed(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waited = sched.renew_if_needed(Duration::from_secs(5)).await;

        assert!(renewer.await.unwrap().is_err());
        assert!(matches!(waited, Err(SessionError::SessionKeyExpired(_))));
        // the in-flight flag was cleared, so a later caller renews again
        service.fail_renewals(false);
        sched.renew_if_needed(Duration::from_secs(5)).await.unwrap();
        assert_eq!(service.renew_calls(), 2);
    }

    #[tokio::test]
    async fn dropped_renewal_hands_over_to_the_next_one() {
        let clock = ManualClock::new(T);
        let service = Arc::new(
            TestTokenService::new(clock.clone(), 6000.0)
                .with_renew_delay(Duration::from_millis(100)),
        );
        let sched = scheduler(policy(600.0), &clock, &service).await;
        clock.advance(600.0);

        let dropped = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.renew(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!sched.renewal_done.is_set());
        dropped.abort();
        assert!(dropped.await.unwrap_err().is_cancelled());
        assert!(sched.renewal_done.is_set());
        assert!(!sched.state.lock_unpoisoned().renewal_ongoing);

        let next = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.renew(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        // waiters of the second renewal block until it is done
        assert!(!sched.renewal_done.is_set());
        assert!(sched.state.lock_unpoisoned().renewal_ongoing);
        sched.renew_if_needed(Duration::from_secs(5)).await.unwrap();
        next.await.unwrap().unwrap();
        assert!(!sched.needs_renewal());
        assert_eq!(service.renew_calls(), 2);
    }

    #[tokio::test]
    async fn abort_releases_renewal_waiters() {
        let clock = ManualClock::new(T);
        let service = Arc::new(
            TestTokenService::new(clock.clone(), 6000.0)
                .with_renew_delay(Duration::from_millis(500)),
        );
        let sched = scheduler(policy(600.0), &clock, &service).await;

        let renewer = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.renew(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waiter = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.renew(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        sched.abort();
        assert_eq!(waiter.await.unwrap(), Err(SessionError::Aborted));
        assert_eq!(renewer.await.unwrap(), Err(SessionError::Aborted));
        assert_eq!(sched.key_renewal_time(), Some(T + 600.0));
    }
}
