//! A resettable event that waiters can block on with a timeout and that
//! releases all of them at once on abort or fault.

use std::time::Duration;

use tokio::sync::watch;

use crate::{Result, SessionError};

#[derive(Clone, Debug)]
enum Signal {
    Unset,
    Set,
    Aborted,
    Faulted(SessionError),
}

impl Signal {
    fn is_final(&self) -> bool {
        matches!(self, Self::Aborted | Self::Faulted(_))
    }
}

#[derive(Debug)]
pub struct WaitObject {
    signal: watch::Sender<Signal>,
}

impl WaitObject {
    pub fn new(set: bool) -> Self {
        let initial = if set { Signal::Set } else { Signal::Unset };
        Self {
            signal: watch::Sender::new(initial),
        }
    }

    pub fn set(&self) {
        self.transition(Signal::Set);
    }

    pub fn reset(&self) {
        self.transition(Signal::Unset);
    }

    /// Wake every current and future waiter with [SessionError::Aborted]
    pub fn abort(&self) {
        self.transition(Signal::Aborted);
    }

    /// Wake every current and future waiter with `err`
    pub fn fault(&self, err: SessionError) {
        self.transition(Signal::Faulted(err));
    }

    pub fn is_set(&self) -> bool {
        matches!(*self.signal.borrow(), Signal::Set)
    }

    fn transition(&self, to: Signal) {
        // Aborted and faulted are terminal
        self.signal.send_if_modified(|current| {
            if current.is_final() {
                return false;
            }
            *current = to;
            true
        });
    }

    /// Wait until the object is set.
    ///
    /// Returns `Ok(false)` when the timeout elapses first.
    pub async fn wait(&self, timeout: Duration) -> Result<bool> {
        let mut rx = self.signal.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            let signal = rx
                .wait_for(|s| !matches!(s, Signal::Unset))
                .await
                .map_err(|_| SessionError::Aborted)?;
            match &*signal {
                Signal::Faulted(err) => Err(err.clone()),
                Signal::Aborted => Err(SessionError::Aborted),
                _ => Ok(()),
            }
        })
        .await;

        match waited {
            Ok(res) => res.map(|()| true),
            Err(_) => Ok(false),
        }
    }

    /// Resolves once the object is aborted or faulted, with the error a
    /// waiter would get
    pub async fn terminated(&self) -> SessionError {
        let mut rx = self.signal.subscribe();
        let Ok(signal) = rx.wait_for(Signal::is_final).await else {
            return SessionError::Aborted;
        };
        match &*signal {
            Signal::Faulted(err) => err.clone(),
            _ => SessionError::Aborted,
        }
    }
}
