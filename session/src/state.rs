//! Channel lifecycle: `Created → Opening → Opened → Closing → Closed`, with
//! `Faulted` reachable from every state but `Closed`.

use std::fmt;
use std::sync::Mutex;

use secure_session_util::sync::MutexExt;

use crate::{Result, SessionError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommunicationState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl fmt::Display for CommunicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Opening => "opening",
            Self::Opened => "opened",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Inner {
    state: CommunicationState,
    fault: Option<SessionError>,
}

#[derive(Debug)]
pub struct Lifecycle(Mutex<Inner>);

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(CommunicationState::Created)
    }
}

impl Lifecycle {
    pub fn new(state: CommunicationState) -> Self {
        Self(Mutex::new(Inner { state, fault: None }))
    }

    pub fn state(&self) -> CommunicationState {
        self.0.lock_unpoisoned().state
    }

    pub fn fault_cause(&self) -> Option<SessionError> {
        self.0.lock_unpoisoned().fault.clone()
    }

    fn unusable(inner: &Inner) -> SessionError {
        match (&inner.state, &inner.fault) {
            (CommunicationState::Faulted, Some(err)) => err.clone(),
            (CommunicationState::Closed, _) => SessionError::Aborted,
            (state, _) => SessionError::InvalidState(state.to_string()),
        }
    }

    pub fn begin_open(&self) -> Result<()> {
        let mut inner = self.0.lock_unpoisoned();
        match inner.state {
            CommunicationState::Created => {
                inner.state = CommunicationState::Opening;
                Ok(())
            }
            _ => Err(Self::unusable(&inner)),
        }
    }

    /// Fails if the channel was aborted or faulted while opening
    pub fn opened(&self) -> Result<()> {
        let mut inner = self.0.lock_unpoisoned();
        match inner.state {
            CommunicationState::Opening | CommunicationState::Created => {
                inner.state = CommunicationState::Opened;
                Ok(())
            }
            _ => Err(Self::unusable(&inner)),
        }
    }

    /// Returns `false` if the channel is already closed, in which case there
    /// is nothing left to do
    pub fn begin_close(&self) -> Result<bool> {
        let mut inner = self.0.lock_unpoisoned();
        match inner.state {
            CommunicationState::Opened => {
                inner.state = CommunicationState::Closing;
                Ok(true)
            }
            CommunicationState::Closed => Ok(false),
            _ => Err(Self::unusable(&inner)),
        }
    }

    pub fn closed(&self) {
        let mut inner = self.0.lock_unpoisoned();
        if inner.state != CommunicationState::Faulted {
            inner.state = CommunicationState::Closed;
        }
    }

    /// Returns whether this call moved the channel to `Faulted`
    pub fn fault(&self, err: SessionError) -> bool {
        let mut inner = self.0.lock_unpoisoned();
        match inner.state {
            CommunicationState::Closed | CommunicationState::Faulted => false,
            _ => {
                inner.state = CommunicationState::Faulted;
                inner.fault = Some(err);
                true
            }
        }
    }

    /// Returns whether this call moved the channel to `Closed`
    pub fn abort(&self) -> bool {
        let mut inner = self.0.lock_unpoisoned();
        match inner.state {
            CommunicationState::Closed => false,
            _ => {
                inner.state = CommunicationState::Closed;
                true
            }
        }
    }

    /// Application traffic is allowed while opened and, for receiving the
    /// peer's side of the close handshake, while closing
    pub fn ensure_usable(&self, allow_closing: bool) -> Result<()> {
        let inner = self.0.lock_unpoisoned();
        match inner.state {
            CommunicationState::Opened => Ok(()),
            CommunicationState::Closing if allow_closing => Ok(()),
            _ => Err(Self::unusable(&inner)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state(),
            CommunicationState::Closed | CommunicationState::Faulted
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regular_lifecycle() {
        let lc = Lifecycle::default();
        assert!(lc.ensure_usable(false).is_err());
        lc.begin_open().unwrap();
        assert!(lc.begin_open().is_err());
        lc.opened().unwrap();
        lc.ensure_usable(false).unwrap();
        assert!(lc.begin_close().unwrap());
        assert!(lc.ensure_usable(false).is_err());
        lc.ensure_usable(true).unwrap();
        lc.closed();
        assert_eq!(lc.state(), CommunicationState::Closed);
        assert!(!lc.begin_close().unwrap());
    }

    #[test]
    fn fault_is_sticky_and_reported() {
        let lc = Lifecycle::new(CommunicationState::Opened);
        assert!(lc.fault(SessionError::ProtocolViolation("boom".into())));
        assert!(!lc.fault(SessionError::Aborted));
        assert_eq!(
            lc.ensure_usable(true),
            Err(SessionError::ProtocolViolation("boom".into()))
        );
        lc.closed();
        assert_eq!(lc.state(), CommunicationState::Faulted);
    }

    #[test]
    fn abort_while_opening_fails_the_open() {
        let lc = Lifecycle::default();
        lc.begin_open().unwrap();
        assert!(lc.abort());
        assert_eq!(lc.opened(), Err(SessionError::Aborted));
    }
}
