//! Bookkeeping of the close/close-response handshake shared by client and
//! server channels.
//!
//! What a channel sends when it closes, and what it expects to receive, is
//! decided by two facts: whether it already sent a close and whether it
//! already received one.
//!
//! | sent close | received close | on local close                           |
//! |------------|----------------|------------------------------------------|
//! | no         | no             | send close, wait for close-response      |
//! | no         | yes            | send close-response                      |
//! | yes        | any            | nothing more to send                     |

use log::debug;

use crate::msgs::{Body, Message};
use crate::token::ContextId;
use crate::{Result, SessionError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CloseHandshake {
    pub sent_close: bool,
    pub received_close: bool,
    pub input_closed: bool,
    pub output_closed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseStep {
    SendClose,
    SendCloseResponse,
    Nothing,
}

impl CloseHandshake {
    /// Close the output side of the session, returning what needs to be sent
    pub fn close_output(&mut self) -> CloseStep {
        if self.output_closed {
            return CloseStep::Nothing;
        }
        self.output_closed = true;
        if self.received_close {
            CloseStep::SendCloseResponse
        } else {
            self.sent_close = true;
            CloseStep::SendClose
        }
    }

    /// Record a close from the peer.
    ///
    /// Returns `false` for a repeated close, which is ignored. Channels that
    /// never expect a close from their peer reject it as a protocol violation.
    pub fn on_close_received(&mut self, expect_close: bool) -> Result<bool> {
        if !expect_close {
            return Err(SessionError::ProtocolViolation(
                "received an unexpected close message".to_owned(),
            ));
        }
        if self.input_closed {
            debug!("ignoring close message, input session is already closed");
            return Ok(false);
        }
        self.received_close = true;
        self.input_closed = true;
        Ok(true)
    }

    /// Record a close-response from the peer; only valid after sending a close
    pub fn on_close_response_received(&mut self) -> Result<bool> {
        if !self.sent_close {
            return Err(SessionError::ProtocolViolation(
                "received a close response without having sent a close".to_owned(),
            ));
        }
        if self.input_closed {
            return Ok(false);
        }
        self.input_closed = true;
        Ok(true)
    }

    pub fn ensure_output_open(&self) -> Result<()> {
        match self.output_closed {
            true => Err(SessionError::OutputClosed),
            false => Ok(()),
        }
    }
}

/// A close must name a token of the session it is received on
pub fn check_close_target(close: &Message, session: ContextId) -> Result<()> {
    let target = match &close.body {
        Body::Close(req) => req.close_target,
        _ => None,
    };
    match target {
        None => Err(SessionError::NoCloseTarget),
        Some(key) if key.context_id != session => Err(SessionError::BadCloseTarget {
            expected: session,
            found: key.context_id,
        }),
        Some(_) => Ok(()),
    }
}

/// A close-response must confirm that the token is closed
pub fn check_close_response(response: &Message) -> Result<()> {
    match &response.body {
        Body::CloseResponse(rsp) if rsp.token_closed => Ok(()),
        _ => Err(SessionError::SessionTokenNotClosed),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::token::{KeyGeneration, KeyIdentifier};

    fn key(ctx: u64) -> KeyIdentifier {
        KeyIdentifier {
            context_id: ContextId(ctx),
            key_generation: KeyGeneration(1),
        }
    }

    #[test]
    fn initiator_sends_close_once() {
        let mut hs = CloseHandshake::default();
        assert_eq!(hs.close_output(), CloseStep::SendClose);
        assert!(hs.sent_close && hs.output_closed);
        assert_eq!(hs.close_output(), CloseStep::Nothing);
        assert!(hs.ensure_output_open().is_err());
        assert!(hs.on_close_response_received().unwrap());
        assert!(hs.input_closed);
    }

    #[test]
    fn responder_answers_with_close_response() {
        let mut hs = CloseHandshake::default();
        assert!(hs.on_close_received(true).unwrap());
        assert_eq!(hs.close_output(), CloseStep::SendCloseResponse);
        assert!(!hs.sent_close);
    }

    #[test]
    fn simultaneous_close_needs_no_response() {
        let mut hs = CloseHandshake::default();
        assert_eq!(hs.close_output(), CloseStep::SendClose);
        assert!(hs.on_close_received(true).unwrap());
        assert!(hs.input_closed && hs.output_closed);
        assert_eq!(hs.close_output(), CloseStep::Nothing);
    }

    #[test]
    fn repeated_close_is_ignored() {
        let mut hs = CloseHandshake::default();
        assert!(hs.on_close_received(true).unwrap());
        assert!(!hs.on_close_received(true).unwrap());
    }

    #[test]
    fn unexpected_messages_are_violations() {
        let mut hs = CloseHandshake::default();
        assert!(matches!(
            hs.on_close_response_received(),
            Err(SessionError::ProtocolViolation(_))
        ));
        assert!(matches!(
            hs.on_close_received(false),
            Err(SessionError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn close_target_must_match_session() {
        assert!(check_close_target(&Message::close(key(4), None), ContextId(4)).is_ok());
        assert_eq!(
            check_close_target(&Message::close(key(5), None), ContextId(4)),
            Err(SessionError::BadCloseTarget {
                expected: ContextId(4),
                found: ContextId(5)
            })
        );
        let no_target = Message::application("noop", vec![]);
        assert_eq!(
            check_close_target(&no_target, ContextId(4)),
            Err(SessionError::NoCloseTarget)
        );
    }

    #[test]
    fn close_response_must_confirm() {
        let close = Message::close(key(1), Some("ctx".into()));
        assert!(check_close_response(&Message::close_response(&close, true)).is_ok());
        assert_eq!(
            check_close_response(&Message::close_response(&close, false)),
            Err(SessionError::SessionTokenNotClosed)
        );
    }
}
