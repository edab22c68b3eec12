//! Messages exchanged over a session and the control messages of the session
//! layer itself.
//!
//! Application messages are opaque to this crate. The session layer defines
//! three kinds of its own, identified by their [Action]:
//!
//! - [Action::Close] asks the peer to end the session; a [CloseResponse] is
//!   required
//! - [Action::CloseResponse] confirms that the session token was closed
//! - [Action::Fault] carries a [SessionFault]; the [FaultCode::RenewNeeded] and
//!   [FaultCode::SessionAborted] codes are interpreted by the session layer,
//!   anything else is handed to the application untouched

use serde::{Deserialize, Serialize};

use crate::token::KeyIdentifier;

pub type MessageId = u64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Application(String),
    Close,
    CloseResponse,
    Fault,
}

impl Action {
    /// Close and close-response messages drive the close handshake and are
    /// never delivered to the application
    pub fn is_close_handshake(&self) -> bool {
        matches!(self, Self::Close | Self::CloseResponse)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCode {
    /// The key presented by the peer is stale; renew and try again
    RenewNeeded,
    /// The peer gave up on the session
    SessionAborted,
    /// A message could not be verified
    SecurityError,
    /// Application defined
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFault {
    pub code: FaultCode,
    pub reason: String,
}

pub const RENEW_NEEDED_REASON: &str = "the session key needs to be renewed";
pub const SESSION_ABORTED_REASON: &str = "the session was aborted";
pub const SECURITY_ERROR_REASON: &str = "the message could not be verified";

impl SessionFault {
    pub fn renew_needed() -> Self {
        Self {
            code: FaultCode::RenewNeeded,
            reason: RENEW_NEEDED_REASON.to_owned(),
        }
    }

    pub fn session_aborted() -> Self {
        Self {
            code: FaultCode::SessionAborted,
            reason: SESSION_ABORTED_REASON.to_owned(),
        }
    }

    pub fn security_error() -> Self {
        Self {
            code: FaultCode::SecurityError,
            reason: SECURITY_ERROR_REASON.to_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRequest {
    /// The token being retired
    pub close_target: Option<KeyIdentifier>,
    pub context: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseResponse {
    pub context: Option<String>,
    pub token_closed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    Empty,
    Payload(Vec<u8>),
    Close(CloseRequest),
    CloseResponse(CloseResponse),
    Fault(SessionFault),
}

/// Added by the security protocol when securing a message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityHeader {
    pub key: KeyIdentifier,
    pub tag: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub action: Action,
    pub message_id: MessageId,
    pub relates_to: Option<MessageId>,
    pub body: Body,
    pub security: Option<SecurityHeader>,
}

impl Message {
    fn new(action: Action, body: Body) -> Self {
        Self {
            action,
            message_id: rand::random(),
            relates_to: None,
            body,
            security: None,
        }
    }

    pub fn application<A: Into<String>>(action: A, payload: Vec<u8>) -> Self {
        Self::new(Action::Application(action.into()), Body::Payload(payload))
    }

    pub fn close(close_target: KeyIdentifier, context: Option<String>) -> Self {
        Self::new(
            Action::Close,
            Body::Close(CloseRequest {
                close_target: Some(close_target),
                context,
            }),
        )
    }

    /// Response to the close message `close`, copying its context
    pub fn close_response(close: &Message, token_closed: bool) -> Self {
        let context = match &close.body {
            Body::Close(req) => req.context.clone(),
            _ => None,
        };
        Self::new(
            Action::CloseResponse,
            Body::CloseResponse(CloseResponse {
                context,
                token_closed,
            }),
        )
        .in_reply_to(close)
    }

    pub fn fault(fault: SessionFault) -> Self {
        Self::new(Action::Fault, Body::Fault(fault))
    }

    pub fn in_reply_to(mut self, request: &Message) -> Self {
        self.relates_to = Some(request.message_id);
        self
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Payload(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_fault(&self) -> Option<&SessionFault> {
        match (&self.action, &self.body) {
            (Action::Fault, Body::Fault(f)) => Some(f),
            _ => None,
        }
    }

    pub fn is_secured(&self) -> bool {
        self.security.is_some()
    }

    /// The message with its security header removed
    pub fn unsecured(mut self) -> Self {
        self.security = None;
        self
    }
}
