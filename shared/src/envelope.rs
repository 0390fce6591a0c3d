//! Wire envelope shared by both directions of the channel
//!
//! Every frame carries the same JSON wrapper:
//! ```text
//! { "type": string, "sessionId"?: string, "data"?: any, "timestamp": number }
//! ```
//!
//! A handful of `type` values are reserved for the connection lifecycle and
//! are decoded into [`Inbound`]; everything else is an application event.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::now_ms;

/// Reserved message types
pub mod msg_type {
    /// Liveness probe
    pub const PING: &str = "ping";
    /// Liveness reply
    pub const PONG: &str = "pong";
    /// Handshake confirmation from the backend
    pub const SESSION_CREATED: &str = "session_created";
    /// Credential rejected by the backend
    pub const AUTH_ERROR: &str = "auth_error";
    /// First frame on transports without a native handshake (framed TCP)
    pub const AUTH: &str = "auth";
}

/// Errors raised while interpreting a reserved envelope
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("'{0}' message has no data")]
    MissingData(String),

    #[error("'{msg_type}' message has invalid data: {source}")]
    InvalidData {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The message wrapper used for all wire traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub timestamp: u64,
}

impl Envelope {
    /// Create an envelope stamped with the current time
    pub fn new(msg_type: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            msg_type: msg_type.into(),
            session_id: None,
            data,
            timestamp: now_ms(),
        }
    }

    /// Attach a session identifier
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn ping() -> Self {
        Self::new(msg_type::PING, None)
    }

    pub fn pong() -> Self {
        Self::new(msg_type::PONG, None)
    }

    /// Handshake frame carrying the credential
    pub fn auth(token: &str) -> Self {
        Self::new(msg_type::AUTH, Some(json!({ "token": token })))
    }

    pub fn session_created(session: &SessionCreated) -> Self {
        Self::new(msg_type::SESSION_CREATED, serde_json::to_value(session).ok())
            .with_session(session.session_id.clone())
    }

    pub fn auth_error(error: &AuthErrorInfo) -> Self {
        Self::new(msg_type::AUTH_ERROR, serde_json::to_value(error).ok())
    }

    /// Whether this type is consumed by the connection lifecycle
    pub fn is_reserved(&self) -> bool {
        matches!(
            self.msg_type.as_str(),
            msg_type::PING | msg_type::PONG | msg_type::SESSION_CREATED | msg_type::AUTH_ERROR
        )
    }

    /// Decode the `data` payload into a typed value
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| EnvelopeError::MissingData(self.msg_type.clone()))?;
        serde_json::from_value(data).map_err(|source| EnvelopeError::InvalidData {
            msg_type: self.msg_type.clone(),
            source,
        })
    }

    /// Token carried by an `auth` frame, if any
    pub fn auth_token(&self) -> Option<&str> {
        self.data.as_ref()?.get("token")?.as_str()
    }
}

/// Payload of `session_created`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub session_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub is_guest: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Authentication failure codes reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AuthErrorCode {
    Required,
    Invalid,
    Expired,
    Unknown(String),
}

impl AuthErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            AuthErrorCode::Required => "AUTH_REQUIRED",
            AuthErrorCode::Invalid => "AUTH_INVALID",
            AuthErrorCode::Expired => "AUTH_EXPIRED",
            AuthErrorCode::Unknown(code) => code,
        }
    }
}

impl From<&str> for AuthErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "AUTH_REQUIRED" => AuthErrorCode::Required,
            "AUTH_INVALID" => AuthErrorCode::Invalid,
            "AUTH_EXPIRED" => AuthErrorCode::Expired,
            other => AuthErrorCode::Unknown(other.to_string()),
        }
    }
}

impl From<String> for AuthErrorCode {
    fn from(code: String) -> Self {
        AuthErrorCode::from(code.as_str())
    }
}

impl From<AuthErrorCode> for String {
    fn from(code: AuthErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl std::fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `auth_error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthErrorInfo {
    pub code: AuthErrorCode,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// An inbound envelope, classified by its `type`
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ping,
    Pong,
    SessionCreated(SessionCreated),
    AuthError(AuthErrorInfo),
    /// Any non-reserved type, forwarded verbatim to subscribers
    Event(Envelope),
}

impl TryFrom<Envelope> for Inbound {
    type Error = EnvelopeError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        match envelope.msg_type.as_str() {
            msg_type::PING => Ok(Inbound::Ping),
            msg_type::PONG => Ok(Inbound::Pong),
            msg_type::SESSION_CREATED => Ok(Inbound::SessionCreated(envelope.decode_data()?)),
            msg_type::AUTH_ERROR => Ok(Inbound::AuthError(envelope.decode_data()?)),
            _ => Ok(Inbound::Event(envelope)),
        }
    }
}
