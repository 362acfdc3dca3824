//! Messages exchanged with websocket clients.
//!
//! Frames travel as binary messages in both directions. Everything else is a
//! small JSON text message tagged by `type`.

use serde::{Deserialize, Serialize};

/// Normal closure: the peer left or its connection went dead.
pub const CLOSE_NORMAL: u16 = 1000;
/// Policy violation: bad or missing credentials.
pub const CLOSE_POLICY: u16 = 1008;
/// Going away: heartbeat expiry or server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

pub const REASON_INVALID_AUTH: &str = "Invalid authentication";
pub const REASON_INVALID_AUTH_FORMAT: &str = "Invalid authentication format";
pub const REASON_HEARTBEAT_TIMEOUT: &str = "Heartbeat timeout";
pub const REASON_SHUTDOWN: &str = "Server shutting down";
pub const REASON_CLOSED: &str = "Connection closed";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Auth { password: String },
    Ping,
    Pong,
}

impl ClientMessage {
    /// Parse a text message. Older clients answer heartbeats with a bare `pong`.
    pub fn parse(text: &str) -> Option<Self> {
        if text.trim() == "pong" {
            return Some(ClientMessage::Pong);
        }
        serde_json::from_str(text).ok()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Pong,
}

impl ServerMessage {
    pub fn to_text(&self) -> String {
        // unit variants of a tagged enum always serialize
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"pong\"}"))
    }
}

/// How the first message of a connection reads as an authentication attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum AuthAttempt {
    /// `{type: "auth", password}`; the password still has to be checked.
    Password(String),
    /// Valid JSON that is not an auth message.
    NotAuth,
    /// Binary, or not JSON at all.
    Malformed,
}

impl AuthAttempt {
    pub fn parse(text: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return AuthAttempt::Malformed,
        };
        match serde_json::from_value::<ClientMessage>(value) {
            Ok(ClientMessage::Auth { password }) => AuthAttempt::Password(password),
            _ => AuthAttempt::NotAuth,
        }
    }

    /// Close reason sent when this attempt is rejected.
    pub fn rejection_reason(&self) -> &'static str {
        match self {
            AuthAttempt::Malformed => REASON_INVALID_AUTH_FORMAT,
            _ => REASON_INVALID_AUTH,
        }
    }
}

#[cfg(test)]
#[path = "protocol_test.rs"]
mod protocol_test;
