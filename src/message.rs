//! Frame decoding and the reserved keep-alive envelopes.
//!
//! The layer is agnostic to payload meaning. It parses every frame exactly
//! once, strips the two protocol-internal envelopes, and hands everything else
//! to the consumer as a typed [`Message<T>`].
//!
//! # Reserved Envelopes
//!
//! | Frame | Direction | Surfaced |
//! |-------|-----------|----------|
//! | `{"type":"ping"}` | sent by this layer | never |
//! | `{"type":"pong"}` | expected reply | never |

// ============================================================================
// Imports
// ============================================================================

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ParseError;
use crate::identifiers::SessionId;

// ============================================================================
// Constants
// ============================================================================

/// Keep-alive probe sent by the monitor.
pub const PING_FRAME: &str = r#"{"type":"ping"}"#;

/// Expected keep-alive reply.
pub const PONG_FRAME: &str = r#"{"type":"pong"}"#;

// ============================================================================
// Message
// ============================================================================

/// A decoded application frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<T> {
    /// Transport handle the frame arrived on.
    pub session: SessionId,
    /// Decoded payload.
    pub data: T,
}

impl<T> Message<T> {
    /// Consumes the message, returning the payload.
    #[inline]
    pub fn into_data(self) -> T {
        self.data
    }
}

// ============================================================================
// Frame
// ============================================================================

/// Classification of one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<T> {
    /// `{"type":"ping"}`.
    Ping,
    /// `{"type":"pong"}`.
    Pong,
    /// Anything else, decoded as `T`.
    Data(T),
}

/// Decodes a raw text frame.
///
/// The text is parsed once into a JSON value; reserved envelopes are
/// recognised by their `type` field, everything else is converted to `T`.
///
/// # Errors
///
/// - [`ParseError::Syntax`] if the frame is not JSON
/// - [`ParseError::Shape`] if the JSON does not deserialize into `T`
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<Frame<T>, ParseError> {
    let value: Value = serde_json::from_str(raw).map_err(ParseError::Syntax)?;

    match reserved_type(&value) {
        Some("ping") => return Ok(Frame::Ping),
        Some("pong") => return Ok(Frame::Pong),
        _ => {}
    }

    serde_json::from_value(value)
        .map(Frame::Data)
        .map_err(ParseError::Shape)
}

/// Returns the `type` of a reserved envelope, if `value` is one.
fn reserved_type(value: &Value) -> Option<&str> {
    let kind = value.as_object()?.get("type")?.as_str()?;
    matches!(kind, "ping" | "pong").then_some(kind)
}

// ============================================================================
// Tests
// ============================================================================
