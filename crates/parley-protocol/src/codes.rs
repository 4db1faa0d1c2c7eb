//! Error codes carried in `error` frames and WebSocket close frames.
//!
//! Codes in the 1xxx range describe a rejected frame; the connection stays
//! open. Codes in the 4xxx range are application close codes.

/// The frame could not be decoded.
pub const INVALID_FRAME: u16 = 1001;

/// The frame is valid but clients may not send it.
pub const UNEXPECTED_FRAME: u16 = 1003;

/// A newer connection for the same user replaced this one.
pub const SUPERSEDED: u16 = 4009;

/// The server could not deliver to this connection and dropped it.
pub const EVICTED: u16 = 4010;

/// No traffic within the heartbeat timeout.
pub const HEARTBEAT_TIMEOUT: u16 = 4011;

/// Human-readable reason for a close code.
#[must_use]
pub fn close_reason(code: u16) -> &'static str {
    match code {
        SUPERSEDED => "Superseded by a newer connection",
        EVICTED => "Connection could not keep up",
        HEARTBEAT_TIMEOUT => "Heartbeat timeout",
        _ => "Connection closed",
    }
}
