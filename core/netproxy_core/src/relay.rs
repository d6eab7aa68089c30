//! CSR relay framing
//!
//! NetProxies without a direct path register with a relay daemon under their
//! unique id and exchange encoded PWP messages through it.
//!
//! ```text
//! NetProxy A               csr-relay                NetProxy B
//!     │─── Register{A} ────────►│◄──────── Register{B} ───│
//!     │◄── Registered{A} ───────│──── Registered{B} ─────►│
//!     │─── Forward{to: B} ─────►│                          │
//!     │                         │──── Deliver{from: A} ───►│
//! ```
//!
//! # Message Framing
//!
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (4B) │ Payload (bincode-encoded)       │
//! └─────────────┴─────────────────────────────────┘
//! ```

use std::fmt;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Largest encoded relay message
pub const MAX_MESSAGE_SIZE: u32 = 131_072;

/// Length of the message header (4 bytes for length)
pub const HEADER_LEN: usize = 4;

// ============================================================================
// Relay Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Claim a unique id on this relay connection
    Register { proxy_id: u32 },
    Registered { proxy_id: u32 },
    /// Sender → relay: deliver `payload` to `to`
    Forward { to: u32, payload: Vec<u8> },
    /// Relay → receiver
    Deliver { from: u32, payload: Vec<u8> },
    Error { code: RelayErrorCode, proxy_id: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RelayErrorCode {
    /// No NetProxy registered under that id
    UnknownPeer = 1,
    /// Id already registered on another connection
    DuplicateId = 2,
    /// Forward before Register
    NotRegistered = 3,
}

impl fmt::Display for RelayErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayErrorCode::UnknownPeer => write!(f, "unknown peer"),
            RelayErrorCode::DuplicateId => write!(f, "duplicate id"),
            RelayErrorCode::NotRegistered => write!(f, "not registered"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Not enough data (need N more bytes)
    Incomplete(usize),
    MessageTooLarge(usize),
    Serialization(String),
    Deserialization(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Incomplete(needed) => {
                write!(f, "incomplete message, need {} more bytes", needed)
            }
            RelayError::MessageTooLarge(size) => {
                write!(f, "message too large: {} bytes (max {})", size, MAX_MESSAGE_SIZE)
            }
            RelayError::Serialization(e) => write!(f, "serialization error: {}", e),
            RelayError::Deserialization(e) => write!(f, "deserialization error: {}", e),
        }
    }
}

impl std::error::Error for RelayError {}

// ============================================================================
// Encoding/Decoding
// ============================================================================

/// Returns `[4-byte BE length][bincode payload]`
pub fn encode_message(msg: &RelayMessage) -> Result<Vec<u8>, RelayError> {
    let payload = bincode::serialize(msg).map_err(|e| RelayError::Serialization(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(RelayError::MessageTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode one message; returns it with the number of bytes consumed
pub fn decode_message(buf: &[u8]) -> Result<(RelayMessage, usize), RelayError> {
    if buf.len() < HEADER_LEN {
        return Err(RelayError::Incomplete(HEADER_LEN - buf.len()));
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_MESSAGE_SIZE as usize {
        return Err(RelayError::MessageTooLarge(length));
    }
    let total = HEADER_LEN + length;
    if buf.len() < total {
        return Err(RelayError::Incomplete(total - buf.len()));
    }
    let msg = bincode::deserialize(&buf[HEADER_LEN..total]).map_err(|e| RelayError::Deserialization(e.to_string()))?;
    Ok((msg, total))
}

/// Decode every complete message at the front of `buf`
///
/// Consumed bytes are drained; a trailing partial message stays. A corrupt
/// frame is returned as an error after the good ones were drained.
pub fn drain_messages(buf: &mut Vec<u8>) -> Result<Vec<RelayMessage>, RelayError> {
    let mut messages = Vec::new();
    let mut consumed = 0;
    let result = loop {
        match decode_message(&buf[consumed..]) {
            Ok((msg, n)) => {
                messages.push(msg);
                consumed += n;
            }
            Err(RelayError::Incomplete(_)) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    buf.drain(..consumed);
    result.map(|_| messages)
}

pub fn write_message<W: Write>(writer: &mut W, msg: &RelayMessage) -> io::Result<()> {
    let encoded = encode_message(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&encoded)
}

/// Blocks until a complete message is received
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<RelayMessage> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {} bytes", length),
        ));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    bincode::deserialize(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_forward() {
        let msg = RelayMessage::Forward {
            to: 42,
            payload: vec![1, 2, 3],
        };
        let encoded = encode_message(&msg).unwrap();
        let (decoded, consumed) = decode_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_incomplete_and_oversize() {
        let encoded = encode_message(&RelayMessage::Register { proxy_id: 1 }).unwrap();
        assert!(matches!(
            decode_message(&encoded[..encoded.len() - 1]),
            Err(RelayError::Incomplete(1))
        ));
        let mut big = Vec::new();
        big.extend_from_slice(&(MAX_MESSAGE_SIZE + 1).to_be_bytes());
        assert!(matches!(decode_message(&big), Err(RelayError::MessageTooLarge(_))));
    }

    #[test]
    fn test_drain_keeps_partial_tail() {
        let mut buf = encode_message(&RelayMessage::Registered { proxy_id: 5 }).unwrap();
        let second = encode_message(&RelayMessage::Deliver {
            from: 9,
            payload: vec![7; 10],
        })
        .unwrap();
        buf.extend_from_slice(&second[..6]);

        let msgs = drain_messages(&mut buf).unwrap();
        assert_eq!(msgs, vec![RelayMessage::Registered { proxy_id: 5 }]);
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&second[6..]);
        let msgs = drain_messages(&mut buf).unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_stream_io() {
        let msg = RelayMessage::Error {
            code: RelayErrorCode::UnknownPeer,
            proxy_id: 3,
        };
        let mut wire = Vec::new();
        write_message(&mut wire, &msg).unwrap();
        let mut cursor = io::Cursor::new(wire);
        assert_eq!(read_message(&mut cursor).unwrap(), msg);
    }
}
