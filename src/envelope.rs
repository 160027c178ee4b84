// Envelope codec: serializes and deserializes the {message, peer_id,
// signature} frames carried over the wire during the handshake, each
// bounded by a maximum on-wire size.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::machine::HandshakeError;

// MAX_FRAME_SIZE is the maximum number of bytes a single frame may
// occupy on the wire, framing overhead included.
pub const MAX_FRAME_SIZE: usize = 1024;

// PROTOCOL_VERSION is carried ahead of every envelope so the wire
// format can evolve later without breaking older readers. Only 0 is
// understood today.
const PROTOCOL_VERSION: u8 = 0;

// HEADER_LEN is 1 version byte plus 4 big-endian payload-length bytes.
const HEADER_LEN: usize = 1 + 4;

// A framed record: the sender's identity, the opaque act payload it is
// vouching for, and a signature over that payload under the sender's
// private key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeEnvelope {
    pub message: Vec<u8>,
    pub peer_id: Vec<u8>,
    pub signature: Vec<u8>,
}

impl HandshakeEnvelope {
    pub fn new(message: Vec<u8>, peer_id: Vec<u8>, signature: Vec<u8>) -> Self {
        HandshakeEnvelope {
            message,
            peer_id,
            signature,
        }
    }
}

// Serializes and flushes one frame. Stateless beyond the underlying
// stream position.
pub fn write<W: Write>(
    writer: &mut W,
    envelope: &HandshakeEnvelope,
    stage: &'static str,
) -> Result<(), HandshakeError> {
    let payload =
        bincode::serialize(envelope).map_err(|e| HandshakeError::MalformedEnvelope(e.to_string()))?;

    if HEADER_LEN + payload.len() > MAX_FRAME_SIZE {
        return Err(HandshakeError::FrameOversize);
    }

    let mut header = [0u8; HEADER_LEN];
    header[0] = PROTOCOL_VERSION;
    BigEndian::write_u32(&mut header[1..], payload.len() as u32);

    writer
        .write_all(&header)
        .map_err(|e| HandshakeError::io_at(stage, e))?;
    writer
        .write_all(&payload)
        .map_err(|e| HandshakeError::io_at(stage, e))?;
    writer.flush().map_err(|e| HandshakeError::io_at(stage, e))
}

// Reads exactly one frame, rejecting frames larger than MAX_FRAME_SIZE.
// Partial reads block (via read_exact) until a full frame is available
// or the transport errors.
pub fn read<R: Read>(
    reader: &mut R,
    stage: &'static str,
) -> Result<HandshakeEnvelope, HandshakeError> {
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|e| HandshakeError::io_at(stage, e))?;

    if header[0] != PROTOCOL_VERSION {
        return Err(HandshakeError::MalformedEnvelope(format!(
            "unsupported protocol version {}",
            header[0]
        )));
    }

    let payload_len = BigEndian::read_u32(&header[1..]) as usize;
    // Reject before allocating/reading a payload of attacker-controlled
    // size: the cap covers the whole frame, header included.
    if HEADER_LEN + payload_len > MAX_FRAME_SIZE {
        return Err(HandshakeError::FrameOversize);
    }

    let mut payload = vec![0u8; payload_len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| HandshakeError::io_at(stage, e))?;

    bincode::deserialize(&payload).map_err(|e| HandshakeError::MalformedEnvelope(e.to_string()))
}
