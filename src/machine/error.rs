// The error taxonomy surfaced to callers of upgrade_outbound and
// upgrade_inbound.

use thiserror::Error;

// Every kind is fatal to the handshake: there is no internal retry, and
// the caller always gets the underlying transport closed before this is
// returned.
#[derive(Debug, Error)]
pub enum HandshakeError {
    // A read or write on the underlying transport failed.
    #[error("transport I/O error during {stage}: {source}")]
    TransportIo {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    // A frame's declared length exceeded the configured maximum.
    #[error("frame exceeds the maximum allowed size")]
    FrameOversize,

    // A frame could not be decoded into a HandshakeEnvelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    // A peer_id field did not decode into a valid identity.
    #[error("malformed peer identity")]
    MalformedIdentity,

    // A signature failed to verify against the claimed identity.
    #[error("signature verification failed")]
    SignatureInvalid,

    // The sender of an envelope did not match the expected or
    // previously-pinned remote identity.
    #[error("peer identity mismatch: expected a different remote peer")]
    IdentityMismatch,

    // The embedded key-agreement sub-protocol rejected an act.
    #[error("sub-protocol error during {stage}: {reason}")]
    SubprotocolError { stage: &'static str, reason: String },

    // The caller's task was cancelled before the handshake completed.
    #[error("handshake cancelled")]
    Cancelled,
}

impl From<std::io::Error> for HandshakeError {
    fn from(source: std::io::Error) -> Self {
        HandshakeError::TransportIo {
            stage: "unspecified",
            source,
        }
    }
}

impl HandshakeError {
    // Attaches a stage label to an I/O error produced deeper in the call
    // stack, so the caller can tell which act or operation failed.
    pub fn io_at(stage: &'static str, source: std::io::Error) -> Self {
        HandshakeError::TransportIo { stage, source }
    }
}
