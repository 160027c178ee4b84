// The embedded key-agreement sub-protocol: an opaque collaborator the
// handshake state machine drives without inspecting its payloads. The
// default implementation is an ephemeral X25519 Diffie-Hellman exchange
// with a key-confirmation tag carried in act 3, in the spirit of
// Noise_XK's own ephemeral-key-then-confirmation shape.
//
// The core only ever calls initiate/answer/advance/finalize and treats
// every return value as opaque bytes to place in an envelope's message
// field; it never inspects or stores the derived secret.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::machine::HandshakeError;

const CONFIRMATION_LABEL: &[u8] = b"peerauth/key-confirmation/v0";
const CONFIRMATION_TAG_LEN: usize = 32;

// Capability set required of any embedded key-agreement sub-protocol:
// initiate the exchange, answer the initiator's opening payload, advance
// with the responder's reply, and finalize by confirming both sides
// derived the same secret.
pub trait KeyAgreement {
    // Produces the initiator's act 1 payload.
    fn initiate(&mut self) -> Vec<u8>;

    // Responder's reaction to act 1: derives the shared secret and
    // produces the act 2 payload.
    fn answer(&mut self, act1_payload: &[u8]) -> Result<Vec<u8>, HandshakeError>;

    // Initiator's reaction to act 2: derives the shared secret and
    // produces the act 3 key-confirmation payload.
    fn advance(&mut self, act2_payload: &[u8]) -> Result<Vec<u8>, HandshakeError>;

    // Responder's reaction to act 3: confirms the initiator derived the
    // same shared secret. The sub-protocol is considered complete once
    // this returns Ok.
    fn finalize(&mut self, act3_payload: &[u8]) -> Result<(), HandshakeError>;
}

// Ephemeral X25519 Diffie-Hellman, regenerated for every handshake
// attempt so a compromised transcript never compromises a future one.
pub struct EphemeralX25519 {
    secret: Option<EphemeralSecret>,
    public: X25519PublicKey,
    shared_secret: Option<[u8; 32]>,
}

impl EphemeralX25519 {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random();
        let public = X25519PublicKey::from(&secret);
        EphemeralX25519 {
            secret: Some(secret),
            public,
            shared_secret: None,
        }
    }

    fn parse_peer_public(bytes: &[u8]) -> Result<X25519PublicKey, HandshakeError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| HandshakeError::SubprotocolError {
            stage: "key_agreement",
            reason: "peer's key-agreement payload is not 32 bytes".to_string(),
        })?;
        Ok(X25519PublicKey::from(arr))
    }

    fn take_secret(&mut self) -> Result<EphemeralSecret, HandshakeError> {
        self.secret.take().ok_or(HandshakeError::SubprotocolError {
            stage: "key_agreement",
            reason: "key agreement already consumed its ephemeral secret".to_string(),
        })
    }

    fn confirmation_tag(shared_secret: &[u8; 32]) -> [u8; CONFIRMATION_TAG_LEN] {
        let hk = Hkdf::<Sha256>::new(None, shared_secret);
        let mut tag = [0u8; CONFIRMATION_TAG_LEN];
        hk.expand(CONFIRMATION_LABEL, &mut tag)
            .expect("CONFIRMATION_TAG_LEN is a valid HKDF-SHA256 output length");
        tag
    }
}

impl Default for EphemeralX25519 {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyAgreement for EphemeralX25519 {
    fn initiate(&mut self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    fn answer(&mut self, act1_payload: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let peer_public = Self::parse_peer_public(act1_payload)?;
        let secret = self.take_secret()?;
        self.shared_secret = Some(secret.diffie_hellman(&peer_public).to_bytes());
        Ok(self.public.as_bytes().to_vec())
    }

    fn advance(&mut self, act2_payload: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let peer_public = Self::parse_peer_public(act2_payload)?;
        let secret = self.take_secret()?;
        let shared = secret.diffie_hellman(&peer_public).to_bytes();
        self.shared_secret = Some(shared);
        Ok(Self::confirmation_tag(&shared).to_vec())
    }

    fn finalize(&mut self, act3_payload: &[u8]) -> Result<(), HandshakeError> {
        let shared = self.shared_secret.ok_or(HandshakeError::SubprotocolError {
            stage: "key_agreement",
            reason: "finalize called before a shared secret was derived".to_string(),
        })?;
        let expected = Self::confirmation_tag(&shared);
        if act3_payload == expected.as_slice() {
            Ok(())
        } else {
            Err(HandshakeError::SubprotocolError {
                stage: "key_agreement",
                reason: "key confirmation tag did not match".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_exchange_confirms_on_both_sides() {
        let mut initiator = EphemeralX25519::new();
        let mut responder = EphemeralX25519::new();

        let act1 = initiator.initiate();
        let act2 = responder.answer(&act1).unwrap();
        let act3 = initiator.advance(&act2).unwrap();
        responder.finalize(&act3).unwrap();
    }

    #[test]
    fn rejects_malformed_act1_payload() {
        let mut responder = EphemeralX25519::new();
        assert!(responder.answer(&[0u8; 4]).is_err());
    }

    #[test]
    fn rejects_tampered_confirmation_tag() {
        let mut initiator = EphemeralX25519::new();
        let mut responder = EphemeralX25519::new();

        let act1 = initiator.initiate();
        let act2 = responder.answer(&act1).unwrap();
        let mut act3 = initiator.advance(&act2).unwrap();
        act3[0] ^= 0xff;

        assert!(responder.finalize(&act3).is_err());
    }
}
