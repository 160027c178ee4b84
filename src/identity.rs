// Peer identity: an opaque binding of a public key to a short byte-string
// identifier, used throughout the handshake to name the local and remote
// parties.

use secp256k1::PublicKey;
use std::fmt;
use subtle::ConstantTimeEq;

use crate::machine::HandshakeError;

// The serialized (SEC1-compressed) public key of a peer. The identity
// bytes ARE the public key encoding, so extract_public_key is a total
// function of any well-formed identifier: there is no registry to miss.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    bytes: [u8; Self::LEN],
}

impl PeerIdentity {
    // Length in bytes of a compressed secp256k1 public key.
    pub const LEN: usize = 33;

    // Derives the identity that corresponds to a local static public key.
    pub fn from_public_key(pk: &PublicKey) -> Self {
        PeerIdentity {
            bytes: pk.serialize(),
        }
    }

    // Parses an identity from its wire bytes. Fails only on length
    // mismatch or an encoding secp256k1 does not recognize as a valid
    // curve point, never panics.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HandshakeError> {
        let arr: [u8; Self::LEN] = bytes
            .try_into()
            .map_err(|_| HandshakeError::MalformedIdentity)?;
        // Round-trip through PublicKey to reject anything that isn't a
        // valid curve point, while keeping the stored representation as
        // raw bytes (extract_public_key below is then infallible on an
        // identity constructed through this path).
        PublicKey::from_slice(&arr).map_err(|_| HandshakeError::MalformedIdentity)?;
        Ok(PeerIdentity { bytes: arr })
    }

    // Raw identity bytes as carried on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    // Recovers the public key this identity is bound to. Total for any
    // PeerIdentity value, since construction already validated the
    // encoding.
    pub fn extract_public_key(&self) -> Result<PublicKey, HandshakeError> {
        PublicKey::from_slice(&self.bytes).map_err(|_| HandshakeError::MalformedIdentity)
    }

    // Constant-time identity comparison, used when checking a sender
    // against a pinned identity so a remote party cannot learn anything
    // about the pinned value by timing how long the comparison takes.
    pub fn constant_time_eq(&self, other: &PeerIdentity) -> bool {
        self.bytes[..].ct_eq(&other.bytes[..]).into()
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({})", hex::encode(self.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Secp256k1, SecretKey};

    fn gen_identity() -> (SecretKey, PeerIdentity) {
        let ctx = Secp256k1::new();
        let sk = SecretKey::new(&mut rand::thread_rng());
        let pk = PublicKey::from_secret_key(&ctx, &sk);
        (sk, PeerIdentity::from_public_key(&pk))
    }

    #[test]
    fn round_trips_through_bytes() {
        let (_, id) = gen_identity();
        let parsed = PeerIdentity::from_bytes(id.as_bytes()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn extract_public_key_is_total_for_valid_identity() {
        let ctx = Secp256k1::new();
        let sk = SecretKey::new(&mut rand::thread_rng());
        let pk = PublicKey::from_secret_key(&ctx, &sk);
        let id = PeerIdentity::from_public_key(&pk);
        assert_eq!(id.extract_public_key().unwrap(), pk);
    }

    #[test]
    fn rejects_malformed_bytes() {
        assert!(PeerIdentity::from_bytes(&[0u8; 10]).is_err());
        assert!(PeerIdentity::from_bytes(&[0u8; 33]).is_err());
    }

    #[test]
    fn distinct_keys_yield_distinct_identities() {
        let (_, a) = gen_identity();
        let (_, b) = gen_identity();
        assert!(!a.constant_time_eq(&b));
    }
}
