// Signature adapter: sign a byte string with the local private key; verify
// a byte string against an advertised public key extracted from a peer
// identity.
//
// Both routines are pure and total: a malformed identity or signature is
// reported as an error, never a panic.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::identity::PeerIdentity;
use crate::machine::HandshakeError;

fn digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

// Signs message_bytes with private_key. The signature covers the
// SHA-256 digest of message_bytes, not the raw bytes themselves,
// matching the secp256k1 crate's fixed-size Message contract.
pub fn sign(private_key: &SecretKey, message_bytes: &[u8]) -> Signature {
    let ctx = Secp256k1::signing_only();
    let msg = Message::from_digest(digest(message_bytes));
    ctx.sign_ecdsa(&msg, private_key)
}

// Verifies signature_bytes over message_bytes against the public key
// advertised by peer_identity. Succeeds iff the identity is well-formed
// and the signature is a valid ECDSA signature of the message digest
// under that key.
pub fn verify(
    peer_identity: &PeerIdentity,
    message_bytes: &[u8],
    signature_bytes: &[u8],
) -> Result<(), HandshakeError> {
    let public_key = extract_public_key(peer_identity)?;
    let signature =
        Signature::from_compact(signature_bytes).map_err(|_| HandshakeError::SignatureInvalid)?;
    let msg = Message::from_digest(digest(message_bytes));

    let ctx = Secp256k1::verification_only();
    ctx.verify_ecdsa(&msg, &signature, &public_key)
        .map_err(|_| HandshakeError::SignatureInvalid)
}

// Extracts the public key an identity is bound to.
pub fn extract_public_key(peer_identity: &PeerIdentity) -> Result<PublicKey, HandshakeError> {
    peer_identity.extract_public_key()
}
