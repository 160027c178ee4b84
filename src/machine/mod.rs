// The handshake state machine: typed progression through acts one
// through three on distinct initiator and responder tracks.
//
// Each state is its own Rust type. Transition methods consume self by
// value and return the next state, so a consumed state cannot be
// replayed: there is no way to call send_act1 twice on the same
// initiator, nor to resume a handshake from a state the caller merely
// holds a reference to. Failure is always the Err arm of a transition;
// there is no Failed state value for a caller to retry.

mod error;

pub use error::HandshakeError;

use std::io::{Read, Write};
use std::marker::PhantomData;

use secp256k1::SecretKey;

use crate::envelope::{self, HandshakeEnvelope};
use crate::identity::PeerIdentity;
use crate::signature;
use crate::subprotocol::{EphemeralX25519, KeyAgreement};

// Initiator has sent nothing yet.
pub struct Init;
// Initiator has flushed act 1, awaiting act 2.
pub struct AwaitingAct2;
// Initiator has validated act 2 but not yet flushed act 3.
pub struct AwaitingAct3Send;
// Handshake complete.
pub struct Done;

// Initiator-side handshake. Knows the expected remote identity from
// construction, since upgrade_outbound requires the caller to supply it
// up front.
pub struct Initiator<S> {
    local_id: PeerIdentity,
    local_priv: SecretKey,
    remote_id: PeerIdentity,
    key_agreement: Box<dyn KeyAgreement + Send>,
    act3_payload: Option<Vec<u8>>,
    _state: PhantomData<S>,
}

impl Initiator<Init> {
    pub fn new(local_id: PeerIdentity, local_priv: SecretKey, remote_id: PeerIdentity) -> Self {
        Self::with_key_agreement(local_id, local_priv, remote_id, Box::new(EphemeralX25519::new()))
    }

    // As Initiator::new, but with an explicit key-agreement sub-protocol
    // implementation. Primarily for tests that need to control its
    // behavior.
    pub fn with_key_agreement(
        local_id: PeerIdentity,
        local_priv: SecretKey,
        remote_id: PeerIdentity,
        key_agreement: Box<dyn KeyAgreement + Send>,
    ) -> Self {
        Initiator {
            local_id,
            local_priv,
            remote_id,
            key_agreement,
            act3_payload: None,
            _state: PhantomData,
        }
    }

    // Act 1, send: construct the sub-protocol's opening payload, sign it,
    // and transmit it under the local identity.
    pub fn send_act1<W: Write>(mut self, writer: &mut W) -> Result<Initiator<AwaitingAct2>, HandshakeError> {
        let message = self.key_agreement.initiate();
        let signature = signature::sign(&self.local_priv, &message)
            .serialize_compact()
            .to_vec();
        let envelope = HandshakeEnvelope::new(message, self.local_id.as_bytes().to_vec(), signature);
        envelope::write(writer, &envelope, "act1_send")?;

        tracing::debug!(role = "initiator", act = 1, "sent");
        Ok(Initiator {
            local_id: self.local_id,
            local_priv: self.local_priv,
            remote_id: self.remote_id,
            key_agreement: self.key_agreement,
            act3_payload: None,
            _state: PhantomData,
        })
    }
}

impl Initiator<AwaitingAct2> {
    // Act 2, receive: read the next envelope, verify it against the
    // known remote identity, and feed its message into the sub-protocol
    // to derive the act 3 payload.
    pub fn recv_act2<R: Read>(
        mut self,
        reader: &mut R,
    ) -> Result<Initiator<AwaitingAct3Send>, HandshakeError> {
        let envelope = envelope::read(reader, "act2_recv")?;
        if let Err(err) = verify_against_pinned(&self.remote_id, &envelope) {
            tracing::warn!(role = "initiator", act = 2, error = %err, "rejected");
            return Err(err);
        }

        let act3_payload = self
            .key_agreement
            .advance(&envelope.message)
            .map_err(|err| {
                tracing::warn!(role = "initiator", act = 2, error = %err, "sub-protocol rejected");
                err
            })?;

        tracing::debug!(role = "initiator", act = 2, "received");
        self.act3_payload = Some(act3_payload);
        Ok(Initiator {
            local_id: self.local_id,
            local_priv: self.local_priv,
            remote_id: self.remote_id,
            key_agreement: self.key_agreement,
            act3_payload: self.act3_payload,
            _state: PhantomData,
        })
    }
}

impl Initiator<AwaitingAct3Send> {
    // Act 3, send: sign the sub-protocol's closing payload (derived at
    // act 2) and transmit it. The initiator is done once this flushes.
    pub fn send_act3<W: Write>(self, writer: &mut W) -> Result<Initiator<Done>, HandshakeError> {
        let message = self
            .act3_payload
            .expect("AwaitingAct3Send always carries a computed act3_payload");
        let signature = signature::sign(&self.local_priv, &message)
            .serialize_compact()
            .to_vec();
        let envelope = HandshakeEnvelope::new(message, self.local_id.as_bytes().to_vec(), signature);
        envelope::write(writer, &envelope, "act3_send")?;

        tracing::debug!(role = "initiator", act = 3, "sent");
        Ok(Initiator {
            local_id: self.local_id,
            local_priv: self.local_priv,
            remote_id: self.remote_id,
            key_agreement: self.key_agreement,
            act3_payload: None,
            _state: PhantomData,
        })
    }
}

impl Initiator<Done> {
    pub fn remote_identity(&self) -> &PeerIdentity {
        &self.remote_id
    }
}

// Responder has received nothing yet; it does not know the remote
// identity.
pub struct AwaitingAct1;
// Responder has pinned the remote identity from act 1 and flushed
// act 2; awaiting act 3.
pub struct AwaitingAct3;

// Responder-side handshake. Discovers the remote identity from the
// first envelope it receives and pins it immutably from then on.
pub struct Responder<S> {
    local_id: PeerIdentity,
    local_priv: SecretKey,
    remote_id: Option<PeerIdentity>,
    key_agreement: Box<dyn KeyAgreement + Send>,
    _state: PhantomData<S>,
}

impl Responder<AwaitingAct1> {
    pub fn new(local_id: PeerIdentity, local_priv: SecretKey) -> Self {
        Self::with_key_agreement(local_id, local_priv, Box::new(EphemeralX25519::new()))
    }

    pub fn with_key_agreement(
        local_id: PeerIdentity,
        local_priv: SecretKey,
        key_agreement: Box<dyn KeyAgreement + Send>,
    ) -> Self {
        Responder {
            local_id,
            local_priv,
            remote_id: None,
            key_agreement,
            _state: PhantomData,
        }
    }

    // Act 1 receive, then act 2 send, as a single atomic step: the
    // responder adopts the sender's claimed identity as the pinned
    // remote identity, verifies act 1's signature against it, and only
    // then answers with act 2. There is no intermediate state a caller
    // could hold to emit bytes before act 1 has been read and validated,
    // so a responder never reveals its own identity to an unauthenticated
    // peer.
    pub fn recv_act1_send_act2<T: Read + Write>(
        mut self,
        transport: &mut T,
    ) -> Result<Responder<AwaitingAct3>, HandshakeError> {
        let envelope = envelope::read(transport, "act1_recv")?;
        let sender = PeerIdentity::from_bytes(&envelope.peer_id).map_err(|err| {
            tracing::warn!(role = "responder", act = 1, error = %err, "rejected");
            err
        })?;
        signature::verify(&sender, &envelope.message, &envelope.signature).map_err(|err| {
            tracing::warn!(role = "responder", act = 1, error = %err, "signature rejected");
            err
        })?;
        tracing::debug!(role = "responder", act = 1, "received, pinned remote identity");

        let act2_payload = self.key_agreement.answer(&envelope.message).map_err(|err| {
            tracing::warn!(role = "responder", act = 1, error = %err, "sub-protocol rejected");
            err
        })?;

        let signature = signature::sign(&self.local_priv, &act2_payload)
            .serialize_compact()
            .to_vec();
        let out_envelope =
            HandshakeEnvelope::new(act2_payload, self.local_id.as_bytes().to_vec(), signature);
        envelope::write(transport, &out_envelope, "act2_send")?;
        tracing::debug!(role = "responder", act = 2, "sent");

        Ok(Responder {
            local_id: self.local_id,
            local_priv: self.local_priv,
            remote_id: Some(sender),
            key_agreement: self.key_agreement,
            _state: PhantomData,
        })
    }
}

impl Responder<AwaitingAct3> {
    // Act 3, receive: verify against the pinned identity and hand the
    // message to the sub-protocol's finalize.
    pub fn recv_act3<R: Read>(mut self, reader: &mut R) -> Result<Responder<Done>, HandshakeError> {
        let pinned = self
            .remote_id
            .as_ref()
            .expect("AwaitingAct3 always carries a pinned remote identity")
            .clone();
        let envelope = envelope::read(reader, "act3_recv")?;
        if let Err(err) = verify_against_pinned(&pinned, &envelope) {
            tracing::warn!(role = "responder", act = 3, error = %err, "rejected");
            return Err(err);
        }

        self.key_agreement.finalize(&envelope.message).map_err(|err| {
            tracing::warn!(role = "responder", act = 3, error = %err, "sub-protocol rejected");
            err
        })?;

        tracing::debug!(role = "responder", act = 3, "received, handshake complete");
        Ok(Responder {
            local_id: self.local_id,
            local_priv: self.local_priv,
            remote_id: self.remote_id,
            key_agreement: self.key_agreement,
            _state: PhantomData,
        })
    }
}

impl Responder<Done> {
    pub fn remote_identity(&self) -> &PeerIdentity {
        self.remote_id
            .as_ref()
            .expect("Done always carries a pinned remote identity")
    }
}

// The envelope's sender must byte-equal the pinned identity (checked
// first, and in constant time, so a mismatch is never confused with a
// bad signature), and the signature must verify under that identity.
fn verify_against_pinned(
    pinned: &PeerIdentity,
    envelope: &HandshakeEnvelope,
) -> Result<(), HandshakeError> {
    let sender = PeerIdentity::from_bytes(&envelope.peer_id)?;
    if !pinned.constant_time_eq(&sender) {
        return Err(HandshakeError::IdentityMismatch);
    }
    signature::verify(&sender, &envelope.message, &envelope.signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pipe::bipipe;
    use secp256k1::{PublicKey, Secp256k1};

    fn keypair() -> (SecretKey, PeerIdentity) {
        let ctx = Secp256k1::new();
        let sk = SecretKey::new(&mut rand::thread_rng());
        let pk = PublicKey::from_secret_key(&ctx, &sk);
        (sk, PeerIdentity::from_public_key(&pk))
    }

    #[test]
    fn happy_path_both_sides_pin_each_other() {
        let (sk_a, id_a) = keypair();
        let (sk_b, id_b) = keypair();
        let (mut pipe_a, mut pipe_b) = bipipe();

        let initiator = Initiator::<Init>::new(id_a.clone(), sk_a, id_b.clone());
        let responder = Responder::<AwaitingAct1>::new(id_b.clone(), sk_b);

        let initiator = initiator.send_act1(&mut pipe_a).unwrap();
        let responder = responder.recv_act1_send_act2(&mut pipe_b).unwrap();
        let initiator = initiator.recv_act2(&mut pipe_a).unwrap();
        let initiator = initiator.send_act3(&mut pipe_a).unwrap();
        let responder = responder.recv_act3(&mut pipe_b).unwrap();

        assert_eq!(initiator.remote_identity(), &id_b);
        assert_eq!(responder.remote_identity(), &id_a);
    }

    #[test]
    fn initiator_rejects_wrong_signer_on_act2() {
        let (sk_a, id_a) = keypair();
        let (sk_b, id_b) = keypair();
        let (_, id_mallory) = keypair();
        let (mut pipe_a, mut pipe_b) = bipipe();

        let initiator = Initiator::<Init>::new(id_a, sk_a, id_b);
        let responder = Responder::<AwaitingAct1>::new(id_mallory, sk_b);

        let initiator = initiator.send_act1(&mut pipe_a).unwrap();
        responder.recv_act1_send_act2(&mut pipe_b).unwrap();
        let err = initiator.recv_act2(&mut pipe_a).unwrap_err();
        assert!(matches!(err, HandshakeError::IdentityMismatch));
    }

    #[test]
    fn responder_rejects_identity_switch_on_act3() {
        let (sk_a, id_a) = keypair();
        let (sk_b, id_b) = keypair();
        let (_, id_mallory) = keypair();
        let (mut pipe_a, mut pipe_b) = bipipe();

        let initiator = Initiator::<Init>::new(id_a.clone(), sk_a.clone(), id_b.clone());
        let responder = Responder::<AwaitingAct1>::new(id_b, sk_b);

        let initiator = initiator.send_act1(&mut pipe_a).unwrap();
        let responder = responder.recv_act1_send_act2(&mut pipe_b).unwrap();
        let initiator = initiator.recv_act2(&mut pipe_a).unwrap();

        // Splice in an act-3 envelope signed under a different identity
        // than the one the responder pinned at Act 1.
        let forged_message = b"forged-act3".to_vec();
        let forged_signature = signature::sign(&sk_a, &forged_message).serialize_compact().to_vec();
        let forged_envelope =
            HandshakeEnvelope::new(forged_message, id_mallory.as_bytes().to_vec(), forged_signature);
        envelope::write(&mut pipe_a, &forged_envelope, "test").unwrap();
        let _ = initiator; // the forged frame replaces what send_act3 would have sent

        let err = responder.recv_act3(&mut pipe_b).unwrap_err();
        assert!(matches!(err, HandshakeError::IdentityMismatch));
    }
}
