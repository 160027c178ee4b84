// Authenticated connection handshake: a three-act challenge-response
// protocol that upgrades a plain, unauthenticated byte-stream connection
// into a mutually-authenticated stream between two peers identified by
// public keys.
//
// The entry points are connection::upgrade_outbound (the caller already
// knows the expected remote identity) and connection::upgrade_inbound
// (the remote identity is learned from the first message). Both return
// an AuthenticatedConnection that behaves like the raw transport for
// byte I/O and additionally exposes the peer's pinned identity.
//
// The upgraded channel is authenticated plaintext: this crate does not
// provide confidentiality, and forward secrecy is whatever the embedded
// key-agreement sub-protocol provides.

#![forbid(unsafe_code)]

pub mod connection;
pub mod envelope;
pub mod identity;
pub mod machine;
pub mod signature;
pub mod subprotocol;
pub mod testing;

pub use connection::{upgrade_inbound, upgrade_outbound, AuthenticatedConnection, Transport};
pub use identity::PeerIdentity;
pub use machine::HandshakeError;
