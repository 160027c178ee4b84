// Authenticated connection wrapper: drives the handshake state machine
// over a raw transport, enforces identity pinning, and surfaces the
// upgraded stream.

use std::future::Future;
use std::io::{self, Read, Write};
use std::net::Shutdown;

use secp256k1::SecretKey;

use crate::identity::PeerIdentity;
use crate::machine::{AwaitingAct1, HandshakeError, Init, Initiator, Responder};

// The raw byte-stream collaborator a handshake upgrades. Blocking
// Read/Write, since the handshake itself is a linear, blocking sequence;
// close and closer exist so a failure or an external cancellation can
// tear the transport down even while a blocking read or write is in
// flight on another thread.
pub trait Transport: Read + Write + Send + 'static {
    // Tears the transport down. Called on every handshake failure path
    // before the error reaches the caller.
    fn close(&mut self) -> io::Result<()>;

    // Produces an independent handle capable of closing the same
    // underlying resource from another thread. Used to unblock a
    // handshake that is currently parked in a blocking read/write when
    // the caller cancels.
    fn closer(&self) -> io::Result<Box<dyn TransportCloser>>;
}

// A detached capability to close a transport, obtained before handing
// the transport itself to a blocking task.
pub trait TransportCloser: Send + 'static {
    fn close(self: Box<Self>) -> io::Result<()>;
}

impl Transport for std::net::TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn closer(&self) -> io::Result<Box<dyn TransportCloser>> {
        Ok(Box::new(TcpCloser(self.try_clone()?)))
    }
}

struct TcpCloser(std::net::TcpStream);

impl TransportCloser for TcpCloser {
    fn close(self: Box<Self>) -> io::Result<()> {
        self.0.shutdown(Shutdown::Both)
    }
}

// The post-handshake object: behaves like the raw transport for byte
// I/O, additionally exposing the pinned remote identity.
pub struct AuthenticatedConnection<T: Transport> {
    transport: T,
    local_identity: PeerIdentity,
    remote_identity: PeerIdentity,
}

impl<T: Transport> AuthenticatedConnection<T> {
    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local_identity
    }

    pub fn remote_identity(&self) -> &PeerIdentity {
        &self.remote_identity
    }

    // Closes the underlying transport. The connection is not reused
    // after this; a fresh handshake is required for a new session.
    pub fn close(mut self) -> io::Result<()> {
        self.transport.close()
    }
}

impl<T: Transport> Read for AuthenticatedConnection<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.transport.read(buf)
    }
}

impl<T: Transport> Write for AuthenticatedConnection<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.transport.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.transport.flush()
    }
}

// Upgrades an outbound connection: the caller already knows the
// expected remote identity.
pub async fn upgrade_outbound<T: Transport>(
    transport: T,
    local_id: PeerIdentity,
    local_priv: SecretKey,
    remote_id: PeerIdentity,
) -> Result<AuthenticatedConnection<T>, HandshakeError> {
    upgrade_outbound_cancellable(transport, local_id, local_priv, remote_id, std::future::pending())
        .await
}

// As upgrade_outbound, but aborts with HandshakeError::Cancelled if
// cancel resolves before the handshake completes, closing the transport
// first.
pub async fn upgrade_outbound_cancellable<T, C>(
    transport: T,
    local_id: PeerIdentity,
    local_priv: SecretKey,
    remote_id: PeerIdentity,
    cancel: C,
) -> Result<AuthenticatedConnection<T>, HandshakeError>
where
    T: Transport,
    C: Future<Output = ()>,
{
    let closer = transport
        .closer()
        .map_err(|e| HandshakeError::io_at("upgrade_outbound", e))?;

    let local_for_blocking = local_id.clone();
    let handle = tokio::task::spawn_blocking(move || {
        run_initiator(transport, local_for_blocking, local_priv, remote_id)
    });

    tokio::pin!(cancel);
    tokio::select! {
        outcome = handle => resolve_outbound(outcome, local_id),
        _ = &mut cancel => {
            tracing::warn!(role = "initiator", "handshake cancelled");
            let _ = closer.close();
            Err(HandshakeError::Cancelled)
        }
    }
}

fn resolve_outbound<T: Transport>(
    outcome: Result<Result<(T, PeerIdentity), HandshakeError>, tokio::task::JoinError>,
    local_id: PeerIdentity,
) -> Result<AuthenticatedConnection<T>, HandshakeError> {
    match outcome {
        Ok(Ok((transport, remote_identity))) => {
            tracing::debug!(role = "initiator", "upgrade succeeded");
            Ok(AuthenticatedConnection {
                transport,
                local_identity: local_id,
                remote_identity,
            })
        }
        Ok(Err(err)) => {
            tracing::warn!(role = "initiator", error = %err, "upgrade failed");
            Err(err)
        }
        Err(_join_error) => Err(HandshakeError::Cancelled),
    }
}

fn run_initiator<T: Transport>(
    mut transport: T,
    local_id: PeerIdentity,
    local_priv: SecretKey,
    remote_id: PeerIdentity,
) -> Result<(T, PeerIdentity), HandshakeError> {
    let initiator = Initiator::<Init>::new(local_id, local_priv, remote_id);
    let result = (|| {
        let initiator = initiator.send_act1(&mut transport)?;
        let initiator = initiator.recv_act2(&mut transport)?;
        let initiator = initiator.send_act3(&mut transport)?;
        Ok::<_, HandshakeError>(initiator.remote_identity().clone())
    })();

    match result {
        Ok(remote_identity) => Ok((transport, remote_identity)),
        Err(err) => {
            let _ = transport.close();
            Err(err)
        }
    }
}

// Upgrades an inbound connection: the remote identity is not known
// until act 1 arrives.
pub async fn upgrade_inbound<T: Transport>(
    transport: T,
    local_id: PeerIdentity,
    local_priv: SecretKey,
) -> Result<AuthenticatedConnection<T>, HandshakeError> {
    upgrade_inbound_cancellable(transport, local_id, local_priv, std::future::pending()).await
}

pub async fn upgrade_inbound_cancellable<T, C>(
    transport: T,
    local_id: PeerIdentity,
    local_priv: SecretKey,
    cancel: C,
) -> Result<AuthenticatedConnection<T>, HandshakeError>
where
    T: Transport,
    C: Future<Output = ()>,
{
    let closer = transport
        .closer()
        .map_err(|e| HandshakeError::io_at("upgrade_inbound", e))?;

    let local_for_blocking = local_id.clone();
    let handle =
        tokio::task::spawn_blocking(move || run_responder(transport, local_for_blocking, local_priv));

    tokio::pin!(cancel);
    tokio::select! {
        outcome = handle => resolve_inbound(outcome, local_id),
        _ = &mut cancel => {
            tracing::warn!(role = "responder", "handshake cancelled");
            let _ = closer.close();
            Err(HandshakeError::Cancelled)
        }
    }
}

fn resolve_inbound<T: Transport>(
    outcome: Result<Result<(T, PeerIdentity), HandshakeError>, tokio::task::JoinError>,
    local_id: PeerIdentity,
) -> Result<AuthenticatedConnection<T>, HandshakeError> {
    match outcome {
        Ok(Ok((transport, remote_identity))) => {
            tracing::debug!(role = "responder", "upgrade succeeded");
            Ok(AuthenticatedConnection {
                transport,
                local_identity: local_id,
                remote_identity,
            })
        }
        Ok(Err(err)) => {
            tracing::warn!(role = "responder", error = %err, "upgrade failed");
            Err(err)
        }
        Err(_join_error) => Err(HandshakeError::Cancelled),
    }
}

fn run_responder<T: Transport>(
    mut transport: T,
    local_id: PeerIdentity,
    local_priv: SecretKey,
) -> Result<(T, PeerIdentity), HandshakeError> {
    let responder = Responder::<AwaitingAct1>::new(local_id, local_priv);
    let result = (|| {
        let responder = responder.recv_act1_send_act2(&mut transport)?;
        let responder = responder.recv_act3(&mut transport)?;
        Ok::<_, HandshakeError>(responder.remote_identity().clone())
    })();

    match result {
        Ok(remote_identity) => Ok((transport, remote_identity)),
        Err(err) => {
            let _ = transport.close();
            Err(err)
        }
    }
}
