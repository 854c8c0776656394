//! TCP connection between a module and the supercomponent
//!
//! Handshake: the module sends its `ModuleDescriptor`, the supercomponent
//! answers with the module's scoped `Configuration`. Afterwards the
//! supercomponent pushes pulses and state commands, and the module answers
//! with pulse acks and finally a `ModuleExit`.
//!
//! Every message is one framed envelope. A session is registered only after
//! the configuration has been written, so no pulse can overtake it.

use crate::codec::{Decodable, Encodable};
use crate::config::Configuration;
use crate::envelope::Envelope;
use crate::error::ConnectionError;
use crate::frame::{read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};
use crate::messages::{data_type, ModuleExit, PulseAck};
use crate::registry::{ModuleHandle, ModuleRegistry};
use crate::types::{ExitCode, ModuleDescriptor, ServerInformation};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Default TCP port of the supercomponent
pub const SUPERCOMPONENT_PORT: u16 = 19866;

/// Default time allowed for either side of the handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for sessions before aborting them
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Read one envelope from a stream, stamping its receive time.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<Envelope>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, DEFAULT_MAX_FRAME_SIZE).await? {
        Some(payload) => {
            let mut envelope = Envelope::from_bytes(&payload)?;
            envelope.stamp_received();
            Ok(Some(envelope))
        }
        None => Ok(None),
    }
}

/// Write one envelope to a stream, stamping its send time if unset.
pub async fn write_envelope<W>(writer: &mut W, envelope: &mut Envelope) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    envelope.stamp_sent_if_unset();
    write_frame(writer, &envelope.to_bytes(), DEFAULT_MAX_FRAME_SIZE).await
}

// ============================================================================
// Module side
// ============================================================================

/// Module end of the connection
pub struct ModuleConnection {
    descriptor: ModuleDescriptor,
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    reader: JoinHandle<()>,
}

impl ModuleConnection {
    /// Connect and perform the handshake. Returns the connection and the
    /// configuration the supercomponent sent for this module.
    pub async fn connect(
        server: &ServerInformation,
        descriptor: &ModuleDescriptor,
        handshake_timeout: Duration,
    ) -> Result<(Self, Configuration), ConnectionError> {
        let addr = format!("{}:{}", server.address, server.port);
        let stream = timeout(handshake_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout)??;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (mut read_half, mut writer) = stream.into_split();

        write_envelope(&mut writer, &mut Envelope::from_payload(descriptor)).await?;

        let reply = timeout(handshake_timeout, read_envelope(&mut read_half))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout)??
            .ok_or(ConnectionError::Closed)?;
        let configuration = reply.decode::<Configuration>().map_err(|e| {
            ConnectionError::Protocol(format!("expected configuration, got type {}: {}", reply.data_type(), e))
        })?;

        info!(
            "Connection: {} connected to {} ({} configuration entries)",
            descriptor,
            peer,
            configuration.len()
        );

        let (tx, inbound) = mpsc::unbounded_channel();
        let reader = tokio::spawn(forward_inbound(read_half, tx, descriptor.to_string()));

        Ok((
            Self {
                descriptor: descriptor.clone(),
                peer,
                writer,
                inbound,
                reader,
            },
            configuration,
        ))
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, mut envelope: Envelope) -> Result<(), ConnectionError> {
        write_envelope(&mut self.writer, &mut envelope).await
    }

    /// Next envelope from the supercomponent; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    /// Send `ModuleExit` and close the write side.
    pub async fn close(mut self, exit_code: ExitCode) -> Result<(), ConnectionError> {
        let result = self.send(Envelope::from_payload(&ModuleExit { exit_code })).await;
        let _ = self.writer.shutdown().await;
        debug!("Connection: {} closed ({})", self.descriptor, exit_code);
        result
    }
}

impl Drop for ModuleConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn forward_inbound(mut reader: OwnedReadHalf, tx: mpsc::UnboundedSender<Envelope>, name: String) {
    loop {
        match read_envelope(&mut reader).await {
            Ok(Some(envelope)) => {
                if tx.send(envelope).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("Connection: supercomponent closed the connection of {}", name);
                break;
            }
            Err(e) => {
                warn!("Connection: read error on {}: {}", name, e);
                break;
            }
        }
    }
}

// ============================================================================
// Supercomponent side
// ============================================================================

struct SessionContext {
    configuration: Arc<Configuration>,
    registry: Arc<ModuleRegistry>,
    handshake_timeout: Duration,
}

/// Why a module session ended
#[derive(Debug)]
enum SessionEnd {
    Exited(ExitCode),
    Closed,
    Failed(ConnectionError),
    Stopped,
}

/// Accepts module connections for the supercomponent
pub struct ConnectionAcceptor {
    listener: TcpListener,
    context: Arc<SessionContext>,
    limit: Arc<Semaphore>,
}

impl ConnectionAcceptor {
    pub async fn bind(
        addr: SocketAddr,
        configuration: Arc<Configuration>,
        registry: Arc<ModuleRegistry>,
        max_modules: usize,
        handshake_timeout: Duration,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            context: Arc::new(SessionContext {
                configuration,
                registry,
                handshake_timeout,
            }),
            limit: Arc::new(Semaphore::new(max_modules.max(1))),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept and serve sessions until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sessions = JoinSet::new();
        info!(
            "Connection: accepting modules on {}",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let Ok(permit) = self.limit.clone().try_acquire_owned() else {
                            warn!("Connection: rejecting {}, module limit reached", peer);
                            continue;
                        };
                        let context = self.context.clone();
                        sessions.spawn(async move {
                            let _permit = permit;
                            serve(context, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        error!("Connection: accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = done {
                        if e.is_panic() {
                            error!("Connection: session panicked: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(self.listener);
        let drain = async { while sessions.join_next().await.is_some() {} };
        if timeout(SESSION_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("Connection: {} session(s) did not close, aborting", sessions.len());
            sessions.abort_all();
        }
        debug!("Connection: acceptor stopped");
    }
}

async fn serve(context: Arc<SessionContext>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Connection: set_nodelay on {}: {}", peer, e);
    }
    let (mut read_half, mut write_half) = stream.into_split();

    let descriptor = match handshake(&context, &mut read_half, &mut write_half).await {
        Ok(descriptor) => descriptor,
        Err(e) => {
            warn!("Connection: handshake with {} failed: {}", peer, e);
            let _ = write_half.shutdown().await;
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    if let Err(e) = context.registry.register(ModuleHandle::new(descriptor.clone(), tx)) {
        warn!("Connection: {} from {}: {}", descriptor, peer, e);
        let _ = write_half.shutdown().await;
        return;
    }
    let mut writer = tokio::spawn(drain_outbound(write_half, rx, descriptor.to_string()));

    let end = loop {
        tokio::select! {
            read = read_envelope(&mut read_half) => match read {
                Ok(Some(envelope)) => {
                    if let Some(end) = dispatch(&context.registry, &descriptor, envelope) {
                        break end;
                    }
                }
                Ok(None) => break SessionEnd::Closed,
                Err(e) => break SessionEnd::Failed(e),
            },
            // The registry dropped our queue and the writer flushed it.
            _ = &mut writer => break SessionEnd::Stopped,
        }
    };

    match end {
        SessionEnd::Exited(code) => {
            context.registry.remove(&descriptor);
            info!("Connection: {} left ({})", descriptor, code);
        }
        SessionEnd::Closed => context.registry.handle_connection_lost(&descriptor),
        SessionEnd::Failed(e) => {
            warn!("Connection: {} read error: {}", descriptor, e);
            context.registry.handle_connection_lost(&descriptor);
        }
        SessionEnd::Stopped => {
            // No-op after stop_all; covers a failed write otherwise.
            context.registry.handle_connection_lost(&descriptor);
            debug!("Connection: session of {} stopped", descriptor);
            return;
        }
    }

    // Removal dropped the queue sender; let the writer finish.
    if timeout(context.handshake_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Read the descriptor, reject duplicates and send the scoped configuration.
async fn handshake(
    context: &SessionContext,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
) -> Result<ModuleDescriptor, ConnectionError> {
    let first = timeout(context.handshake_timeout, read_envelope(reader))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)??
        .ok_or(ConnectionError::Closed)?;
    let descriptor = first.decode::<ModuleDescriptor>().map_err(|e| {
        ConnectionError::Protocol(format!("expected module descriptor, got type {}: {}", first.data_type(), e))
    })?;

    if context.registry.contains(&descriptor) {
        return Err(ConnectionError::DuplicateModule(descriptor.to_string()));
    }

    let scoped = context.configuration.scoped_for(&descriptor);
    debug!(
        "Connection: sending {} configuration entries to {} (version {})",
        scoped.len(),
        descriptor,
        descriptor.version
    );
    write_envelope(writer, &mut Envelope::from_payload(&scoped)).await?;
    Ok(descriptor)
}

fn dispatch(registry: &ModuleRegistry, descriptor: &ModuleDescriptor, envelope: Envelope) -> Option<SessionEnd> {
    match envelope.data_type() {
        data_type::PULSE_ACK => match envelope.decode::<PulseAck>() {
            Ok(ack) => {
                trace!(
                    "Connection: ack from {} for tick {} ({} envelopes)",
                    descriptor,
                    ack.tick,
                    ack.envelopes.len()
                );
                registry.deliver_ack(descriptor, ack);
            }
            Err(e) => warn!("Connection: malformed ack from {}: {}", descriptor, e),
        },
        data_type::MODULE_EXIT => match envelope.decode::<ModuleExit>() {
            Ok(exit) => return Some(SessionEnd::Exited(exit.exit_code)),
            Err(e) => warn!("Connection: malformed exit from {}: {}", descriptor, e),
        },
        other => debug!("Connection: ignoring type {} from {}", other, descriptor),
    }
    None
}

async fn drain_outbound(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Envelope>, name: String) {
    while let Some(mut envelope) = rx.recv().await {
        if let Err(e) = write_envelope(&mut writer, &mut envelope).await {
            debug!("Connection: write to {} failed: {}", name, e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}
