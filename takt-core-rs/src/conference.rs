//! Conference bus: publish/subscribe of envelopes by conference id
//!
//! Every participant joined to a CID receives every envelope published on
//! it, its own included. The bus carries no sender identity.
//!
//! Two backends:
//! - UDP multicast on `225.0.0.<cid>:12175` for separate processes
//! - an in-process [`LocalHub`] for tests and single-process deployments

use crate::codec::{Decodable, Encodable};
use crate::envelope::Envelope;
use crate::error::{CodecError, TaktError};
use crate::frame::{decode_datagram, encode_frame, DEFAULT_MAX_FRAME_SIZE};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// UDP port shared by all multicast conferences
pub const CONFERENCE_PORT: u16 = 12175;

/// Largest datagram the bus will send or receive
const MAX_DATAGRAM_SIZE: usize = 65507;

/// Queue depth of an in-process conference
const LOCAL_QUEUE_DEPTH: usize = 1024;

/// Callback invoked for every delivered envelope
pub type Listener = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Multicast group for a conference id.
pub fn multicast_group(cid: u8) -> Result<Ipv4Addr, TaktError> {
    if !(2..=254).contains(&cid) {
        return Err(TaktError::InvalidConferenceId(cid));
    }
    Ok(Ipv4Addr::new(225, 0, 0, cid))
}

/// In-process conference registry
///
/// Cloning shares the same set of conferences.
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    groups: Arc<Mutex<HashMap<u8, broadcast::Sender<Arc<Vec<u8>>>>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, cid: u8) -> broadcast::Sender<Arc<Vec<u8>>> {
        self.groups
            .lock()
            .entry(cid)
            .or_insert_with(|| broadcast::channel(LOCAL_QUEUE_DEPTH).0)
            .clone()
    }
}

/// How a process reaches its conference
#[derive(Debug, Clone, Default)]
pub enum ConferenceFactory {
    /// UDP multicast (separate processes)
    #[default]
    Multicast,
    /// In-process hub
    Local(LocalHub),
}

impl ConferenceFactory {
    pub async fn join(&self, cid: u8) -> Result<Conference, TaktError> {
        match self {
            ConferenceFactory::Multicast => Conference::join(cid).await,
            ConferenceFactory::Local(hub) => Conference::join_local(hub, cid),
        }
    }
}

enum Outbound {
    Multicast {
        socket: Arc<UdpSocket>,
        group: SocketAddr,
    },
    Local(broadcast::Sender<Arc<Vec<u8>>>),
}

/// Handle on one joined conference
pub struct Conference {
    cid: u8,
    outbound: Outbound,
    listener: Arc<Mutex<Option<Listener>>>,
    receiver: JoinHandle<()>,
}

impl Conference {
    /// Join the multicast conference `cid`.
    pub async fn join(cid: u8) -> Result<Self, TaktError> {
        let group = multicast_group(cid)?;
        let socket = multicast_socket(group, CONFERENCE_PORT)?;
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        let listener: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));

        let receiver = tokio::spawn(receive_multicast(socket.clone(), listener.clone(), cid));
        info!("Conference: joined {} (cid={})", group, cid);

        Ok(Self {
            cid,
            outbound: Outbound::Multicast {
                socket,
                group: SocketAddr::V4(SocketAddrV4::new(group, CONFERENCE_PORT)),
            },
            listener,
            receiver,
        })
    }

    /// Join conference `cid` on an in-process hub.
    ///
    /// Must be called from within a tokio runtime.
    pub fn join_local(hub: &LocalHub, cid: u8) -> Result<Self, TaktError> {
        multicast_group(cid)?;
        let sender = hub.channel(cid);
        let listener: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));

        let receiver = tokio::spawn(receive_local(sender.subscribe(), listener.clone(), cid));
        debug!("Conference: joined local cid={}", cid);

        Ok(Self {
            cid,
            outbound: Outbound::Local(sender),
            listener,
            receiver,
        })
    }

    pub fn cid(&self) -> u8 {
        self.cid
    }

    /// Install the callback for delivered envelopes, replacing any previous one.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Arc::new(listener));
    }

    pub fn clear_listener(&self) {
        *self.listener.lock() = None;
    }

    /// Publish an envelope to every participant, this one included.
    ///
    /// The sent timestamp is stamped here if the sender left it unset.
    pub async fn publish(&self, mut envelope: Envelope) -> Result<(), TaktError> {
        envelope.stamp_sent_if_unset();
        let frame = encode_frame(&envelope.to_bytes());

        let max = match &self.outbound {
            Outbound::Multicast { .. } => MAX_DATAGRAM_SIZE,
            Outbound::Local(_) => DEFAULT_MAX_FRAME_SIZE,
        };
        if frame.len() > max {
            warn!(
                "Conference: refusing {} byte envelope (type {}) on cid={}, limit {}",
                frame.len(),
                envelope.data_type(),
                self.cid,
                max
            );
            return Err(CodecError::FrameTooLarge {
                size: frame.len(),
                max,
            }
            .into());
        }

        match &self.outbound {
            Outbound::Multicast { socket, group } => {
                socket.send_to(&frame, group).await?;
            }
            Outbound::Local(sender) => {
                // Our own subscription keeps the channel open.
                let _ = sender.send(Arc::new(frame));
            }
        }
        Ok(())
    }
}

impl Drop for Conference {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Decode a frame and hand it to the listener without holding the lock.
fn deliver(listener: &Mutex<Option<Listener>>, frame: &[u8], cid: u8) {
    let envelope = decode_datagram(frame, DEFAULT_MAX_FRAME_SIZE)
        .map_err(|e| e.to_string())
        .and_then(|payload| Envelope::from_bytes(payload).map_err(|e| e.to_string()));

    let mut envelope = match envelope {
        Ok(env) => env,
        Err(e) => {
            warn!("Conference: dropping malformed record on cid={}: {}", cid, e);
            return;
        }
    };
    envelope.stamp_received();

    let callback = listener.lock().clone();
    if let Some(callback) = callback {
        callback(envelope);
    }
}

async fn receive_multicast(socket: Arc<UdpSocket>, listener: Arc<Mutex<Option<Listener>>>, cid: u8) {
    let mut buf = vec![0u8; 65536];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, _src)) => deliver(&listener, &buf[..len], cid),
            Err(e) => {
                error!("Conference: receive error on cid={}: {}", cid, e);
            }
        }
    }
}

async fn receive_local(
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    listener: Arc<Mutex<Option<Listener>>>,
    cid: u8,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => deliver(&listener, &frame, cid),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Conference: listener on cid={} lagged, {} envelope(s) lost", cid, missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    // Binding the group address filters out other groups sharing the port.
    #[cfg(unix)]
    let bind = SocketAddr::V4(SocketAddrV4::new(group, port));
    #[cfg(not(unix))]
    let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&bind.into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    #[cfg(target_os = "linux")]
    socket.set_multicast_all_v4(false)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}
