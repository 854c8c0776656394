//! UDP discovery of the supercomponent
//!
//! Module side:
//! `Idle -> (DISCOVER{name}) -> AwaitingResponse -> (RESPONSE{info}) -> Discovered`,
//! giving up after the configured number of attempts.
//!
//! Supercomponent side: answer every DISCOVER on the well-known port. The
//! responder never pushes.

use crate::codec::{Decodable, Encodable};
use crate::envelope::Envelope;
use crate::error::{CodecError, DiscoveryError};
use crate::frame::{decode_datagram, encode_frame};
use crate::messages::DiscoverMessage;
use crate::types::ServerInformation;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Default UDP port for discovery
pub const DISCOVERY_PORT: u16 = 19751;

/// Maximum discovery datagram size
const MAX_MSG_SIZE: usize = 65536;

/// Module-side discovery settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Where DISCOVER is sent (broadcast by default)
    pub target: SocketAddr,
    /// Number of DISCOVER attempts before giving up
    pub attempts: u32,
    /// How long to wait for an answer per attempt
    pub attempt_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            target: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
            attempts: 5,
            attempt_timeout: Duration::from_secs(1),
        }
    }
}

impl DiscoveryConfig {
    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

/// Module-side discovery state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    AwaitingResponse { attempt: u32 },
    Discovered,
    GaveUp,
}

fn to_datagram(msg: &DiscoverMessage) -> Vec<u8> {
    encode_frame(&Envelope::from_payload(msg).to_bytes())
}

fn from_datagram(buf: &[u8]) -> Result<DiscoverMessage, CodecError> {
    let payload = decode_datagram(buf, MAX_MSG_SIZE)?;
    Envelope::from_bytes(payload)?.decode()
}

/// Finds the supercomponent for one module
pub struct DiscoveryClient {
    config: DiscoveryConfig,
    state: DiscoveryState,
}

impl DiscoveryClient {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            state: DiscoveryState::Idle,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Broadcast DISCOVER until a supercomponent answers or attempts run out.
    ///
    /// An empty address in the answer is replaced by the address the answer
    /// came from.
    pub async fn discover(&mut self, module_name: &str) -> Result<ServerInformation, DiscoveryError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;

        let request = to_datagram(&DiscoverMessage::Discover {
            module_name: module_name.to_string(),
        });
        let mut buf = vec![0u8; MAX_MSG_SIZE];

        for attempt in 1..=self.config.attempts {
            self.state = DiscoveryState::AwaitingResponse { attempt };
            debug!(
                "Discovery: DISCOVER \"{}\" to {} (attempt {}/{})",
                module_name, self.config.target, attempt, self.config.attempts
            );
            socket.send_to(&request, self.config.target).await?;

            let deadline = Instant::now() + self.config.attempt_timeout;
            while let Ok(received) = timeout_at(deadline, socket.recv_from(&mut buf)).await {
                let (len, src) = received?;
                match from_datagram(&buf[..len]) {
                    Ok(DiscoverMessage::Response {
                        module_name: answered,
                        mut server,
                    }) if answered == module_name => {
                        if server.address.is_empty() {
                            server.address = src.ip().to_string();
                        }
                        self.state = DiscoveryState::Discovered;
                        info!(
                            "Discovery: supercomponent at {}:{} (managed level {})",
                            server.address, server.port, server.managed_level
                        );
                        return Ok(server);
                    }
                    Ok(other) => debug!("Discovery: ignoring {:?} from {}", other, src),
                    Err(e) => warn!("Discovery: malformed datagram from {}: {}", src, e),
                }
            }
        }

        self.state = DiscoveryState::GaveUp;
        warn!(
            "Discovery: no supercomponent answered \"{}\" after {} attempt(s)",
            module_name, self.config.attempts
        );
        Err(DiscoveryError::Timeout {
            attempts: self.config.attempts,
        })
    }
}

/// Answers DISCOVER requests on behalf of the supercomponent
pub struct DiscoveryResponder {
    socket: Arc<UdpSocket>,
    info: ServerInformation,
    exclusions: Vec<String>,
}

impl DiscoveryResponder {
    /// Bind the responder socket.
    pub async fn bind(
        addr: SocketAddr,
        info: ServerInformation,
        exclusions: Vec<String>,
    ) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;

        Ok(Self {
            socket: Arc::new(socket),
            info,
            exclusions,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// Serve requests until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_MSG_SIZE];
        info!(
            "Discovery: answering on {} (managed level {})",
            self.socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            self.info.managed_level
        );

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => self.handle(&buf[..len], src).await,
                    Err(e) => error!("Discovery: receive error: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Discovery: responder stopped");
    }

    async fn handle(&self, datagram: &[u8], src: SocketAddr) {
        let module_name = match from_datagram(datagram) {
            Ok(DiscoverMessage::Discover { module_name }) => module_name,
            Ok(DiscoverMessage::Response { .. }) => return,
            Err(e) => {
                warn!("Discovery: malformed datagram from {}: {}", src, e);
                return;
            }
        };

        let server = self.info.as_seen_by(&module_name, &self.exclusions);
        info!(
            "Discovery: \"{}\" at {} -> managed level {}",
            module_name, src, server.managed_level
        );

        let reply = to_datagram(&DiscoverMessage::Response {
            module_name,
            server,
        });
        if let Err(e) = self.socket.send_to(&reply, src).await {
            warn!("Discovery: failed to answer {}: {}", src, e);
        }
    }
}
