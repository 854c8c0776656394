//! The coordinating process
//!
//! Owns the discovery responder, the connection acceptor and the scheduler,
//! each running as its own task over a shared module registry.

use crate::conference::ConferenceFactory;
use crate::config::Configuration;
use crate::connection::{ConnectionAcceptor, DEFAULT_HANDSHAKE_TIMEOUT, SUPERCOMPONENT_PORT};
use crate::discovery::{DiscoveryResponder, DISCOVERY_PORT};
use crate::error::{ConfigError, TaktError};
use crate::lifecycle::DEFAULT_CID;
use crate::registry::ModuleRegistry;
use crate::scheduler::{time_slice_us, Scheduler, SchedulerConfig, SchedulerEvent};
use crate::types::{ManagedLevel, ModuleState, ServerInformation};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const KEY_SHIFT: &str = "supercomponent.pulseshift.shift";
pub const KEY_ACK_TIMEOUT: &str = "supercomponent.pulsetimeack.timeout";
pub const KEY_ACK_YIELD: &str = "supercomponent.pulsetimeack.yield";
pub const KEY_EXCLUDE: &str = "supercomponent.pulsetimeack.exclude";

/// Supercomponent settings
#[derive(Debug, Clone)]
pub struct SupercomponentConfig {
    pub cid: u8,
    pub frequency: f64,
    pub managed_level: ManagedLevel,
    /// Interface for the TCP and discovery sockets
    pub bind_address: IpAddr,
    /// Address announced to modules; empty means "where the answer came from"
    pub advertised_address: String,
    /// TCP port for module connections (0 picks a free port)
    pub port: u16,
    pub discovery_port: u16,
    /// Modules that always run unmanaged
    pub exclusions: Vec<String>,
    pub shift: Duration,
    pub ack_timeout: Duration,
    pub ack_yield: Duration,
    pub max_modules: usize,
    pub handshake_timeout: Duration,
    /// Store served to modules during the handshake
    pub configuration: Configuration,
}

impl Default for SupercomponentConfig {
    fn default() -> Self {
        let scheduling = SchedulerConfig::default();
        Self {
            cid: DEFAULT_CID,
            frequency: scheduling.frequency,
            managed_level: ManagedLevel::None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertised_address: String::new(),
            port: SUPERCOMPONENT_PORT,
            discovery_port: DISCOVERY_PORT,
            exclusions: Vec::new(),
            shift: scheduling.shift,
            ack_timeout: scheduling.ack_timeout,
            ack_yield: scheduling.ack_yield,
            max_modules: 64,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            configuration: Configuration::new(),
        }
    }
}

impl SupercomponentConfig {
    /// Take scheduling parameters from the `supercomponent.` keys of the store.
    pub fn from_configuration(configuration: Configuration) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            shift: Duration::from_micros(configuration.get_or(KEY_SHIFT, 10_000u64)?),
            ack_timeout: Duration::from_millis(configuration.get_or(KEY_ACK_TIMEOUT, 1_000u64)?),
            ack_yield: Duration::from_micros(configuration.get_or(KEY_ACK_YIELD, 5_000u64)?),
            exclusions: configuration.get_list(KEY_EXCLUDE),
            configuration,
            ..defaults
        })
    }

    pub fn with_cid(mut self, cid: u8) -> Self {
        self.cid = cid;
        self
    }

    pub fn with_frequency(mut self, frequency: f64) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_managed_level(mut self, level: ManagedLevel) -> Self {
        self.managed_level = level;
        self
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_advertised_address(mut self, address: impl Into<String>) -> Self {
        self.advertised_address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    pub fn with_exclusions(mut self, exclusions: Vec<String>) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn with_shift(mut self, shift: Duration) -> Self {
        self.shift = shift;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_ack_yield(mut self, pause: Duration) -> Self {
        self.ack_yield = pause;
        self
    }

    pub fn with_max_modules(mut self, max: usize) -> Self {
        self.max_modules = max;
        self
    }

    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_level(self.managed_level)
            .with_frequency(self.frequency)
            .with_shift(self.shift)
            .with_ack_timeout(self.ack_timeout)
            .with_ack_yield(self.ack_yield)
    }
}

/// A running supercomponent
pub struct Supercomponent {
    server: ServerInformation,
    connection_addr: SocketAddr,
    discovery_addr: SocketAddr,
    registry: Arc<ModuleRegistry>,
    state: ModuleState,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Supercomponent {
    /// Bind every socket and start the discovery, connection and scheduling
    /// tasks.
    pub async fn start(
        config: SupercomponentConfig,
        conference: ConferenceFactory,
        events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    ) -> Result<Self, TaktError> {
        if time_slice_us(config.frequency).is_none() {
            return Err(TaktError::InvalidFrequency(config.frequency));
        }
        let conference = Arc::new(conference.join(config.cid).await?);
        let registry = Arc::new(ModuleRegistry::new());

        let acceptor = ConnectionAcceptor::bind(
            SocketAddr::new(config.bind_address, config.port),
            Arc::new(config.configuration.clone()),
            registry.clone(),
            config.max_modules,
            config.handshake_timeout,
        )
        .await?;
        let connection_addr = acceptor.local_addr()?;

        let server = ServerInformation::new(
            config.advertised_address.clone(),
            connection_addr.port(),
            config.managed_level,
        );
        let responder = DiscoveryResponder::bind(
            SocketAddr::new(config.bind_address, config.discovery_port),
            server.clone(),
            config.exclusions.clone(),
        )
        .await?;
        let discovery_addr = responder.local_addr()?;

        let mut scheduler = Scheduler::new(config.scheduler_config(), registry.clone()).with_conference(conference);
        if let Some(events) = events {
            scheduler = scheduler.with_events(events);
        }

        let (shutdown, watcher) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(scheduler.run(watcher.clone())),
            tokio::spawn(acceptor.run(watcher.clone())),
            tokio::spawn(responder.run(watcher)),
        ];

        info!(
            "Supercomponent: running on cid {} at {} Hz, managed level {} (tcp {}, discovery {})",
            config.cid, config.frequency, config.managed_level, connection_addr, discovery_addr
        );
        if !config.exclusions.is_empty() {
            info!("Supercomponent: unmanaged modules: {}", config.exclusions.join(", "));
        }

        Ok(Self {
            server,
            connection_addr,
            discovery_addr,
            registry,
            state: ModuleState::Running,
            shutdown,
            tasks,
        })
    }

    /// What discovery announces (before exclusions and address fill-in)
    pub fn server_information(&self) -> &ServerInformation {
        &self.server
    }

    pub fn connection_addr(&self) -> SocketAddr {
        self.connection_addr
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Leave RUNNING: modules receive NOT_RUNNING, then every task is joined.
    pub async fn shutdown(mut self) {
        info!("Supercomponent: shutting down");
        self.state = ModuleState::NotRunning;
        self.shutdown.send_replace(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Supercomponent: task ended abnormally: {}", e);
            }
        }
        info!("Supercomponent: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_store() {
        let store = Configuration::parse(
            "supercomponent.pulseshift.shift = 2000\n\
             supercomponent.pulsetimeack.timeout = 250\n\
             supercomponent.pulsetimeack.exclude = cockpit, monitor\n\
             global.x = 1",
        );
        let config = SupercomponentConfig::from_configuration(store).unwrap();

        assert_eq!(config.shift, Duration::from_micros(2000));
        assert_eq!(config.ack_timeout, Duration::from_millis(250));
        assert_eq!(config.ack_yield, Duration::from_micros(5000));
        assert_eq!(config.exclusions, vec!["cockpit", "monitor"]);
        assert!(config.configuration.contains("global.x"));
    }

    #[test]
    fn test_config_rejects_bad_number() {
        let store = Configuration::parse("supercomponent.pulsetimeack.timeout = soon");
        assert!(matches!(
            SupercomponentConfig::from_configuration(store),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_non_positive_frequency() {
        let config = SupercomponentConfig::default().with_frequency(-2.0);
        let started = Supercomponent::start(config, ConferenceFactory::Local(Default::default()), None).await;
        assert!(matches!(started, Err(TaktError::InvalidFrequency(_))));
    }

    #[test]
    fn test_scheduler_config() {
        let config = SupercomponentConfig::default()
            .with_managed_level(ManagedLevel::PulseShift)
            .with_frequency(20.0)
            .with_shift(Duration::from_millis(3));
        let scheduling = config.scheduler_config();
        assert_eq!(scheduling.level, ManagedLevel::PulseShift);
        assert_eq!(scheduling.period(), Duration::from_millis(50));
        assert_eq!(scheduling.shift, Duration::from_millis(3));
    }
}
