//! Module lifecycle: setup, time-triggered execution and tear-down
//!
//! A module moves `NotRunning -> Running -> NotRunning`. `setup` finds the
//! supercomponent, connects, receives the module's configuration and joins
//! the conference. `run` then calls the module's step whenever the managed
//! level allows it, until the supercomponent sends NOT_RUNNING, the
//! connection drops, a stop is requested or the step fails.

use crate::conference::{Conference, ConferenceFactory};
use crate::config::Configuration;
use crate::connection::{ModuleConnection, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::discovery::{DiscoveryClient, DiscoveryConfig};
use crate::envelope::{Envelope, TimeStamp};
use crate::error::{CodecError, ConnectionError, TaktError};
use crate::messages::{data_type, ModuleStateMessage, Pulse, PulseAck};
use crate::scheduler::{stopped, time_slice_us};
use crate::types::{ExitCode, ManagedLevel, ModuleDescriptor, ModuleState, ServerInformation};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default conference id
pub const DEFAULT_CID: u8 = 111;

/// Error type a step may return
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

/// Application logic driven by the runtime
pub trait TimeTriggered {
    /// Called once per granted time slice.
    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), StepError>;
}

/// What a step sees and produces
pub struct StepContext<'a> {
    configuration: &'a Configuration,
    received: Vec<Envelope>,
    outbox: &'a mut Vec<Envelope>,
    pulse: Option<Pulse>,
    time: TimeStamp,
}

impl StepContext<'_> {
    /// Configuration delivered by the supercomponent
    pub fn configuration(&self) -> &Configuration {
        self.configuration
    }

    /// Envelopes delivered on the conference since the previous step
    pub fn received(&self) -> &[Envelope] {
        &self.received
    }

    pub fn take_received(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.received)
    }

    /// Queue an envelope for the conference.
    ///
    /// Under PULSE_TIME_ACK it travels inside this tick's ack, otherwise it
    /// is published right after the step.
    pub fn publish(&mut self, envelope: Envelope) {
        self.outbox.push(envelope);
    }

    /// The pulse that triggered this step, when the module is managed
    pub fn pulse(&self) -> Option<&Pulse> {
        self.pulse.as_ref()
    }

    /// Time of this step: the pulse's time when managed, wall clock otherwise
    pub fn time(&self) -> TimeStamp {
        self.time
    }
}

/// Module runtime settings
#[derive(Debug, Clone)]
pub struct ModuleOptions {
    pub name: String,
    pub instance_id: Option<u32>,
    pub version: Option<String>,
    pub cid: u8,
    /// Own execution frequency in Hz
    pub frequency: f64,
    pub discovery: DiscoveryConfig,
    pub handshake_timeout: Duration,
    pub conference: ConferenceFactory,
}

impl ModuleOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_id: None,
            version: None,
            cid: DEFAULT_CID,
            frequency: 1.0,
            discovery: DiscoveryConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            conference: ConferenceFactory::default(),
        }
    }

    pub fn with_instance(mut self, id: u32) -> Self {
        self.instance_id = Some(id);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_cid(mut self, cid: u8) -> Self {
        self.cid = cid;
        self
    }

    pub fn with_frequency(mut self, frequency: f64) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_conference(mut self, conference: ConferenceFactory) -> Self {
        self.conference = conference;
        self
    }

    pub fn descriptor(&self) -> ModuleDescriptor {
        let mut descriptor = ModuleDescriptor::new(self.name.clone());
        descriptor.instance_id = self.instance_id;
        if let Some(version) = &self.version {
            descriptor = descriptor.with_version(version.clone());
        }
        descriptor
    }

    fn period_us(&self) -> Result<u64, TaktError> {
        time_slice_us(self.frequency)
            .map(u64::from)
            .ok_or(TaktError::InvalidFrequency(self.frequency))
    }
}

/// Requests a running module to stop after its current step
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Why the runtime woke up
enum Wake {
    Step(Option<Pulse>),
    Stop,
    Lost,
}

/// Everything that exists between `setup` and tear-down
struct Session {
    server: ServerInformation,
    configuration: Configuration,
    connection: ModuleConnection,
    conference: Conference,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    outbox: Vec<Envelope>,
    ticker: Interval,
    period_us: u64,
    pending_ack: Option<u32>,
    accumulated_us: u64,
}

/// Drives one module through its lifecycle
pub struct ModuleRuntime {
    options: ModuleOptions,
    descriptor: ModuleDescriptor,
    state: ModuleState,
    session: Option<Session>,
    stop: Arc<watch::Sender<bool>>,
}

impl ModuleRuntime {
    pub fn new(options: ModuleOptions) -> Self {
        let descriptor = options.descriptor();
        Self {
            options,
            descriptor,
            state: ModuleState::NotRunning,
            session: None,
            stop: Arc::new(watch::channel(false).0),
        }
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Configuration received during setup
    pub fn configuration(&self) -> Option<&Configuration> {
        self.session.as_ref().map(|s| &s.configuration)
    }

    pub fn server_information(&self) -> Option<&ServerInformation> {
        self.session.as_ref().map(|s| &s.server)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    /// Discover the supercomponent, connect, receive the configuration and
    /// join the conference.
    pub async fn setup(&mut self) -> Result<(), TaktError> {
        let period_us = self.options.period_us()?;
        let mut discovery = DiscoveryClient::new(self.options.discovery.clone());
        let server = discovery.discover(&self.descriptor.name).await?;

        let (connection, configuration) =
            ModuleConnection::connect(&server, &self.descriptor, self.options.handshake_timeout).await?;

        let conference = self.options.conference.join(self.options.cid).await?;
        let (tx, inbox) = mpsc::unbounded_channel();
        conference.set_listener(move |envelope| {
            let _ = tx.send(envelope);
        });

        let mut ticker = interval(Duration::from_micros(period_us));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Module: {} running (managed level {}, cid {}, {} Hz)",
            self.descriptor, server.managed_level, self.options.cid, self.options.frequency
        );

        self.session = Some(Session {
            server,
            configuration,
            connection,
            conference,
            inbox,
            outbox: Vec::new(),
            ticker,
            period_us,
            pending_ack: None,
            accumulated_us: 0,
        });
        self.state = ModuleState::Running;
        Ok(())
    }

    /// Execute `module` until told to stop.
    pub async fn run<M: TimeTriggered>(&mut self, module: &mut M) -> ExitCode {
        let Some(mut session) = self.session.take() else {
            error!("Module: {} run without setup", self.descriptor);
            return ExitCode::NoSetup;
        };
        let mut stop = self.stop.subscribe();

        let code = loop {
            let pulse = match session.next_wake(&mut stop).await {
                Wake::Step(pulse) => pulse,
                Wake::Stop => break ExitCode::Okay,
                Wake::Lost => {
                    warn!("Module: {} lost its supercomponent", self.descriptor);
                    break ExitCode::NoSupercomponent;
                }
            };

            let mut received = Vec::new();
            while let Ok(envelope) = session.inbox.try_recv() {
                received.push(envelope);
            }
            let outcome = {
                let mut ctx = StepContext {
                    configuration: &session.configuration,
                    received,
                    outbox: &mut session.outbox,
                    time: pulse.as_ref().map(|p| p.real_time).unwrap_or_else(TimeStamp::now),
                    pulse,
                };
                catch_unwind(AssertUnwindSafe(|| module.step(&mut ctx)))
            };

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Module: {} step failed: {}", self.descriptor, e);
                    break ExitCode::ExceptionCaught;
                }
                Err(_) => {
                    error!("Module: {} step panicked", self.descriptor);
                    break ExitCode::SeriousError;
                }
            }

            match session.flush().await {
                Ok(()) => {}
                Err(e) if is_oversized(&e) => {
                    error!("Module: {} produced output that cannot be sent: {}", self.descriptor, e);
                    break ExitCode::ExceptionCaught;
                }
                Err(e) => {
                    warn!("Module: {} could not deliver its output: {}", self.descriptor, e);
                    break ExitCode::NoSupercomponent;
                }
            }
        };

        self.tear_down(session, code).await;
        code
    }

    async fn tear_down(&mut self, session: Session, code: ExitCode) {
        session.conference.clear_listener();
        if let Err(e) = session.connection.close(code).await {
            debug!("Module: {} exit not delivered: {}", self.descriptor, e);
        }
        self.state = ModuleState::NotRunning;
        info!("Module: {} stopped ({})", self.descriptor, code);
    }
}

impl Session {
    fn acking(&self) -> bool {
        self.server.managed_level == ManagedLevel::PulseTimeAck
    }

    async fn next_wake(&mut self, stop: &mut watch::Receiver<bool>) -> Wake {
        let pulsed = self.server.managed_level.is_pulsed();
        loop {
            tokio::select! {
                biased;
                _ = stopped(stop) => return Wake::Stop,
                received = self.connection.recv() => match received {
                    None => return Wake::Lost,
                    Some(envelope) => {
                        if let Some(wake) = self.on_control(envelope).await {
                            return wake;
                        }
                    }
                },
                _ = self.ticker.tick(), if !pulsed => return Wake::Step(None),
            }
        }
    }

    /// Handle a message from the supercomponent.
    async fn on_control(&mut self, envelope: Envelope) -> Option<Wake> {
        match envelope.data_type() {
            data_type::PULSE => {
                let pulse = match envelope.decode::<Pulse>() {
                    Ok(pulse) => pulse,
                    Err(e) => {
                        warn!("Module: malformed pulse: {}", e);
                        return None;
                    }
                };
                if !self.server.managed_level.is_pulsed() {
                    return None;
                }

                if due(&mut self.accumulated_us, pulse.nominal_time_slice_us, self.period_us) {
                    if self.acking() {
                        self.pending_ack = Some(pulse.tick);
                    }
                    return Some(Wake::Step(Some(pulse)));
                }

                // Not our turn; the scheduler still waits for an answer.
                if self.acking() {
                    let ack = PulseAck {
                        tick: pulse.tick,
                        envelopes: Vec::new(),
                    };
                    if self.connection.send(Envelope::from_payload(&ack)).await.is_err() {
                        return Some(Wake::Lost);
                    }
                }
                None
            }
            data_type::MODULE_STATE => match envelope.decode::<ModuleStateMessage>() {
                Ok(msg) if msg.state == ModuleState::NotRunning => {
                    info!("Module: supercomponent requested NOT_RUNNING");
                    Some(Wake::Stop)
                }
                Ok(_) => None,
                Err(e) => {
                    warn!("Module: malformed state message: {}", e);
                    None
                }
            },
            other => {
                debug!("Module: ignoring type {} from supercomponent", other);
                None
            }
        }
    }

    /// Hand this step's output over: inside the ack under PULSE_TIME_ACK,
    /// straight onto the conference otherwise.
    async fn flush(&mut self) -> Result<(), TaktError> {
        let envelopes = std::mem::take(&mut self.outbox);

        if let Some(tick) = self.pending_ack.take() {
            let ack = PulseAck { tick, envelopes };
            self.connection.send(Envelope::from_payload(&ack)).await?;
            return Ok(());
        }

        for envelope in envelopes {
            self.conference.publish(envelope).await?;
        }
        Ok(())
    }
}

fn is_oversized(error: &TaktError) -> bool {
    matches!(
        error,
        TaktError::Codec(CodecError::FrameTooLarge { .. })
            | TaktError::Connection(ConnectionError::Codec(CodecError::FrameTooLarge { .. }))
    )
}

/// Accumulate one nominal slice and report whether the module's own period
/// has been reached.
fn due(accumulated_us: &mut u64, slice_us: u32, period_us: u64) -> bool {
    *accumulated_us += u64::from(slice_us);
    if period_us == 0 || *accumulated_us >= period_us {
        *accumulated_us %= period_us.max(1);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl TimeTriggered for Noop {
        fn step(&mut self, _ctx: &mut StepContext<'_>) -> Result<(), StepError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_without_setup() {
        let mut runtime = ModuleRuntime::new(ModuleOptions::new("idle"));
        assert_eq!(runtime.state(), ModuleState::NotRunning);
        assert_eq!(runtime.run(&mut Noop).await, ExitCode::NoSetup);
        assert!(runtime.configuration().is_none());
    }

    #[test]
    fn test_slower_module_skips_pulses() {
        // 10 Hz supercomponent, 2 Hz module: every fifth pulse.
        let mut acc = 0;
        let runs: Vec<bool> = (0..10).map(|_| due(&mut acc, 100_000, 500_000)).collect();
        assert_eq!(
            runs,
            vec![false, false, false, false, true, false, false, false, false, true]
        );
    }

    #[test]
    fn test_faster_module_runs_every_pulse() {
        let mut acc = 0;
        assert!((0..5).all(|_| due(&mut acc, 100_000, 30_000)));
        assert!(acc < 30_000);
    }

    #[test]
    fn test_options_descriptor() {
        let options = ModuleOptions::new("proxy").with_instance(2).with_version("1.2.0");
        let md = options.descriptor();
        assert_eq!(md.to_string(), "proxy:2");
        assert_eq!(md.version, "1.2.0");
        assert_eq!(options.period_us().unwrap(), 1_000_000);
    }

    #[test]
    fn test_fractional_module_frequency() {
        // 10 Hz supercomponent, 2.5 Hz module: every fourth pulse.
        let period = ModuleOptions::new("slow").with_frequency(2.5).period_us().unwrap();
        assert_eq!(period, 400_000);
        let mut acc = 0;
        let runs = (0..8).filter(|_| due(&mut acc, 100_000, period)).count();
        assert_eq!(runs, 2);
    }

    #[test]
    fn test_oversized_output_is_a_step_error() {
        let too_large = CodecError::FrameTooLarge { size: 70_000, max: 65_507 };
        assert!(is_oversized(&TaktError::Codec(too_large)));
        let too_large = CodecError::FrameTooLarge { size: 20, max: 16 };
        assert!(is_oversized(&TaktError::Connection(ConnectionError::Codec(too_large))));
        assert!(!is_oversized(&TaktError::Connection(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_setup_rejects_non_positive_frequency() {
        let mut runtime = ModuleRuntime::new(ModuleOptions::new("stuck").with_frequency(0.0));
        assert!(matches!(
            runtime.setup().await,
            Err(TaktError::InvalidFrequency(f)) if f == 0.0
        ));
        assert_eq!(runtime.state(), ModuleState::NotRunning);
    }
}
