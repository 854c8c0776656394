//! Managed-level scheduler
//!
//! Runs a fixed tick of `1 / frequency` on the supercomponent and decides
//! when each connected module executes:
//!
//! - `None`: membership tracking only
//! - `Pulse`: one pulse to every module per tick, no waiting
//! - `PulseShift`: module in slot `n` is pulsed `n * shift` after the tick start
//! - `PulseTimeAck`: modules are visited in join order; each is pulsed and
//!   awaited (bounded by the ack timeout) and the envelopes in its ack are
//!   published on the conference before the next module is pulsed
//!
//! When the scheduler stops, every module is sent NOT_RUNNING.

use crate::conference::Conference;
use crate::envelope::{Envelope, TimeStamp};
use crate::messages::{Pulse, PulseAck};
use crate::registry::{ModuleRegistry, ScheduledModule};
use crate::types::{ManagedLevel, ModuleDescriptor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Slice used when a scheduler is built with an unusable frequency
const DEFAULT_TIME_SLICE_US: u32 = 100_000;

/// Nominal time slice for `frequency` Hz, rounded to whole microseconds.
///
/// `None` unless the frequency is finite and positive.
pub fn time_slice_us(frequency: f64) -> Option<u32> {
    if !frequency.is_finite() || frequency <= 0.0 {
        return None;
    }
    let slice = (1_000_000.0 / frequency).round();
    Some(slice.clamp(1.0, f64::from(u32::MAX)) as u32)
}

/// Parse a frequency in Hz, accepting fractions and rejecting anything that
/// has no time slice.
pub fn parse_frequency(text: &str) -> Result<f64, String> {
    let frequency: f64 = text
        .trim()
        .parse()
        .map_err(|e| format!("{:?} is not a number: {}", text, e))?;
    match time_slice_us(frequency) {
        Some(_) => Ok(frequency),
        None => Err(format!("{} Hz is not a positive frequency", text)),
    }
}

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub level: ManagedLevel,
    /// Ticks per second
    pub frequency: f64,
    /// Offset between consecutive PULSE_SHIFT slots
    pub shift: Duration,
    /// How long PULSE_TIME_ACK waits for one module
    pub ack_timeout: Duration,
    /// Pause after a module's ack before the next module is pulsed
    pub ack_yield: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            level: ManagedLevel::None,
            frequency: 10.0,
            shift: Duration::from_micros(10_000),
            ack_timeout: Duration::from_millis(1000),
            ack_yield: Duration::from_micros(5_000),
        }
    }
}

impl SchedulerConfig {
    pub fn with_level(mut self, level: ManagedLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_frequency(mut self, frequency: f64) -> Self {
        self.frequency = frequency;
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

    pub fn nominal_time_slice_us(&self) -> u32 {
        time_slice_us(self.frequency).unwrap_or(DEFAULT_TIME_SLICE_US)
    }

    pub fn period(&self) -> Duration {
        Duration::from_micros(u64::from(self.nominal_time_slice_us()))
    }
}

/// Observable scheduling decisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    ModuleJoined(ModuleDescriptor),
    ModuleLeft(ModuleDescriptor),
    PulseSent {
        module: ModuleDescriptor,
        tick: u32,
        offset_us: u32,
    },
    AckReceived {
        module: ModuleDescriptor,
        tick: u32,
        envelopes: usize,
    },
    AckTimeout {
        module: ModuleDescriptor,
        tick: u32,
    },
    /// Envelopes of an ack went out on the conference. `tick` is the ack's
    /// tick, which is older than the current one for late acks.
    Published {
        module: ModuleDescriptor,
        tick: u32,
        envelopes: usize,
    },
}

pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<ModuleRegistry>,
    conference: Option<Arc<Conference>>,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    tick: u32,
    cumulated_us: u64,
    members: Vec<ModuleDescriptor>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, registry: Arc<ModuleRegistry>) -> Self {
        Self {
            config,
            registry,
            conference: None,
            events: None,
            tick: 0,
            cumulated_us: 0,
            members: Vec::new(),
        }
    }

    /// Conference that receives the envelopes carried by pulse acks.
    pub fn with_conference(mut self, conference: Arc<Conference>) -> Self {
        self.conference = Some(conference);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn level(&self) -> ManagedLevel {
        self.config.level
    }

    /// Last tick executed (0 before the first one)
    pub fn tick(&self) -> u32 {
        self.tick
    }

    /// Tick until `shutdown` flips to true, then stop every module.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Scheduler: {} at {} Hz",
            self.config.level, self.config.frequency
        );

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = self.step() => {}
            }
        }

        info!("Scheduler: stopped after {} tick(s)", self.tick);
        self.registry.stop_all();
    }

    /// Execute one tick.
    pub async fn step(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        let slice = self.config.nominal_time_slice_us();
        self.cumulated_us += u64::from(slice);

        let modules = self.registry.snapshot();
        self.track_membership(&modules);

        let pulse = Pulse {
            tick: self.tick,
            real_time: TimeStamp::now(),
            nominal_time_slice_us: slice,
            cumulated_time_slice_us: self.cumulated_us,
            offset_us: 0,
        };

        match self.config.level {
            ManagedLevel::None => {}
            ManagedLevel::Pulse => {
                for module in &modules {
                    self.send_pulse(module, &pulse);
                }
            }
            ManagedLevel::PulseShift => self.pulse_shifted(modules, pulse).await,
            ManagedLevel::PulseTimeAck => self.pulse_time_ack(modules, pulse).await,
        }
    }

    async fn pulse_shifted(&self, mut modules: Vec<ScheduledModule>, pulse: Pulse) {
        modules.sort_by_key(|m| m.slot);
        let base = Instant::now();

        for module in &modules {
            let offset_us = shift_offset_us(self.config.shift, module.slot);
            sleep_until(base + Duration::from_micros(u64::from(offset_us))).await;
            let shifted = Pulse {
                real_time: TimeStamp::now(),
                offset_us,
                ..pulse.clone()
            };
            self.send_pulse(module, &shifted);
        }
    }

    async fn pulse_time_ack(&self, modules: Vec<ScheduledModule>, pulse: Pulse) {
        for module in &modules {
            let acks = module.acks().clone();
            let mut acks = acks.lock().await;

            // Acks that arrived after their tick timed out.
            while let Ok(late) = acks.try_recv() {
                debug!(
                    "Scheduler: late ack from {} for tick {} (now {})",
                    module.descriptor, late.tick, pulse.tick
                );
                self.publish(module, late).await;
            }

            if !self.send_pulse(module, &pulse) {
                continue;
            }

            let deadline = Instant::now() + self.config.ack_timeout;
            loop {
                match timeout_at(deadline, acks.recv()).await {
                    Ok(Some(ack)) if ack.tick == pulse.tick => {
                        self.emit(SchedulerEvent::AckReceived {
                            module: module.descriptor.clone(),
                            tick: ack.tick,
                            envelopes: ack.envelopes.len(),
                        });
                        self.publish(module, ack).await;
                        sleep(self.config.ack_yield).await;
                        break;
                    }
                    Ok(Some(late)) => self.publish(module, late).await,
                    Ok(None) => {
                        debug!("Scheduler: {} left while awaited", module.descriptor);
                        break;
                    }
                    Err(_) => {
                        warn!(
                            "Scheduler: {} did not ack tick {} within {:?}, skipping",
                            module.descriptor, pulse.tick, self.config.ack_timeout
                        );
                        self.emit(SchedulerEvent::AckTimeout {
                            module: module.descriptor.clone(),
                            tick: pulse.tick,
                        });
                        break;
                    }
                }
            }
        }
    }

    fn send_pulse(&self, module: &ScheduledModule, pulse: &Pulse) -> bool {
        if !module.send(Envelope::from_payload(pulse)) {
            debug!("Scheduler: {} is gone, no pulse for tick {}", module.descriptor, pulse.tick);
            return false;
        }
        trace!(
            "Scheduler: pulse {} to {} (+{}us)",
            pulse.tick,
            module.descriptor,
            pulse.offset_us
        );
        self.emit(SchedulerEvent::PulseSent {
            module: module.descriptor.clone(),
            tick: pulse.tick,
            offset_us: pulse.offset_us,
        });
        true
    }

    /// Fan the ack's envelopes out on the conference, in the order the
    /// module produced them.
    async fn publish(&self, module: &ScheduledModule, ack: PulseAck) {
        let count = ack.envelopes.len();
        if let Some(conference) = &self.conference {
            for envelope in ack.envelopes {
                if let Err(e) = conference.publish(envelope).await {
                    warn!("Scheduler: publishing for {} failed: {}", module.descriptor, e);
                }
            }
        }
        self.emit(SchedulerEvent::Published {
            module: module.descriptor.clone(),
            tick: ack.tick,
            envelopes: count,
        });
    }

    fn track_membership(&mut self, modules: &[ScheduledModule]) {
        let current: Vec<ModuleDescriptor> = modules.iter().map(|m| m.descriptor.clone()).collect();

        for gone in self.members.iter().filter(|m| !current.contains(m)) {
            self.emit(SchedulerEvent::ModuleLeft(gone.clone()));
        }
        for joined in current.iter().filter(|m| !self.members.contains(m)) {
            self.emit(SchedulerEvent::ModuleJoined(joined.clone()));
        }
        self.members = current;
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Offset of a PULSE_SHIFT slot in microseconds, saturating at `u32::MAX`.
fn shift_offset_us(shift: Duration, slot: usize) -> u32 {
    let shift_us = u64::try_from(shift.as_micros()).unwrap_or(u64::MAX);
    let slot = u64::try_from(slot).unwrap_or(u64::MAX);
    u32::try_from(shift_us.saturating_mul(slot)).unwrap_or(u32::MAX)
}

/// Resolves once shutdown is requested or the sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conference::LocalHub;
    use crate::messages::data_type;
    use crate::registry::ModuleHandle;

    fn join(registry: &ModuleRegistry, name: &str) -> (ModuleDescriptor, mpsc::UnboundedReceiver<Envelope>) {
        let md = ModuleDescriptor::new(name);
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(ModuleHandle::new(md.clone(), tx)).unwrap();
        (md, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    /// Fake module answering every pulse with one envelope naming itself.
    fn acking(registry: Arc<ModuleRegistry>, md: ModuleDescriptor, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                let Ok(pulse) = env.decode::<Pulse>() else { continue };
                let ack = PulseAck {
                    tick: pulse.tick,
                    envelopes: vec![Envelope::wrap(data_type::USER, md.name.as_bytes().to_vec())],
                };
                registry.deliver_ack(&md, ack);
            }
        });
    }

    #[tokio::test]
    async fn test_pulse_reaches_every_module() {
        let registry = Arc::new(ModuleRegistry::new());
        let (_, mut a) = join(&registry, "a");
        let (_, mut b) = join(&registry, "b");

        let mut scheduler = Scheduler::new(
            SchedulerConfig::default().with_level(ManagedLevel::Pulse).with_frequency(20.0),
            registry,
        );
        scheduler.step().await;
        scheduler.step().await;

        for rx in [&mut a, &mut b] {
            let first = rx.try_recv().unwrap().decode::<Pulse>().unwrap();
            let second = rx.try_recv().unwrap().decode::<Pulse>().unwrap();
            assert_eq!((first.tick, second.tick), (1, 2));
            assert_eq!(first.nominal_time_slice_us, 50_000);
            assert_eq!(second.cumulated_time_slice_us, 100_000);
        }
    }

    #[tokio::test]
    async fn test_none_level_sends_nothing() {
        let registry = Arc::new(ModuleRegistry::new());
        let (md, mut a) = join(&registry, "a");
        let (tx, mut events) = mpsc::unbounded_channel();

        let mut scheduler = Scheduler::new(SchedulerConfig::default(), registry).with_events(tx);
        scheduler.step().await;

        assert!(a.try_recv().is_err());
        assert_eq!(drain(&mut events), vec![SchedulerEvent::ModuleJoined(md)]);
    }

    #[tokio::test]
    async fn test_pulse_shift_offsets_follow_slots() {
        let registry = Arc::new(ModuleRegistry::new());
        let (_, mut a) = join(&registry, "a");
        let (b_md, _b) = join(&registry, "b");
        let (_, mut c) = join(&registry, "c");
        // b leaves: c keeps slot 2
        registry.remove(&b_md);

        let mut scheduler = Scheduler::new(
            SchedulerConfig::default()
                .with_level(ManagedLevel::PulseShift)
                .with_shift(Duration::from_millis(5)),
            registry,
        );
        let started = Instant::now();
        scheduler.step().await;

        assert_eq!(a.try_recv().unwrap().decode::<Pulse>().unwrap().offset_us, 0);
        assert_eq!(c.try_recv().unwrap().decode::<Pulse>().unwrap().offset_us, 10_000);
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_time_ack_publishes_before_next_module() {
        let hub = LocalHub::new();
        let conference = Arc::new(Conference::join_local(&hub, 7).unwrap());
        let observer = Conference::join_local(&hub, 7).unwrap();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        observer.set_listener(move |env| {
            let _ = seen_tx.send(String::from_utf8_lossy(env.payload()).to_string());
        });

        let registry = Arc::new(ModuleRegistry::new());
        let (a, a_rx) = join(&registry, "a");
        let (b, b_rx) = join(&registry, "b");
        acking(registry.clone(), a.clone(), a_rx);
        acking(registry.clone(), b.clone(), b_rx);

        let (tx, mut events) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(
            SchedulerConfig::default()
                .with_level(ManagedLevel::PulseTimeAck)
                .with_ack_yield(Duration::from_millis(1)),
            registry,
        )
        .with_conference(conference)
        .with_events(tx);

        scheduler.step().await;

        let events: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(|e| !matches!(e, SchedulerEvent::ModuleJoined(_)))
            .collect();
        assert_eq!(
            events,
            vec![
                SchedulerEvent::PulseSent { module: a.clone(), tick: 1, offset_us: 0 },
                SchedulerEvent::AckReceived { module: a.clone(), tick: 1, envelopes: 1 },
                SchedulerEvent::Published { module: a, tick: 1, envelopes: 1 },
                SchedulerEvent::PulseSent { module: b.clone(), tick: 1, offset_us: 0 },
                SchedulerEvent::AckReceived { module: b.clone(), tick: 1, envelopes: 1 },
                SchedulerEvent::Published { module: b, tick: 1, envelopes: 1 },
            ]
        );

        let first = tokio::time::timeout(Duration::from_secs(1), seen.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), seen.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(second.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_time_ack_skips_silent_module() {
        let registry = Arc::new(ModuleRegistry::new());
        let (silent, _silent_rx) = join(&registry, "silent");
        let (b, b_rx) = join(&registry, "b");
        acking(registry.clone(), b.clone(), b_rx);

        let (tx, mut events) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(
            SchedulerConfig::default()
                .with_level(ManagedLevel::PulseTimeAck)
                .with_ack_timeout(Duration::from_millis(50))
                .with_ack_yield(Duration::ZERO),
            registry.clone(),
        )
        .with_events(tx);

        scheduler.step().await;
        scheduler.step().await;

        let seen = drain(&mut events);
        for tick in [1, 2] {
            assert!(seen.contains(&SchedulerEvent::AckTimeout { module: silent.clone(), tick }));
            assert!(seen.contains(&SchedulerEvent::AckReceived {
                module: b.clone(),
                tick,
                envelopes: 1
            }));
        }

        // a late ack is published on the next visit, not ordered into it
        registry.deliver_ack(&silent, PulseAck { tick: 2, envelopes: vec![] });
        scheduler.step().await;
        let late = drain(&mut events);
        assert_eq!(
            late[0],
            SchedulerEvent::Published { module: silent.clone(), tick: 2, envelopes: 0 }
        );
        assert_eq!(late[1], SchedulerEvent::PulseSent { module: silent, tick: 3, offset_us: 0 });
    }

    #[tokio::test]
    async fn test_removed_module_releases_wait() {
        let registry = Arc::new(ModuleRegistry::new());
        let (gone, _gone_rx) = join(&registry, "gone");
        let (tx, mut events) = mpsc::unbounded_channel();

        let mut scheduler = Scheduler::new(
            SchedulerConfig::default()
                .with_level(ManagedLevel::PulseTimeAck)
                .with_ack_timeout(Duration::from_secs(30)),
            registry.clone(),
        )
        .with_events(tx);

        let remover = {
            let registry = registry.clone();
            let gone = gone.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(20)).await;
                registry.handle_connection_lost(&gone);
            })
        };

        tokio::time::timeout(Duration::from_secs(2), scheduler.step())
            .await
            .expect("wait released on removal");
        remover.await.unwrap();

        scheduler.step().await;
        assert!(drain(&mut events).contains(&SchedulerEvent::ModuleLeft(gone)));
    }

    #[test]
    fn test_fractional_frequencies() {
        assert_eq!(time_slice_us(0.5), Some(2_000_000));
        assert_eq!(time_slice_us(2.5), Some(400_000));
        assert_eq!(time_slice_us(3.0), Some(333_333));
        assert_eq!(time_slice_us(0.0), None);
        assert_eq!(time_slice_us(-1.0), None);
        assert_eq!(time_slice_us(f64::NAN), None);

        let config = SchedulerConfig::default().with_frequency(0.5);
        assert_eq!(config.nominal_time_slice_us(), 2_000_000);
        assert_eq!(config.period(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_frequency() {
        assert_eq!(parse_frequency("0.5"), Ok(0.5));
        assert_eq!(parse_frequency("10"), Ok(10.0));
        assert!(parse_frequency("0").is_err());
        assert!(parse_frequency("-3").is_err());
        assert!(parse_frequency("fast").is_err());
    }

    #[test]
    fn test_shift_offset_saturates() {
        assert_eq!(shift_offset_us(Duration::from_millis(10), 3), 30_000);
        assert_eq!(shift_offset_us(Duration::from_secs(3_600), 2), u32::MAX);
        assert_eq!(shift_offset_us(Duration::MAX, usize::MAX), u32::MAX);
    }

    #[tokio::test]
    async fn test_run_stops_modules_on_shutdown() {
        let registry = Arc::new(ModuleRegistry::new());
        let (_, mut a) = join(&registry, "a");
        let (stop, shutdown) = watch::channel(false);

        let task = tokio::spawn(
            Scheduler::new(
                SchedulerConfig::default().with_level(ManagedLevel::Pulse).with_frequency(100.0),
                registry.clone(),
            )
            .run(shutdown),
        );
        sleep(Duration::from_millis(50)).await;
        stop.send(true).unwrap();
        task.await.unwrap();

        assert!(registry.is_empty());
        let mut last = None;
        while let Ok(env) = a.try_recv() {
            last = Some(env);
        }
        assert_eq!(last.unwrap().data_type(), data_type::MODULE_STATE);
    }
}
