//! Supercomponent-side registry of connected modules
//!
//! Entries are kept in join order, which is the visiting order under
//! PULSE_TIME_ACK. Each entry owns a PULSE_SHIFT slot: a joining module takes
//! the lowest unused slot, a leaving module frees its slot and nobody else is
//! renumbered.

use crate::envelope::{Envelope, TimeStamp};
use crate::error::ConnectionError;
use crate::messages::{ModuleStateMessage, PulseAck};
use crate::types::{ModuleDescriptor, ModuleState};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Outbound half of a module session
#[derive(Debug, Clone)]
pub struct ModuleHandle {
    descriptor: ModuleDescriptor,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl ModuleHandle {
    pub fn new(descriptor: ModuleDescriptor, outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            descriptor,
            outbound,
        }
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    /// Queue an envelope for the module. False once the session is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.outbound.send(envelope).is_ok()
    }
}

/// Registry record for one connected module
#[derive(Debug)]
pub struct ConnectedModule {
    pub descriptor: ModuleDescriptor,
    pub slot: usize,
    pub joined: TimeStamp,
    pub last_pulse_ack: Option<TimeStamp>,
    handle: ModuleHandle,
    acks_tx: mpsc::UnboundedSender<PulseAck>,
    acks_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PulseAck>>>,
}

/// A module as seen by the scheduler for one tick
///
/// Holds no lock. The ack stream ends when the module leaves the registry,
/// so a waiting scheduler is released immediately.
#[derive(Debug, Clone)]
pub struct ScheduledModule {
    pub descriptor: ModuleDescriptor,
    pub slot: usize,
    handle: ModuleHandle,
    acks: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PulseAck>>>,
}

impl ScheduledModule {
    pub fn send(&self, envelope: Envelope) -> bool {
        self.handle.send(envelope)
    }

    pub(crate) fn acks(&self) -> &Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PulseAck>>> {
        &self.acks
    }
}

/// Shared, mutex-protected set of connected modules
#[derive(Debug)]
pub struct ModuleRegistry {
    modules: Mutex<Vec<ConnectedModule>>,
    count: watch::Sender<usize>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: Mutex::new(Vec::new()),
            count: watch::channel(0).0,
        }
    }

    /// Register a module after a successful handshake. Returns its slot.
    pub fn register(&self, handle: ModuleHandle) -> Result<usize, ConnectionError> {
        let descriptor = handle.descriptor().clone();
        let mut modules = self.modules.lock();

        if modules.iter().any(|m| m.descriptor == descriptor) {
            return Err(ConnectionError::DuplicateModule(descriptor.to_string()));
        }

        let slot = (0..)
            .find(|s| modules.iter().all(|m| m.slot != *s))
            .unwrap_or(modules.len());
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();

        modules.push(ConnectedModule {
            descriptor: descriptor.clone(),
            slot,
            joined: TimeStamp::now(),
            last_pulse_ack: None,
            handle,
            acks_tx,
            acks_rx: Arc::new(tokio::sync::Mutex::new(acks_rx)),
        });
        let count = modules.len();
        drop(modules);

        self.count.send_replace(count);
        info!("Registry: {} joined (slot {}, {} connected)", descriptor, slot, count);
        Ok(slot)
    }

    /// Route a pulse acknowledgement to the scheduler.
    pub fn deliver_ack(&self, descriptor: &ModuleDescriptor, ack: PulseAck) -> bool {
        let mut modules = self.modules.lock();
        match modules.iter_mut().find(|m| &m.descriptor == descriptor) {
            Some(module) => {
                module.last_pulse_ack = Some(TimeStamp::now());
                module.acks_tx.send(ack).is_ok()
            }
            None => false,
        }
    }

    /// Remove a module; frees its slot. Returns false if it was not present.
    pub fn remove(&self, descriptor: &ModuleDescriptor) -> bool {
        let mut modules = self.modules.lock();
        let before = modules.len();
        modules.retain(|m| &m.descriptor != descriptor);
        let removed = modules.len() != before;
        let count = modules.len();
        drop(modules);

        if removed {
            self.count.send_replace(count);
        }
        removed
    }

    /// Session socket failed or closed.
    pub fn handle_connection_lost(&self, descriptor: &ModuleDescriptor) {
        if self.remove(descriptor) {
            warn!("Registry: connection to {} lost, module removed", descriptor);
        }
    }

    pub fn contains(&self, descriptor: &ModuleDescriptor) -> bool {
        self.modules.lock().iter().any(|m| &m.descriptor == descriptor)
    }

    pub fn len(&self) -> usize {
        self.modules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptors in join order
    pub fn descriptors(&self) -> Vec<ModuleDescriptor> {
        self.modules.lock().iter().map(|m| m.descriptor.clone()).collect()
    }

    pub fn slot_of(&self, descriptor: &ModuleDescriptor) -> Option<usize> {
        self.modules
            .lock()
            .iter()
            .find(|m| &m.descriptor == descriptor)
            .map(|m| m.slot)
    }

    pub fn last_pulse_ack(&self, descriptor: &ModuleDescriptor) -> Option<TimeStamp> {
        self.modules
            .lock()
            .iter()
            .find(|m| &m.descriptor == descriptor)
            .and_then(|m| m.last_pulse_ack)
    }

    /// Observe the number of connected modules.
    pub fn watch_count(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    /// Lock-free copy of the current membership, in join order.
    pub fn snapshot(&self) -> Vec<ScheduledModule> {
        self.modules
            .lock()
            .iter()
            .map(|m| ScheduledModule {
                descriptor: m.descriptor.clone(),
                slot: m.slot,
                handle: m.handle.clone(),
                acks: m.acks_rx.clone(),
            })
            .collect()
    }

    /// Tell every module to stop and drop all sessions.
    ///
    /// NOT_RUNNING is queued ahead of the close, so the session writer
    /// delivers it before shutting the socket down.
    pub fn stop_all(&self) -> usize {
        let modules: Vec<ConnectedModule> = std::mem::take(&mut *self.modules.lock());
        self.count.send_replace(0);

        for module in &modules {
            let stop = Envelope::from_payload(&ModuleStateMessage {
                state: ModuleState::NotRunning,
            });
            if !module.handle.send(stop) {
                debug!("Registry: {} already disconnected", module.descriptor);
            }
        }

        if !modules.is_empty() {
            info!("Registry: sent NOT_RUNNING to {} module(s)", modules.len());
        }
        modules.len()
    }
}
