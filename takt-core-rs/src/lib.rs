//! Takt Core Library
//!
//! Middleware for cooperating modules on a local network: UDP discovery of a
//! supercomponent, a TCP handshake that hands each module its configuration,
//! a multicast conference bus and managed-level scheduling (free running,
//! pulsed, shifted pulses or lock-step pulse/ack).

pub mod codec;
pub mod conference;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod lifecycle;
pub mod messages;
pub mod registry;
pub mod scheduler;
pub mod supercomponent;
pub mod types;

pub use conference::{Conference, ConferenceFactory, LocalHub};
pub use config::Configuration;
pub use discovery::{DiscoveryClient, DiscoveryConfig};
pub use envelope::{DataType, Envelope, Payload, TimeStamp};
pub use error::TaktError;
pub use lifecycle::{ModuleOptions, ModuleRuntime, StepContext, StepError, TimeTriggered};
pub use scheduler::SchedulerEvent;
pub use supercomponent::{Supercomponent, SupercomponentConfig};
pub use types::*;
