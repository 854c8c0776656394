//! Core types shared by modules and the supercomponent

use crate::codec::{field_id, Decodable, Decoder, Encodable, Encoder, FieldId};
use crate::error::CodecError;
use std::hash::{Hash, Hasher};

/// Identity of a module process
///
/// Two descriptors name the same module iff `name` and `instance_id` match;
/// `version` is informational.
#[derive(Debug, Clone, Eq)]
pub struct ModuleDescriptor {
    pub name: String,
    pub instance_id: Option<u32>,
    pub version: String,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_id: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_instance(mut self, id: u32) -> Self {
        self.instance_id = Some(id);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

impl PartialEq for ModuleDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.instance_id == other.instance_id
    }
}

impl Hash for ModuleDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.instance_id.hash(state);
    }
}

impl std::fmt::Display for ModuleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.instance_id {
            Some(id) => write!(f, "{}:{}", self.name, id),
            None => write!(f, "{}", self.name),
        }
    }
}

const F_NAME: FieldId = field_id("name");
const F_IDENTIFIER: FieldId = field_id("identifier");
const F_VERSION: FieldId = field_id("version");

impl Encodable for ModuleDescriptor {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_str(F_NAME, &self.name);
        if let Some(id) = self.instance_id {
            enc.put(F_IDENTIFIER, &id);
        }
        enc.put_str(F_VERSION, &self.version);
    }
}

impl Decodable for ModuleDescriptor {
    fn decode(dec: &Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            name: dec.get(F_NAME)?,
            instance_id: dec.get_opt(F_IDENTIFIER)?,
            version: dec.get_or(F_VERSION, String::new())?,
        })
    }
}

/// Scheduling discipline the supercomponent applies to its modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ManagedLevel {
    /// Modules run at their own pace
    #[default]
    None,
    /// One common pulse per tick, non-blocking
    Pulse,
    /// Pulses staggered by a per-module offset
    PulseShift,
    /// Lock-step: pulse, wait for ack, next module
    PulseTimeAck,
}

impl ManagedLevel {
    /// True for every level that delivers pulses
    pub fn is_pulsed(&self) -> bool {
        !matches!(self, ManagedLevel::None)
    }

    fn as_u8(&self) -> u8 {
        match self {
            ManagedLevel::None => 0,
            ManagedLevel::Pulse => 1,
            ManagedLevel::PulseShift => 2,
            ManagedLevel::PulseTimeAck => 3,
        }
    }

    fn from_u8(field: FieldId, v: u8) -> Result<Self, CodecError> {
        match v {
            0 => Ok(ManagedLevel::None),
            1 => Ok(ManagedLevel::Pulse),
            2 => Ok(ManagedLevel::PulseShift),
            3 => Ok(ManagedLevel::PulseTimeAck),
            other => Err(CodecError::InvalidValue {
                field,
                reason: format!("unknown managed level {}", other),
            }),
        }
    }
}

impl std::fmt::Display for ManagedLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagedLevel::None => write!(f, "none"),
            ManagedLevel::Pulse => write!(f, "pulse"),
            ManagedLevel::PulseShift => write!(f, "pulse_shift"),
            ManagedLevel::PulseTimeAck => write!(f, "pulse_time_ack"),
        }
    }
}

impl std::str::FromStr for ManagedLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(ManagedLevel::None),
            "pulse" => Ok(ManagedLevel::Pulse),
            "pulse_shift" => Ok(ManagedLevel::PulseShift),
            "pulse_time_ack" => Ok(ManagedLevel::PulseTimeAck),
            other => Err(format!(
                "unknown managed level '{}' (none|pulse|pulse_shift|pulse_time_ack)",
                other
            )),
        }
    }
}

/// Where the supercomponent accepts connections and how it schedules
///
/// An empty `address` tells the module to use the source address of the
/// discovery response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInformation {
    pub address: String,
    pub port: u16,
    pub managed_level: ManagedLevel,
}

impl ServerInformation {
    pub fn new(address: impl Into<String>, port: u16, managed_level: ManagedLevel) -> Self {
        Self {
            address: address.into(),
            port,
            managed_level,
        }
    }

    /// The information a given module is told during discovery.
    ///
    /// Modules on the exclusion list (compared case-insensitively) are never
    /// scheduled and see `ManagedLevel::None`.
    pub fn as_seen_by(&self, module_name: &str, exclusions: &[String]) -> ServerInformation {
        let excluded = exclusions
            .iter()
            .any(|name| name.eq_ignore_ascii_case(module_name));

        ServerInformation {
            managed_level: if excluded {
                ManagedLevel::None
            } else {
                self.managed_level
            },
            ..self.clone()
        }
    }
}

const F_ADDRESS: FieldId = field_id("address");
const F_PORT: FieldId = field_id("port");
const F_MANAGED_LEVEL: FieldId = field_id("managedlevel");

impl Encodable for ServerInformation {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_str(F_ADDRESS, &self.address)
            .put(F_PORT, &u32::from(self.port))
            .put(F_MANAGED_LEVEL, &self.managed_level.as_u8());
    }
}

impl Decodable for ServerInformation {
    fn decode(dec: &Decoder<'_>) -> Result<Self, CodecError> {
        let port: u32 = dec.get(F_PORT)?;
        let port = u16::try_from(port).map_err(|_| CodecError::InvalidValue {
            field: F_PORT,
            reason: format!("port {} out of range", port),
        })?;

        Ok(Self {
            address: dec.get_or(F_ADDRESS, String::new())?,
            port,
            managed_level: ManagedLevel::from_u8(F_MANAGED_LEVEL, dec.get_or(F_MANAGED_LEVEL, 0u8)?)?,
        })
    }
}

/// Lifecycle state of a module process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ModuleState {
    /// Initial and terminal state
    #[default]
    NotRunning,
    /// Setup done, main loop may proceed
    Running,
}

impl ModuleState {
    pub(crate) fn as_u8(&self) -> u8 {
        match self {
            ModuleState::NotRunning => 0,
            ModuleState::Running => 1,
        }
    }

    pub(crate) fn from_u8(field: FieldId, v: u8) -> Result<Self, CodecError> {
        match v {
            0 => Ok(ModuleState::NotRunning),
            1 => Ok(ModuleState::Running),
            other => Err(CodecError::InvalidValue {
                field,
                reason: format!("unknown module state {}", other),
            }),
        }
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleState::NotRunning => write!(f, "NOT_RUNNING"),
            ModuleState::Running => write!(f, "RUNNING"),
        }
    }
}

/// Result of running a module's main loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCode {
    Okay,
    /// A step returned an error
    ExceptionCaught,
    /// A step panicked or failed in an uncategorized way
    SeriousError,
    /// Discovery found no supercomponent
    NoSupercomponent,
    /// `run` called before `setup` completed
    NoSetup,
}

impl ExitCode {
    pub(crate) fn as_u8(&self) -> u8 {
        match self {
            ExitCode::Okay => 0,
            ExitCode::ExceptionCaught => 1,
            ExitCode::SeriousError => 2,
            ExitCode::NoSupercomponent => 3,
            ExitCode::NoSetup => 4,
        }
    }

    pub(crate) fn from_u8(field: FieldId, v: u8) -> Result<Self, CodecError> {
        match v {
            0 => Ok(ExitCode::Okay),
            1 => Ok(ExitCode::ExceptionCaught),
            2 => Ok(ExitCode::SeriousError),
            3 => Ok(ExitCode::NoSupercomponent),
            4 => Ok(ExitCode::NoSetup),
            other => Err(CodecError::InvalidValue {
                field,
                reason: format!("unknown exit code {}", other),
            }),
        }
    }

    /// Process exit status for binaries
    pub fn status(&self) -> i32 {
        i32::from(self.as_u8())
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitCode::Okay => write!(f, "OKAY"),
            ExitCode::ExceptionCaught => write!(f, "EXCEPTION_CAUGHT"),
            ExitCode::SeriousError => write!(f, "SERIOUS_ERROR"),
            ExitCode::NoSupercomponent => write!(f, "NO_SUPERCOMPONENT"),
            ExitCode::NoSetup => write!(f, "NO_SETUP"),
        }
    }
}
