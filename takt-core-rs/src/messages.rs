//! Control-plane messages exchanged between modules and the supercomponent

use crate::codec::{field_id, Decodable, Decoder, Encodable, Encoder, FieldId};
use crate::envelope::{DataType, Envelope, Payload, TimeStamp};
use crate::error::CodecError;
use crate::types::{ExitCode, ModuleDescriptor, ModuleState, ServerInformation};

/// Reserved data type tags. Application payloads start at [`data_type::USER`].
pub mod data_type {
    use crate::envelope::DataType;

    pub const DISCOVER: DataType = 1;
    pub const MODULE_DESCRIPTOR: DataType = 2;
    pub const CONFIGURATION: DataType = 3;
    pub const PULSE: DataType = 4;
    pub const PULSE_ACK: DataType = 5;
    pub const MODULE_STATE: DataType = 6;
    pub const MODULE_EXIT: DataType = 7;

    /// First tag free for application payloads
    pub const USER: DataType = 1000;
}

impl Payload for ModuleDescriptor {
    const DATA_TYPE: DataType = data_type::MODULE_DESCRIPTOR;
}

/// Discovery datagram: request from a module or answer from the supercomponent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverMessage {
    Discover { module_name: String },
    Response { module_name: String, server: ServerInformation },
}

const F_KIND: FieldId = field_id("type");
const F_MODULE: FieldId = field_id("module");
const F_SERVER: FieldId = field_id("serverinformation");

const KIND_DISCOVER: u8 = 1;
const KIND_RESPONSE: u8 = 2;

impl Encodable for DiscoverMessage {
    fn encode(&self, enc: &mut Encoder) {
        match self {
            DiscoverMessage::Discover { module_name } => {
                enc.put(F_KIND, &KIND_DISCOVER).put_str(F_MODULE, module_name);
            }
            DiscoverMessage::Response {
                module_name,
                server,
            } => {
                enc.put(F_KIND, &KIND_RESPONSE)
                    .put_str(F_MODULE, module_name)
                    .put_nested(F_SERVER, server);
            }
        }
    }
}

impl Decodable for DiscoverMessage {
    fn decode(dec: &Decoder<'_>) -> Result<Self, CodecError> {
        let module_name = dec.get(F_MODULE)?;
        match dec.get::<u8>(F_KIND)? {
            KIND_DISCOVER => Ok(DiscoverMessage::Discover { module_name }),
            KIND_RESPONSE => Ok(DiscoverMessage::Response {
                module_name,
                server: dec.get_nested(F_SERVER)?,
            }),
            other => Err(CodecError::InvalidValue {
                field: F_KIND,
                reason: format!("unknown discover message type {}", other),
            }),
        }
    }
}

impl Payload for DiscoverMessage {
    const DATA_TYPE: DataType = data_type::DISCOVER;
}

/// Scheduling pulse, supercomponent to module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pulse {
    /// Scheduler tick this pulse belongs to
    pub tick: u32,
    /// Wall-clock time at the start of the tick
    pub real_time: TimeStamp,
    /// Length of one tick
    pub nominal_time_slice_us: u32,
    /// Sum of all tick lengths so far
    pub cumulated_time_slice_us: u64,
    /// Delay of this pulse relative to the tick start (PULSE_SHIFT)
    pub offset_us: u32,
}

const F_TICK: FieldId = field_id("tick");
const F_REAL_TIME: FieldId = field_id("realtime");
const F_NOMINAL: FieldId = field_id("nominaltimeslice");
const F_CUMULATED: FieldId = field_id("cumulatedtimeslice");
const F_OFFSET: FieldId = field_id("offset");

impl Encodable for Pulse {
    fn encode(&self, enc: &mut Encoder) {
        enc.put(F_TICK, &self.tick)
            .put_nested(F_REAL_TIME, &self.real_time)
            .put(F_NOMINAL, &self.nominal_time_slice_us)
            .put(F_CUMULATED, &self.cumulated_time_slice_us)
            .put(F_OFFSET, &self.offset_us);
    }
}

impl Decodable for Pulse {
    fn decode(dec: &Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            tick: dec.get(F_TICK)?,
            real_time: dec.get_nested_opt(F_REAL_TIME)?.unwrap_or_default(),
            nominal_time_slice_us: dec.get_or(F_NOMINAL, 0)?,
            cumulated_time_slice_us: dec.get_or(F_CUMULATED, 0)?,
            offset_us: dec.get_or(F_OFFSET, 0)?,
        })
    }
}

impl Payload for Pulse {
    const DATA_TYPE: DataType = data_type::PULSE;
}

/// Acknowledgement of a pulse carrying the envelopes the module produced
#[derive(Debug, Clone, PartialEq)]
pub struct PulseAck {
    pub tick: u32,
    pub envelopes: Vec<Envelope>,
}

const F_ENVELOPE: FieldId = field_id("envelope");

impl Encodable for PulseAck {
    fn encode(&self, enc: &mut Encoder) {
        enc.put(F_TICK, &self.tick)
            .put_list(F_ENVELOPE, self.envelopes.iter());
    }
}

impl Decodable for PulseAck {
    fn decode(dec: &Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            tick: dec.get(F_TICK)?,
            envelopes: dec.get_list(F_ENVELOPE)?,
        })
    }
}

impl Payload for PulseAck {
    const DATA_TYPE: DataType = data_type::PULSE_ACK;
}

/// State command from the supercomponent (NOT_RUNNING on shutdown)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleStateMessage {
    pub state: ModuleState,
}

const F_STATE: FieldId = field_id("state");

impl Encodable for ModuleStateMessage {
    fn encode(&self, enc: &mut Encoder) {
        enc.put(F_STATE, &self.state.as_u8());
    }
}

impl Decodable for ModuleStateMessage {
    fn decode(dec: &Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            state: ModuleState::from_u8(F_STATE, dec.get(F_STATE)?)?,
        })
    }
}

impl Payload for ModuleStateMessage {
    const DATA_TYPE: DataType = data_type::MODULE_STATE;
}

/// Explicit exit notification from a module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleExit {
    pub exit_code: ExitCode,
}

const F_EXIT_CODE: FieldId = field_id("exitcode");

impl Encodable for ModuleExit {
    fn encode(&self, enc: &mut Encoder) {
        enc.put(F_EXIT_CODE, &self.exit_code.as_u8());
    }
}

impl Decodable for ModuleExit {
    fn decode(dec: &Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            exit_code: ExitCode::from_u8(F_EXIT_CODE, dec.get(F_EXIT_CODE)?)?,
        })
    }
}

impl Payload for ModuleExit {
    const DATA_TYPE: DataType = data_type::MODULE_EXIT;
}
