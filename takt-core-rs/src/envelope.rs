//! Envelope: the typed, timestamped unit of data on the conference bus

use crate::codec::{field_id, Decodable, Decoder, Encodable, Encoder, FieldId};
use crate::error::CodecError;
use chrono::Utc;

/// Integer tag identifying the schema of an envelope payload
pub type DataType = i32;

/// Wall-clock time as (seconds, microseconds) since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeStamp {
    pub seconds: i32,
    pub microseconds: i32,
}

impl TimeStamp {
    pub fn new(seconds: i32, microseconds: i32) -> Self {
        Self {
            seconds,
            microseconds,
        }
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            seconds: now.timestamp() as i32,
            microseconds: now.timestamp_subsec_micros() as i32,
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        Self {
            seconds: micros.div_euclid(1_000_000) as i32,
            microseconds: micros.rem_euclid(1_000_000) as i32,
        }
    }

    pub fn to_micros(&self) -> i64 {
        i64::from(self.seconds) * 1_000_000 + i64::from(self.microseconds)
    }

    /// True unless this is the zero timestamp
    pub fn is_set(&self) -> bool {
        self.seconds != 0 || self.microseconds != 0
    }
}

impl std::fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}", self.seconds, self.microseconds)
    }
}

const F_SECONDS: FieldId = field_id("seconds");
const F_MICROSECONDS: FieldId = field_id("microseconds");

impl Encodable for TimeStamp {
    fn encode(&self, enc: &mut Encoder) {
        enc.put(F_SECONDS, &self.seconds)
            .put(F_MICROSECONDS, &self.microseconds);
    }
}

impl Decodable for TimeStamp {
    fn decode(dec: &Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            seconds: dec.get_or(F_SECONDS, 0)?,
            microseconds: dec.get_or(F_MICROSECONDS, 0)?,
        })
    }
}

/// A message schema carried inside an envelope.
///
/// Each concrete message type owns one `DATA_TYPE` tag; receivers dispatch
/// on the tag and decode with [`Envelope::decode`].
pub trait Payload: Encodable + Decodable {
    const DATA_TYPE: DataType;
}

/// Typed, timestamped unit of data
///
/// Immutable once built: the sender stamps `sent` and the receiving bus
/// stamps `received`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    data_type: DataType,
    payload: Vec<u8>,
    sent: TimeStamp,
    received: TimeStamp,
}

const F_DATA_TYPE: FieldId = field_id("datatype");
const F_PAYLOAD: FieldId = field_id("payload");
const F_SENT: FieldId = field_id("sent");
const F_RECEIVED: FieldId = field_id("received");

impl Envelope {
    /// Wrap already-encoded payload bytes, stamping the sent time.
    pub fn wrap(data_type: DataType, payload: Vec<u8>) -> Self {
        Self {
            data_type,
            payload,
            sent: TimeStamp::now(),
            received: TimeStamp::default(),
        }
    }

    /// Encode a typed payload and wrap it.
    pub fn from_payload<P: Payload>(payload: &P) -> Self {
        Self::wrap(P::DATA_TYPE, payload.to_bytes())
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Give up the envelope and keep the payload bytes.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn sent(&self) -> TimeStamp {
        self.sent
    }

    pub fn received(&self) -> TimeStamp {
        self.received
    }

    pub fn is<P: Payload>(&self) -> bool {
        self.data_type == P::DATA_TYPE
    }

    /// Decode the payload as `P`, checking the data type tag first.
    pub fn decode<P: Payload>(&self) -> Result<P, CodecError> {
        if self.data_type != P::DATA_TYPE {
            return Err(CodecError::DataTypeMismatch {
                expected: P::DATA_TYPE,
                actual: self.data_type,
            });
        }
        P::from_bytes(&self.payload)
    }

    pub(crate) fn stamp_sent_if_unset(&mut self) {
        if !self.sent.is_set() {
            self.sent = TimeStamp::now();
        }
    }

    pub(crate) fn stamp_received(&mut self) {
        self.received = TimeStamp::now();
    }
}

impl Encodable for Envelope {
    fn encode(&self, enc: &mut Encoder) {
        enc.put(F_DATA_TYPE, &self.data_type)
            .put_bytes(F_PAYLOAD, &self.payload)
            .put_nested(F_SENT, &self.sent)
            .put_nested(F_RECEIVED, &self.received);
    }
}

impl Decodable for Envelope {
    fn decode(dec: &Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            data_type: dec.get(F_DATA_TYPE)?,
            payload: dec.get_or(F_PAYLOAD, Vec::new())?,
            sent: dec.get_nested_opt(F_SENT)?.unwrap_or_default(),
            received: dec.get_nested_opt(F_RECEIVED)?.unwrap_or_default(),
        })
    }
}
