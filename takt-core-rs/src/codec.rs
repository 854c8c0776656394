//! Field-tagged binary codec
//!
//! Every payload is a flat block of field records:
//!
//! ```text
//! +----------------+----------------+------------------+
//! | fieldId (4B BE)| length (4B BE) | value (length B) |
//! +----------------+----------------+------------------+
//! ```
//!
//! `fieldId` is the CRC-32 of a short ASCII field name. Records appear in
//! encode order; decoders index them by id and skip anything they do not
//! ask for, so older readers keep working when newer writers add fields.
//! Repeated records with the same id form a list.

use crate::error::CodecError;
use crc::{Crc, CRC_32_ISO_HDLC};
use std::ops::Range;

/// 32-bit field identifier (CRC-32 of the field name)
pub type FieldId = u32;

/// Size of a field record header (id + length)
pub const FIELD_HEADER_SIZE: usize = 8;

/// CRC-32/ISO-HDLC, the common IEEE variant
const FIELD_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Compute the field id for a field name.
pub const fn field_id(name: &str) -> FieldId {
    FIELD_CRC.checksum(name.as_bytes())
}

/// A value that can live in a single field record.
pub trait Primitive: Sized {
    /// Append the value bytes (without header).
    fn put(&self, out: &mut Vec<u8>);

    /// Rebuild the value from exactly the bytes of one record.
    fn take(field: FieldId, bytes: &[u8]) -> Result<Self, CodecError>;
}

fn fixed<const N: usize>(field: FieldId, bytes: &[u8]) -> Result<[u8; N], CodecError> {
    bytes.try_into().map_err(|_| CodecError::InvalidLength {
        field,
        expected: N,
        actual: bytes.len(),
    })
}

impl Primitive for bool {
    fn put(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    fn take(field: FieldId, bytes: &[u8]) -> Result<Self, CodecError> {
        let [b] = fixed::<1>(field, bytes)?;
        Ok(b != 0)
    }
}

macro_rules! be_primitive {
    ($($ty:ty),*) => {
        $(
            impl Primitive for $ty {
                fn put(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_be_bytes());
                }

                fn take(field: FieldId, bytes: &[u8]) -> Result<Self, CodecError> {
                    Ok(<$ty>::from_be_bytes(fixed(field, bytes)?))
                }
            }
        )*
    };
}

be_primitive!(u8, i8, u32, i32, u64, f32, f64);

impl Primitive for String {
    fn put(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn take(field: FieldId, bytes: &[u8]) -> Result<Self, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
    }
}

impl Primitive for Vec<u8> {
    fn put(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn take(_field: FieldId, bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bytes.to_vec())
    }
}

/// Types that serialize themselves as a field block.
pub trait Encodable {
    fn encode(&self, enc: &mut Encoder);

    /// Encode into a fresh field block.
    fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode(&mut enc);
        enc.into_bytes()
    }
}

/// Types that rebuild themselves from a field block.
pub trait Decodable: Sized {
    fn decode(dec: &Decoder<'_>) -> Result<Self, CodecError>;

    /// Decode from a raw field block.
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::decode(&Decoder::new(bytes)?)
    }
}

/// Builds a field block in encode order.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, id: FieldId, write: impl FnOnce(&mut Vec<u8>)) -> &mut Self {
        self.buf.extend_from_slice(&id.to_be_bytes());
        let len_at = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        write(&mut self.buf);
        let len = (self.buf.len() - len_at - 4) as u32;
        self.buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
        self
    }

    /// Append one primitive field.
    pub fn put<T: Primitive>(&mut self, id: FieldId, value: &T) -> &mut Self {
        self.record(id, |out| value.put(out))
    }

    /// Append a string field without allocating an owned `String`.
    pub fn put_str(&mut self, id: FieldId, value: &str) -> &mut Self {
        self.record(id, |out| out.extend_from_slice(value.as_bytes()))
    }

    /// Append a raw byte block.
    pub fn put_bytes(&mut self, id: FieldId, value: &[u8]) -> &mut Self {
        self.record(id, |out| out.extend_from_slice(value))
    }

    /// Append a nested object as its own field block.
    pub fn put_nested<T: Encodable + ?Sized>(&mut self, id: FieldId, value: &T) -> &mut Self {
        self.record(id, |out| {
            let mut inner = Encoder {
                buf: std::mem::take(out),
            };
            value.encode(&mut inner);
            *out = inner.buf;
        })
    }

    /// Append every item as a repeated nested field.
    pub fn put_list<'a, T, I>(&mut self, id: FieldId, items: I) -> &mut Self
    where
        T: Encodable + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        for item in items {
            self.put_nested(id, item);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Indexed view over a field block.
#[derive(Debug)]
pub struct Decoder<'a> {
    bytes: &'a [u8],
    fields: Vec<(FieldId, Range<usize>)>,
}

impl<'a> Decoder<'a> {
    /// Index all records. Fails if a header or value runs past the buffer.
    pub fn new(bytes: &'a [u8]) -> Result<Self, CodecError> {
        let mut fields = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            let header = bytes
                .get(pos..pos + FIELD_HEADER_SIZE)
                .ok_or(CodecError::Truncated(pos))?;
            let id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

            let start = pos + FIELD_HEADER_SIZE;
            let end = start.checked_add(len).ok_or(CodecError::Truncated(pos))?;
            if end > bytes.len() {
                return Err(CodecError::Truncated(pos));
            }

            fields.push((id, start..end));
            pos = end;
        }

        Ok(Self { bytes, fields })
    }

    /// Bytes of the first record with this id.
    pub fn raw(&self, id: FieldId) -> Option<&'a [u8]> {
        self.fields
            .iter()
            .find(|(fid, _)| *fid == id)
            .map(|(_, range)| &self.bytes[range.clone()])
    }

    pub fn contains(&self, id: FieldId) -> bool {
        self.raw(id).is_some()
    }

    /// Number of records, including unknown ones.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn get<T: Primitive>(&self, id: FieldId) -> Result<T, CodecError> {
        let bytes = self.raw(id).ok_or(CodecError::MissingField(id))?;
        T::take(id, bytes)
    }

    /// Like [`get`](Self::get) but an absent field yields `default`.
    /// A present but malformed field is still an error.
    pub fn get_or<T: Primitive>(&self, id: FieldId, default: T) -> Result<T, CodecError> {
        match self.raw(id) {
            Some(bytes) => T::take(id, bytes),
            None => Ok(default),
        }
    }

    pub fn get_opt<T: Primitive>(&self, id: FieldId) -> Result<Option<T>, CodecError> {
        self.raw(id).map(|bytes| T::take(id, bytes)).transpose()
    }

    pub fn get_nested<T: Decodable>(&self, id: FieldId) -> Result<T, CodecError> {
        let bytes = self.raw(id).ok_or(CodecError::MissingField(id))?;
        T::from_bytes(bytes)
    }

    pub fn get_nested_opt<T: Decodable>(&self, id: FieldId) -> Result<Option<T>, CodecError> {
        self.raw(id).map(T::from_bytes).transpose()
    }

    /// All records with this id, decoded in encode order.
    pub fn get_list<T: Decodable>(&self, id: FieldId) -> Result<Vec<T>, CodecError> {
        self.fields
            .iter()
            .filter(|(fid, _)| *fid == id)
            .map(|(_, range)| T::from_bytes(&self.bytes[range.clone()]))
            .collect()
    }
}

/// Encode a single field record.
pub fn encode_field<T: Primitive>(id: FieldId, value: &T) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put(id, value);
    enc.into_bytes()
}

/// Decode one field out of a field block.
pub fn decode_field<T: Primitive>(buffer: &[u8], id: FieldId) -> Result<T, CodecError> {
    Decoder::new(buffer)?.get(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALUE: FieldId = field_id("value");

    fn roundtrip<T: Primitive + PartialEq + std::fmt::Debug>(v: T) {
        let bytes = encode_field(VALUE, &v);
        assert_eq!(decode_field::<T>(&bytes, VALUE).unwrap(), v);
    }

    #[test]
    fn test_field_id_is_crc32() {
        assert_eq!(field_id("123456789"), 0xCBF4_3926);
        assert_ne!(field_id("name"), field_id("version"));
        for name in ["name", "identifier", "tick", "envelopes", "managedlevel"] {
            assert_eq!(field_id(name), crc32fast::hash(name.as_bytes()), "{}", name);
        }
    }

    #[test]
    fn test_primitive_roundtrip() {
        roundtrip(true);
        roundtrip(false);
        roundtrip(0xABu8);
        roundtrip(-7i8);
        roundtrip(0xDEAD_BEEFu32);
        roundtrip(-123_456i32);
        roundtrip(u64::MAX - 3);
        roundtrip(3.5f32);
        roundtrip(-2.718_281_828_459f64);
        roundtrip("vehicle.speed".to_string());
        roundtrip(String::new());
        roundtrip(vec![0u8, 1, 2, 255]);
    }

    #[test]
    fn test_big_endian_layout() {
        let bytes = encode_field(0x0102_0304, &0x0A0B_0C0Du32);
        assert_eq!(
            bytes,
            vec![1, 2, 3, 4, 0, 0, 0, 4, 0x0A, 0x0B, 0x0C, 0x0D]
        );
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let mut enc = Encoder::new();
        enc.put(field_id("a"), &1u32)
            .put_bytes(field_id("from_the_future"), &[9; 37])
            .put_str(field_id("b"), "two");
        let bytes = enc.into_bytes();

        let dec = Decoder::new(&bytes).unwrap();
        assert_eq!(dec.field_count(), 3);
        assert_eq!(dec.get::<u32>(field_id("a")).unwrap(), 1);
        assert_eq!(dec.get::<String>(field_id("b")).unwrap(), "two");
    }

    #[test]
    fn test_missing_field_is_recoverable() {
        let bytes = encode_field(field_id("a"), &1u32);
        let dec = Decoder::new(&bytes).unwrap();

        assert!(matches!(
            dec.get::<u32>(field_id("b")),
            Err(CodecError::MissingField(_))
        ));
        assert_eq!(dec.get_or(field_id("b"), 42u32).unwrap(), 42);
        assert_eq!(dec.get_opt::<u32>(field_id("b")).unwrap(), None);
    }

    #[test]
    fn test_wrong_width_rejected() {
        let bytes = encode_field(VALUE, &1u8);
        assert!(matches!(
            decode_field::<u32>(&bytes, VALUE),
            Err(CodecError::InvalidLength { expected: 4, actual: 1, .. })
        ));
    }

    #[test]
    fn test_truncated_block_rejected() {
        let mut bytes = encode_field(VALUE, &7u32);
        bytes.pop();
        assert!(matches!(Decoder::new(&bytes), Err(CodecError::Truncated(0))));
        assert!(matches!(Decoder::new(&bytes[..5]), Err(CodecError::Truncated(0))));
    }

    #[derive(Debug, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    impl Encodable for Point {
        fn encode(&self, enc: &mut Encoder) {
            enc.put(field_id("x"), &self.x).put(field_id("y"), &self.y);
        }
    }

    impl Decodable for Point {
        fn decode(dec: &Decoder<'_>) -> Result<Self, CodecError> {
            Ok(Self {
                x: dec.get(field_id("x"))?,
                y: dec.get(field_id("y"))?,
            })
        }
    }

    #[test]
    fn test_nested_and_repeated() {
        let points = [Point { x: 1, y: 2 }, Point { x: -3, y: 4 }];
        let mut enc = Encoder::new();
        enc.put(field_id("count"), &2u8)
            .put_nested(field_id("origin"), &Point { x: 0, y: 0 })
            .put_list(field_id("point"), points.iter());
        let bytes = enc.into_bytes();

        let dec = Decoder::new(&bytes).unwrap();
        assert_eq!(
            dec.get_nested::<Point>(field_id("origin")).unwrap(),
            Point { x: 0, y: 0 }
        );
        let list: Vec<Point> = dec.get_list(field_id("point")).unwrap();
        assert_eq!(list, points);
        assert!(dec.get_list::<Point>(field_id("none")).unwrap().is_empty());
    }
}
