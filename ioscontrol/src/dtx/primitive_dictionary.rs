//! Auxiliary arguments of a DTX message
//!
//! A packed little-endian list of `(key, value)` entries, each half a type tag
//! followed by its body. Keys are always the null tag in practice and the
//! values are the positional arguments of the invoked selector.

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    IdeviceError,
    nskeyedarchive::{self, ArchiveError, ArchiveValue},
};

const TYPE_NULL: u32 = 0x0a;
const TYPE_STRING: u32 = 0x01;
const TYPE_BYTES: u32 = 0x02;
const TYPE_U32: u32 = 0x03;
const TYPE_I64: u32 = 0x06;

/// Typed value inside a primitive dictionary
#[derive(Clone, PartialEq)]
pub enum AuxValue {
    /// Type 0x0a, no body
    Null,
    /// UTF-8 string (type 0x01)
    String(String),
    /// Raw byte array (type 0x02), usually a keyed archive
    Bytes(Vec<u8>),
    /// 32-bit unsigned integer (type 0x03)
    U32(u32),
    /// 64-bit signed integer (type 0x06)
    I64(i64),
}

/// One `(key, value)` pair
#[derive(Debug, Clone, PartialEq)]
pub struct AuxEntry {
    pub key: AuxValue,
    pub value: AuxValue,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PrimitiveDictionary {
    entries: Vec<AuxEntry>,
}

impl AuxValue {
    /// Wraps a value in a keyed archive
    pub fn archived(value: &ArchiveValue) -> Result<Self, ArchiveError> {
        Ok(Self::Bytes(nskeyedarchive::archive(value)?))
    }

    /// Decodes a keyed archive argument, `None` if this is not a byte array
    pub fn unarchive(&self) -> Option<Result<Vec<ArchiveValue>, ArchiveError>> {
        match self {
            AuxValue::Bytes(b) => Some(nskeyedarchive::unarchive(b)),
            _ => None,
        }
    }

    fn type_tag(&self) -> u32 {
        match self {
            AuxValue::Null => TYPE_NULL,
            AuxValue::String(_) => TYPE_STRING,
            AuxValue::Bytes(_) => TYPE_BYTES,
            AuxValue::U32(_) => TYPE_U32,
            AuxValue::I64(_) => TYPE_I64,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.type_tag().to_le_bytes());
        match self {
            AuxValue::Null => {}
            AuxValue::String(s) => {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            AuxValue::Bytes(v) => {
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(v);
            }
            AuxValue::U32(u) => out.extend_from_slice(&u.to_le_bytes()),
            AuxValue::I64(i) => out.extend_from_slice(&i.to_le_bytes()),
        }
    }

    /// Reads one tagged value off the front of `bytes`
    fn read(bytes: &[u8]) -> Result<(Self, &[u8]), IdeviceError> {
        let tag = take(bytes, 4)?;
        let bytes = &bytes[4..];
        let tag = LittleEndian::read_u32(tag);
        match tag {
            TYPE_NULL => Ok((AuxValue::Null, bytes)),
            TYPE_U32 => {
                let v = take(bytes, 4)?;
                Ok((AuxValue::U32(LittleEndian::read_u32(v)), &bytes[4..]))
            }
            TYPE_I64 => {
                let v = take(bytes, 8)?;
                Ok((AuxValue::I64(LittleEndian::read_i64(v)), &bytes[8..]))
            }
            TYPE_STRING | TYPE_BYTES => {
                let len = LittleEndian::read_u32(take(bytes, 4)?) as usize;
                let bytes = &bytes[4..];
                let body = take(bytes, len)?.to_vec();
                let value = if tag == TYPE_STRING {
                    AuxValue::String(String::from_utf8(body)?)
                } else {
                    AuxValue::Bytes(body)
                };
                Ok((value, &bytes[len..]))
            }
            t => Err(IdeviceError::UnknownAuxValueType(t)),
        }
    }
}

fn take(bytes: &[u8], len: usize) -> Result<&[u8], IdeviceError> {
    bytes
        .get(..len)
        .ok_or(IdeviceError::NotEnoughBytes(bytes.len(), len))
}

impl From<u32> for AuxValue {
    fn from(value: u32) -> Self {
        AuxValue::U32(value)
    }
}

impl From<i64> for AuxValue {
    fn from(value: i64) -> Self {
        AuxValue::I64(value)
    }
}

impl From<&str> for AuxValue {
    fn from(value: &str) -> Self {
        AuxValue::String(value.to_string())
    }
}

impl From<Vec<u8>> for AuxValue {
    fn from(value: Vec<u8>) -> Self {
        AuxValue::Bytes(value)
    }
}

impl PrimitiveDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument under a null key
    pub fn push(&mut self, value: impl Into<AuxValue>) {
        self.entries.push(AuxEntry {
            key: AuxValue::Null,
            value: value.into(),
        });
    }

    pub fn push_archived(&mut self, value: &ArchiveValue) -> Result<(), ArchiveError> {
        self.push(AuxValue::archived(value)?);
        Ok(())
    }

    pub fn entries(&self) -> &[AuxEntry] {
        &self.entries
    }

    /// The positional arguments in order
    pub fn values(&self) -> impl Iterator<Item = &AuxValue> {
        self.entries.iter().map(|e| &e.value)
    }

    pub fn get(&self, index: usize) -> Option<&AuxValue> {
        self.entries.get(index).map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses the auxiliary bytes that follow the 16 byte sub-header
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, IdeviceError> {
        let mut entries = Vec::new();
        while !bytes.is_empty() {
            let (key, rest) = AuxValue::read(bytes)?;
            let (value, rest) = AuxValue::read(rest)?;
            entries.push(AuxEntry { key, value });
            bytes = rest;
        }
        Ok(Self { entries })
    }

    /// Serializes the entries, an empty dictionary has no bytes at all
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            entry.key.write(&mut out);
            entry.value.write(&mut out);
        }
        out
    }
}

impl std::fmt::Debug for AuxValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuxValue::Null => write!(f, "Null"),
            AuxValue::String(s) => write!(f, "String({s:?})"),
            AuxValue::Bytes(arr) => write!(
                f,
                "Bytes(len={}, first_bytes={:?})",
                arr.len(),
                &arr[..arr.len().min(10)]
            ),
            AuxValue::U32(n) => write!(f, "U32({n})"),
            AuxValue::I64(n) => write!(f, "I64({n})"),
        }
    }
}

impl std::fmt::Display for PrimitiveDictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match v.unarchive() {
                Some(Ok(values)) if values.len() == 1 => write!(f, "{}", values[0])?,
                _ => write!(f, "{v:?}")?,
            }
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_has_no_bytes() {
        let d = PrimitiveDictionary::new();
        assert!(d.serialize().is_empty());
        assert!(PrimitiveDictionary::from_bytes(&[]).unwrap().is_empty());
    }

    #[test]
    fn wire_layout() {
        let mut d = PrimitiveDictionary::new();
        d.push(7u32);
        d.push(AuxValue::Bytes(vec![0xaa, 0xbb]));
        let bytes = d.serialize();
        assert_eq!(
            bytes,
            vec![
                0x0a, 0, 0, 0, 0x03, 0, 0, 0, 7, 0, 0, 0, // null key, u32
                0x0a, 0, 0, 0, 0x02, 0, 0, 0, 2, 0, 0, 0, 0xaa, 0xbb, // null key, bytes
            ]
        );
        assert_eq!(PrimitiveDictionary::from_bytes(&bytes).unwrap(), d);
    }

    #[test]
    fn all_value_types() {
        let mut d = PrimitiveDictionary::new();
        d.push(AuxValue::Null);
        d.push("selector");
        d.push(-5i64);
        d.push_archived(&ArchiveValue::from("com.apple.springboard"))
            .unwrap();
        let parsed = PrimitiveDictionary::from_bytes(&d.serialize()).unwrap();
        assert_eq!(parsed, d);
        assert_eq!(
            parsed.get(3).and_then(|v| v.unarchive()).unwrap().unwrap(),
            vec![ArchiveValue::from("com.apple.springboard")]
        );
    }

    #[test]
    fn truncated_and_unknown() {
        let mut d = PrimitiveDictionary::new();
        d.push(AuxValue::Bytes(vec![1, 2, 3, 4]));
        let bytes = d.serialize();
        assert!(matches!(
            PrimitiveDictionary::from_bytes(&bytes[..bytes.len() - 1]),
            Err(IdeviceError::NotEnoughBytes(_, _))
        ));

        // key without a value
        assert!(matches!(
            PrimitiveDictionary::from_bytes(&[0x0a, 0, 0, 0]),
            Err(IdeviceError::NotEnoughBytes(_, _))
        ));

        assert!(matches!(
            PrimitiveDictionary::from_bytes(&[0x0a, 0, 0, 0, 0x09, 0, 0, 0]),
            Err(IdeviceError::UnknownAuxValueType(9))
        ));
    }
}
