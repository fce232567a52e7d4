//! NSKeyedArchiver object graphs
//!
//! DTX payloads and auxiliary arguments are keyed archives: a property list
//! holding a flat `$objects` table in which containers and objects refer to
//! each other by UID. Slot 0 is always the `$null` sentinel and `$top` names
//! the root.
//!
//! ```rust
//! use ioscontrol::nskeyedarchive::{ArchiveValue, archive, unarchive};
//!
//! let value = ArchiveValue::Array(vec!["ping".into(), 42u64.into()]);
//! let bytes = archive(&value).unwrap();
//! assert_eq!(unarchive(&bytes).unwrap(), vec![value]);
//! ```

use indexmap::IndexMap;
use thiserror::Error;

mod archiver;
mod classes;
mod unarchiver;

pub use archiver::Archiver;
pub use classes::{
    DtCpuClusterInfo, DtTapMessage, NsDate, NsError, NsObject, NsUrl, NsValue, TapMessageKind,
    XcActivityRecord, XcTestConfiguration, XcTestConfigurationParams, XctAttachment,
    XctCapabilities, XctIssue, XctSourceCodeContext, XctSourceCodeLocation, XctTestIdentifier,
};
pub use unarchiver::Unarchiver;

pub const ARCHIVER: &str = "NSKeyedArchiver";
pub const ARCHIVER_VERSION: u64 = 100000;
pub const NULL_SENTINEL: &str = "$null";

/// A decoded keyed archive value
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveValue {
    /// `$null` or `NSNull`
    Null,
    Boolean(bool),
    Integer(plist::Integer),
    Real(f64),
    String(String),
    Data(Vec<u8>),
    /// `NSArray` and `NSMutableArray`
    Array(Vec<ArchiveValue>),
    /// `NSSet` and `NSMutableSet`, in archive order
    Set(Vec<ArchiveValue>),
    /// `NSDictionary` and `NSMutableDictionary`
    Dictionary(IndexMap<String, ArchiveValue>),
    /// Any other registered class
    Object(NsObject),
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ArchiveError {
    #[error("invalid archive: {0}")]
    InvalidArchive(String),
    #[error("unknown class {0}")]
    UnknownClass(String),
    #[error("no archiver for {0}")]
    UnsupportedType(String),
    #[error("malformed archive: {0}")]
    Malformed(String),
    #[error("plist error")]
    Plist(#[from] plist::Error),
    #[error("archive is not valid utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl ArchiveValue {
    /// The class this value is archived as, `None` for inline primitives
    pub fn class_name(&self) -> Option<&'static str> {
        match self {
            ArchiveValue::Null
            | ArchiveValue::Boolean(_)
            | ArchiveValue::Integer(_)
            | ArchiveValue::Real(_)
            | ArchiveValue::String(_)
            | ArchiveValue::Data(_) => None,
            ArchiveValue::Array(_) => Some("NSArray"),
            ArchiveValue::Set(_) => Some("NSSet"),
            ArchiveValue::Dictionary(_) => Some("NSDictionary"),
            ArchiveValue::Object(o) => Some(o.class_name()),
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            ArchiveValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            ArchiveValue::Integer(i) => i.as_unsigned(),
            _ => None,
        }
    }

    pub fn as_signed(&self) -> Option<i64> {
        match self {
            ArchiveValue::Integer(i) => i.as_signed(),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            ArchiveValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            ArchiveValue::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            ArchiveValue::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ArchiveValue]> {
        match self {
            ArchiveValue::Array(a) | ArchiveValue::Set(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&IndexMap<String, ArchiveValue>> {
        match self {
            ArchiveValue::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_dictionary(self) -> Option<IndexMap<String, ArchiveValue>> {
        match self {
            ArchiveValue::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&NsObject> {
        match self {
            ArchiveValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ArchiveValue::Null)
    }
}

impl std::fmt::Display for ArchiveValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveValue::Null => write!(f, "null"),
            ArchiveValue::Boolean(b) => write!(f, "{b}"),
            ArchiveValue::Integer(i) => write!(f, "{i}"),
            ArchiveValue::Real(r) => write!(f, "{r}"),
            ArchiveValue::String(s) => write!(f, "{s:?}"),
            ArchiveValue::Data(d) => write!(f, "<{} bytes>", d.len()),
            ArchiveValue::Array(items) | ArchiveValue::Set(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            ArchiveValue::Dictionary(d) => {
                write!(f, "{{")?;
                for (i, (k, v)) in d.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                write!(f, "}}")
            }
            ArchiveValue::Object(NsObject::Error(e)) => write!(f, "{e}"),
            ArchiveValue::Object(o) => write!(f, "{o:?}"),
        }
    }
}

impl From<&str> for ArchiveValue {
    fn from(value: &str) -> Self {
        ArchiveValue::String(value.to_string())
    }
}

impl From<String> for ArchiveValue {
    fn from(value: String) -> Self {
        ArchiveValue::String(value)
    }
}

impl From<bool> for ArchiveValue {
    fn from(value: bool) -> Self {
        ArchiveValue::Boolean(value)
    }
}

impl From<u64> for ArchiveValue {
    fn from(value: u64) -> Self {
        ArchiveValue::Integer(value.into())
    }
}

impl From<i64> for ArchiveValue {
    fn from(value: i64) -> Self {
        ArchiveValue::Integer(value.into())
    }
}

impl From<u32> for ArchiveValue {
    fn from(value: u32) -> Self {
        ArchiveValue::Integer(u64::from(value).into())
    }
}

impl From<f64> for ArchiveValue {
    fn from(value: f64) -> Self {
        ArchiveValue::Real(value)
    }
}

impl From<Vec<u8>> for ArchiveValue {
    fn from(value: Vec<u8>) -> Self {
        ArchiveValue::Data(value)
    }
}

impl From<NsObject> for ArchiveValue {
    fn from(value: NsObject) -> Self {
        ArchiveValue::Object(value)
    }
}

impl From<IndexMap<String, ArchiveValue>> for ArchiveValue {
    fn from(value: IndexMap<String, ArchiveValue>) -> Self {
        ArchiveValue::Dictionary(value)
    }
}

impl TryFrom<plist::Value> for ArchiveValue {
    type Error = ArchiveError;

    /// Converts a plain property list, with dictionaries and arrays becoming
    /// `NSDictionary` and `NSArray`
    fn try_from(value: plist::Value) -> Result<Self, Self::Error> {
        Ok(match value {
            plist::Value::Array(a) => ArchiveValue::Array(
                a.into_iter()
                    .map(ArchiveValue::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            plist::Value::Dictionary(d) => ArchiveValue::Dictionary(
                d.into_iter()
                    .map(|(k, v)| Ok((k, ArchiveValue::try_from(v)?)))
                    .collect::<Result<_, ArchiveError>>()?,
            ),
            plist::Value::Boolean(b) => ArchiveValue::Boolean(b),
            plist::Value::Data(d) => ArchiveValue::Data(d),
            plist::Value::Real(r) => ArchiveValue::Real(r),
            plist::Value::Integer(i) => ArchiveValue::Integer(i),
            plist::Value::String(s) => ArchiveValue::String(s),
            plist::Value::Date(d) => {
                let t = std::time::SystemTime::from(d);
                ArchiveValue::Object(NsObject::Date(NsDate::from_system_time(t)))
            }
            plist::Value::Uid(u) => {
                return Err(ArchiveError::UnsupportedType(format!(
                    "bare UID {}",
                    u.get()
                )));
            }
            other => return Err(ArchiveError::UnsupportedType(format!("{other:?}"))),
        })
    }
}

/// Archives a value as a binary plist
pub fn archive(value: &ArchiveValue) -> Result<Vec<u8>, ArchiveError> {
    let container = Archiver::archive(value)?;
    let mut buf = Vec::new();
    container.to_writer_binary(&mut buf)?;
    Ok(buf)
}

/// Archives a value as an XML plist
///
/// References use the `CF$UID` dictionary form since XML has no UID type.
pub fn archive_text(value: &ArchiveValue) -> Result<String, ArchiveError> {
    let container = uids_to_dicts(Archiver::archive(value)?);
    let mut buf = Vec::new();
    container.to_writer_xml(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

/// Decodes a binary or XML keyed archive into its root values
pub fn unarchive(bytes: &[u8]) -> Result<Vec<ArchiveValue>, ArchiveError> {
    let container = plist::Value::from_reader(std::io::Cursor::new(bytes))?;
    Unarchiver::unarchive(&container)
}

fn uids_to_dicts(value: plist::Value) -> plist::Value {
    match value {
        plist::Value::Uid(u) => {
            let mut d = plist::Dictionary::new();
            d.insert("CF$UID".into(), u.get().into());
            plist::Value::Dictionary(d)
        }
        plist::Value::Array(a) => plist::Value::Array(a.into_iter().map(uids_to_dicts).collect()),
        plist::Value::Dictionary(d) => plist::Value::Dictionary(
            d.into_iter().map(|(k, v)| (k, uids_to_dicts(v))).collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: ArchiveValue) {
        let bytes = archive(&value).unwrap();
        assert_eq!(unarchive(&bytes).unwrap(), vec![value.clone()]);

        let text = archive_text(&value).unwrap();
        assert_eq!(unarchive(text.as_bytes()).unwrap(), vec![value]);
    }

    #[test]
    fn primitives() {
        round_trip("ping".into());
        round_trip(ArchiveValue::Boolean(true));
        round_trip(7u64.into());
        round_trip((-3i64).into());
        round_trip(2.5f64.into());
        round_trip(ArchiveValue::Data(vec![0, 1, 2]));
        round_trip(ArchiveValue::Null);
    }

    #[test]
    fn containers() {
        let mut inner = IndexMap::new();
        inner.insert("pid".to_string(), 12u64.into());
        inner.insert("name".to_string(), "SpringBoard".into());
        inner.insert("flags".to_string(), ArchiveValue::Set(vec!["a".into()]));

        round_trip(ArchiveValue::Array(vec![
            ArchiveValue::Dictionary(inner),
            ArchiveValue::Array(Vec::new()),
            ArchiveValue::Null,
        ]));
    }

    #[test]
    fn container_layout() {
        let value = ArchiveValue::Array(vec!["a".into(), "a".into()]);
        let container = Archiver::archive(&value).unwrap();
        let dict = container.as_dictionary().unwrap();
        assert_eq!(
            dict.get("$archiver").and_then(|x| x.as_string()),
            Some(ARCHIVER)
        );
        assert_eq!(
            dict.get("$version").and_then(|x| x.as_unsigned_integer()),
            Some(ARCHIVER_VERSION)
        );

        let objects = dict.get("$objects").and_then(|x| x.as_array()).unwrap();
        assert_eq!(objects[0].as_string(), Some(NULL_SENTINEL));

        // every $class points into the table at a class description
        for o in objects {
            if let Some(class) = o.as_dictionary().and_then(|d| d.get("$class")) {
                let idx = class.as_uid().unwrap().get() as usize;
                let class = objects[idx].as_dictionary().unwrap();
                assert!(class.contains_key("$classname"));
                assert!(class.contains_key("$classes"));
            }
        }
    }

    #[test]
    fn missing_keys_are_invalid() {
        let mut d = plist::Dictionary::new();
        d.insert("$archiver".into(), ARCHIVER.into());
        d.insert("$version".into(), ARCHIVER_VERSION.into());
        d.insert("$objects".into(), plist::Value::Array(vec![NULL_SENTINEL.into()]));
        let mut buf = Vec::new();
        plist::Value::Dictionary(d).to_writer_binary(&mut buf).unwrap();
        assert!(matches!(
            unarchive(&buf),
            Err(ArchiveError::InvalidArchive(_))
        ));
    }

    #[test]
    fn wrong_archiver_is_invalid() {
        let mut d = plist::Dictionary::new();
        d.insert("$archiver".into(), "NSUnarchiver".into());
        d.insert("$version".into(), ARCHIVER_VERSION.into());
        d.insert("$top".into(), plist::Dictionary::new().into());
        d.insert("$objects".into(), plist::Value::Array(vec![NULL_SENTINEL.into()]));
        let mut buf = Vec::new();
        plist::Value::Dictionary(d).to_writer_xml(&mut buf).unwrap();
        assert!(matches!(
            unarchive(&buf),
            Err(ArchiveError::InvalidArchive(_))
        ));
    }

    #[test]
    fn top_without_root_uses_positional_keys() {
        let mut top = plist::Dictionary::new();
        top.insert("$0".into(), plist::Value::Uid(plist::Uid::new(1)));
        top.insert("$1".into(), plist::Value::Uid(plist::Uid::new(2)));
        let mut d = plist::Dictionary::new();
        d.insert("$archiver".into(), ARCHIVER.into());
        d.insert("$version".into(), ARCHIVER_VERSION.into());
        d.insert("$top".into(), top.into());
        d.insert(
            "$objects".into(),
            plist::Value::Array(vec![NULL_SENTINEL.into(), "first".into(), 2u64.into()]),
        );
        let mut buf = Vec::new();
        plist::Value::Dictionary(d).to_writer_binary(&mut buf).unwrap();

        assert_eq!(
            unarchive(&buf).unwrap(),
            vec![ArchiveValue::from("first"), ArchiveValue::from(2u64)]
        );
    }

    #[test]
    fn bare_uid_is_unsupported() {
        assert!(matches!(
            ArchiveValue::try_from(plist::Value::Uid(plist::Uid::new(3))),
            Err(ArchiveError::UnsupportedType(_))
        ));
    }

    #[test]
    fn plist_conversion() {
        let mut d = plist::Dictionary::new();
        d.insert("k".into(), plist::Value::Array(vec![1.into()]));
        let v = ArchiveValue::try_from(plist::Value::Dictionary(d)).unwrap();
        assert_eq!(
            v.as_dictionary().unwrap().get("k"),
            Some(&ArchiveValue::Array(vec![1u64.into()]))
        );
        round_trip(v);
    }
}
