// Walks an `$objects` table back into values

use std::collections::HashMap;

use super::{ARCHIVER, ARCHIVER_VERSION, ArchiveError, ArchiveValue, NULL_SENTINEL, classes};

/// Object graphs nested deeper than this are rejected
const MAX_DEPTH: usize = 256;
/// Values one archive may expand to, shared objects count once per reference
const MAX_VALUES: usize = 1 << 20;

pub struct Unarchiver<'a> {
    objects: &'a [plist::Value],
    depth: usize,
    /// Decoded objects by table index with the number of values each expands to
    decoded: HashMap<usize, (ArchiveValue, usize)>,
    produced: usize,
}

impl<'a> Unarchiver<'a> {
    /// Decodes the roots of an archive container
    ///
    /// `$top.root` is preferred. Archives without it list their roots as
    /// `$0`, `$1`, ... and all of them are returned in order.
    pub fn unarchive(container: &'a plist::Value) -> Result<Vec<ArchiveValue>, ArchiveError> {
        let dict = container
            .as_dictionary()
            .ok_or_else(|| ArchiveError::InvalidArchive("archive is not a dictionary".into()))?;

        match dict.get("$archiver").and_then(|a| a.as_string()) {
            Some(ARCHIVER) => {}
            other => {
                return Err(ArchiveError::InvalidArchive(format!(
                    "unexpected $archiver {other:?}"
                )));
            }
        }
        match dict.get("$version").and_then(|v| v.as_unsigned_integer()) {
            Some(ARCHIVER_VERSION) => {}
            other => {
                return Err(ArchiveError::InvalidArchive(format!(
                    "unexpected $version {other:?}"
                )));
            }
        }
        let top = dict
            .get("$top")
            .and_then(|t| t.as_dictionary())
            .ok_or_else(|| ArchiveError::InvalidArchive("missing $top".into()))?;
        let objects = dict
            .get("$objects")
            .and_then(|o| o.as_array())
            .ok_or_else(|| ArchiveError::InvalidArchive("missing $objects".into()))?;
        if objects.first().and_then(|o| o.as_string()) != Some(NULL_SENTINEL) {
            return Err(ArchiveError::InvalidArchive(
                "$objects does not start with $null".into(),
            ));
        }

        let mut unarchiver = Unarchiver {
            objects,
            depth: 0,
            decoded: HashMap::new(),
            produced: 0,
        };
        if let Some(root) = top.get("root") {
            return Ok(vec![unarchiver.decode_ref(root)?]);
        }

        let mut roots = Vec::with_capacity(top.len());
        for i in 0..top.len() {
            let key = format!("${i}");
            let r = top
                .get(&key)
                .ok_or_else(|| ArchiveError::InvalidArchive(format!("$top has no {key}")))?;
            roots.push(unarchiver.decode_ref(r)?);
        }
        if roots.is_empty() {
            return Err(ArchiveError::InvalidArchive("$top is empty".into()));
        }
        Ok(roots)
    }

    /// Decodes a field value, either inline or a reference into the table
    pub fn decode_ref(&mut self, v: &plist::Value) -> Result<ArchiveValue, ArchiveError> {
        match reference(v) {
            Some(idx) => self.decode_index(idx),
            None => inline(v),
        }
    }

    /// Decodes `key` of an object, a missing key is null
    pub fn field(
        &mut self,
        dict: &plist::Dictionary,
        key: &str,
    ) -> Result<ArchiveValue, ArchiveError> {
        match dict.get(key) {
            Some(v) => self.decode_ref(v),
            None => Ok(ArchiveValue::Null),
        }
    }

    /// Decodes a list of references such as `NS.objects`
    pub fn refs(
        &mut self,
        dict: &plist::Dictionary,
        key: &str,
    ) -> Result<Vec<ArchiveValue>, ArchiveError> {
        match dict.get(key) {
            None => Ok(Vec::new()),
            Some(plist::Value::Array(items)) => {
                items.iter().map(|v| self.decode_ref(v)).collect()
            }
            Some(other) => Err(ArchiveError::Malformed(format!(
                "{key} is not an array: {other:?}"
            ))),
        }
    }

    fn decode_index(&mut self, idx: usize) -> Result<ArchiveValue, ArchiveError> {
        if idx == 0 {
            return Ok(ArchiveValue::Null);
        }
        if let Some(weight) = self.decoded.get(&idx).map(|(_, w)| *w) {
            self.charge(weight)?;
            if let Some((value, _)) = self.decoded.get(&idx) {
                return Ok(value.clone());
            }
        }
        let objects = self.objects;
        let obj = objects.get(idx).ok_or_else(|| {
            ArchiveError::Malformed(format!(
                "reference {idx} out of range for {} objects",
                objects.len()
            ))
        })?;
        match obj {
            plist::Value::Dictionary(d) => {
                let before = self.produced;
                let value = self.decode_object(d)?;
                self.charge(1)?;
                let weight = self.produced - before;
                self.decoded.insert(idx, (value.clone(), weight));
                Ok(value)
            }
            other => {
                self.charge(1)?;
                inline(other)
            }
        }
    }

    fn charge(&mut self, values: usize) -> Result<(), ArchiveError> {
        self.produced = self.produced.saturating_add(values);
        if self.produced > MAX_VALUES {
            return Err(ArchiveError::Malformed(format!(
                "archive expands to more than {MAX_VALUES} values"
            )));
        }
        Ok(())
    }

    fn decode_object(&mut self, dict: &plist::Dictionary) -> Result<ArchiveValue, ArchiveError> {
        let objects = self.objects;
        let class = dict
            .get("$class")
            .and_then(reference)
            .and_then(|idx| objects.get(idx))
            .and_then(|c| c.as_dictionary())
            .ok_or_else(|| ArchiveError::Malformed("object has no valid $class".into()))?;
        let name = class
            .get("$classname")
            .and_then(|n| n.as_string())
            .ok_or_else(|| ArchiveError::Malformed("class has no $classname".into()))?;
        let factory =
            classes::lookup(name).ok_or_else(|| ArchiveError::UnknownClass(name.to_string()))?;

        if self.depth >= MAX_DEPTH {
            return Err(ArchiveError::Malformed(format!(
                "objects nested deeper than {MAX_DEPTH}"
            )));
        }
        self.depth += 1;
        let res = (factory.decode)(name, dict, self);
        self.depth -= 1;
        res
    }
}

/// The table index a value points at, as a UID or an XML `CF$UID` dictionary
fn reference(v: &plist::Value) -> Option<usize> {
    match v {
        plist::Value::Uid(u) => Some(u.get() as usize),
        plist::Value::Dictionary(d) if d.len() == 1 => d
            .get("CF$UID")
            .and_then(|u| u.as_unsigned_integer())
            .map(|u| u as usize),
        _ => None,
    }
}

fn inline(v: &plist::Value) -> Result<ArchiveValue, ArchiveError> {
    Ok(match v {
        plist::Value::Boolean(b) => ArchiveValue::Boolean(*b),
        plist::Value::Integer(i) => ArchiveValue::Integer(*i),
        plist::Value::Real(r) => ArchiveValue::Real(*r),
        plist::Value::String(s) => ArchiveValue::String(s.clone()),
        plist::Value::Data(d) => ArchiveValue::Data(d.clone()),
        other => {
            return Err(ArchiveError::Malformed(format!(
                "unexpected value in archive: {other:?}"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nskeyedarchive::unarchive;

    fn container(objects: Vec<plist::Value>) -> Vec<u8> {
        let mut top = plist::Dictionary::new();
        top.insert("root".into(), plist::Value::Uid(plist::Uid::new(1)));
        let mut d = plist::Dictionary::new();
        d.insert("$archiver".into(), ARCHIVER.into());
        d.insert("$version".into(), ARCHIVER_VERSION.into());
        d.insert("$top".into(), top.into());
        d.insert("$objects".into(), plist::Value::Array(objects));
        let mut buf = Vec::new();
        plist::Value::Dictionary(d).to_writer_binary(&mut buf).unwrap();
        buf
    }

    fn class(name: &str) -> plist::Value {
        let mut d = plist::Dictionary::new();
        d.insert("$classname".into(), name.into());
        d.insert(
            "$classes".into(),
            plist::Value::Array(vec![name.into(), "NSObject".into()]),
        );
        d.into()
    }

    fn uid(n: u64) -> plist::Value {
        plist::Value::Uid(plist::Uid::new(n))
    }

    #[test]
    fn unknown_class() {
        let mut obj = plist::Dictionary::new();
        obj.insert("$class".into(), uid(2));
        let buf = container(vec![NULL_SENTINEL.into(), obj.into(), class("NSFoo")]);
        assert!(matches!(
            unarchive(&buf),
            Err(ArchiveError::UnknownClass(c)) if c == "NSFoo"
        ));
    }

    #[test]
    fn dangling_reference() {
        let mut obj = plist::Dictionary::new();
        obj.insert("$class".into(), uid(2));
        obj.insert("NS.objects".into(), plist::Value::Array(vec![uid(9)]));
        let buf = container(vec![NULL_SENTINEL.into(), obj.into(), class("NSArray")]);
        assert!(matches!(unarchive(&buf), Err(ArchiveError::Malformed(_))));
    }

    #[test]
    fn self_reference_is_bounded() {
        let mut obj = plist::Dictionary::new();
        obj.insert("$class".into(), uid(2));
        obj.insert("NS.objects".into(), plist::Value::Array(vec![uid(1)]));
        let buf = container(vec![NULL_SENTINEL.into(), obj.into(), class("NSArray")]);
        assert!(matches!(unarchive(&buf), Err(ArchiveError::Malformed(_))));
    }

    #[test]
    fn null_references() {
        let mut obj = plist::Dictionary::new();
        obj.insert("$class".into(), uid(2));
        obj.insert("NS.objects".into(), plist::Value::Array(vec![uid(0), uid(3)]));
        let buf = container(vec![
            NULL_SENTINEL.into(),
            obj.into(),
            class("NSArray"),
            "x".into(),
        ]);
        assert_eq!(
            unarchive(&buf).unwrap(),
            vec![ArchiveValue::Array(vec![ArchiveValue::Null, "x".into()])]
        );
    }

    #[test]
    fn non_string_keys_are_stringified() {
        let mut obj = plist::Dictionary::new();
        obj.insert("$class".into(), uid(2));
        obj.insert("NS.keys".into(), plist::Value::Array(vec![uid(3)]));
        obj.insert("NS.objects".into(), plist::Value::Array(vec![uid(4)]));
        let buf = container(vec![
            NULL_SENTINEL.into(),
            obj.into(),
            class("NSDictionary"),
            5.into(),
            "five".into(),
        ]);
        let decoded = unarchive(&buf).unwrap();
        let dict = decoded[0].as_dictionary().unwrap();
        assert_eq!(dict.get("5"), Some(&ArchiveValue::from("five")));
    }

    #[test]
    fn mutable_containers() {
        let mut obj = plist::Dictionary::new();
        obj.insert("$class".into(), uid(2));
        obj.insert("NS.objects".into(), plist::Value::Array(vec![uid(3)]));
        let buf = container(vec![
            NULL_SENTINEL.into(),
            obj.into(),
            class("NSMutableSet"),
            "a".into(),
        ]);
        assert_eq!(
            unarchive(&buf).unwrap(),
            vec![ArchiveValue::Set(vec!["a".into()])]
        );
    }

    #[test]
    fn shared_objects_decode_once() {
        let mut outer = plist::Dictionary::new();
        outer.insert("$class".into(), uid(2));
        outer.insert("NS.objects".into(), plist::Value::Array(vec![uid(3), uid(3)]));
        let mut inner = plist::Dictionary::new();
        inner.insert("$class".into(), uid(2));
        inner.insert("NS.objects".into(), plist::Value::Array(vec![uid(4)]));
        let buf = container(vec![
            NULL_SENTINEL.into(),
            outer.into(),
            class("NSArray"),
            inner.into(),
            "x".into(),
        ]);
        let shared = ArchiveValue::Array(vec!["x".into()]);
        assert_eq!(
            unarchive(&buf).unwrap(),
            vec![ArchiveValue::Array(vec![shared.clone(), shared])]
        );
    }

    #[test]
    fn doubling_chain_is_bounded() {
        // every array holds the next one twice
        const LEVELS: u64 = 40;
        let class_idx = LEVELS + 2;
        let mut objects: Vec<plist::Value> = vec![NULL_SENTINEL.into()];
        for i in 1..=LEVELS {
            let mut obj = plist::Dictionary::new();
            obj.insert("$class".into(), uid(class_idx));
            obj.insert(
                "NS.objects".into(),
                plist::Value::Array(vec![uid(i + 1), uid(i + 1)]),
            );
            objects.push(obj.into());
        }
        objects.push("leaf".into());
        objects.push(class("NSArray"));
        let buf = container(objects);
        assert!(matches!(unarchive(&buf), Err(ArchiveError::Malformed(_))));
    }
}
