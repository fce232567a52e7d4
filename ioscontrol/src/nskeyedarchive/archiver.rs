// Flattens values into an `$objects` table

use std::collections::HashMap;

use super::{ARCHIVER, ARCHIVER_VERSION, ArchiveError, ArchiveValue, NULL_SENTINEL, classes};

pub struct Archiver {
    objects: Vec<plist::Value>,
    classes: HashMap<&'static str, plist::Uid>,
}

impl Default for Archiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Archiver {
    pub fn new() -> Self {
        Self {
            objects: vec![NULL_SENTINEL.into()],
            classes: HashMap::new(),
        }
    }

    /// Builds the archive container with `value` as `$top.root`
    pub fn archive(value: &ArchiveValue) -> Result<plist::Value, ArchiveError> {
        let mut archiver = Self::new();
        let root = archiver.encode_ref(value)?;
        Ok(archiver.finish(root))
    }

    pub fn finish(self, root: plist::Uid) -> plist::Value {
        let mut top = plist::Dictionary::new();
        top.insert("root".into(), plist::Value::Uid(root));

        let mut d = plist::Dictionary::new();
        d.insert("$version".into(), ARCHIVER_VERSION.into());
        d.insert("$archiver".into(), ARCHIVER.into());
        d.insert("$top".into(), top.into());
        d.insert("$objects".into(), plist::Value::Array(self.objects));
        plist::Value::Dictionary(d)
    }

    /// Adds `value` to the table and returns its reference
    pub fn encode_ref(&mut self, value: &ArchiveValue) -> Result<plist::Uid, ArchiveError> {
        let primitive = match value {
            ArchiveValue::Null => return self.encode_with_class("NSNull", value),
            ArchiveValue::Boolean(b) => plist::Value::Boolean(*b),
            ArchiveValue::Integer(i) => plist::Value::Integer(*i),
            ArchiveValue::Real(r) => plist::Value::Real(*r),
            ArchiveValue::String(s) => plist::Value::String(s.clone()),
            ArchiveValue::Data(d) => plist::Value::Data(d.clone()),
            other => {
                let class = other
                    .class_name()
                    .ok_or_else(|| ArchiveError::UnsupportedType(format!("{other:?}")))?;
                return self.encode_with_class(class, other);
            }
        };
        Ok(self.push(primitive))
    }

    /// Encodes an object field
    ///
    /// Numbers and booleans are stored inline, null is the `$null` slot and
    /// everything else becomes a reference.
    pub fn encode_field(&mut self, value: &ArchiveValue) -> Result<plist::Value, ArchiveError> {
        Ok(match value {
            ArchiveValue::Null => plist::Value::Uid(plist::Uid::new(0)),
            ArchiveValue::Boolean(b) => plist::Value::Boolean(*b),
            ArchiveValue::Integer(i) => plist::Value::Integer(*i),
            ArchiveValue::Real(r) => plist::Value::Real(*r),
            other => plist::Value::Uid(self.encode_ref(other)?),
        })
    }

    pub fn encode_refs(&mut self, items: &[ArchiveValue]) -> Result<plist::Value, ArchiveError> {
        let refs = items
            .iter()
            .map(|i| self.encode_ref(i).map(plist::Value::Uid))
            .collect::<Result<_, _>>()?;
        Ok(plist::Value::Array(refs))
    }

    /// Encodes `value` under an explicit class, such as `NSMutableArray` for
    /// an array
    pub fn encode_with_class(
        &mut self,
        class: &str,
        value: &ArchiveValue,
    ) -> Result<plist::Uid, ArchiveError> {
        let factory = classes::lookup(class)
            .ok_or_else(|| ArchiveError::UnsupportedType(class.to_string()))?;

        // the object keeps the lowest index, its members follow
        let idx = self.objects.len();
        self.objects.push(plist::Value::Dictionary(plist::Dictionary::new()));
        let class_ref = self.class_ref(factory.name, factory.chain);

        let mut dict = (factory.encode)(value, self)?;
        dict.insert("$class".into(), plist::Value::Uid(class_ref));
        self.objects[idx] = plist::Value::Dictionary(dict);
        Ok(plist::Uid::new(idx as u64))
    }

    fn class_ref(&mut self, name: &'static str, chain: &[&str]) -> plist::Uid {
        if let Some(uid) = self.classes.get(name) {
            return *uid;
        }
        let mut d = plist::Dictionary::new();
        d.insert(
            "$classes".into(),
            plist::Value::Array(chain.iter().map(|c| (*c).into()).collect()),
        );
        d.insert("$classname".into(), name.into());
        let uid = self.push(d.into());
        self.classes.insert(name, uid);
        uid
    }

    fn push(&mut self, v: plist::Value) -> plist::Uid {
        self.objects.push(v);
        plist::Uid::new((self.objects.len() - 1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_root_matches_foundation_layout() {
        let container = Archiver::archive(&ArchiveValue::Null).unwrap();
        let objects = container
            .as_dictionary()
            .and_then(|d| d.get("$objects"))
            .and_then(|o| o.as_array())
            .unwrap();
        assert_eq!(objects.len(), 3);
        assert_eq!(
            objects[1]
                .as_dictionary()
                .and_then(|d| d.get("$class"))
                .and_then(|c| c.as_uid())
                .map(|u| u.get()),
            Some(2)
        );
        assert_eq!(
            objects[2]
                .as_dictionary()
                .and_then(|d| d.get("$classname"))
                .and_then(|c| c.as_string()),
            Some("NSNull")
        );
    }

    #[test]
    fn class_descriptions_are_shared() {
        let value = ArchiveValue::Array(vec![
            ArchiveValue::Array(Vec::new()),
            ArchiveValue::Array(Vec::new()),
        ]);
        let container = Archiver::archive(&value).unwrap();
        let objects = container
            .as_dictionary()
            .and_then(|d| d.get("$objects"))
            .and_then(|o| o.as_array())
            .unwrap();
        let class_dicts = objects
            .iter()
            .filter(|o| {
                o.as_dictionary()
                    .is_some_and(|d| d.contains_key("$classname"))
            })
            .count();
        assert_eq!(class_dicts, 1);
    }

    #[test]
    fn unknown_explicit_class() {
        let mut a = Archiver::new();
        assert!(matches!(
            a.encode_with_class("NSFoo", &ArchiveValue::Null),
            Err(ArchiveError::UnsupportedType(_))
        ));
    }
}
