//! tagmap is the key, value metadata that rides along with every point. Its
//! purpose is to distinguish identically named points coming from different
//! hosts, services or whatever else the user cares to annotate. Think of it
//! as a specialized hashmap: a vector kept sorted by key, which makes
//! searches fast for the small maps we see in practice and gives iteration a
//! stable, key-ordered sequence. That stable order is load-bearing: the
//! flattener's fingerprints must not depend on tag insertion order.

use serde::de;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::slice::Iter;

/// The tag key, value collection. Behaves similarly to
/// `std::collections::HashMap` but iterates in key order and serializes as
/// a JSON object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagMap {
    inner: Vec<(String, String)>,
}

impl TagMap {
    /// Create an empty tagmap.
    pub fn new() -> TagMap {
        TagMap {
            inner: Vec::with_capacity(15),
        }
    }

    /// Iterate the key / value pairs in key order.
    pub fn iter(&self) -> Iter<(String, String)> {
        self.inner.iter()
    }

    /// Get a value from the tagmap, if it exists.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self.inner
            .binary_search_by(|probe| probe.0.as_str().cmp(key))
        {
            Ok(idx) => Some(&self.inner[idx].1),
            Err(_) => None,
        }
    }

    /// Insert a key / value into self
    ///
    /// Insertion is last-write-wins: an existing value under the given key
    /// is replaced and returned.
    pub fn insert<S>(&mut self, key: S, val: S) -> Option<String>
    where
        S: Into<String>,
    {
        let key = key.into();
        let val = val.into();
        match self.inner.binary_search_by(|probe| probe.0.cmp(&key)) {
            Ok(idx) => {
                self.inner.push((key, val));
                let old = self.inner.swap_remove(idx);
                Some(old.1)
            }
            Err(idx) => {
                self.inner.insert(idx, (key, val));
                None
            }
        }
    }

    /// Overlay `other` on top of self.
    ///
    /// Every key / value in `other` is inserted into self, replacing any
    /// value already stored under the same key.
    pub fn overlay(&mut self, other: &TagMap) {
        for &(ref k, ref v) in other.iter() {
            self.insert(k.clone(), v.clone());
        }
    }

    /// Determine if the tagmap is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The total number of key / value pairs stored in the map.
    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl Serialize for TagMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for &(ref k, ref v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct TagMapVisitor;

impl<'de> de::Visitor<'de> for TagMapVisitor {
    type Value = TagMap;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map of string keys to string values")
    }

    fn visit_map<M>(self, mut access: M) -> Result<TagMap, M::Error>
    where
        M: de::MapAccess<'de>,
    {
        let mut tags = TagMap::new();
        while let Some((key, val)) = access.next_entry::<String, String>()? {
            tags.insert(key, val);
        }
        Ok(tags)
    }
}

impl<'de> Deserialize<'de> for TagMap {
    fn deserialize<D>(deserializer: D) -> Result<TagMap, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(TagMapVisitor)
    }
}
