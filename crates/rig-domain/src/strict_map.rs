//! A `BTreeMap`-backed map that rejects duplicate keys while deserializing.
//!
//! `serde_json`'s default map deserialization silently keeps the last
//! value for a repeated key. The wire format (§6.1) requires duplicate
//! `services`/`ingresses`/`egresses` keys to be a decode error, so this
//! type re-walks the map tokens itself instead of deserializing straight
//! into a `BTreeMap`.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StrictMap<V>(pub BTreeMap<String, V>);

impl<V> Deref for StrictMap<V> {
    type Target = BTreeMap<String, V>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<V> DerefMut for StrictMap<V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<V> IntoIterator for StrictMap<V> {
    type Item = (String, V);
    type IntoIter = std::collections::btree_map::IntoIter<String, V>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<V: Serialize> Serialize for StrictMap<V> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de, V> Deserialize<'de> for StrictMap<V>
where
    V: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StrictMapVisitor<V>(PhantomData<V>);

        impl<'de, V> Visitor<'de> for StrictMapVisitor<V>
        where
            V: Deserialize<'de>,
        {
            type Value = StrictMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object with unique keys")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut out = BTreeMap::new();
                while let Some((key, value)) = map.next_entry::<String, V>()? {
                    if out.insert(key.clone(), value).is_some() {
                        return Err(de::Error::custom(format!("duplicate key {key:?}")));
                    }
                }
                Ok(StrictMap(out))
            }
        }

        deserializer.deserialize_map(StrictMapVisitor(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_keys() {
        let raw = r#"{"a": 1, "b": 2, "a": 3}"#;
        let result: std::result::Result<StrictMap<i32>, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn accepts_unique_keys() {
        let raw = r#"{"a": 1, "b": 2}"#;
        let parsed: StrictMap<i32> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.get("a"), Some(&1));
        assert_eq!(parsed.get("b"), Some(&2));
    }

    #[test]
    fn round_trips_through_serialize() {
        let raw = r#"{"a": 1, "b": 2}"#;
        let parsed: StrictMap<i32> = serde_json::from_str(raw).unwrap();
        let encoded = serde_json::to_string(&parsed).unwrap();
        let reparsed: StrictMap<i32> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(parsed, reparsed);
    }
}
