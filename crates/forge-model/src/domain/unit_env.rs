use serde::{Deserialize, Serialize};

use crate::KeyValue;

/// Environment variables handed to a subprocess unit.
///
/// Serialized as a plain array of `{key, value}` objects. Entries are applied in order, so a
/// later entry for the same key wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitEnv(Vec<KeyValue>);

impl UnitEnv {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.0.iter()
    }

    pub fn push<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.push(KeyValue::new(key, value));
    }
}
