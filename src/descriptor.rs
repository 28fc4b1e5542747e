//! Wire descriptors for timers and attack strategies.
//!
//! A [`Descriptor`] is a `{type, payload}` pair: a stable tag naming the concrete
//! variant plus that variant's parameters as JSON. The receiving side looks the tag up
//! in a [`DescriptorRegistry`] to rebuild the value. A tag without a registered
//! decoder is an error, never a silent default.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::SkeinError;

/// A tagged, serialized timer or strategy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Stable tag identifying the concrete variant.
    #[serde(rename = "type")]
    pub kind: String,
    /// Variant parameters.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Descriptor {
    /// Build a descriptor by serializing `payload`.
    pub fn encode<P: Serialize>(kind: &str, payload: &P) -> Result<Self, SkeinError> {
        Ok(Descriptor {
            kind: kind.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Deserialize the payload into `P`, treating a missing payload as `{}`.
    pub fn payload<P: DeserializeOwned>(&self) -> Result<P, SkeinError> {
        let value = if self.payload.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.payload.clone()
        };
        serde_json::from_value(value).map_err(|e| SkeinError::InvalidDescriptor {
            kind: self.kind.clone(),
            detail: e.to_string(),
        })
    }
}

/// Rebuilds a `T` from a descriptor payload.
pub type DecodeFn<T> = fn(&Descriptor) -> Result<T, SkeinError>;

/// Maps descriptor tags to decode functions.
pub struct DescriptorRegistry<T> {
    decoders: HashMap<String, DecodeFn<T>>,
}

impl<T> Default for DescriptorRegistry<T> {
    fn default() -> Self {
        DescriptorRegistry {
            decoders: HashMap::new(),
        }
    }
}

impl<T> fmt::Debug for DescriptorRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DescriptorRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

impl<T> DescriptorRegistry<T> {
    pub fn new() -> Self {
        DescriptorRegistry::default()
    }

    /// Register (or replace) the decoder for `kind`.
    pub fn register(&mut self, kind: &str, decode: DecodeFn<T>) -> &mut Self {
        self.decoders.insert(kind.to_string(), decode);
        self
    }

    pub fn decode(&self, descriptor: &Descriptor) -> Result<T, SkeinError> {
        match self.decoders.get(&descriptor.kind) {
            Some(decode) => decode(descriptor),
            None => Err(SkeinError::UnknownDescriptor {
                kind: descriptor.kind.clone(),
            }),
        }
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.decoders.keys().map(|k| k.as_str()).collect();
        tags.sort_unstable();
        tags
    }
}
