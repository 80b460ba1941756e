// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hierarchical publication names made of typed components.
//!
//! Collections, key records, membership requests and election candidacies
//! all live in one namespace; subscriptions match on name prefixes.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tlv::{self, TLV_GENERIC, TLV_NAME, TLV_TIMESTAMP, TlvError};

/// One name component: a type number and its value bytes.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Component {
    typ: u8,
    value: Vec<u8>,
}

impl Component {
    /// Generic component from raw bytes.
    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Self {
            typ: TLV_GENERIC,
            value: value.into(),
        }
    }

    /// Generic component from a UTF-8 string.
    pub fn str(value: &str) -> Self {
        Self::bytes(value.as_bytes().to_vec())
    }

    /// Generic component holding a non-negative integer.
    pub fn number(value: u64) -> Self {
        Self {
            typ: TLV_GENERIC,
            value: tlv::encode_number(value),
        }
    }

    /// Timestamp component (microseconds since the Unix epoch).
    pub fn timestamp(micros: u64) -> Self {
        Self {
            typ: TLV_TIMESTAMP,
            value: tlv::encode_number(micros),
        }
    }

    pub fn typ(&self) -> u8 {
        self.typ
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    pub fn to_number(&self) -> Result<u64, NameError> {
        Ok(tlv::decode_number(&self.value)?)
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_graphic()) => write!(f, "{s}"),
            _ => write!(f, "0x{}", hex::encode(&self.value)),
        }
    }
}

/// A hierarchical name: an ordered sequence of components.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Name(Vec<Component>);

impl Name {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name with a single generic string component per `/`-separated part.
    pub fn from_str_parts(parts: &[&str]) -> Self {
        Self(parts.iter().map(|part| Component::str(part)).collect())
    }

    /// Returns a new name with `component` appended.
    pub fn join(&self, component: Component) -> Self {
        let mut components = self.0.clone();
        components.push(component);
        Self(components)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Component> {
        self.0.get(index)
    }

    pub fn last(&self) -> Option<&Component> {
        self.0.last()
    }

    pub fn is_prefix_of(&self, other: &Name) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Wire encoding: a name block wrapping one block per component.
    pub fn encode(&self) -> Vec<u8> {
        let mut inner = Vec::new();
        for component in &self.0 {
            tlv::write_block(&mut inner, component.typ, &component.value);
        }
        let mut out = Vec::with_capacity(inner.len() + 4);
        tlv::write_block(&mut out, TLV_NAME, &inner);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, NameError> {
        let mut outer = tlv::TlvReader::new(buf);
        let inner = outer.next_block(TLV_NAME)?;
        let mut reader = tlv::TlvReader::new(inner);
        let mut components = Vec::new();
        while !reader.is_done() {
            let (typ, value) = reader.next_any()?;
            components.push(Component {
                typ,
                value: value.to_vec(),
            });
        }
        Ok(Self(components))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.0 {
            write!(f, "/{component:?}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[derive(Debug, Error)]
pub enum NameError {
    #[error(transparent)]
    Tlv(#[from] TlvError),

    #[error("name is missing an expected component")]
    MissingComponent,
}

#[cfg(test)]
mod tests {
    use super::{Component, Name};

    #[test]
    fn prefix_matching() {
        let prefix = Name::from_str_parts(&["domain", "keys", "pdus"]);
        let kr = prefix
            .join(Component::str("kr"))
            .join(Component::number(1))
            .join(Component::timestamp(1_700_000_000_000_000));

        assert!(prefix.is_prefix_of(&kr));
        assert!(prefix.is_prefix_of(&prefix));
        assert!(!kr.is_prefix_of(&prefix));

        let other = Name::from_str_parts(&["domain", "keys", "pubs"]);
        assert!(!other.is_prefix_of(&kr));
    }

    #[test]
    fn encode_decode_round_trip() {
        let name = Name::from_str_parts(&["domain", "keys"])
            .join(Component::bytes(vec![1, 2, 3, 4]))
            .join(Component::number(7))
            .join(Component::timestamp(123_456_789));

        let decoded = Name::decode(&name.encode()).unwrap();
        assert_eq!(decoded, name);
        assert_eq!(decoded.get(3).unwrap().to_number().unwrap(), 7);
        assert_eq!(decoded.last().unwrap().to_number().unwrap(), 123_456_789);
    }

    #[test]
    fn component_accessors() {
        let c = Component::str("pubs");
        assert_eq!(c.as_str(), Some("pubs"));
        assert_eq!(c.as_bytes(), b"pubs");
        assert!(Component::bytes(vec![0xff]).as_str().is_none());
    }
}
