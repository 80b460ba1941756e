// SPDX-License-Identifier: MIT OR Apache-2.0

//! Certificates, validity windows and thumbprints.
//!
//! An identity is a chain of certificates rooted at the domain's trust
//! anchor. Capabilities (subscriber group membership, keymaker priority) are
//! attached to certificates along the chain; the distributor itself only
//! ever stores thumbprints and keys derived from certificate content.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::name::Name;
use crate::tlv;

pub const THUMBPRINT_SIZE: usize = 32;

/// SHA2-256 digest of a signing certificate.
pub type Thumbprint = [u8; THUMBPRINT_SIZE];

/// Validity window in microseconds since the Unix epoch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    pub not_before: u64,
    pub not_after: u64,
}

impl Validity {
    pub fn covers(&self, at: u64) -> bool {
        self.not_before <= at && at < self.not_after
    }
}

/// A capability granted by a certificate in a signing chain: an identifier
/// and an argument, e.g. `SG` with the collection name as argument or `KM`
/// with a single-digit priority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub argument: Vec<u8>,
}

impl Capability {
    pub fn new(id: &str, argument: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.to_string(),
            argument: argument.into(),
        }
    }
}

/// One certificate in a signing chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cert {
    /// Certificate name; component 1 is the identity's role.
    pub name: Name,

    /// The certified Ed25519 public key.
    pub content: Vec<u8>,

    pub validity: Validity,

    /// Capability this certificate grants, if any.
    pub capability: Option<Capability>,

    /// Thumbprint of the issuing certificate; `None` at the trust anchor.
    pub signer: Option<Thumbprint>,
}

impl Cert {
    /// Thumbprint over the certificate's deterministic encoding.
    pub fn thumbprint(&self) -> Thumbprint {
        Sha256::digest(self.encode()).into()
    }

    /// Role component of the certificate name.
    pub fn role(&self) -> Option<&str> {
        self.name.get(1).and_then(|component| component.as_str())
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = self.name.encode();
        tlv::write_block(&mut out, 21, &self.content);
        tlv::write_number(&mut out, 30, self.validity.not_before);
        tlv::write_number(&mut out, 31, self.validity.not_after);
        if let Some(capability) = &self.capability {
            tlv::write_block(&mut out, 8, capability.id.as_bytes());
            tlv::write_block(&mut out, 8, &capability.argument);
        }
        if let Some(signer) = &self.signer {
            tlv::write_block(&mut out, 29, signer);
        }
        out
    }
}
