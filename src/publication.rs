// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signed publications carried by a sync collection.
use serde::{Deserialize, Serialize};

use crate::cert::{THUMBPRINT_SIZE, Thumbprint};
use crate::name::Name;
use crate::tlv;

/// Content block.
const TLV_CONTENT: u8 = 21;

/// Key locator digest block inside the signature info.
const TLV_KEY_DIGEST: u8 = 29;

/// A named, signed unit of data in a sync collection.
///
/// The key locator carries the thumbprint of the signing certificate, which
/// is how receivers attribute a publication to an identity. Signing is the
/// job of a [`SigMgr`](crate::traits::SigMgr); a freshly built publication
/// has an all-zero locator and an empty signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    name: Name,
    content: Vec<u8>,
    key_locator: Thumbprint,
    signature: Vec<u8>,
}

impl Publication {
    pub fn new(name: Name, content: Vec<u8>) -> Self {
        Self {
            name,
            content,
            key_locator: [0; THUMBPRINT_SIZE],
            signature: Vec::new(),
        }
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Thumbprint of the signing certificate, taken from the key locator.
    pub fn thumbprint(&self) -> &Thumbprint {
        &self.key_locator
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// The bytes covered by the signature: name, content and key locator.
    pub fn signed_portion(&self) -> Vec<u8> {
        let mut out = self.name.encode();
        tlv::write_block(&mut out, TLV_CONTENT, &self.content);
        tlv::write_block(&mut out, TLV_KEY_DIGEST, &self.key_locator);
        out
    }

    pub fn set_signature(&mut self, key_locator: Thumbprint, signature: Vec<u8>) {
        self.key_locator = key_locator;
        self.signature = signature;
    }
}
