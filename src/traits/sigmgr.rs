// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

use crate::cert::Cert;
use crate::publication::Publication;

/// Resolves the public key a publication was signed with.
pub type KeyLookupCb = Box<dyn Fn(&Publication) -> Option<Vec<u8>>>;

/// Signs and validates publications with the current identity key.
///
/// The distributor holds two instances: one for sync-state packets and one
/// for publications in the key collection. Both are reseated through
/// [`update_signing_key`](SigMgr::update_signing_key) whenever the identity
/// rotates.
pub trait SigMgr {
    /// Signs `publication` in place, setting its key locator to the signing
    /// certificate's thumbprint.
    fn sign(&self, publication: &mut Publication) -> Result<(), SigMgrError>;

    fn validate(&self, publication: &Publication) -> bool;

    fn update_signing_key(&mut self, secret: &[u8], cert: &Cert) -> Result<(), SigMgrError>;

    fn set_key_cb(&mut self, cb: KeyLookupCb);
}

#[derive(Debug, Error)]
pub enum SigMgrError {
    #[error("signing key was rejected")]
    BadSigningKey,

    #[error("no signing key has been configured")]
    NotConfigured,
}
