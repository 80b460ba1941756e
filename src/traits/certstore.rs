// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::cert::{Cert, Thumbprint};
use crate::publication::Publication;

/// Read access to the trust domain's certificate store.
///
/// The store outlives the distributor; the distributor keeps a handle and
/// never caches certificates beyond single operations.
pub trait CertStore {
    /// Heads of the signing chains held by this entity; index 0 is the
    /// current signing certificate.
    fn chains(&self) -> Vec<Thumbprint>;

    /// Secret signing key for one of our own certificates.
    fn key(&self, tp: &Thumbprint) -> Option<Vec<u8>>;

    fn get(&self, tp: &Thumbprint) -> Option<Cert>;

    fn contains(&self, tp: &Thumbprint) -> bool {
        self.get(tp).is_some()
    }

    /// Public key for validating `publication`, looked up through its key
    /// locator.
    fn signing_key(&self, publication: &Publication) -> Option<Vec<u8>> {
        self.get(publication.thumbprint()).map(|cert| cert.content)
    }
}
