// SPDX-License-Identifier: MIT OR Apache-2.0

//! `dct-sgkd` distributes a subscriber-group key pair to the authorized
//! peers of a data-centric trust domain.
//!
//! A trust domain's schema grants capabilities to signed identities. Peers
//! holding the subscriber-group capability (`SG`) may decrypt publications
//! on a collection; everybody else publishes blind. Among the subscribers,
//! the identities with keymaker capability (`KM`, or `KMP` for the
//! public-keys collection) elect exactly one *keymaker* which generates an
//! X25519 key pair, seals the secret half towards every enrolled member and
//! publishes the records over a set-reconciliation pub/sub collection,
//! rekeying at a fixed interval. Members enroll with signed membership
//! requests; publish-only peers take the public key from any key record.
//!
//! The crate provides the key distribution core: the
//! [`SgKeyDistributor`](distributor::SgKeyDistributor) state machine, the
//! keymaker [election](election), the [wire shapes](records) for key
//! records and membership requests and the [crypto](crypto) they rest on.
//! The sync collection, certificate store and signature managers are
//! borrowed collaborators, specified by the [`traits`] module and provided
//! by the embedding transport.
//!
//! Everything runs single-threaded and cooperative on the embedder's
//! executor: state transitions happen in subscription callbacks and timers,
//! and every callback handed out is bound to the distributor's lifetime.
pub mod capability;
pub mod cert;
pub mod crypto;
pub mod distributor;
pub mod election;
pub mod name;
pub mod publication;
pub mod records;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;
pub mod tlv;
pub mod traits;

pub use cert::{Cert, Thumbprint, Validity};
pub use distributor::{Config, DistributorError, SgKeyDistributor};
pub use name::{Component, Name};
pub use publication::Publication;
