// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capability resolution over signing chains.
//!
//! A capability is granted by a certificate somewhere between an identity
//! and the domain's trust anchor. Resolution walks the chain from the given
//! thumbprint upwards and returns the first matching capability's argument.
use crate::cert::Thumbprint;
use crate::traits::CertStore;

/// Subscriber-group membership; the argument names the collection.
pub const SUBSCRIBER_GROUP: &str = "SG";

/// Keymaker priority for a subscriber-group collection; the argument is a
/// single ASCII digit.
pub const KEYMAKER: &str = "KM";

/// Keymaker priority for the public-keys collection.
pub const KEYMAKER_PUBS: &str = "KMP";

/// Chains longer than this are treated as broken.
const MAX_CHAIN_DEPTH: usize = 16;

/// Argument of the first `cap` capability found on the signing chain of
/// `tp`, or empty when the chain does not grant it.
pub fn capability_argument<C: CertStore>(certs: &C, tp: &Thumbprint, cap: &str) -> Vec<u8> {
    let mut cursor = Some(*tp);
    for _ in 0..MAX_CHAIN_DEPTH {
        let Some(current) = cursor.take().and_then(|tp| certs.get(&tp)) else {
            break;
        };
        if let Some(capability) = &current.capability {
            if capability.id == cap {
                return capability.argument.clone();
            }
        }
        cursor = current.signer;
    }
    Vec::new()
}

/// Keymaker priority declared by the signing chain of `tp` for capability
/// `cap` (`KM` or `KMP`).
///
/// The argument must be a single decimal digit; anything else maps to 0,
/// "not eligible".
pub fn keymaker_priority<C: CertStore>(certs: &C, tp: &Thumbprint, cap: &str) -> i32 {
    priority_value(&capability_argument(certs, tp, cap))
}

fn priority_value(argument: &[u8]) -> i32 {
    match argument {
        &[digit @ b'0'..=b'9'] => (digit - b'0') as i32,
        _ => 0,
    }
}
