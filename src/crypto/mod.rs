// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives for subscriber-group key distribution.
//!
//! Algorithms:
//! - X25519 key agreement, with conversion of Ed25519 identity keys to their
//!   Montgomery form
//! - Anonymous public-key encryption ("sealed box") built from an ephemeral
//!   X25519 exchange, HKDF-SHA256 and ChaCha20-Poly1305
//!
//! Random Number Generator:
//! - ChaCha20 stream cipher, seeded via `getrandom`
mod rng;
mod secret;
pub mod sealed_box;
pub mod x25519;

pub use rng::{Rng, RngError};
pub use secret::Secret;
