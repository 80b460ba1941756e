// SPDX-License-Identifier: MIT OR Apache-2.0

//! Elliptic-curve Diffie-Hellman key agreement (X25519) and conversion of
//! Ed25519 identity keys to their Montgomery form.
//!
//! Peers sign with Ed25519 but the subscriber-group secret is sealed towards
//! each member with X25519, so both halves of a member's signing key pair get
//! converted once and reused for every key record.
use curve25519_dalek::MontgomeryPoint;
use curve25519_dalek::edwards::CompressedEdwardsY;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use thiserror::Error;

use crate::crypto::Secret;

pub const SECRET_KEY_SIZE: usize = 32;

pub const PUBLIC_KEY_SIZE: usize = 32;

pub const AGREEMENT_SIZE: usize = 32;

/// X25519 secret key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(Secret<SECRET_KEY_SIZE>);

impl SecretKey {
    /// Interprets the given bytes as an X25519 scalar, applying the standard
    /// clamping.
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        let mut bytes = bytes;
        bytes[0] &= 248u8;
        bytes[31] &= 127u8;
        bytes[31] |= 64u8;
        Self(Secret::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        self.0.as_bytes()
    }

    /// Derives the matching public key.
    pub fn public_key(&self) -> PublicKey {
        let point = MontgomeryPoint::mul_base_clamped(*self.0.as_bytes());
        PublicKey(point.to_bytes())
    }

    /// X25519 shared secret between our secret key and their public key.
    ///
    /// Fails on low-order public keys (the agreement would be the identity
    /// element).
    pub fn calculate_agreement(
        &self,
        their_public: &PublicKey,
    ) -> Result<[u8; AGREEMENT_SIZE], X25519Error> {
        let shared = MontgomeryPoint(their_public.0).mul_clamped(*self.0.as_bytes());
        if shared.to_bytes() == [0; AGREEMENT_SIZE] {
            return Err(X25519Error::LowOrderPoint);
        }
        Ok(shared.to_bytes())
    }
}

/// X25519 public key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }
}

/// Converts the seed half of an Ed25519 signing key into an X25519 secret
/// key (RFC 8032 key expansion, then clamping).
///
/// Only the first 32 bytes of `ed_secret` are used; some encodings append
/// the public key after the seed.
pub fn secret_key_from_ed25519(ed_secret: &[u8]) -> Result<SecretKey, X25519Error> {
    if ed_secret.len() < SECRET_KEY_SIZE {
        return Err(X25519Error::MalformedSecretKey);
    }
    let digest = Sha512::digest(&ed_secret[..SECRET_KEY_SIZE]);
    let mut bytes = [0u8; SECRET_KEY_SIZE];
    bytes.copy_from_slice(&digest[..SECRET_KEY_SIZE]);
    Ok(SecretKey::from_bytes(bytes))
}

/// Converts an Ed25519 public key (compressed Edwards point) into an X25519
/// public key (Montgomery u-coordinate).
pub fn public_key_from_ed25519(ed_public: &[u8]) -> Result<PublicKey, X25519Error> {
    let compressed = CompressedEdwardsY::from_slice(ed_public)
        .map_err(|_| X25519Error::MalformedPublicKey)?;
    let point = compressed
        .decompress()
        .ok_or(X25519Error::MalformedPublicKey)?;
    Ok(PublicKey(point.to_montgomery().to_bytes()))
}

#[derive(Debug, Error)]
pub enum X25519Error {
    #[error("ed25519 secret key has invalid length")]
    MalformedSecretKey,

    #[error("bytes do not encode a valid curve point")]
    MalformedPublicKey,

    #[error("public key is a low-order point")]
    LowOrderPoint,
}
