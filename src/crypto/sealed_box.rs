// SPDX-License-Identifier: MIT OR Apache-2.0

//! Anonymous public-key encryption towards a single recipient ("sealed box").
//!
//! The sender generates an ephemeral X25519 key pair, derives a symmetric key
//! from the ephemeral exchange with the recipient's public key and encrypts
//! the message with ChaCha20-Poly1305. The ephemeral public key is prepended
//! to the ciphertext, so the recipient can recover the symmetric key without
//! learning anything about the sender.
//!
//! Both the ephemeral public key and the recipient's public key are bound
//! into the key derivation, a fresh key is derived per box so the AEAD nonce
//! is constant.
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::x25519::{PUBLIC_KEY_SIZE, PublicKey, SecretKey, X25519Error};
use crate::crypto::{Rng, RngError};

/// Bytes a sealed box adds on top of the message: the ephemeral public key
/// and the AEAD tag.
pub const SEAL_OVERHEAD: usize = PUBLIC_KEY_SIZE + 16;

const KDF_INFO: &[u8] = b"dct-sgkd sealed box v1";

/// Seals `message` towards the holder of the secret key matching
/// `recipient`.
pub fn seal(message: &[u8], recipient: &PublicKey, rng: &Rng) -> Result<Vec<u8>, SealedBoxError> {
    let ephemeral_secret = SecretKey::from_bytes(rng.random_array()?);
    let ephemeral_public = ephemeral_secret.public_key();
    let shared = Zeroizing::new(ephemeral_secret.calculate_agreement(recipient)?);

    let key = derive_key(&shared, &ephemeral_public, recipient)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&[0; 12]), message)
        .map_err(SealedBoxError::Encrypt)?;

    let mut out = Vec::with_capacity(PUBLIC_KEY_SIZE + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Opens a sealed box with the recipient's key pair. Returns the message, or
/// an error when the box is malformed, was sealed towards somebody else or
/// was tampered with.
pub fn open(
    sealed: &[u8],
    recipient_public: &PublicKey,
    recipient_secret: &SecretKey,
) -> Result<Zeroizing<Vec<u8>>, SealedBoxError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(SealedBoxError::TooShort);
    }
    let ephemeral_public = PublicKey::from_bytes(
        sealed[..PUBLIC_KEY_SIZE]
            .try_into()
            .expect("slice has public key size"),
    );
    let shared = Zeroizing::new(recipient_secret.calculate_agreement(&ephemeral_public)?);

    let key = derive_key(&shared, &ephemeral_public, recipient_public)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let message = cipher
        .decrypt(Nonce::from_slice(&[0; 12]), &sealed[PUBLIC_KEY_SIZE..])
        .map_err(SealedBoxError::Decrypt)?;
    Ok(Zeroizing::new(message))
}

fn derive_key(
    shared: &[u8; 32],
    ephemeral_public: &PublicKey,
    recipient: &PublicKey,
) -> Result<Zeroizing<[u8; 32]>, SealedBoxError> {
    let mut salt = [0u8; PUBLIC_KEY_SIZE * 2];
    salt[..PUBLIC_KEY_SIZE].copy_from_slice(ephemeral_public.as_bytes());
    salt[PUBLIC_KEY_SIZE..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(KDF_INFO, &mut okm[..])
        .map_err(|_| SealedBoxError::KeyDerivation)?;
    Ok(okm)
}

#[derive(Debug, Error)]
pub enum SealedBoxError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error("could not derive sealed box key")]
    KeyDerivation,

    #[error("sealed box is shorter than the minimum overhead")]
    TooShort,

    #[error("could not encrypt sealed box: {0}")]
    Encrypt(chacha20poly1305::Error),

    #[error("could not decrypt sealed box: {0}")]
    Decrypt(chacha20poly1305::Error),
}
