// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Password transport encryption for subscription requests.
//!
//! Subscribers never put their password on the wire in plain text.
//! Both endpoints derive the same AES-256-GCM transport key from a
//! phrase compiled into the binary, so the scheme keeps passwords out
//! of packet captures but assumes the endpoints themselves are
//! trusted. The wire form is `base64(nonce || ciphertext || tag)`.
//!
//! # Security Properties
//!
//! - **Confidentiality**: AES-256 encryption
//! - **Integrity**: GCM authentication tag (128-bit)
//! - **Nonce**: 96-bit random nonce per encryption (never reused)

use base64::{engine::general_purpose, Engine as _};
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_256_GCM,
};
use ring::error::Unspecified;
use ring::hkdf::{Salt, HKDF_SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Phrase both endpoints derive the transport key from.
const KEY_PHRASE: &[u8] = b"hpdc-subscription-password-transport-v1";

/// HKDF-Extract salt for the transport key.
const KEY_SALT: &[u8] = b"hpdc-password-salt";

/// HKDF-Expand context for the transport key.
const KEY_INFO: &[u8] = b"hpdc password transport key";

/// AES-GCM nonce length in bytes (96 bits).
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes (128 bits).
const TAG_LEN: usize = 16;

/// AES-256-GCM cipher bound to the password transport key.
pub struct PasswordCipher {
    /// 256-bit derived key
    key: [u8; 32],
}

impl PasswordCipher {
    /// Derive the transport key and build a cipher around it.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoError` if HKDF key derivation fails.
    pub fn new() -> Result<Self> {
        // HKDF-Extract then Expand: phrase -> 256-bit transport key
        let salt = Salt::new(HKDF_SHA256, KEY_SALT);
        let prk = salt.extract(KEY_PHRASE);

        let mut key = [0u8; 32];
        prk.expand(&[KEY_INFO], HKDF_SHA256)
            .map_err(|_| Error::CryptoError("HKDF expand failed".to_string()))?
            .fill(&mut key)
            .map_err(|_| Error::CryptoError("HKDF fill failed".to_string()))?;

        Ok(Self { key })
    }

    /// Encrypt a password for transport.
    ///
    /// Each call draws a fresh random nonce, so two encryptions of the
    /// same password produce different wire strings.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoError` if the system CSPRNG or the AEAD
    /// seal operation fails. Encryption is refused rather than run with
    /// a predictable nonce.
    pub fn encrypt(&self, password: &str) -> Result<String> {
        let rng = SystemRandom::new();
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill(&mut nonce)
            .map_err(|_| Error::CryptoError("nonce generation failed".to_string()))?;

        let unbound_key = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| Error::CryptoError("failed to create AES-256-GCM key".to_string()))?;
        let mut sealing_key = SealingKey::new(unbound_key, SingleNonce::new(nonce));

        let mut in_out = password.as_bytes().to_vec();
        sealing_key
            .seal_in_place_append_tag(Aad::empty(), &mut in_out)
            .map_err(|_| Error::CryptoError("password encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + in_out.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&in_out);
        Ok(general_purpose::STANDARD.encode(blob))
    }

    /// Decrypt a transported password.
    ///
    /// # Errors
    ///
    /// Returns `Error::AuthenticationFailed` if the blob is malformed,
    /// too short, fails GCM tag verification, or does not decode as
    /// UTF-8. All of these mean the subscriber does not hold the
    /// transport key or the packet was tampered with.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let blob = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| Error::AuthenticationFailed("malformed encrypted password".to_string()))?;

        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::AuthenticationFailed(
                "encrypted password too short".to_string(),
            ));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&blob[..NONCE_LEN]);

        let unbound_key = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| Error::CryptoError("failed to create AES-256-GCM key".to_string()))?;
        let mut opening_key = OpeningKey::new(unbound_key, SingleNonce::new(nonce));

        let mut in_out = blob[NONCE_LEN..].to_vec();
        let plaintext = opening_key
            .open_in_place(Aad::empty(), &mut in_out)
            .map_err(|_| {
                Error::AuthenticationFailed("password decryption failed".to_string())
            })?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| Error::AuthenticationFailed("password is not valid UTF-8".to_string()))
    }
}

impl Drop for PasswordCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Nonce sequence that yields one externally generated nonce, then fails.
///
/// ring's BoundKey API drives nonces through a sequence; every packet
/// here gets its own key binding, so a single-shot sequence is enough.
struct SingleNonce {
    nonce: Option<[u8; NONCE_LEN]>,
}

impl SingleNonce {
    fn new(nonce: [u8; NONCE_LEN]) -> Self {
        Self { nonce: Some(nonce) }
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> core::result::Result<Nonce, Unspecified> {
        let nonce_bytes = self.nonce.take().ok_or(Unspecified)?;
        Nonce::try_assume_unique_for_key(&nonce_bytes)
    }
}

/// Encrypt a password for a subscribe request (subscriber side).
pub fn encrypt_password(password: &str) -> Result<String> {
    PasswordCipher::new()?.encrypt(password)
}

/// Decrypt a transported password (publisher side).
pub fn decrypt_password(encoded: &str) -> Result<String> {
    PasswordCipher::new()?.decrypt(encoded)
}

/// Decrypt a transported password and compare it to the expected secret.
///
/// # Errors
///
/// Returns `Error::AuthenticationFailed` if decryption fails or the
/// decrypted password does not match.
pub fn verify_password(encoded: &str, expected: &str) -> Result<()> {
    let decrypted = decrypt_password(encoded)?;
    if decrypted == expected {
        Ok(())
    } else {
        Err(Error::AuthenticationFailed(
            "password does not match the publisher secret".to_string(),
        ))
    }
}
