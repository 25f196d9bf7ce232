// SPDX-License-Identifier: MIT OR Apache-2.0

//! XChaCha20-Poly1305 authenticated encryption with additional data (AEAD): 256-bit key, 192-bit
//! nonce and a 128-bit tag appended to the ciphertext.
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use thiserror::Error;

pub const AEAD_KEY_SIZE: usize = 32;

pub const AEAD_NONCE_SIZE: usize = 24;

pub type AeadKey = [u8; AEAD_KEY_SIZE];

pub type AeadNonce = [u8; AEAD_NONCE_SIZE];

pub fn aead_encrypt(
    key: &AeadKey,
    plaintext: &[u8],
    nonce: &AeadNonce,
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::Encrypt)
}

pub fn aead_decrypt(
    key: &AeadKey,
    ciphertext: &[u8],
    nonce: &AeadNonce,
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::Decrypt)
}

#[derive(Debug, Error)]
pub enum AeadError {
    #[error("could not encrypt with xchacha20-poly1305")]
    Encrypt,

    #[error("could not decrypt with xchacha20-poly1305")]
    Decrypt,
}
