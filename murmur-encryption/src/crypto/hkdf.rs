// SPDX-License-Identifier: MIT OR Apache-2.0

//! HMAC-based key derivation function (HKDF) with SHA-256.
//!
//! <https://www.rfc-editor.org/rfc/rfc5869>
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

/// Extract-and-expand `N` bytes of output key material.
///
/// An empty salt is treated as "no salt" (a string of zeroes of the hash length, as per RFC).
pub fn hkdf<const N: usize>(
    salt: &[u8],
    ikm: &[u8],
    info: Option<&[u8]>,
) -> Result<[u8; N], HkdfError> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; N];
    hk.expand(info.unwrap_or_default(), &mut okm)
        .map_err(|_| HkdfError::InvalidLength(N))?;
    Ok(okm)
}

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("requested {0} bytes of key material which is too large for hkdf-sha256")]
    InvalidLength(usize),
}

#[cfg(test)]
mod tests {
    use super::{HkdfError, hkdf};

    #[test]
    fn info_separates_outputs() {
        let chain: [u8; 32] = hkdf(b"", b"ikm", Some(b"chain")).unwrap();
        let message: [u8; 32] = hkdf(b"", b"ikm", Some(b"message")).unwrap();
        let chain_again: [u8; 32] = hkdf(b"", b"ikm", Some(b"chain")).unwrap();
        assert_ne!(chain, message);
        assert_eq!(chain, chain_again);
    }

    #[test]
    fn output_too_large() {
        // HKDF-SHA256 can expand at most 255 * 32 bytes.
        let result = hkdf::<8192>(b"salt", b"ikm", None);
        assert!(matches!(result, Err(HkdfError::InvalidLength(8192))));
    }
}
