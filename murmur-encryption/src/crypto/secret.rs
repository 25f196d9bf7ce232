// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

/// Fixed-size container for key material.
///
/// Bytes are wiped from memory when the container is dropped, are only reachable from inside this
/// crate, never show up in debug output and are compared in constant time.
///
/// Zeroizing is best-effort: copies made by the allocator or by moves the compiler inserts are
/// outside of our control.
#[derive(Clone, Eq, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct Secret<const N: usize>(#[serde(with = "serde_bytes")] [u8; N]);

impl<const N: usize> Secret<N> {
    pub(crate) fn from_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> PartialEq for Secret<N> {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl<const N: usize> fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Secret").field(&"***").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Secret;

    #[test]
    fn debug_hides_value() {
        let secret = Secret::from_bytes([42u8; 4]);
        assert_eq!(format!("{secret:?}"), "Secret(\"***\")");
    }

    #[test]
    fn equality() {
        assert_eq!(Secret::from_bytes([1u8; 8]), Secret::from_bytes([1u8; 8]));
        assert_ne!(Secret::from_bytes([1u8; 8]), Secret::from_bytes([2u8; 8]));
    }
}
