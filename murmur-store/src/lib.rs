// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistence interfaces of the murmur session layer.
//!
//! The session layer treats storage as a narrow key-value and append-only log interface. Every
//! trait is generic over the stored types, so this crate does not depend on any cryptographic
//! types itself.
#[cfg(feature = "memory")]
mod memory;
mod traits;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;
pub use traits::{
    CiphertextRef, Direction, GroupStore, KeyStorage, MessageLog, MessageRecord, SessionStore,
};
