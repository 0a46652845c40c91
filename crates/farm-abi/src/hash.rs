//! Fingerprint of the call-record layout.
//!
//! A Park and a Ref sharing one region must be built against the same
//! layout. The fingerprint hashes every constant that shapes a record and
//! every function id, so two builds agree exactly when their hashes do.

use sha2::{Digest, Sha256};

use crate::layout::{
    FuncId, ARENA_HEADER_LEN, CALL_PENDING, CALL_SHUTDOWN, ERRNO_PARK_FAULT, ERRNO_UNSET,
    ERRNO_WORD, FD_WORD, FUNC_WORD, LOCK_HELD, LOCK_HELD_DOUBLE, RECORD_WORDS, REPLY_KIND_WORD,
    SLOT_LISTENING, SLOT_RETIRED,
};

/// A 256-bit layout hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutHash([u8; 32]);

impl LayoutHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Format as hex string.
    #[cfg(feature = "std")]
    pub fn to_hex(&self) -> alloc::string::String {
        use alloc::format;
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Hash the layout constants and function table.
pub fn layout_fingerprint() -> LayoutHash {
    let mut hasher = Sha256::new();
    hasher.update(b"wasi-farm/record");
    for word in [
        RECORD_WORDS as u32,
        FUNC_WORD as u32,
        FD_WORD as u32,
        REPLY_KIND_WORD as u32,
        ERRNO_WORD as u32,
        ARENA_HEADER_LEN,
        LOCK_HELD,
        LOCK_HELD_DOUBLE,
        CALL_PENDING,
        CALL_SHUTDOWN,
        SLOT_LISTENING,
        SLOT_RETIRED,
    ] {
        hasher.update(word.to_le_bytes());
    }
    hasher.update(ERRNO_UNSET.to_le_bytes());
    hasher.update(ERRNO_PARK_FAULT.to_le_bytes());
    for func in FuncId::ALL {
        hasher.update((func as u32).to_le_bytes());
        hasher.update(func.name().as_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    LayoutHash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_within_a_build() {
        assert_eq!(layout_fingerprint(), layout_fingerprint());
    }

    #[cfg(feature = "std")]
    #[test]
    fn hex_is_64_chars() {
        assert_eq!(layout_fingerprint().to_hex().len(), 64);
    }
}
