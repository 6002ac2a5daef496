//! SHA-256 batch hashing, per §3's "the hash of the concatenated
//! serialized requests (SHA-256)".

use std::fmt;
use std::hash::{Hash, Hasher};

use ring::digest::{self, SHA256, SHA256_OUTPUT_LEN};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::error::*;

pub struct Context(digest::Context);

#[derive(Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    pub const LENGTH: usize = SHA256_OUTPUT_LEN;

    /// A digest of all zero bytes, never produced by [`Context::finish`];
    /// used as the "absent hash" sentinel of a `TxnManager` whose
    /// pre-prepare hasn't arrived yet (§3).
    pub const fn blank() -> Self {
        Self([0; Self::LENGTH])
    }

    pub fn is_blank(&self) -> bool {
        self.0 == [0; Self::LENGTH]
    }

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Digest has an invalid length")
                .wrapped(ErrorKind::CryptoHashRingSha2);
        }
        Ok(Self::from_bytes_unchecked(raw_bytes))
    }

    fn from_bytes_unchecked(raw_bytes: &[u8]) -> Self {
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Self(inner)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

impl Hash for Digest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl Context {
    pub fn new() -> Self {
        Self(digest::Context::new(&SHA256))
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data)
    }

    pub fn finish(self) -> Digest {
        let digest = self.0.finish();
        Digest::from_bytes_unchecked(digest.as_ref())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience one-shot hash of a single byte slice.
pub fn digest(data: &[u8]) -> Digest {
    let mut ctx = Context::new();
    ctx.update(data);
    ctx.finish()
}
