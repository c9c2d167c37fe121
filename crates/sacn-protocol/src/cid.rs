use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Component Identifier: 16 bytes naming one source instance on the wire.
///
/// Rendered as a lowercase, hyphenated UUID string (8-4-4-4-12), which is
/// also the key the source registry uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Cid([u8; 16]);

impl Cid {
    pub const LEN: usize = 16;

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Fresh identifier from the OS CSPRNG (UUID v4).
    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Copy out of a wire buffer. Caller guarantees `src.len() >= 16`.
    pub(crate) fn from_slice(src: &[u8]) -> Self {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&src[..Self::LEN]);
        Self(bytes)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Uuid::from_bytes(self.0).hyphenated(), f)
    }
}

impl FromStr for Cid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(|u| Self(u.into_bytes()))
    }
}

impl From<[u8; 16]> for Cid {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}
