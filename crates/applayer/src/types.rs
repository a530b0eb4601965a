//! Small wire types shared across the command families.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TypeError {
    #[error("invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("expected {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
}

/// 64-bit end-device identifier (EUI-64), displayed as 16 hex characters.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    pub fn from_slice(b: &[u8]) -> Result<Self, TypeError> {
        if b.len() != 8 {
            return Err(TypeError::Length {
                expected: 8,
                got: b.len(),
            });
        }
        let mut eui = [0u8; 8];
        eui.copy_from_slice(b);
        Ok(Self(eui))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Eui64({})", self)
    }
}

impl FromStr for Eui64 {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b = hex::decode(s)?;
        Self::from_slice(&b)
    }
}

/// 128-bit AES key (McRootKey, McKey, derived session keys).
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Aes128Key(pub [u8; 16]);

impl Aes128Key {
    pub fn from_slice(b: &[u8]) -> Result<Self, TypeError> {
        if b.len() != 16 {
            return Err(TypeError::Length {
                expected: 16,
                got: b.len(),
            });
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(b);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Aes128Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Aes128Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Aes128Key({})", self)
    }
}

impl FromStr for Aes128Key {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b = hex::decode(s)?;
        Self::from_slice(&b)
    }
}

/// 32-bit multicast device address, stored big-endian as displayed.
///
/// On the wire (McGroupSetupReq, key-derivation blocks) the address is
/// little-endian; [`DevAddr::to_le_bytes`] performs the swap.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct DevAddr(pub [u8; 4]);

impl DevAddr {
    pub fn from_le_bytes(b: [u8; 4]) -> Self {
        Self([b[3], b[2], b[1], b[0]])
    }

    pub fn to_le_bytes(&self) -> [u8; 4] {
        [self.0[3], self.0[2], self.0[1], self.0[0]]
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevAddr({})", self)
    }
}

impl FromStr for DevAddr {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b = hex::decode(s)?;
        if b.len() != 4 {
            return Err(TypeError::Length {
                expected: 4,
                got: b.len(),
            });
        }
        Ok(Self([b[0], b[1], b[2], b[3]]))
    }
}
