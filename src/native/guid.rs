//! A portable 128-bit GUID
//!
//! Provider identities, activity ids and GUID-typed fields all use this type. Its memory layout
//! matches the Windows `GUID` structure, so it can be read straight out of an event buffer.
use std::fmt;
use std::str::FromStr;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Errors when parsing a [`Guid`] from its textual form
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuidError {
    /// The string does not have the `8-4-4-4-12` shape (optionally surrounded by braces)
    #[error("invalid GUID length or layout: {0:?}")]
    InvalidFormat(String),
    /// A character is not an hexadecimal digit
    #[error("invalid hexadecimal digit in GUID {0:?}")]
    InvalidDigit(String),
}

/// A 128-bit globally unique identifier
#[repr(C)]
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, AsBytes, FromBytes, FromZeroes)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    /// The all-zero GUID
    pub const fn zeroed() -> Self {
        Self::from_values(0, 0, 0, [0; 8])
    }

    pub const fn from_values(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// Build a GUID from its big-endian 128-bit representation, e.g. `0x22fb2cd6_0e7b_422b_a0c7_2fad1fd0e716`
    pub const fn from_u128(uuid: u128) -> Self {
        Self {
            data1: (uuid >> 96) as u32,
            data2: (uuid >> 80 & 0xffff) as u16,
            data3: (uuid >> 64 & 0xffff) as u16,
            data4: (uuid as u64).to_be_bytes(),
        }
    }

    pub const fn to_u128(&self) -> u128 {
        ((self.data1 as u128) << 96)
            | ((self.data2 as u128) << 80)
            | ((self.data3 as u128) << 64)
            | u64::from_be_bytes(self.data4) as u128
    }

    /// Parse the usual `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` form, with or without braces
    pub fn parse(s: &str) -> Result<Self, GuidError> {
        let trimmed = s.trim();
        let inner = trimmed
            .strip_prefix('{')
            .and_then(|t| t.strip_suffix('}'))
            .unwrap_or(trimmed);

        let groups: Vec<&str> = inner.split('-').collect();
        let expected_lengths = [8, 4, 4, 4, 12];
        if groups.len() != expected_lengths.len()
            || groups
                .iter()
                .zip(expected_lengths.iter())
                .any(|(g, l)| g.len() != *l)
        {
            return Err(GuidError::InvalidFormat(s.to_string()));
        }

        let hex: String = groups.concat();
        let value =
            u128::from_str_radix(&hex, 16).map_err(|_| GuidError::InvalidDigit(s.to_string()))?;
        // from_str_radix accepts a leading '+'
        if hex.starts_with('+') {
            return Err(GuidError::InvalidDigit(s.to_string()));
        }
        Ok(Self::from_u128(value))
    }

    /// Decode a GUID stored in an event buffer (native byte order for the first three members)
    pub fn from_ne_slice(bytes: &[u8]) -> Option<Self> {
        Self::read_from(bytes)
    }
}

impl FromStr for Guid {
    type Err = GuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Guid {
    type Error = GuidError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl TryFrom<&String> for Guid {
    type Error = GuidError;

    fn try_from(s: &String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<u128> for Guid {
    fn from(uuid: u128) -> Self {
        Self::from_u128(uuid)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Guid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(windows)]
impl From<windows::core::GUID> for Guid {
    fn from(guid: windows::core::GUID) -> Self {
        Self::from_values(guid.data1, guid.data2, guid.data3, guid.data4)
    }
}

#[cfg(windows)]
impl From<Guid> for windows::core::GUID {
    fn from(guid: Guid) -> Self {
        windows::core::GUID::from_values(guid.data1, guid.data2, guid.data3, guid.data4)
    }
}
