//! Security identifiers
//!
//! SIDs show up both as event fields (`InTypeSid`) and as extended data when a provider is enabled
//! with [`TraceFlags::EVENT_ENABLE_PROPERTY_SID`](crate::provider::TraceFlags::EVENT_ENABLE_PROPERTY_SID).
//! This module decodes their binary form and renders the usual `S-1-5-...` string, without calling into
//! the OS.
use std::fmt;
use std::str::FromStr;

/// SID decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SidError {
    /// The buffer is shorter than the SID it describes
    #[error("buffer too short for a SID ({0} bytes)")]
    TooShort(usize),
    /// Only revision 1 SIDs exist
    #[error("unknown SID revision {0}")]
    InvalidRevision(u8),
    /// A SID has at most 15 sub-authorities
    #[error("too many sub-authorities ({0})")]
    TooManySubAuthorities(u8),
    /// The string is not in the `S-R-I-S-S...` form
    #[error("invalid SID string {0:?}")]
    InvalidString(String),
}

const SID_REVISION: u8 = 1;
const SID_MAX_SUB_AUTHORITIES: u8 = 15;
const SID_HEADER_SIZE: usize = 8;

/// A decoded security identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sid {
    revision: u8,
    identifier_authority: [u8; 6],
    sub_authorities: Vec<u32>,
}

impl Sid {
    pub fn new(identifier_authority: u64, sub_authorities: &[u32]) -> Self {
        let bytes = identifier_authority.to_be_bytes();
        let mut authority = [0u8; 6];
        authority.copy_from_slice(&bytes[2..]);
        Sid {
            revision: SID_REVISION,
            identifier_authority: authority,
            sub_authorities: sub_authorities.to_vec(),
        }
    }

    /// The size in bytes of the SID that starts at `buffer`, if its header is readable
    pub fn encoded_len(buffer: &[u8]) -> Option<usize> {
        let count = *buffer.get(1)?;
        Some(SID_HEADER_SIZE + 4 * count as usize)
    }

    /// Decode the SID at the start of `buffer`
    ///
    /// Trailing bytes are ignored.
    pub fn from_bytes(buffer: &[u8]) -> Result<Self, SidError> {
        if buffer.len() < SID_HEADER_SIZE {
            return Err(SidError::TooShort(buffer.len()));
        }
        let revision = buffer[0];
        if revision != SID_REVISION {
            return Err(SidError::InvalidRevision(revision));
        }
        let count = buffer[1];
        if count > SID_MAX_SUB_AUTHORITIES {
            return Err(SidError::TooManySubAuthorities(count));
        }
        let total = SID_HEADER_SIZE + 4 * count as usize;
        let body = buffer
            .get(SID_HEADER_SIZE..total)
            .ok_or(SidError::TooShort(buffer.len()))?;

        let mut identifier_authority = [0u8; 6];
        identifier_authority.copy_from_slice(&buffer[2..SID_HEADER_SIZE]);
        let sub_authorities = body
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Sid {
            revision,
            identifier_authority,
            sub_authorities,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SID_HEADER_SIZE + 4 * self.sub_authorities.len());
        out.push(self.revision);
        out.push(self.sub_authorities.len() as u8);
        out.extend_from_slice(&self.identifier_authority);
        for sub in &self.sub_authorities {
            out.extend_from_slice(&sub.to_le_bytes());
        }
        out
    }

    pub fn identifier_authority(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[2..].copy_from_slice(&self.identifier_authority);
        u64::from_be_bytes(bytes)
    }

    pub fn sub_authorities(&self) -> &[u32] {
        &self.sub_authorities
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let authority = self.identifier_authority();
        write!(f, "S-{}-", self.revision)?;
        // Same convention as ConvertSidToStringSid
        if authority >= 1 << 32 {
            write!(f, "0x{:012X}", authority)?;
        } else {
            write!(f, "{}", authority)?;
        }
        for sub in &self.sub_authorities {
            write!(f, "-{}", sub)?;
        }
        Ok(())
    }
}

impl FromStr for Sid {
    type Err = SidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SidError::InvalidString(s.to_string());
        let mut parts = s.split('-');
        if parts.next() != Some("S") {
            return Err(invalid());
        }
        let revision: u8 = parts.next().and_then(|r| r.parse().ok()).ok_or_else(invalid)?;
        if revision != SID_REVISION {
            return Err(SidError::InvalidRevision(revision));
        }
        let authority_str = parts.next().ok_or_else(invalid)?;
        let authority = match authority_str.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => authority_str.parse(),
        }
        .map_err(|_| invalid())?;
        if authority >= 1 << 48 {
            return Err(invalid());
        }
        let sub_authorities = parts
            .map(|p| p.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        if sub_authorities.len() > SID_MAX_SUB_AUTHORITIES as usize {
            return Err(SidError::TooManySubAuthorities(sub_authorities.len() as u8));
        }
        Ok(Sid::new(authority, &sub_authorities))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Sid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_convert_sid_to_string() {
        let sid: Vec<u8> = vec![1, 2, 0, 0, 0, 0, 0, 5, 0x20, 0, 0, 0, 0x20, 2, 0, 0];
        let parsed = Sid::from_bytes(&sid).unwrap();
        assert_eq!(parsed.to_string(), "S-1-5-32-544");
        assert_eq!(parsed.to_bytes(), sid);
        assert_eq!(Sid::encoded_len(&sid), Some(16));
    }

    #[test]
    fn test_string_round_trip() {
        let sid: Sid = "S-1-5-21-1004336348-1177238915-682003330-512".parse().unwrap();
        assert_eq!(sid.identifier_authority(), 5);
        assert_eq!(sid.sub_authorities().len(), 5);
        assert_eq!(
            Sid::from_bytes(&sid.to_bytes()).unwrap().to_string(),
            "S-1-5-21-1004336348-1177238915-682003330-512"
        );
    }

    #[test]
    fn test_truncated_sid() {
        let sid: Vec<u8> = vec![1, 2, 0, 0, 0, 0, 0, 5, 0x20, 0, 0, 0, 0x20, 2];
        assert_eq!(Sid::from_bytes(&sid), Err(SidError::TooShort(14)));
        assert_eq!(Sid::from_bytes(&sid[..3]), Err(SidError::TooShort(3)));
        assert_eq!(
            Sid::from_bytes(&[2, 0, 0, 0, 0, 0, 0, 5]),
            Err(SidError::InvalidRevision(2))
        );
    }

    #[test]
    fn test_large_authority_is_hex() {
        let sid = Sid::new(0x0000_1234_5678_9abc, &[1]);
        assert_eq!(sid.to_string(), "S-1-0x123456789ABC-1");
        assert_eq!(sid.to_string().parse::<Sid>().unwrap(), sid);
    }
}
