//! Protocol and encoding versions carried in every message header and
//! encapsulation.
//!
//! Both versions are a `major.minor` byte pair on the wire. The message
//! protocol is always 1.0; encapsulations may use encoding 1.0 or 1.1.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Version of the message protocol (the framing layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    /// Major version - incompatible changes.
    pub major: u8,
    /// Minor version - backward compatible additions.
    pub minor: u8,
}

/// Version of the data encoding used inside an encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EncodingVersion {
    /// Major version - incompatible changes.
    pub major: u8,
    /// Minor version - backward compatible additions.
    pub minor: u8,
}

/// The only message protocol spoken by this crate.
pub const PROTOCOL_1_0: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Encoding used for message headers and legacy peers.
pub const ENCODING_1_0: EncodingVersion = EncodingVersion { major: 1, minor: 0 };

/// Encoding with optional members, compact sizes for enums and sliced classes.
pub const ENCODING_1_1: EncodingVersion = EncodingVersion { major: 1, minor: 1 };

impl ProtocolVersion {
    /// Create a new protocol version.
    pub const fn new(major: u8, minor: u8) -> Self {
        ProtocolVersion { major, minor }
    }

    /// Whether a peer announcing this version can be talked to.
    pub fn is_supported(&self) -> bool {
        self.major == PROTOCOL_1_0.major && self.minor <= PROTOCOL_1_0.minor
    }
}

impl EncodingVersion {
    /// Create a new encoding version.
    pub const fn new(major: u8, minor: u8) -> Self {
        EncodingVersion { major, minor }
    }

    /// Whether encapsulations in this encoding can be decoded.
    pub fn is_supported(&self) -> bool {
        self.major == ENCODING_1_1.major && self.minor <= ENCODING_1_1.minor
    }

    /// True for the 1.0 encoding, which lacks optionals and sliced classes.
    pub fn is_1_0(&self) -> bool {
        *self == ENCODING_1_0
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_1_0
    }
}

impl Default for EncodingVersion {
    fn default() -> Self {
        ENCODING_1_1
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Error parsing a `major.minor` version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseVersionError(pub String);

impl fmt::Display for ParseVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid version `{}`", self.0)
    }
}

impl std::error::Error for ParseVersionError {}

fn parse_pair(s: &str) -> Result<(u8, u8), ParseVersionError> {
    let (major, minor) = s
        .trim()
        .split_once('.')
        .ok_or_else(|| ParseVersionError(s.to_string()))?;
    let major = major
        .parse::<u8>()
        .map_err(|_| ParseVersionError(s.to_string()))?;
    let minor = minor
        .parse::<u8>()
        .map_err(|_| ParseVersionError(s.to_string()))?;
    Ok((major, minor))
}

impl FromStr for ProtocolVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = parse_pair(s)?;
        Ok(ProtocolVersion::new(major, minor))
    }
}

impl FromStr for EncodingVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = parse_pair(s)?;
        Ok(EncodingVersion::new(major, minor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(ProtocolVersion::default(), PROTOCOL_1_0);
        assert_eq!(EncodingVersion::default(), ENCODING_1_1);
    }

    #[test]
    fn test_supported() {
        assert!(PROTOCOL_1_0.is_supported());
        assert!(!ProtocolVersion::new(2, 0).is_supported());
        assert!(ENCODING_1_0.is_supported());
        assert!(ENCODING_1_1.is_supported());
        assert!(!EncodingVersion::new(1, 2).is_supported());
        assert!(!EncodingVersion::new(2, 0).is_supported());
    }

    #[test]
    fn test_display_and_parse() {
        assert_eq!(ENCODING_1_1.to_string(), "1.1");
        assert_eq!("1.0".parse::<EncodingVersion>().unwrap(), ENCODING_1_0);
        assert_eq!("1.0".parse::<ProtocolVersion>().unwrap(), PROTOCOL_1_0);
        assert!("1".parse::<EncodingVersion>().is_err());
        assert!("x.1".parse::<EncodingVersion>().is_err());
        assert!("1.300".parse::<EncodingVersion>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(ENCODING_1_0 < ENCODING_1_1);
        assert!(ENCODING_1_0.is_1_0());
        assert!(!ENCODING_1_1.is_1_0());
    }
}
