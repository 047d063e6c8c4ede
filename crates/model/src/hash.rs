use crate::error::{Error, ErrorKind};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Hash identifying a piece of content, independent of where it is stored.
///
/// Always lowercase hexadecimal. Parsing is case-insensitive, so hashes
/// received in upper case compare equal to locally computed ones.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// BLAKE3 hash of `data`.
    pub fn of(data: impl AsRef<[u8]>) -> Self {
        Self(blake3::hash(data.as_ref()).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First two characters, used to fan cached files out over directories.
    pub fn shard(&self) -> &str {
        &self.0[..self.0.len().min(2)]
    }
}

impl FromStr for ContentHash {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::try_from(s.to_string())?)
    }
}
// Serde needs a `Display` error, so this one reports the bare kind.
impl TryFrom<String> for ContentHash {
    type Error = ErrorKind;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ErrorKind::InvalidHash(s));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}
impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}
impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_is_case_insensitive() {
        let upper: ContentHash = "AB12CD".parse().unwrap();
        let lower: ContentHash = "ab12cd".parse().unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.to_string(), "ab12cd");
        assert_eq!(upper.shard(), "ab");
    }

    #[rstest]
    #[case("")]
    #[case("xyz")]
    #[case("ab 12")]
    #[case("../ab")]
    fn test_rejects(#[case] input: &str) {
        let err = input.parse::<ContentHash>().unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidHash(_)));
    }

    #[test]
    fn test_of_matches_blake3() {
        let hash = ContentHash::of(b"texture bytes");
        assert_eq!(hash.as_str(), blake3::hash(b"texture bytes").to_hex().as_str());
        assert_eq!(hash.as_str().len(), 64);
    }

    #[test]
    fn test_serde_round_trip_normalizes() {
        let hash: ContentHash = serde_json::from_str(r#""ABCDEF""#).unwrap();
        assert_eq!(serde_json::to_string(&hash).unwrap(), r#""abcdef""#);
        assert!(serde_json::from_str::<ContentHash>(r#""nothex""#).is_err());
    }
}
