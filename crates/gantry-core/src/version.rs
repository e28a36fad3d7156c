//! Dotted-numeric version handling.
//!
//! Bundle versions are plain dotted numerics (`1.2.3`, `2.0`, `1.2.3.4`).
//! Comparison zero-pads the shorter side, so `1.2` == `1.2.0` and
//! `1.10` > `1.9`.

use crate::error::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A dotted-numeric bundle version.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    raw: String,
    parts: Vec<u64>,
}

impl Version {
    /// Parse a version, failing on non-numeric components.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidVersion { raw: raw.into() });
        }
        let parts = trimmed
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| Error::InvalidVersion { raw: raw.into() })?;
        Ok(Self {
            raw: trimmed.to_string(),
            parts,
        })
    }

    /// The raw version string as read from the manifest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Major component (first part).
    #[must_use]
    pub fn major(&self) -> u64 {
        self.parts.first().copied().unwrap_or(0)
    }

    /// Minor component (second part, zero when absent).
    #[must_use]
    pub fn minor(&self) -> u64 {
        self.parts.get(1).copied().unwrap_or(0)
    }

    /// Whether a snapshot taken at `self` can be restored into `new`:
    /// exact match, or same major with `new` minor >= `self` minor.
    #[must_use]
    pub fn compatible_with(&self, new: &Self) -> bool {
        self == new || (self.major() == new.major() && new.minor() >= self.minor())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::hash::Hash for Version {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Strip trailing zeros so 1.2 and 1.2.0 hash alike.
        let mut parts = self.parts.as_slice();
        while let [rest @ .., 0] = parts {
            parts = rest;
        }
        parts.hash(state);
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_and_display() {
        let v = Version::parse("1.2.3").unwrap();
        assert_eq!(v.to_string(), "1.2.3");
        assert_eq!(v.major(), 1);
        assert_eq!(v.minor(), 2);
    }

    #[test]
    fn rejects_non_numeric() {
        assert!(Version::parse("1.2.x").is_err());
        assert!(Version::parse("").is_err());
        assert!(Version::parse("1.2-beta").is_err());
    }

    #[test]
    fn zero_padded_comparison() {
        let a = Version::parse("1.2").unwrap();
        let b = Version::parse("1.2.0").unwrap();
        assert_eq!(a, b);

        let newer = Version::parse("1.10").unwrap();
        let older = Version::parse("1.9").unwrap();
        assert!(newer > older);

        let long = Version::parse("1.2.0.1").unwrap();
        assert!(long > a);
    }

    #[test]
    fn snapshot_compatibility() {
        let old = Version::parse("1.2.0").unwrap();
        assert!(old.compatible_with(&Version::parse("1.2.0").unwrap()));
        assert!(old.compatible_with(&Version::parse("1.3.0").unwrap()));
        assert!(!old.compatible_with(&Version::parse("1.1.0").unwrap()));
        assert!(!old.compatible_with(&Version::parse("2.2.0").unwrap()));
    }

    #[test]
    fn serde_round_trip() {
        let v = Version::parse("2.0.1").unwrap();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"2.0.1\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
