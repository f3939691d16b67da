use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::UpdateError;

/// Dotted `major.minor.patch` triple ordered numerically, component by component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Baseline assigned to manifests synthesized from an unmanaged install.
    pub const ZERO: Version = Version::new(0, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a release tag such as `v3.14.32`.
    pub fn from_tag(tag: &str) -> Result<Self, UpdateError> {
        tag.parse()
    }
}

/// Normalize version string by removing one 'v' prefix and surrounding whitespace.
fn normalize_version(version: &str) -> &str {
    let trimmed = version.trim();
    trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed)
}

impl FromStr for Version {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize_version(s);
        let parts: Vec<&str> = normalized.split('.').collect();
        if parts.len() != 3 {
            return Err(UpdateError::Version(format!(
                "{s:?} is not of the form MAJOR.MINOR.PATCH"
            )));
        }

        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            // `u32::from_str` accepts a leading '+', which is not a valid component.
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(UpdateError::Version(format!(
                    "{s:?} has a non-numeric component {part:?}"
                )));
            }
            *slot = part
                .parse()
                .map_err(|_| UpdateError::Version(format!("{s:?} component {part:?} overflows")))?;
        }

        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
