use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Broker protocol version.
///
/// Pre-1.0 brokers use four components (`0.10.2.1`); from 1.0 on versions are
/// plain `major.minor.patch` with no pre-release or build suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KafkaVersion {
    parts: [u32; 4],
}

impl KafkaVersion {
    pub const DEFAULT: &'static str = "3.7.0";

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidVersion {
            version: s.to_string(),
            reason: reason.to_string(),
        };

        if let Some(rest) = s.strip_prefix("0.") {
            let fields: Vec<&str> = rest.split('.').collect();
            if fields.len() != 3 {
                return Err(invalid("pre-1.0 versions have the form 0.X.Y.Z"));
            }
            let mut parts = [0u32; 4];
            for (slot, field) in parts[1..].iter_mut().zip(&fields) {
                if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid("version components must be decimal numbers"));
                }
                *slot = field
                    .parse()
                    .map_err(|_| invalid("version component out of range"))?;
            }
            return Ok(Self { parts });
        }

        let version = semver::Version::parse(s).map_err(|e| invalid(&e.to_string()))?;
        if !version.pre.is_empty() || !version.build.is_empty() {
            return Err(invalid("pre-release and build metadata are not allowed"));
        }
        if version.major == 0 {
            return Err(invalid("pre-1.0 versions have the form 0.X.Y.Z"));
        }
        let component =
            |v: u64| u32::try_from(v).map_err(|_| invalid("version component out of range"));
        Ok(Self {
            parts: [
                component(version.major)?,
                component(version.minor)?,
                component(version.patch)?,
                0,
            ],
        })
    }

    pub fn major(&self) -> u32 {
        self.parts[0]
    }

    pub fn minor(&self) -> u32 {
        self.parts[1]
    }

    pub fn patch(&self) -> u32 {
        self.parts[2]
    }
}

impl Default for KafkaVersion {
    fn default() -> Self {
        // 3.7.0
        Self {
            parts: [3, 7, 0, 0],
        }
    }
}

impl FromStr for KafkaVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.parts;
        if a == 0 {
            write!(f, "0.{b}.{c}.{d}")
        } else {
            write!(f, "{a}.{b}.{c}")
        }
    }
}
