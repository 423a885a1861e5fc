//! Firmware/hardware version parsing: `major.minor`.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

/// A `(major, minor)` version pair, totally ordered lexicographically
/// (major first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32) -> Self {
        Version { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no major.minor pattern found in {0:?}")]
pub struct VersionError(String);

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\.(\d+)").expect("static pattern is valid"))
}

impl FromStr for Version {
    type Err = VersionError;

    /// Accepts the first `\d+\.\d+` substring found anywhere in the input,
    /// not an anchored full-string match -- firmware strings in the wild
    /// carry suffixes (`"2.3-rc1"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = pattern().captures(s).ok_or_else(|| VersionError(s.to_owned()))?;
        let major = caps[1].parse().map_err(|_| VersionError(s.to_owned()))?;
        let minor = caps[2].parse().map_err(|_| VersionError(s.to_owned()))?;
        Ok(Version { major, minor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_version() {
        assert_eq!("1.0".parse::<Version>().unwrap(), Version::new(1, 0));
        assert_eq!("2.3".parse::<Version>().unwrap(), Version::new(2, 3));
    }

    #[test]
    fn parses_version_with_suffix() {
        assert_eq!("2.3-rc1".parse::<Version>().unwrap(), Version::new(2, 3));
    }

    #[test]
    fn rejects_string_without_a_version() {
        assert!("no-version-here".parse::<Version>().is_err());
    }

    #[test]
    fn orders_lexicographically() {
        assert!(Version::new(1, 9) < Version::new(2, 0));
        assert!(Version::new(2, 0) < Version::new(2, 1));
        assert_eq!(Version::new(2, 1), Version::new(2, 1));
    }

    #[test]
    fn display_round_trips() {
        let v = Version::new(1, 2);
        assert_eq!(v.to_string(), "1.2");
        assert_eq!(v.to_string().parse::<Version>().unwrap(), v);
    }
}
