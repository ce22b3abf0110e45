//! Host size scale.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Ordinal size of a host, from smallest to largest.
///
/// Applications declare a minimum size; a host may only start applications
/// whose minimum does not exceed its own assigned size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostSize {
    /// Extra small.
    #[default]
    Xs,
    /// Small.
    S,
    /// Medium.
    M,
    /// Large.
    L,
    /// Extra large.
    Xl,
}

impl HostSize {
    /// Returns true if an application requiring `minimum` may run on a host of
    /// size `host`. An unknown host size is permissive.
    #[must_use]
    pub fn allows(host: Option<Self>, minimum: Self) -> bool {
        host.map_or(true, |size| minimum <= size)
    }

    /// The lowercase name used in metadata files and configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Xs => "xs",
            Self::S => "s",
            Self::M => "m",
            Self::L => "l",
            Self::Xl => "xl",
        }
    }
}

impl fmt::Display for HostSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostSize {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xs" => Ok(Self::Xs),
            "s" => Ok(Self::S),
            "m" => Ok(Self::M),
            "l" => Ok(Self::L),
            "xl" => Ok(Self::Xl),
            other => Err(CoreError::UnknownHostSize(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        assert!(HostSize::Xs < HostSize::S);
        assert!(HostSize::S < HostSize::M);
        assert!(HostSize::L < HostSize::Xl);
    }

    #[test]
    fn allows() {
        assert!(HostSize::allows(None, HostSize::Xl));
        assert!(HostSize::allows(Some(HostSize::M), HostSize::M));
        assert!(HostSize::allows(Some(HostSize::M), HostSize::S));
        assert!(!HostSize::allows(Some(HostSize::S), HostSize::L));
    }

    #[test]
    fn parse_and_serde() {
        assert_eq!("XL".parse::<HostSize>().unwrap(), HostSize::Xl);
        assert_eq!(
            "huge".parse::<HostSize>(),
            Err(CoreError::UnknownHostSize("huge".to_string()))
        );
        let json = serde_json::to_string(&HostSize::M).unwrap();
        assert_eq!(json, "\"m\"");
    }
}
