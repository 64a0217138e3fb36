//! Welcome-frame version handshake.
//!
//! The hub stamps [`PROTOCOL_VERSION`] into every `welcome` frame as a
//! `major.minor` string. Clients call [`Version::check`] on that string
//! before joining and disconnect when the server speaks a different major
//! version. Minor bumps only add optional frame fields.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version the hub advertises in `welcome`.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Reasons a client refuses the server's advertised version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// The `welcome` frame's version is not `major.minor`.
    #[error("unparsable protocol version '{0}'")]
    Unparsable(String),

    /// The server speaks a different major version.
    #[error("incompatible protocol version {theirs} (client speaks {ours})")]
    Incompatible {
        /// This build's version.
        ours: Version,
        /// The server's advertised version.
        theirs: Version,
    },
}

/// A `major.minor` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Bumped when a frame changes shape or meaning.
    pub major: u8,
    /// Bumped when optional fields are added.
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Validate the version carried by a server's `welcome` frame.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::Unparsable`] when `advertised` is malformed and
    /// [`VersionError::Incompatible`] when its major version differs from
    /// [`PROTOCOL_VERSION`].
    pub fn check(advertised: &str) -> Result<Self, VersionError> {
        let theirs: Self = advertised.parse()?;
        if PROTOCOL_VERSION.is_compatible_with(&theirs) {
            Ok(theirs)
        } else {
            Err(VersionError::Incompatible {
                ours: PROTOCOL_VERSION,
                theirs,
            })
        }
    }

    /// Same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unparsable = || VersionError::Unparsable(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(unparsable)?;
        Ok(Self::new(
            major.parse().map_err(|_| unparsable())?,
            minor.parse().map_err(|_| unparsable())?,
        ))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerFrame;

    fn advertised(frame: &ServerFrame) -> &str {
        match frame {
            ServerFrame::Welcome { version, .. } => version,
            other => panic!("expected welcome, got {}", other.kind()),
        }
    }

    #[test]
    fn test_welcome_version_accepted() {
        let welcome = ServerFrame::welcome("conn-1", PROTOCOL_VERSION.to_string());
        assert_eq!(Version::check(advertised(&welcome)), Ok(PROTOCOL_VERSION));

        // A newer minor from the same major is still fine.
        let newer = Version::new(PROTOCOL_VERSION.major, PROTOCOL_VERSION.minor + 3);
        let welcome = ServerFrame::welcome("conn-1", newer.to_string());
        assert_eq!(Version::check(advertised(&welcome)), Ok(newer));
    }

    #[test]
    fn test_welcome_version_other_major_refused() {
        let theirs = Version::new(PROTOCOL_VERSION.major + 1, 0);
        let welcome = ServerFrame::welcome("conn-1", theirs.to_string());

        let err = Version::check(advertised(&welcome)).unwrap_err();
        assert_eq!(
            err,
            VersionError::Incompatible {
                ours: PROTOCOL_VERSION,
                theirs,
            }
        );
        assert!(err.to_string().contains(&theirs.to_string()));
    }

    #[test]
    fn test_welcome_version_malformed() {
        for bad in ["", "1", "1.x", "one.zero", "1.0.0", "300.0"] {
            assert_eq!(
                Version::check(bad),
                Err(VersionError::Unparsable(bad.to_string())),
                "{bad:?}"
            );
        }
        assert_eq!(" 1.0 ".parse::<Version>(), Ok(Version::new(1, 0)));
    }
}
