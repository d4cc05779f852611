use std::fmt;

use const_format::concatcp;

const API_MAJOR: u16 = 1;
const API_MINOR: u16 = 0;

/// The API version implemented by this crate.
pub const API_VERSION: ApiVersion = ApiVersion::new(API_MAJOR, API_MINOR);

/// [`API_VERSION`] as a `major.minor` string.
pub const API_VERSION_STR: &str = concatcp!(API_MAJOR, ".", API_MINOR);

/// A plugin API version. On the wire the major version occupies the most significant 16 bits
/// of an `i32` and the minor version the least significant 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApiVersion {
    major: u16,
    minor: u16,
}

impl ApiVersion {
    /// Create a version from its parts.
    #[must_use]
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Unpack a version as returned by a plugin's `api_version` export.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub const fn from_raw(raw: i32) -> Self {
        let raw = raw as u32;
        Self {
            major: (raw >> 16) as u16,
            minor: (raw & 0xFFFF) as u16,
        }
    }

    /// Pack the version for the `api_version` export.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn to_raw(self) -> i32 {
        (((self.major as u32) << 16) | self.minor as u32) as i32
    }

    /// The major version.
    #[must_use]
    pub const fn major(self) -> u16 {
        self.major
    }

    /// The minor version.
    #[must_use]
    pub const fn minor(self) -> u16 {
        self.minor
    }

    /// Whether a host supporting `self` can run a plugin declaring `plugin`: the major versions
    /// must match and the plugin must not need a newer minor version than the host provides.
    #[must_use]
    pub const fn accepts(self, plugin: ApiVersion) -> bool {
        self.major == plugin.major && plugin.minor <= self.minor
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_major_into_high_bits() {
        let version = ApiVersion::new(2, 7);
        assert_eq!(version.to_raw(), 0x0002_0007);
        assert_eq!(ApiVersion::from_raw(0x0002_0007), version);
    }

    #[test]
    fn unpacks_high_major_without_sign_extension() {
        let version = ApiVersion::from_raw(i32::MIN | 3);
        assert_eq!(version.major(), 0x8000);
        assert_eq!(version.minor(), 3);
        assert_eq!(version.to_raw(), i32::MIN | 3);
    }

    #[test]
    fn reads_big_endian_halves() {
        // Major then minor as big-endian 16-bit halves is the same packed value.
        let mut b = [0u8; 4];
        b[..2].copy_from_slice(&0i16.to_be_bytes());
        b[2..].copy_from_slice(&5i16.to_be_bytes());
        assert_eq!(ApiVersion::from_raw(i32::from_be_bytes(b)), ApiVersion::new(0, 5));
    }

    #[test]
    fn compatibility_requires_equal_major_and_older_minor() {
        let host = ApiVersion::new(1, 4);
        assert!(host.accepts(ApiVersion::new(1, 0)));
        assert!(host.accepts(ApiVersion::new(1, 4)));
        assert!(!host.accepts(ApiVersion::new(1, 5)));
        assert!(!host.accepts(ApiVersion::new(0, 4)));
        assert!(!host.accepts(ApiVersion::new(2, 0)));
    }

    #[test]
    fn version_string_matches_constant() {
        assert_eq!(API_VERSION_STR, API_VERSION.to_string());
    }
}
