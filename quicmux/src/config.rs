use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use crate::{MAX_CID_SIZE, MIN_CID_SIZE};

/// Whether an engine hosts the client or the server end of its connections
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

/// A QUIC version the engine knows how to route
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum QuicVersion {
    /// Legacy gQUIC with the old-style header
    Q043 = 0,
    /// Transitional version with IETF-shaped long headers but fixed 8-byte CIDs
    Q044 = 1,
    /// Transitional version that always truncates the client CID to zero
    Q046 = 2,
    /// IETF QUIC v1
    V1 = 3,
}

impl QuicVersion {
    pub(crate) fn bit(self) -> VersionSet {
        VersionSet::from_bits_retain(1 << self as u8)
    }
}

bitflags! {
    /// Set of QUIC versions an engine offers
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct VersionSet: u8 {
        const Q043 = 1 << 0;
        const Q044 = 1 << 1;
        const Q046 = 1 << 2;
        const V1   = 1 << 3;

        /// Versions using the legacy gQUIC header layout
        const GQUIC_HEADER = Self::Q043.bits();
        /// Versions that force a zero-length client CID
        const FORCED_TCID0 = Self::Q046.bits();
        /// IETF versions
        const IETF = Self::V1.bits();
    }
}

impl VersionSet {
    /// Every version this engine implementation supports
    pub const SUPPORTED: Self = Self::all();

    pub fn contains_version(self, version: QuicVersion) -> bool {
        self.contains(version.bit())
    }
}

impl Default for VersionSet {
    fn default() -> Self {
        Self::SUPPORTED
    }
}

/// Error produced when engine settings fail validation
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("flow control window set too low")]
    FlowControlWindowTooLow,
    #[error("No supported QUIC versions specified")]
    NoSupportedVersions,
    #[error("one or more unsupported QUIC version is specified")]
    UnsupportedVersion,
    #[error("The maximum value of idle timeout is 600 seconds")]
    IdleTimeoutTooLong,
    #[error(
        "Source connection ID cannot be {0} bytes long; it must be between {MIN_CID_SIZE} \
         and {MAX_CID_SIZE}"
    )]
    BadScidLen(u8),
    #[error(
        "Combined number of streams and placeholders ({0}) is greater than the maximum \
         supported number of elements in the HTTP/3 priority tree ({H3_PRIO_MAX_ELEMS})"
    )]
    TooManyPriorityElems(u64),
}

/// Smallest flow control window either side may configure
pub(crate) const MIN_FCW: u32 = 16 * 1024;

/// Capacity of the HTTP/3 priority tree shared by streams and placeholders
pub(crate) const H3_PRIO_MAX_ELEMS: u64 = 256;

/// Engine settings, validated once at construction and immutable after
///
/// Build one with [`EngineConfig::default_for`] and adjust fields before
/// handing it to [`Engine::new`](crate::Engine::new); construction fails
/// with a [`ConfigError`] if the combination is invalid.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// QUIC versions to offer; must intersect [`VersionSet::SUPPORTED`]
    pub versions: VersionSet,
    /// Source CID length in bytes; zero is legal only for clients
    pub scid_len: u8,
    /// Connection flow control window
    pub cfcw: u32,
    /// Stream flow control window
    pub sfcw: u32,
    /// Idle timeout, at most 600 seconds
    pub idle_timeout: Duration,
    /// Egress processing deadline; `None` disables the deadline check
    pub proc_time_thresh: Option<Duration>,
    /// Whether to accept peers that truncate our CID to zero length
    pub support_tcid0: bool,
    /// Whether to honor legacy public resets and stateless resets
    pub honor_prst: bool,
    /// Whether connections should pace outgoing packets
    pub pace_packets: bool,
    /// Whether to request ECN marking on outgoing datagrams
    pub ecn: bool,
    /// Initial limit on peer-initiated bidirectional streams
    pub init_max_streams_bidi: u32,
    /// Initial limit on peer-initiated unidirectional streams
    pub init_max_streams_uni: u32,
    /// HTTP/3 priority placeholders to advertise
    pub h3_placeholders: u32,
}

impl EngineConfig {
    /// Settings with the stock defaults for `side`
    pub fn default_for(side: Side) -> Self {
        let (cfcw, sfcw) = match side {
            Side::Server => (768 * 1024, 64 * 1024),
            Side::Client => (15 * 1024 * 1024, 6 * 1024 * 1024),
        };
        Self {
            versions: VersionSet::default(),
            scid_len: 8,
            cfcw,
            sfcw,
            idle_timeout: Duration::from_secs(30),
            proc_time_thresh: None,
            support_tcid0: true,
            honor_prst: false,
            pace_packets: true,
            ecn: false,
            init_max_streams_bidi: 100,
            init_max_streams_uni: 100,
            h3_placeholders: 5,
        }
    }

    /// Validate the settings for an engine on `side`
    pub(crate) fn validate(&self, side: Side) -> Result<(), ConfigError> {
        if self.cfcw < MIN_FCW || self.sfcw < MIN_FCW {
            return Err(ConfigError::FlowControlWindowTooLow);
        }
        if (self.versions & VersionSet::SUPPORTED).is_empty() {
            return Err(ConfigError::NoSupportedVersions);
        }
        if !(self.versions - VersionSet::SUPPORTED).is_empty() {
            return Err(ConfigError::UnsupportedVersion);
        }
        if self.idle_timeout > Duration::from_secs(600) {
            return Err(ConfigError::IdleTimeoutTooLong);
        }
        let zero_scid_ok = side.is_client() && self.scid_len == 0;
        if !zero_scid_ok
            && ((self.scid_len as usize) < MIN_CID_SIZE || (self.scid_len as usize) > MAX_CID_SIZE)
        {
            return Err(ConfigError::BadScidLen(self.scid_len));
        }
        let sum = u64::from(self.init_max_streams_bidi)
            + u64::from(self.init_max_streams_uni)
            + u64::from(self.h3_placeholders);
        if sum > H3_PRIO_MAX_ELEMS {
            return Err(ConfigError::TooManyPriorityElems(sum));
        }
        Ok(())
    }

    /// Whether connections are routed by local address instead of by CID
    ///
    /// True when a forced-TCID0 version is offered, when a legacy-header
    /// version is combined with TCID0 support, or when source CIDs are
    /// zero-length.
    pub(crate) fn hash_conns_by_addr(&self) -> bool {
        if self.versions.intersects(VersionSet::FORCED_TCID0) {
            return true;
        }
        if self.versions.intersects(VersionSet::GQUIC_HEADER) && self.support_tcid0 {
            return true;
        }
        self.scid_len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default_for(Side::Server)
            .validate(Side::Server)
            .unwrap();
        EngineConfig::default_for(Side::Client)
            .validate(Side::Client)
            .unwrap();
    }

    #[test]
    fn rejects_low_flow_control_window() {
        let mut config = EngineConfig::default_for(Side::Server);
        config.cfcw = MIN_FCW - 1;
        assert_eq!(
            config.validate(Side::Server),
            Err(ConfigError::FlowControlWindowTooLow)
        );
    }

    #[test]
    fn rejects_empty_version_set() {
        let mut config = EngineConfig::default_for(Side::Server);
        config.versions = VersionSet::empty();
        assert_eq!(
            config.validate(Side::Server),
            Err(ConfigError::NoSupportedVersions)
        );
    }

    #[test]
    fn rejects_unknown_version_bits() {
        let mut config = EngineConfig::default_for(Side::Server);
        config.versions = VersionSet::from_bits_retain(0x80) | VersionSet::V1;
        assert_eq!(
            config.validate(Side::Server),
            Err(ConfigError::UnsupportedVersion)
        );
    }

    #[test]
    fn rejects_long_idle_timeout() {
        let mut config = EngineConfig::default_for(Side::Client);
        config.idle_timeout = Duration::from_secs(601);
        assert_eq!(
            config.validate(Side::Client),
            Err(ConfigError::IdleTimeoutTooLong)
        );
    }

    #[test]
    fn zero_scid_is_client_only() {
        let mut config = EngineConfig::default_for(Side::Client);
        config.scid_len = 0;
        config.validate(Side::Client).unwrap();
        assert_eq!(
            config.validate(Side::Server),
            Err(ConfigError::BadScidLen(0))
        );

        config.scid_len = 3;
        assert_eq!(
            config.validate(Side::Client),
            Err(ConfigError::BadScidLen(3))
        );
        config.scid_len = 19;
        assert_eq!(
            config.validate(Side::Client),
            Err(ConfigError::BadScidLen(19))
        );
    }

    #[test]
    fn bounds_priority_tree_occupancy() {
        let mut config = EngineConfig::default_for(Side::Server);
        config.init_max_streams_bidi = 200;
        config.init_max_streams_uni = 50;
        config.h3_placeholders = 7;
        assert_eq!(
            config.validate(Side::Server),
            Err(ConfigError::TooManyPriorityElems(257))
        );
    }

    #[test]
    fn address_hashing_rules() {
        let mut config = EngineConfig::default_for(Side::Client);
        config.versions = VersionSet::V1;
        assert!(!config.hash_conns_by_addr());

        // Forced-TCID0 version offered
        config.versions = VersionSet::V1 | VersionSet::Q046;
        assert!(config.hash_conns_by_addr());

        // Legacy header version with TCID0 support
        config.versions = VersionSet::Q043;
        config.support_tcid0 = true;
        assert!(config.hash_conns_by_addr());
        config.support_tcid0 = false;
        assert!(!config.hash_conns_by_addr());

        // Explicit zero-length source CIDs
        config.versions = VersionSet::V1;
        config.scid_len = 0;
        assert!(config.hash_conns_by_addr());
    }
}
