//! Session configuration.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use uuid::Uuid;

/// Service type advertised and browsed for by default.
pub const DEFAULT_SERVICE_TYPE: &str = "location-share";

/// Multicast group used for LAN discovery beacons.
pub const DEFAULT_DISCOVERY_GROUP: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 77, 14), 47774);

const MAX_SERVICE_TYPE_LEN: usize = 15;
const MAX_DISPLAY_NAME_BYTES: usize = 63;

/// Configuration shared by every session transport.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Service identifier peers advertise and browse under
    pub service_type: String,
    /// Human-readable name shown in other peers' rosters
    pub display_name: String,
    /// Advertise and browse via multicast beacons (LAN transport only)
    pub discovery: bool,
    /// Multicast group and port for discovery beacons
    pub discovery_group: SocketAddrV4,
    /// Interval between advertisement beacons
    pub beacon_interval: Duration,
    /// Address the session listener binds to
    pub listen_addr: SocketAddr,
    /// Window for an invitation to be accepted and the session established
    pub invite_timeout: Duration,
    /// Outbound payloads buffered per peer link before dropping
    pub outbound_capacity: usize,
    /// Buffered transport/sync events
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            display_name: format!("crayon-{}", &suffix[..8]),
            discovery: true,
            discovery_group: DEFAULT_DISCOVERY_GROUP,
            beacon_interval: Duration::from_secs(1),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            invite_timeout: Duration::from_secs(10),
            outbound_capacity: 64,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Default configuration with the given display name.
    pub fn with_display_name(name: impl Into<String>) -> Self {
        Self {
            display_name: name.into(),
            ..Self::default()
        }
    }

    /// Check the configuration before a transport is built from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_service_type(&self.service_type)?;

        if self.display_name.trim().is_empty() {
            return Err(ConfigError::InvalidDisplayName("display name is empty".into()));
        }
        if self.display_name.len() > MAX_DISPLAY_NAME_BYTES {
            return Err(ConfigError::InvalidDisplayName(format!(
                "{} bytes exceeds {MAX_DISPLAY_NAME_BYTES}",
                self.display_name.len()
            )));
        }

        if self.beacon_interval.is_zero() {
            return Err(ConfigError::InvalidSetting("beacon_interval must be non-zero"));
        }
        if self.invite_timeout.is_zero() {
            return Err(ConfigError::InvalidSetting("invite_timeout must be non-zero"));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::InvalidSetting("outbound_capacity must be non-zero"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidSetting("event_capacity must be non-zero"));
        }
        Ok(())
    }
}

/// Bonjour-style service type: 1–15 chars of `[a-z0-9-]`, at least one
/// letter, no leading, trailing or doubled hyphen.
fn validate_service_type(service: &str) -> Result<(), ConfigError> {
    let invalid = |why: &str| Err(ConfigError::InvalidServiceType(format!("{service:?}: {why}")));

    if service.is_empty() || service.len() > MAX_SERVICE_TYPE_LEN {
        return invalid("must be 1-15 characters");
    }
    if !service
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return invalid("only lowercase ASCII letters, digits and hyphens are allowed");
    }
    if !service.chars().any(|c| c.is_ascii_lowercase()) {
        return invalid("must contain at least one letter");
    }
    if service.starts_with('-') || service.ends_with('-') || service.contains("--") {
        return invalid("hyphens cannot lead, trail or repeat");
    }
    Ok(())
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidServiceType(String),
    InvalidDisplayName(String),
    InvalidSetting(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidServiceType(e) => write!(f, "Invalid service type {e}"),
            Self::InvalidDisplayName(e) => write!(f, "Invalid display name: {e}"),
            Self::InvalidSetting(e) => write!(f, "Invalid setting: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
