//! Configuration readable from a config file.
//!
//! Session settings can be read from a TOML file holding a `[client]` and a
//! `[server]` table; see [SessionConfig]. All intervals are given in seconds.
//! Options left out of the file take their default values.

use std::{fs, path::Path};

use anyhow::ensure;
use serde::{Deserialize, Serialize};

use secure_session_util::time::{dur, Timing};

/// Default client key renewal interval: ten hours
pub const CLIENT_KEY_RENEWAL_INTERVAL: Timing = 10.0 * 3600.0;
/// Default server key renewal interval: fifteen hours
pub const SERVER_KEY_RENEWAL_INTERVAL: Timing = 15.0 * 3600.0;
pub const KEY_ROLLOVER_INTERVAL: Timing = 5.0 * 60.0;
pub const INACTIVITY_TIMEOUT: Timing = 2.0 * 60.0;
pub const MAXIMUM_PENDING_SESSIONS: usize = 128;
pub const MAXIMUM_PENDING_KEYS_PER_SESSION: usize = 5;
pub const RENEWAL_THRESHOLD_PERCENT: u8 = 80;
pub const DEFAULT_TIMEOUT: Timing = 60.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientChannelKind {
    /// Simplex request-reply session
    #[default]
    Request,
    Duplex,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerChannelKind {
    /// Simplex request-reply session
    #[default]
    Reply,
    Duplex,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSessionConfig {
    /// Upper bound on how long one key generation is used
    pub key_renewal_interval: Timing,

    /// How long the previous key is still accepted after a renewal
    pub key_rollover_interval: Timing,

    /// Share of a token's validity window after which it gets renewed
    pub renewal_threshold_percent: u8,

    /// Keep receiving when a single receive fails on the transport
    pub tolerate_transport_failures: bool,

    pub can_renew_session: bool,

    pub channel_kind: ClientChannelKind,
}

impl Default for ClientSessionConfig {
    fn default() -> Self {
        Self {
            key_renewal_interval: CLIENT_KEY_RENEWAL_INTERVAL,
            key_rollover_interval: KEY_ROLLOVER_INTERVAL,
            renewal_threshold_percent: RENEWAL_THRESHOLD_PERCENT,
            tolerate_transport_failures: true,
            can_renew_session: true,
            channel_kind: ClientChannelKind::default(),
        }
    }
}

impl ClientSessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.key_renewal_interval > 0.0,
            "key_renewal_interval must be positive, found {}",
            self.key_renewal_interval
        );
        ensure!(
            self.key_rollover_interval > 0.0,
            "key_rollover_interval must be positive, found {}",
            self.key_rollover_interval
        );
        ensure!(
            self.key_rollover_interval <= self.key_renewal_interval,
            "key_rollover_interval ({}) must not exceed key_renewal_interval ({})",
            self.key_rollover_interval,
            self.key_renewal_interval
        );
        ensure!(
            (1..=100).contains(&self.renewal_threshold_percent),
            "renewal_threshold_percent must lie in 1..=100, found {}",
            self.renewal_threshold_percent
        );
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSessionConfig {
    /// Keys older than this are treated as expired, however long the token
    /// itself is valid
    pub maximum_key_renewal_interval: Timing,

    /// How long a superseded key is still accepted
    pub key_rollover_interval: Timing,

    /// Period of the pending session sweep; a session that received no
    /// message is closed after one to two periods
    pub inactivity_timeout: Timing,

    pub maximum_pending_sessions: usize,

    /// Renewed keys the client has not started using yet
    pub maximum_pending_keys_per_session: usize,

    /// Keep receiving when a single receive fails on the transport
    pub tolerate_transport_failures: bool,

    pub can_renew_session: bool,

    pub channel_kind: ServerChannelKind,

    pub open_timeout: Timing,

    /// Bound for closing stale pending sessions and for sending close
    /// responses and faults
    pub close_timeout: Timing,
}

impl Default for ServerSessionConfig {
    fn default() -> Self {
        Self {
            maximum_key_renewal_interval: SERVER_KEY_RENEWAL_INTERVAL,
            key_rollover_interval: KEY_ROLLOVER_INTERVAL,
            inactivity_timeout: INACTIVITY_TIMEOUT,
            maximum_pending_sessions: MAXIMUM_PENDING_SESSIONS,
            maximum_pending_keys_per_session: MAXIMUM_PENDING_KEYS_PER_SESSION,
            tolerate_transport_failures: true,
            can_renew_session: true,
            channel_kind: ServerChannelKind::default(),
            open_timeout: DEFAULT_TIMEOUT,
            close_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ServerSessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("maximum_key_renewal_interval", self.maximum_key_renewal_interval),
            ("key_rollover_interval", self.key_rollover_interval),
            ("inactivity_timeout", self.inactivity_timeout),
            ("open_timeout", self.open_timeout),
            ("close_timeout", self.close_timeout),
        ] {
            ensure!(value > 0.0, "{name} must be positive, found {value}");
        }
        ensure!(
            self.maximum_key_renewal_interval >= self.key_rollover_interval,
            "key_rollover_interval ({}) must not exceed maximum_key_renewal_interval ({})",
            self.key_rollover_interval,
            self.maximum_key_renewal_interval
        );
        ensure!(
            self.maximum_pending_sessions >= 1,
            "maximum_pending_sessions must be at least 1"
        );
        ensure!(
            self.maximum_pending_keys_per_session >= 1,
            "maximum_pending_keys_per_session must be at least 1"
        );
        Ok(())
    }

    pub fn inactivity_period(&self) -> std::time::Duration {
        dur(self.inactivity_timeout)
    }
}

/// A configuration file with both sides of a session
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub client: ClientSessionConfig,
    pub server: ServerSessionConfig,
}

impl SessionConfig {
    pub fn load<P: AsRef<Path>>(p: P) -> anyhow::Result<Self> {
        Ok(toml::from_str(&fs::read_to_string(p)?)?)
    }

    pub fn store<P: AsRef<Path>>(&self, p: P) -> anyhow::Result<()> {
        fs::write(p, toml::to_string_pretty(&self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.client.validate()?;
        self.server.validate()?;
        Ok(())
    }
}
