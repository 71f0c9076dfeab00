// Router configuration.
//
// `RouterConfig` is the already-parsed configuration the core consumes. The
// binary loads it from a JSON file (`from_json_file`) and applies CLI
// overrides; tests build it in code from `Default`. Nothing is ever written
// back.
//
// Timeouts are stored as whole milliseconds so the JSON stays readable and
// tests can use short intervals.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RouterError};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub name: String,
    /// Interface to bind and the address advertised to peers.
    pub address: String,
    pub port: u16,
    pub password: String,
    pub motd: Option<String>,
    /// Location sent with `Redirect` when a frame arrives with no body.
    pub redirect: Option<String>,
    /// Maximum number of buffered chunks per transfer.
    pub buffer_size: usize,
    /// Worker pool size.
    pub threads: usize,
    /// Maximum queued deliveries per session; the oldest are dropped.
    pub mailbox_capacity: usize,
    pub timeouts: Timeouts,
    pub rooms: Vec<RoomConfig>,
    pub routers: Vec<PeerConfig>,
    /// Verified names and their keys.
    pub verified: BTreeMap<String, String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: "shade-router".into(),
            address: "127.0.0.1".into(),
            port: 8080,
            password: String::new(),
            motd: None,
            redirect: None,
            buffer_size: 32,
            threads: 4,
            mailbox_capacity: 1024,
            timeouts: Timeouts::default(),
            rooms: Vec::new(),
            routers: Vec::new(),
            verified: BTreeMap::new(),
        }
    }
}

impl RouterConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RouterError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| RouterError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(RouterError::Config("threads must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(RouterError::Config("buffer_size must be at least 1".into()));
        }
        if self.mailbox_capacity == 0 {
            return Err(RouterError::Config(
                "mailbox_capacity must be at least 1".into(),
            ));
        }
        // Zero intervals would spin the sweeper, and a zero socket timeout
        // is refused by the OS.
        let t = &self.timeouts;
        for (name, ms) in [
            ("socket", t.socket),
            ("idle", t.idle),
            ("monitor", t.monitor),
            ("probe", t.probe),
        ] {
            if ms == 0 {
                return Err(RouterError::Config(format!(
                    "timeouts.{name} must be at least 1 ms"
                )));
            }
        }
        Ok(())
    }
}

/// All router timeouts, in milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Deadline for one frame read or one reply write.
    pub socket: u64,
    /// How long a connection may sit between frames.
    pub idle: u64,
    /// Sessions not seen for this long are torn down.
    pub session: u64,
    /// Lifetime of a message id in a group's dedup table.
    pub message: u64,
    /// Transfers untouched for this long are removed.
    pub transfer: u64,
    /// Sweep interval.
    pub monitor: u64,
    /// Connect deadline when probing peer routers.
    pub probe: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            socket: 10_000,
            idle: 60_000,
            session: 180_000,
            message: 60_000,
            transfer: 120_000,
            monitor: 5_000,
            probe: 2_000,
        }
    }
}

impl Timeouts {
    pub fn socket(&self) -> Duration {
        Duration::from_millis(self.socket)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle)
    }

    pub fn session(&self) -> Duration {
        Duration::from_millis(self.session)
    }

    pub fn message(&self) -> Duration {
        Duration::from_millis(self.message)
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_millis(self.transfer)
    }

    pub fn monitor(&self) -> Duration {
        Duration::from_millis(self.monitor)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe)
    }
}

/// A room materialized in every new group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub name: String,
    #[serde(default)]
    pub color: Option<u32>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

/// A peer router in the federation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_runnable() {
        let config = RouterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.address, "127.0.0.1");
        assert!(config.routers.is_empty());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{
            "port": 9000,
            "rooms": [{ "name": "lobby" }],
            "routers": [{ "name": "peer", "address": "10.0.0.2", "port": 9001 }],
            "timeouts": { "monitor": 250 }
        }"#;
        let config: RouterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.buffer_size, RouterConfig::default().buffer_size);
        assert!(config.rooms[0].enabled);
        assert!(config.routers[0].enabled);
        assert_eq!(config.timeouts.monitor(), Duration::from_millis(250));
        assert_eq!(config.timeouts.session, Timeouts::default().session);
    }

    #[test]
    fn zero_threads_rejected() {
        let config = RouterConfig {
            threads: 0,
            ..RouterConfig::default()
        };
        assert!(matches!(config.validate(), Err(RouterError::Config(_))));
    }

    #[test]
    fn zero_intervals_rejected() {
        for timeouts in [
            Timeouts {
                monitor: 0,
                ..Timeouts::default()
            },
            Timeouts {
                probe: 0,
                ..Timeouts::default()
            },
            Timeouts {
                socket: 0,
                ..Timeouts::default()
            },
        ] {
            let config = RouterConfig {
                timeouts,
                ..RouterConfig::default()
            };
            assert!(matches!(config.validate(), Err(RouterError::Config(_))));
        }
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = RouterConfig::from_json_file("/nonexistent/shade.json").unwrap_err();
        assert!(matches!(err, RouterError::Config(_)));
    }
}
