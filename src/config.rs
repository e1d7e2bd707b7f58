//! On-disk configuration: the local key pair, the route table, and an
//! optional signal channel URL.
//!
//! YAML by default, JSON when the path ends in `.json`. The file holds
//! a private key, so it is written with mode 0600.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypt::{Key, KeyPair};
use crate::error::{Error, Result};

/// Rendezvous used when the config does not name one.
pub const DEFAULT_SIGNAL_CHANNEL: &str = "operator://operator.rtctunnel.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RouteKind {
    #[default]
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl FromStr for RouteKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TCP" | "tcp" => Ok(RouteKind::Tcp),
            "UDP" | "udp" => Ok(RouteKind::Udp),
            other => Err(Error::Config(format!("invalid route type: {other}"))),
        }
    }
}

impl std::fmt::Display for RouteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteKind::Tcp => f.write_str("TCP"),
            RouteKind::Udp => f.write_str("UDP"),
        }
    }
}

/// A directional forwarding rule: traffic arriving on
/// `local_peer:local_port` exits at `remote_peer:remote_port`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "LocalPort")]
    pub local_port: u16,
    #[serde(rename = "LocalPeer")]
    pub local_peer: Key,
    #[serde(rename = "RemotePeer")]
    pub remote_peer: Key,
    #[serde(rename = "RemotePort")]
    pub remote_port: u16,
    #[serde(rename = "Type", default)]
    pub kind: RouteKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "KeyPair")]
    pub keypair: KeyPair,
    #[serde(rename = "Routes", default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(
        rename = "signalchannel",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub signal_channel: Option<String>,
}

impl Config {
    /// A fresh config with a newly generated identity and no routes.
    pub fn generate() -> Self {
        Config {
            keypair: KeyPair::generate(),
            routes: Vec::new(),
            signal_channel: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg = if is_json(path) {
            serde_json::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?
        } else {
            serde_yaml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?
        };
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = if is_json(path) {
            serde_json::to_string(self).map_err(|e| Error::Config(e.to_string()))?
        } else {
            serde_yaml::to_string(self).map_err(|e| Error::Config(e.to_string()))?
        };
        fs::write(path, raw)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Append a route, ignoring exact duplicates.
    pub fn add_route(&mut self, route: Route) {
        if self.routes.contains(&route) {
            return;
        }
        self.routes.push(route);
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Default config path under the OS user config directory.
pub fn default_path() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| Error::Config("no user config directory".to_string()))?;
    Ok(base.join("rtctunnel").join("rtctunnel.yaml"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        let mut cfg = Config::generate();
        cfg.add_route(Route {
            local_port: 10000,
            local_peer: cfg.keypair.public,
            remote_peer: KeyPair::generate().public,
            remote_port: 10000,
            kind: RouteKind::Tcp,
        });
        cfg.signal_channel = Some("memory://test".to_string());
        cfg
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtctunnel.yaml");

        let cfg = sample();
        cfg.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), cfg);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtctunnel.json");

        let cfg = sample();
        cfg.save(&path).unwrap();

        // Really JSON on disk.
        let raw = std::fs::read_to_string(&path).unwrap();
        serde_json::from_str::<serde_json::Value>(&raw).unwrap();

        assert_eq!(Config::load(&path).unwrap(), cfg);
    }

    #[test]
    fn test_add_route_dedupes() {
        let mut cfg = Config::generate();
        let route = Route {
            local_port: 8080,
            local_peer: cfg.keypair.public,
            remote_peer: KeyPair::generate().public,
            remote_port: 80,
            kind: RouteKind::Tcp,
        };
        cfg.add_route(route);
        cfg.add_route(route);
        assert_eq!(cfg.routes.len(), 1);

        // A different kind is a different route.
        cfg.add_route(Route {
            kind: RouteKind::Udp,
            ..route
        });
        assert_eq!(cfg.routes.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_with_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtctunnel.yaml");
        sample().save(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_keys_serialized_as_base58() {
        let cfg = sample();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        assert!(yaml.contains(&cfg.keypair.public.to_string()));
        assert!(yaml.contains("Public:"));
        assert!(yaml.contains("LocalPort: 10000"));
        assert!(yaml.contains("Type: TCP"));
        assert!(yaml.contains("signalchannel: memory://test"));
    }

    #[test]
    fn test_route_kind_parse() {
        assert_eq!("TCP".parse::<RouteKind>().unwrap(), RouteKind::Tcp);
        assert_eq!("udp".parse::<RouteKind>().unwrap(), RouteKind::Udp);
        assert!("SCTP".parse::<RouteKind>().is_err());
    }
}
