//! On-disk configuration: a world-readable public file and a tighter
//! secrets file.
//!
//! Both are TOML. Secrets are written with mode 0o640 via temp-file +
//! atomic rename so a crash can never leave a half-written token behind,
//! and never appear in the public file.

use anyhow::{Context, Result};
use atomicwrites::{AtomicFile, OverwriteBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A peer's accepted subset of what it advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSelections {
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub dns_search: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_url: Option<String>,
    pub device_name: Option<String>,
    pub device_id: Option<String>,
    /// Base64 Curve25519 private key.
    pub private_key: Option<String>,
    /// Tunnel address in CIDR notation, e.g. `100.64.0.3/24`.
    pub tunnel_address: Option<String>,

    /// LAN routes advertised to peers.
    #[serde(default)]
    pub advertised_routes: Vec<String>,
    #[serde(default)]
    pub advertised_dns: Vec<String>,
    #[serde(default)]
    pub advertised_search: Vec<String>,

    /// Accept every peer's advertised routes without per-peer selection.
    #[serde(default)]
    pub accept_routes: bool,

    /// STUN servers handed to every peer connection, e.g.
    /// `stun:stun.l.google.com:19302`.
    #[serde(default)]
    pub ice_servers: Vec<String>,

    /// Interface name hint.
    #[serde(default = "default_interface")]
    pub interface: String,

    /// MTU of the tunnel interface.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Per-peer accepted routes/DNS, keyed by peer device id.
    #[serde(default)]
    pub peer_selections: BTreeMap<String, PeerSelections>,
}

fn default_interface() -> String {
    "bamgate0".to_owned()
}

fn default_mtu() -> u16 {
    tun_device::DEFAULT_MTU
}

/// The validated form of [`Config`]; every required field is present.
#[derive(Debug, Clone)]
pub struct ValidConfig {
    pub server_url: url::Url,
    pub device_name: String,
    pub device_id: String,
    pub private_key: x25519_dalek::StaticSecret,
    pub tunnel_address: ip_network::Ipv4Network,
    pub tunnel_ip: std::net::Ipv4Addr,
    pub advertised_routes: Vec<String>,
    pub advertised_dns: Vec<String>,
    pub advertised_search: Vec<String>,
    pub accept_routes: bool,
    pub ice_servers: Vec<String>,
    pub interface: String,
    pub mtu: u16,
    pub peer_selections: BTreeMap<String, PeerSelections>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;

        toml::from_str(&raw).with_context(|| format!("cannot parse {}", path.display()))
    }

    /// Validates the config, reporting *all* missing fields in one message.
    pub fn validate(self) -> Result<ValidConfig, String> {
        let mut missing = Vec::new();

        if self.server_url.is_none() {
            missing.push("server_url");
        }
        if self.device_name.is_none() {
            missing.push("device_name");
        }
        if self.device_id.is_none() {
            missing.push("device_id");
        }
        if self.private_key.is_none() {
            missing.push("private_key");
        }
        if self.tunnel_address.is_none() {
            missing.push("tunnel_address");
        }

        if !missing.is_empty() {
            return Err(format!("missing required fields: {}", missing.join(", ")));
        }

        let server_url = self.server_url.expect("checked above");
        let server_url = url::Url::parse(&server_url)
            .map_err(|e| format!("server_url is not a valid URL: {e}"))?;

        let private_key = wg_tunnel::parse_private_key(self.private_key.as_deref().expect("checked above"))
            .map_err(|e| format!("private_key is invalid: {e}"))?;

        let tunnel_address = self.tunnel_address.expect("checked above");
        let (tunnel_ip, tunnel_address) = parse_cidr(&tunnel_address)
            .map_err(|e| format!("tunnel_address is invalid: {e}"))?;

        Ok(ValidConfig {
            server_url,
            device_name: self.device_name.expect("checked above"),
            device_id: self.device_id.expect("checked above"),
            private_key,
            tunnel_address,
            tunnel_ip,
            advertised_routes: self.advertised_routes,
            advertised_dns: self.advertised_dns,
            advertised_search: self.advertised_search,
            accept_routes: self.accept_routes,
            ice_servers: self.ice_servers,
            interface: self.interface,
            mtu: self.mtu,
            peer_selections: self.peer_selections,
        })
    }
}

/// Parses `a.b.c.d/len` into the host address and its network.
pub fn parse_cidr(cidr: &str) -> Result<(std::net::Ipv4Addr, ip_network::Ipv4Network)> {
    let (ip, len) = cidr
        .split_once('/')
        .context("expected CIDR notation (a.b.c.d/len)")?;

    let ip: std::net::Ipv4Addr = ip.parse().context("invalid IPv4 address")?;
    let len: u8 = len.parse().context("invalid prefix length")?;

    let network = ip_network::Ipv4Network::new_truncate(ip, len)
        .context("invalid prefix length")?;

    Ok((ip, network))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Secrets {
    pub refresh_token: Option<String>,
    pub turn_secret: Option<String>,
    pub api_token: Option<String>,
}

impl Secrets {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("cannot read secrets file {}", path.display()))
            }
        };

        check_secret_permissions(path);

        toml::from_str(&raw).with_context(|| format!("cannot parse {}", path.display()))
    }

    /// Writes the secrets atomically with restrictive permissions.
    ///
    /// The write happens to a temp file followed by a rename, so readers
    /// never observe a partial file and a crash mid-write leaves the old
    /// secrets intact.
    pub fn store(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }

        let serialized = toml::to_string_pretty(self).context("cannot serialize secrets")?;

        AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
            .write(|f| {
                use std::io::Write;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;

                    let permissions = std::fs::Permissions::from_mode(0o640);
                    f.set_permissions(permissions)?;
                }

                f.write_all(serialized.as_bytes())
            })
            .with_context(|| format!("cannot write secrets file {}", path.display()))?;

        Ok(())
    }
}

#[cfg(unix)]
fn check_secret_permissions(path: &Path) {
    use std::os::unix::fs::MetadataExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };

    if metadata.mode() & 0o004 != 0 {
        tracing::warn!(
            path = %path.display(),
            "secrets file is world-readable; fix with `chmod 640`"
        );
    }
}

#[cfg(not(unix))]
fn check_secret_permissions(_path: &Path) {}

/// Default locations: `/etc/bamgate/bamgate.toml` and its sibling
/// `secrets.toml`.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/bamgate/bamgate.toml")
}

pub fn secrets_path_for(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("secrets.toml")
}

/// Persists the current peer selections back into the public config file.
pub fn store_selections(
    config_path: &Path,
    selections: &BTreeMap<String, PeerSelections>,
) -> Result<()> {
    let mut config = Config::load(config_path)?;
    config.peer_selections = selections.clone();

    let serialized = toml::to_string_pretty(&config).context("cannot serialize config")?;

    AtomicFile::new(config_path, OverwriteBehavior::AllowOverwrite)
        .write(|f| {
            use std::io::Write;

            f.write_all(serialized.as_bytes())
        })
        .with_context(|| format!("cannot write config file {}", config_path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            server_url = "https://worker.example.com"
            device_name = "laptop"
            device_id = "dev-1"
            private_key = "GBPSZT8Ajx7SOGBIVr4BdmOVK1K6gKnBEoMBjZ6FgW4="
            tunnel_address = "100.64.0.3/24"
        "#
    }

    #[test]
    fn minimal_config_validates() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        let valid = config.validate().unwrap();

        assert_eq!(valid.device_name, "laptop");
        assert_eq!(valid.mtu, tun_device::DEFAULT_MTU);
        assert_eq!(valid.interface, "bamgate0");
        assert_eq!(valid.tunnel_ip, "100.64.0.3".parse::<std::net::Ipv4Addr>().unwrap());
    }

    #[test]
    fn validation_reports_every_missing_field() {
        let config: Config = toml::from_str("accept_routes = true").unwrap();

        let error = config.validate().unwrap_err();

        for field in [
            "server_url",
            "device_name",
            "device_id",
            "private_key",
            "tunnel_address",
        ] {
            assert!(error.contains(field), "{error} should mention {field}");
        }
    }

    #[test]
    fn bad_private_key_is_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.private_key = Some("not-a-key".to_owned());

        assert!(config.validate().unwrap_err().contains("private_key"));
    }

    #[test]
    fn secrets_round_trip_with_restrictive_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.toml");

        let secrets = Secrets {
            refresh_token: Some("r-token".to_owned()),
            turn_secret: Some("t-secret".to_owned()),
            api_token: None,
        };

        secrets.store(&path).unwrap();

        let loaded = Secrets::load(&path).unwrap();
        assert_eq!(loaded.refresh_token.as_deref(), Some("r-token"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;

            let mode = std::fs::metadata(&path).unwrap().mode() & 0o777;
            assert_eq!(mode, 0o640);
        }
    }

    #[test]
    fn missing_secrets_file_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();

        let secrets = Secrets::load(&dir.path().join("nope.toml")).unwrap();

        assert!(secrets.refresh_token.is_none());
    }

    #[test]
    fn selections_survive_a_config_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bamgate.toml");
        std::fs::write(&path, minimal_toml()).unwrap();

        let mut selections = BTreeMap::new();
        selections.insert(
            "peer-b".to_owned(),
            PeerSelections {
                routes: vec!["192.168.10.0/24".to_owned()],
                ..Default::default()
            },
        );

        store_selections(&path, &selections).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.peer_selections, selections);
        assert_eq!(reloaded.device_name.as_deref(), Some("laptop"));
    }
}
