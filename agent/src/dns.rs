//! DNS resolver switching.
//!
//! When peers advertise DNS servers and the user accepts them, the agent
//! rewrites `/etc/resolv.conf`, keeping a snapshot of the original so
//! shutdown restores it bit for bit. Our own file carries a marker header:
//! a file with the marker is never snapshotted as "original" (it would be
//! a leftover of a crashed run).

use anyhow::Result;
use std::net::IpAddr;

#[cfg(target_os = "linux")]
pub use linux::DnsManager;

#[cfg(target_os = "macos")]
pub use macos::DnsManager;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use anyhow::Context;
    use atomicwrites::{AtomicFile, OverwriteBehavior};
    use std::io::Write;
    use std::path::PathBuf;

    const RESOLV_CONF: &str = "/etc/resolv.conf";
    const MARKER: &str = "# Generated by bamgate; the original configuration is restored on shutdown.";

    pub struct DnsManager {
        path: PathBuf,
        /// The pre-bamgate file contents, captured on first change.
        original: Option<String>,
    }

    impl DnsManager {
        pub fn new() -> Self {
            Self::with_path(PathBuf::from(RESOLV_CONF))
        }

        pub fn with_path(path: PathBuf) -> Self {
            Self {
                path,
                original: None,
            }
        }

        /// Points the system at the given resolvers and search domains.
        pub fn apply(&mut self, servers: &[IpAddr], search: &[String]) -> Result<()> {
            if servers.is_empty() {
                return self.restore();
            }

            self.snapshot_original()?;

            let mut contents = String::new();
            contents.push_str(MARKER);
            contents.push('\n');
            for server in servers {
                contents.push_str(&format!("nameserver {server}\n"));
            }
            if !search.is_empty() {
                contents.push_str(&format!("search {}\n", search.join(" ")));
            }

            self.write(&contents)?;

            tracing::info!(?servers, ?search, "switched DNS resolvers");

            Ok(())
        }

        /// Puts the original configuration back, if we ever changed it.
        pub fn restore(&mut self) -> Result<()> {
            let Some(original) = self.original.take() else {
                return Ok(());
            };

            self.write(&original)?;

            tracing::info!("restored original DNS configuration");

            Ok(())
        }

        fn snapshot_original(&mut self) -> Result<()> {
            if self.original.is_some() {
                return Ok(());
            }

            let current = match std::fs::read_to_string(&self.path) {
                Ok(current) => current,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => {
                    return Err(e).with_context(|| format!("cannot read {}", self.path.display()))
                }
            };

            if current.starts_with(MARKER) {
                // Leftover of a previous run; there is no sane original to
                // snapshot, fall back to a resolver that at least works.
                tracing::warn!("found our own resolv.conf from an earlier run");
                self.original = Some("nameserver 1.1.1.1\n".to_owned());
                return Ok(());
            }

            // Sanity-parse before we commit to restoring this later.
            let parsed = resolv_conf::Config::parse(&current);
            if let Err(e) = parsed {
                tracing::warn!("existing resolv.conf does not parse ({e}); keeping it anyway");
            }

            self.original = Some(current);

            Ok(())
        }

        fn write(&self, contents: &str) -> Result<()> {
            AtomicFile::new(&self.path, OverwriteBehavior::AllowOverwrite)
                .write(|f| f.write_all(contents.as_bytes()))
                .with_context(|| format!("cannot write {}", self.path.display()))?;

            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn apply_and_restore_round_trips() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("resolv.conf");
            std::fs::write(&path, "nameserver 192.0.2.53\nsearch lan\n").unwrap();

            let mut dns = DnsManager::with_path(path.clone());

            dns.apply(
                &["100.64.0.2".parse().unwrap()],
                &["corp.example".to_owned()],
            )
            .unwrap();

            let switched = std::fs::read_to_string(&path).unwrap();
            assert!(switched.contains("nameserver 100.64.0.2"));
            assert!(switched.contains("search corp.example"));
            assert!(switched.starts_with(MARKER));

            dns.restore().unwrap();

            assert_eq!(
                std::fs::read_to_string(&path).unwrap(),
                "nameserver 192.0.2.53\nsearch lan\n"
            );
        }

        #[test]
        fn own_leftover_file_is_not_snapshotted_as_original() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("resolv.conf");
            std::fs::write(&path, format!("{MARKER}\nnameserver 100.64.0.9\n")).unwrap();

            let mut dns = DnsManager::with_path(path.clone());
            dns.apply(&["100.64.0.2".parse().unwrap()], &[]).unwrap();
            dns.restore().unwrap();

            let restored = std::fs::read_to_string(&path).unwrap();
            assert!(
                !restored.contains("100.64.0.9"),
                "must not restore our own leftover file"
            );
        }

        #[test]
        fn second_apply_keeps_first_snapshot() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("resolv.conf");
            std::fs::write(&path, "nameserver 192.0.2.53\n").unwrap();

            let mut dns = DnsManager::with_path(path.clone());
            dns.apply(&["100.64.0.2".parse().unwrap()], &[]).unwrap();
            dns.apply(&["100.64.0.3".parse().unwrap()], &[]).unwrap();
            dns.restore().unwrap();

            assert_eq!(
                std::fs::read_to_string(&path).unwrap(),
                "nameserver 192.0.2.53\n"
            );
        }
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use super::*;

    /// DNS switching on macOS requires the system configuration framework;
    /// until that lands the agent leaves the resolver alone.
    pub struct DnsManager;

    impl DnsManager {
        pub fn new() -> Self {
            Self
        }

        pub fn apply(&mut self, servers: &[IpAddr], _search: &[String]) -> Result<()> {
            if !servers.is_empty() {
                tracing::warn!("DNS switching is not implemented on macOS; ignoring accepted resolvers");
            }

            Ok(())
        }

        pub fn restore(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
