//! Kernel route and interface plumbing.
//!
//! Only the agent mutates routes. Every route installed in this process
//! lifetime lands on an unwind list so shutdown can revert exactly what we
//! added and nothing else. A route that already exists is logged and
//! skipped, never treated as ours.

use anyhow::{Context, Result};
use ip_network::Ipv4Network;
use std::net::Ipv4Addr;

#[cfg(target_os = "linux")]
pub use linux::RouteManager;

#[cfg(target_os = "macos")]
pub use macos::RouteManager;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use futures::TryStreamExt;
    use rtnetlink::{new_connection, Error::NetlinkError, Handle};

    pub struct RouteManager {
        handle: Handle,
        connection_task: tokio::task::JoinHandle<()>,
        iface_index: u32,
        iface_name: String,
        /// Routes this process installed, in installation order.
        installed: Vec<Ipv4Network>,
    }

    impl Drop for RouteManager {
        fn drop(&mut self) {
            self.connection_task.abort();
        }
    }

    impl RouteManager {
        /// Opens a netlink connection and resolves the interface index.
        pub async fn new(iface_name: &str) -> Result<Self> {
            let (connection, handle, _) =
                new_connection().context("failed to create netlink connection")?;

            let connection_task = tokio::spawn(connection);

            let iface_index = handle
                .link()
                .get()
                .match_name(iface_name.to_owned())
                .execute()
                .try_next()
                .await
                .context("netlink link lookup failed")?
                .with_context(|| format!("no interface named {iface_name}"))?
                .header
                .index;

            Ok(Self {
                handle,
                connection_task,
                iface_index,
                iface_name: iface_name.to_owned(),
                installed: Vec::new(),
            })
        }

        /// Assigns the tunnel address, sets the MTU and brings the link up.
        pub async fn configure_interface(
            &self,
            address: Ipv4Addr,
            prefix: u8,
            mtu: u16,
        ) -> Result<()> {
            self.handle
                .address()
                .add(self.iface_index, address.into(), prefix)
                .execute()
                .await
                .or_else(ignore_exists)
                .with_context(|| format!("failed to assign {address}/{prefix}"))?;

            self.handle
                .link()
                .set(self.iface_index)
                .mtu(u32::from(mtu))
                .execute()
                .await
                .context("failed to set MTU")?;

            self.handle
                .link()
                .set(self.iface_index)
                .up()
                .execute()
                .await
                .with_context(|| format!("failed to bring up {}", self.iface_name))?;

            Ok(())
        }

        /// Installs one route towards the tunnel interface.
        ///
        /// An already existing route is a conflict with other software; it
        /// is skipped and stays off the unwind list.
        pub async fn add_route(&mut self, route: Ipv4Network) -> Result<()> {
            if self.installed.contains(&route) {
                return Ok(());
            }

            let result = self
                .handle
                .route()
                .add()
                .v4()
                .destination_prefix(route.network_address(), route.netmask())
                .output_interface(self.iface_index)
                .execute()
                .await;

            match result {
                Ok(()) => {
                    tracing::info!(%route, iface = %self.iface_name, "installed route");
                    self.installed.push(route);
                    Ok(())
                }
                Err(NetlinkError(ref message)) if message.raw_code() == -libc::EEXIST => {
                    tracing::warn!(%route, "route already exists, skipping");
                    Ok(())
                }
                Err(e) => Err(e).with_context(|| format!("failed to add route {route}")),
            }
        }

        pub async fn remove_route(&mut self, route: Ipv4Network) {
            let Some(position) = self.installed.iter().position(|r| *r == route) else {
                // Never ours, never touch it.
                return;
            };

            self.installed.remove(position);
            self.delete_from_kernel(route).await;
        }

        /// Removes every route this process installed.
        pub async fn unwind(&mut self) {
            for route in std::mem::take(&mut self.installed) {
                self.delete_from_kernel(route).await;
            }
        }

        pub fn installed(&self) -> &[Ipv4Network] {
            &self.installed
        }

        async fn delete_from_kernel(&self, route: Ipv4Network) {
            let mut request = self
                .handle
                .route()
                .add()
                .v4()
                .destination_prefix(route.network_address(), route.netmask())
                .output_interface(self.iface_index);

            let message = request.message_mut().clone();

            match self.handle.route().del(message).execute().await {
                Ok(()) => tracing::info!(%route, "removed route"),
                // Stale view: the route is already gone.
                Err(NetlinkError(ref e))
                    if e.raw_code() == -libc::ENOENT || e.raw_code() == -libc::ESRCH => {}
                Err(e) => tracing::warn!(%route, "failed to remove route: {e}"),
            }
        }
    }

    fn ignore_exists(error: rtnetlink::Error) -> Result<(), rtnetlink::Error> {
        match error {
            NetlinkError(ref message) if message.raw_code() == -libc::EEXIST => Ok(()),
            other => Err(other),
        }
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use super::*;
    use tokio::process::Command;

    /// Shells out to `ifconfig`/`route`; macOS has no netlink.
    pub struct RouteManager {
        iface_name: String,
        installed: Vec<Ipv4Network>,
    }

    impl RouteManager {
        pub async fn new(iface_name: &str) -> Result<Self> {
            Ok(Self {
                iface_name: iface_name.to_owned(),
                installed: Vec::new(),
            })
        }

        pub async fn configure_interface(
            &self,
            address: Ipv4Addr,
            prefix: u8,
            mtu: u16,
        ) -> Result<()> {
            run(Command::new("ifconfig").args([
                &self.iface_name,
                "inet",
                &format!("{address}/{prefix}"),
                &address.to_string(),
                "mtu",
                &mtu.to_string(),
                "up",
            ]))
            .await
        }

        pub async fn add_route(&mut self, route: Ipv4Network) -> Result<()> {
            if self.installed.contains(&route) {
                return Ok(());
            }

            run(Command::new("route").args([
                "-n",
                "add",
                "-net",
                &route.to_string(),
                "-interface",
                &self.iface_name,
            ]))
            .await?;

            self.installed.push(route);

            Ok(())
        }

        pub async fn remove_route(&mut self, route: Ipv4Network) {
            let Some(position) = self.installed.iter().position(|r| *r == route) else {
                return;
            };

            self.installed.remove(position);

            let _ = run(Command::new("route").args([
                "-n",
                "delete",
                "-net",
                &route.to_string(),
            ]))
            .await;
        }

        pub async fn unwind(&mut self) {
            for route in std::mem::take(&mut self.installed) {
                let _ = run(Command::new("route").args([
                    "-n",
                    "delete",
                    "-net",
                    &route.to_string(),
                ]))
                .await;
            }
        }

        pub fn installed(&self) -> &[Ipv4Network] {
            &self.installed
        }
    }

    async fn run(command: &mut Command) -> Result<()> {
        let output = command.output().await.context("failed to run command")?;

        if !output.status.success() {
            anyhow::bail!(
                "command failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(())
    }
}
