//! Host link management through iproute2.

use crate::error::{Result, VmError};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Output;
use tokio::process::Command;

/// Link-level operations on host interfaces.
#[async_trait]
pub trait LinkManager: Send + Sync {
    /// Interface carrying the default route.
    async fn default_interface(&self) -> Result<String>;

    /// First IPv4 address assigned to `name`.
    async fn interface_ipv4(&self, name: &str) -> Result<Option<String>>;

    async fn link_exists(&self, name: &str) -> Result<bool>;

    /// Device kind (`bridge`, `tun`, ...) or `None` for plain devices.
    async fn link_kind(&self, name: &str) -> Result<Option<String>>;

    async fn create_tap(&self, name: &str) -> Result<()>;
    async fn set_up(&self, name: &str) -> Result<()>;
    async fn add_address(&self, name: &str, address: &str, prefix_len: u8) -> Result<()>;
    async fn set_master(&self, name: &str, master: &str) -> Result<()>;
    async fn delete_link(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct RouteEntry {
    #[serde(default)]
    dst: String,
    dev: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LinkEntry {
    #[serde(default)]
    linkinfo: Option<LinkInfo>,
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct LinkInfo {
    info_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    family: String,
    local: String,
}

/// [`LinkManager`] backed by the `ip` command.
#[derive(Debug, Clone)]
pub struct IpLinkManager {
    binary: String,
}

impl Default for IpLinkManager {
    fn default() -> Self {
        Self {
            binary: "ip".to_string(),
        }
    }
}

impl IpLinkManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn output(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| VmError::Network(format!("failed to run ip {}: {e}", args.join(" "))))
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let out = self.output(args).await?;
        if !out.status.success() {
            return Err(VmError::Network(format!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(out.stdout)
    }

    async fn show_link(&self, name: &str) -> Result<Option<LinkEntry>> {
        let out = self.output(&["-j", "-d", "link", "show", "dev", name]).await?;
        if !out.status.success() {
            return Ok(None);
        }
        let mut entries: Vec<LinkEntry> = serde_json::from_slice(&out.stdout)?;
        Ok(entries.pop())
    }
}

fn parse_default_route(json: &[u8]) -> Result<Option<String>> {
    let routes: Vec<RouteEntry> = serde_json::from_slice(json)?;
    Ok(routes
        .into_iter()
        .find(|r| r.dst == "default")
        .and_then(|r| r.dev))
}

fn parse_ipv4(json: &[u8]) -> Result<Option<String>> {
    let links: Vec<LinkEntry> = serde_json::from_slice(json)?;
    Ok(links
        .into_iter()
        .flat_map(|l| l.addr_info)
        .find(|a| a.family == "inet")
        .map(|a| a.local))
}

#[async_trait]
impl LinkManager for IpLinkManager {
    async fn default_interface(&self) -> Result<String> {
        let out = self.run(&["-j", "route", "show", "default"]).await?;
        parse_default_route(&out)?
            .ok_or_else(|| VmError::Network("unable to determine the default interface".into()))
    }

    async fn interface_ipv4(&self, name: &str) -> Result<Option<String>> {
        let out = self.run(&["-j", "addr", "show", "dev", name]).await?;
        parse_ipv4(&out)
    }

    async fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.output(&["link", "show", "dev", name]).await?.status.success())
    }

    async fn link_kind(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .show_link(name)
            .await?
            .and_then(|l| l.linkinfo)
            .and_then(|i| i.info_kind))
    }

    async fn create_tap(&self, name: &str) -> Result<()> {
        self.run(&["tuntap", "add", name, "mode", "tap"]).await?;
        Ok(())
    }

    async fn set_up(&self, name: &str) -> Result<()> {
        self.run(&["link", "set", name, "up"]).await?;
        Ok(())
    }

    async fn add_address(&self, name: &str, address: &str, prefix_len: u8) -> Result<()> {
        let cidr = format!("{address}/{prefix_len}");
        self.run(&["addr", "add", &cidr, "dev", name]).await?;
        Ok(())
    }

    async fn set_master(&self, name: &str, master: &str) -> Result<()> {
        self.run(&["link", "set", name, "master", master]).await?;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        self.run(&["link", "delete", name]).await?;
        Ok(())
    }
}
