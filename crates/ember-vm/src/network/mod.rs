//! Host network provisioning for microVMs.
//!
//! Each VM gets a tap device named after its id. Unbridged taps are
//! NAT-ed through the uplink interface; one masquerade rule per uplink is
//! shared by every VM. All rule-table changes happen under a host-wide
//! [`ProvisioningLock`].

pub mod forward;
pub mod gateway;
pub mod link;
pub mod lock;
pub mod nat;
pub mod nft;

pub use forward::{ForwardHandles, PortForward, Protocol};
pub use gateway::derive_gateway;
pub use link::{IpLinkManager, LinkManager};
pub use lock::ProvisioningLock;
pub use nft::{detect_rule_engine, NftRuleEngine, Rule, RuleEngine, RuleRef, UnavailableRuleEngine};

use crate::error::{Result, VmError};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Longest accepted interface name.
pub const MAX_IFACE_NAME_LEN: usize = 16;

/// Prefix length of the per-VM subnet.
pub const TAP_PREFIX_LEN: u8 = 24;

/// Lock shared by every ember process on the host, whatever its data root.
pub const HOST_LOCK_PATH: &str = "/run/ember/network.lock";

/// Reject empty or over-long interface names.
pub fn validate_iface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VmError::Config("interface name is required".into()));
    }
    if name.len() > MAX_IFACE_NAME_LEN {
        return Err(VmError::Config(format!(
            "interface name {name} exceeds {MAX_IFACE_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Creates and removes per-VM network state.
#[derive(Clone)]
pub struct NetworkProvisioner {
    links: Arc<dyn LinkManager>,
    rules: Arc<dyn RuleEngine>,
    lock_path: PathBuf,
}

impl std::fmt::Debug for NetworkProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkProvisioner")
            .field("lock_path", &self.lock_path)
            .finish_non_exhaustive()
    }
}

impl NetworkProvisioner {
    pub fn new(
        links: Arc<dyn LinkManager>,
        rules: Arc<dyn RuleEngine>,
        lock_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            links,
            rules,
            lock_path: lock_path.into(),
        }
    }

    /// Provisioner using `ip`, whichever rule engine the host offers and
    /// the host-wide lock.
    pub fn system() -> Self {
        Self::new(
            Arc::new(IpLinkManager::new()),
            detect_rule_engine(),
            HOST_LOCK_PATH,
        )
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    async fn lock(&self) -> Result<ProvisioningLock> {
        ProvisioningLock::acquire(&self.lock_path).await
    }

    /// Interface carrying the default route, used as the NAT uplink.
    pub async fn uplink_interface(&self) -> Result<String> {
        let uplink = self.links.default_interface().await?;
        tracing::debug!(uplink = %uplink, "Resolved uplink interface");
        Ok(uplink)
    }

    /// Externally visible IPv4 address of the host (the uplink's address).
    pub async fn host_address(&self) -> Result<String> {
        let uplink = self.uplink_interface().await?;
        self.links
            .interface_ipv4(&uplink)
            .await?
            .ok_or_else(|| VmError::Network(format!("no IPv4 address on {uplink}")))
    }

    /// Create `tap` for a VM at `vm_ip`.
    ///
    /// With a bridge the tap is attached to it; otherwise forward and
    /// masquerade rules are installed. An existing tap is left untouched.
    /// On failure, whatever was created is removed again.
    pub async fn create_tap(&self, tap: &str, vm_ip: &str, bridge: Option<&str>) -> Result<()> {
        validate_iface_name(tap)?;
        if let Some(bridge) = bridge {
            validate_iface_name(bridge)?;
        }
        let gateway = derive_gateway(vm_ip)?;
        let uplink = match bridge {
            Some(_) => None,
            None => {
                let uplink = self.uplink_interface().await?;
                validate_iface_name(&uplink)?;
                Some(uplink)
            }
        };

        let _guard = self.lock().await?;

        if self.links.link_exists(tap).await? {
            tracing::debug!(tap = %tap, "Tap device already exists");
            return Ok(());
        }

        let result = async {
            self.links.create_tap(tap).await?;
            tracing::debug!(tap = %tap, "Tap device created");

            if let Some(bridge) = bridge {
                self.attach_locked(tap, bridge).await?;
            }

            self.links.set_up(tap).await?;

            if let Some(uplink) = uplink.as_deref() {
                self.rules.apply(&nat::forward_batch(tap, uplink)).await?;
                self.ensure_masquerade_locked(uplink).await?;
            }

            self.links
                .add_address(tap, &gateway.to_string(), TAP_PREFIX_LEN)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!(tap = %tap, gateway = %gateway, bridge = ?bridge, "Tap device ready");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(tap = %tap, error = %e, "Tap setup failed, cleaning up");
                if let Err(cleanup) = self.teardown_locked(tap, uplink.is_some()).await {
                    tracing::warn!(tap = %tap, error = %cleanup, "Tap cleanup failed");
                }
                Err(e)
            }
        }
    }

    /// Remove the rules naming `tap` (when `nat`) and then the device.
    /// A missing device is not an error.
    pub async fn delete_tap(&self, tap: &str, nat: bool) -> Result<()> {
        let _guard = self.lock().await?;
        self.teardown_locked(tap, nat).await
    }

    async fn teardown_locked(&self, tap: &str, nat: bool) -> Result<()> {
        if nat {
            let listed = self.rules.list_rules(nat::FILTER_TABLE).await?;
            let matching = nat::find_tap_rules(&listed, tap);
            tracing::debug!(tap = %tap, total = listed.len(), matching = matching.len(), "Deleting tap rules");
            for rule in &matching {
                self.rules.delete_rule(rule).await?;
            }
        }

        if self.links.link_exists(tap).await? {
            self.links.delete_link(tap).await?;
            tracing::info!(tap = %tap, "Tap device removed");
        } else {
            tracing::debug!(tap = %tap, "Tap device not present");
        }
        Ok(())
    }

    /// Attach `tap` to an existing bridge device.
    pub async fn attach_to_bridge(&self, tap: &str, bridge: &str) -> Result<()> {
        let _guard = self.lock().await?;
        self.attach_locked(tap, bridge).await
    }

    async fn attach_locked(&self, tap: &str, bridge: &str) -> Result<()> {
        match self.links.link_kind(bridge).await?.as_deref() {
            Some("bridge") => {}
            Some(kind) => {
                return Err(VmError::Network(format!(
                    "{bridge} is a {kind} device, not a bridge"
                )))
            }
            None => {
                return Err(VmError::Network(format!("bridge device {bridge} not found")));
            }
        }
        self.links.set_master(tap, bridge).await?;
        tracing::info!(tap = %tap, bridge = %bridge, "Tap attached to bridge");
        Ok(())
    }

    /// Ensure exactly one masquerade rule exists for `uplink`.
    pub async fn ensure_masquerade(&self, uplink: &str) -> Result<RuleRef> {
        let _guard = self.lock().await?;
        self.ensure_masquerade_locked(uplink).await
    }

    async fn ensure_masquerade_locked(&self, uplink: &str) -> Result<RuleRef> {
        let listed = self.rules.list_rules(nat::NAT_TABLE).await?;
        if let Some(existing) = nat::find_masquerade(&listed, uplink) {
            tracing::debug!(uplink = %uplink, handle = existing.handle, "Masquerade rule exists");
            return Ok(existing);
        }

        self.rules.apply(&nat::masquerade_batch(uplink)).await?;
        let listed = self.rules.list_rules(nat::NAT_TABLE).await?;
        let created = nat::find_masquerade(&listed, uplink).ok_or_else(|| {
            VmError::Network(format!("masquerade rule for {uplink} missing after creation"))
        })?;
        tracing::info!(uplink = %uplink, handle = created.handle, "Masquerade rule created");
        Ok(created)
    }

    /// Handles of an installed port-forward mapping.
    pub async fn port_forward_handles(&self, mapping: &PortForward) -> Result<ForwardHandles> {
        let listed = self.rules.list_rules(nat::NAT_TABLE).await?;
        Ok(mapping.find(&listed))
    }

    /// Install a port-forward rule pair. Installing an existing mapping is a no-op.
    pub async fn add_port_forward(&self, mapping: &PortForward) -> Result<ForwardHandles> {
        let _guard = self.lock().await?;

        let existing = self.port_forward_handles(mapping).await?;
        if existing.is_complete() {
            tracing::debug!(mapping = %mapping, "Port forward already installed");
            return Ok(existing);
        }
        // Half-installed pairs are replaced as a whole.
        self.delete_handles(&existing).await?;

        self.rules.apply(&mapping.batch()).await?;
        let installed = self.port_forward_handles(mapping).await?;
        if !installed.is_complete() {
            return Err(VmError::Network(format!(
                "port forward {mapping} not found after creation"
            )));
        }
        tracing::info!(mapping = %mapping, "Port forward added");
        Ok(installed)
    }

    /// Remove a port-forward rule pair. Removing an unknown mapping is a no-op.
    pub async fn delete_port_forward(&self, mapping: &PortForward) -> Result<()> {
        let _guard = self.lock().await?;

        let handles = self.port_forward_handles(mapping).await?;
        if handles.is_empty() {
            tracing::debug!(mapping = %mapping, "No port forward rules to delete");
            return Ok(());
        }
        self.delete_handles(&handles).await?;
        tracing::info!(mapping = %mapping, "Port forward removed");
        Ok(())
    }

    /// Remove the rules of every port forward whose destination is `dest_ip`.
    pub async fn delete_port_forwards_to(&self, dest_ip: &str) -> Result<usize> {
        let _guard = self.lock().await?;

        let listed = self.rules.list_rules(nat::NAT_TABLE).await?;
        let matching: Vec<RuleRef> = listed
            .iter()
            .filter(|r| forward::targets(r, dest_ip))
            .map(RuleRef::from)
            .collect();
        for rule in &matching {
            self.rules.delete_rule(rule).await?;
        }
        if !matching.is_empty() {
            tracing::info!(dest_ip = %dest_ip, removed = matching.len(), "Port forwards removed");
        }
        Ok(matching.len())
    }

    async fn delete_handles(&self, handles: &ForwardHandles) -> Result<()> {
        for rule in [&handles.prerouting, &handles.postrouting].into_iter().flatten() {
            self.rules.delete_rule(rule).await?;
        }
        Ok(())
    }
}
