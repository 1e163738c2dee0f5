//! MicroVM lifecycle orchestration.
//!
//! [`MicroVm`] composes the process launcher, control plane, network
//! provisioner and registry into create/pause/resume/delete and friends.
//! `create` records an undo step for every resource it acquires so a
//! failure at any point leaves nothing behind.

use crate::config::{generate_id, MicroVmConfig, GUEST_IFACE};
use crate::error::{ConfigError, CoreError, Result};
use crate::registry::{RegistryEntry, VmState, VmmRegistry};
use crate::rollback::Rollback;
use crate::ssh::{self, RelayEnd, RetryPolicy, SshCredentials};
use chrono::Utc;
use ember_vm::network::{derive_gateway, validate_iface_name};
use ember_vm::{
    wait_for_socket, BootSource, ControlPlane, ControlPlaneConnector, Drive, LaunchSpec,
    LifecycleAction, MachineConfiguration, MmdsConfig, NetworkInterface, NetworkProvisioner,
    PortForward, ProcessLauncher, ProcessProbe, ReadinessPolicy, SessionLauncher,
    SocketConnector, SystemProbe, VmError,
};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// SSH port inside the guest.
pub const SSH_PORT: u16 = 22;

/// Host-side tap device for a VM.
pub fn tap_name(id: &str) -> String {
    format!("tap_{id}")
}

/// Identifiers double as directory and interface name components.
///
/// Any non-empty run of lowercase ASCII letters and digits is accepted.
/// Generated ids are always [`ID_LENGTH`](crate::config::ID_LENGTH) long.
/// Ids too long to fit a tap name are rejected by [`MicroVm::create`]
/// before anything is touched.
pub fn validate_id(id: &str) -> std::result::Result<(), ConfigError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("invalid VMM id: {id:?}")))
    }
}

/// External collaborators of the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub probe: Arc<dyn ProcessProbe>,
    pub connector: Arc<dyn ControlPlaneConnector>,
    pub network: NetworkProvisioner,
}

impl Collaborators {
    /// Real process, socket and host-network implementations.
    pub fn system() -> Self {
        Self {
            launcher: Arc::new(SessionLauncher::new()),
            probe: Arc::new(SystemProbe),
            connector: Arc::new(SocketConnector),
            network: NetworkProvisioner::system(),
        }
    }
}

/// Result of [`MicroVm::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(RegistryEntry),
    /// A VM with this id is already registered; nothing was changed.
    AlreadyExists(String),
}

/// What [`MicroVm::delete`] should remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteTarget {
    One(String),
    All,
}

/// Result of [`MicroVm::delete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(Vec<String>),
    /// The registry was empty.
    NothingToDelete,
}

/// Result of [`MicroVm::port_forward`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortForwardOutcome {
    Added(PortForward),
    Removed(PortForward),
}

/// Lifecycle orchestrator for one microVM id.
///
/// Operations taking an `Option<&str>` id default to this instance's id.
pub struct MicroVm {
    id: String,
    config: MicroVmConfig,
    registry: VmmRegistry,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn ProcessProbe>,
    connector: Arc<dyn ControlPlaneConnector>,
    network: NetworkProvisioner,
    readiness: ReadinessPolicy,
    ssh_retry: RetryPolicy,
}

impl std::fmt::Debug for MicroVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicroVm")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MicroVm {
    /// New VM with a generated id and host collaborators.
    pub fn new(config: MicroVmConfig) -> Result<Self> {
        let collaborators = Collaborators::system();
        Self::with_collaborators(None, config, collaborators)
    }

    /// VM with an explicit id and host collaborators.
    pub fn with_id(id: impl Into<String>, config: MicroVmConfig) -> Result<Self> {
        let collaborators = Collaborators::system();
        Self::with_collaborators(Some(id.into()), config, collaborators)
    }

    pub fn with_collaborators(
        id: Option<String>,
        config: MicroVmConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let id = id.unwrap_or_else(generate_id);
        validate_id(&id)?;

        let registry = VmmRegistry::new(config.data_path.clone(), collaborators.probe.clone());
        Ok(Self {
            id,
            config,
            registry,
            launcher: collaborators.launcher,
            probe: collaborators.probe,
            connector: collaborators.connector,
            network: collaborators.network,
            readiness: ReadinessPolicy::default(),
            ssh_retry: RetryPolicy::default(),
        })
    }

    /// Override the control-socket readiness bounds.
    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Override the SSH connect retry bounds.
    pub fn with_ssh_retry(mut self, retry: RetryPolicy) -> Self {
        self.ssh_retry = retry;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &MicroVmConfig {
        &self.config
    }

    pub fn registry(&self) -> &VmmRegistry {
        &self.registry
    }

    fn resolve<'a>(&'a self, id: Option<&'a str>) -> &'a str {
        id.unwrap_or(&self.id)
    }

    async fn require(&self, id: &str) -> Result<RegistryEntry> {
        self.registry
            .read(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    /// All registered VMs.
    pub async fn list(&self) -> Result<Vec<RegistryEntry>> {
        self.registry.list().await
    }

    /// Spawn, configure and start this VM.
    ///
    /// Configuration order is fixed: boot source, drives, machine resources,
    /// network interface, metadata service (when enabled), then start.
    ///
    /// # Errors
    /// Configuration and process errors are returned as-is; anything else is
    /// wrapped in [`CoreError::Management`]. In every error case the partial
    /// VM has been rolled back.
    pub async fn create(&self) -> Result<CreateOutcome> {
        let id = self.id.as_str();

        let known = self.registry.exists(id)
            || self.registry.list().await?.iter().any(|e| e.id == id);
        if known {
            tracing::info!(vm_id = %id, "VMM already exists");
            return Ok(CreateOutcome::AlreadyExists(id.to_string()));
        }

        self.config.check_files()?;
        let tap = tap_name(id);
        validate_iface_name(&tap)?;
        if self.config.bridge {
            validate_iface_name(&self.config.bridge_name)?;
        }
        let gateway = derive_gateway(&self.config.ip_addr)?.to_string();

        tracing::info!(vm_id = %id, ip = %self.config.ip_addr, "Creating VMM");
        let start = Instant::now();

        let mut rollback = Rollback::new();
        let mut client: Option<Box<dyn ControlPlane>> = None;
        let result = self
            .provision(&mut rollback, &mut client, &tap, &gateway)
            .await;

        if let Some(mut client) = client {
            client.close();
        }

        match result {
            Ok(entry) => {
                rollback.commit();
                tracing::info!(
                    vm_id = %id,
                    pid = ?entry.pid,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "VMM created"
                );
                Ok(CreateOutcome::Created(entry))
            }
            Err(e) => {
                tracing::error!(vm_id = %id, error = %e, steps = rollback.len(), "Create failed, rolling back");
                let failures = rollback.run().await;
                if !failures.is_empty() {
                    tracing::warn!(vm_id = %id, failed = failures.len(), "Rollback incomplete");
                }
                if e.is_passthrough() {
                    Err(e)
                } else {
                    Err(CoreError::management(id, "create", e))
                }
            }
        }
    }

    async fn provision(
        &self,
        rollback: &mut Rollback,
        client: &mut Option<Box<dyn ControlPlane>>,
        tap: &str,
        gateway: &str,
    ) -> Result<RegistryEntry> {
        let id = self.id.clone();
        let config = &self.config;

        {
            let registry = self.registry.clone();
            let id = id.clone();
            rollback.push("directory", move || async move { registry.remove(&id).await });
        }
        let paths = self.registry.prepare(&id).await?;

        let base_rootfs = config
            .base_rootfs
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("base_rootfs is required".into()))?;
        let rootfs = self.registry.install_rootfs(&paths, base_rootfs).await?;

        let bridge = config.bridge.then(|| config.bridge_name.clone());
        let mut entry = RegistryEntry {
            id: id.clone(),
            name: config.hostname_for(&id),
            ip_addr: config.ip_addr.clone(),
            tap: tap.to_string(),
            bridge: bridge.clone(),
            session: None,
            pid: None,
            state: VmState::Configuring,
            socket_path: paths.socket.clone(),
            created_at: Utc::now(),
        };
        self.registry.write(&entry).await?;

        let spec = LaunchSpec {
            vm_id: id.clone(),
            binary: config.binary_path.clone(),
            socket_path: paths.socket.clone(),
            log_path: paths.log_file.clone(),
            screen_log_path: paths.screen_log.clone(),
        };
        let launched = self.launcher.launch(&spec).await?;
        {
            let launcher = self.launcher.clone();
            let pid = launched.pid;
            rollback.push("process", move || async move {
                launcher.terminate(pid).await.map_err(CoreError::from)
            });
        }
        entry.pid = Some(launched.pid);
        entry.session = Some(launched.session);
        self.registry.write(&entry).await?;

        wait_for_socket(self.probe.as_ref(), launched.pid, &paths.socket, self.readiness).await?;
        let api = client.insert(self.connector.connect(&paths.socket));

        api.put_boot_source(&BootSource {
            kernel_image_path: path_string(&config.kernel_file),
            boot_args: config.boot_args(&id, gateway),
            initrd_path: config.initrd_file.as_deref().map(path_string),
        })
        .await?;

        api.put_drive(&Drive {
            drive_id: "rootfs".to_string(),
            path_on_host: path_string(&rootfs),
            is_root_device: true,
            is_read_only: config.overlayfs,
        })
        .await?;
        if config.overlayfs {
            if let Some(overlay) = &config.overlayfs_file {
                api.put_drive(&Drive {
                    drive_id: "overlayfs".to_string(),
                    path_on_host: path_string(overlay),
                    is_root_device: false,
                    is_read_only: false,
                })
                .await?;
            }
        }

        let vcpu_count = u8::try_from(config.vcpu_count).map_err(|_| {
            ConfigError::Invalid(format!("vcpu count {} out of range", config.vcpu_count))
        })?;
        api.put_machine_config(&MachineConfiguration {
            vcpu_count,
            mem_size_mib: config.mem_size_mib,
        })
        .await?;

        self.network
            .create_tap(tap, &config.ip_addr, bridge.as_deref())
            .await?;
        {
            let network = self.network.clone();
            let tap = tap.to_string();
            let nat = bridge.is_none();
            rollback.push("tap", move || async move {
                network.delete_tap(&tap, nat).await.map_err(CoreError::from)
            });
        }
        api.put_network_interface(&NetworkInterface {
            iface_id: GUEST_IFACE.to_string(),
            host_dev_name: tap.to_string(),
        })
        .await?;

        if config.mmds_enabled {
            api.put_mmds_config(&MmdsConfig {
                version: "V2".to_string(),
                ipv4_address: config.mmds_ip.clone(),
                network_interfaces: vec![GUEST_IFACE.to_string()],
            })
            .await?;
            api.put_mmds(&metadata_document(&id, &entry.name, config.user_data.as_deref()))
                .await?;
        }

        api.action(LifecycleAction::Start).await?;
        entry.state = VmState::Running;
        self.registry.write(&entry).await?;

        if config.expose_ports {
            if let (Some(host_port), Some(dest_port)) = (config.host_port, config.dest_port) {
                self.add_forward(&entry, host_port, dest_port).await?;
            }
        }

        Ok(entry)
    }

    async fn add_forward(
        &self,
        entry: &RegistryEntry,
        host_port: u16,
        dest_port: u16,
    ) -> Result<PortForward> {
        let host_ip = self.network.host_address().await?;
        let mapping = PortForward::tcp(host_ip, host_port, entry.ip_addr.clone(), dest_port);
        self.network.add_port_forward(&mapping).await?;
        Ok(mapping)
    }

    async fn lifecycle(
        &self,
        id: &str,
        action: LifecycleAction,
        state: VmState,
        operation: &'static str,
    ) -> Result<RegistryEntry> {
        let entry = self.require(id).await?;

        let result = async {
            if entry.state == VmState::Stopped {
                return Err(CoreError::Vm(VmError::Process(format!(
                    "VMM {id} is not running"
                ))));
            }
            let mut client = self.connector.connect(&entry.socket_path);
            let outcome = client.action(action).await;
            client.close();
            outcome?;

            self.registry
                .set_state(id, state)
                .await?
                .ok_or_else(|| CoreError::NotFound(id.to_string()))
        }
        .await;

        match result {
            Ok(entry) => {
                tracing::info!(vm_id = %id, state = %entry.state, "VMM {operation}d");
                Ok(entry)
            }
            Err(e) => Err(CoreError::management(id, operation, e)),
        }
    }

    /// Pause a running VM.
    pub async fn pause(&self, id: Option<&str>) -> Result<RegistryEntry> {
        let id = self.resolve(id);
        self.lifecycle(id, LifecycleAction::Pause, VmState::Paused, "pause")
            .await
    }

    /// Resume a paused VM.
    pub async fn resume(&self, id: Option<&str>) -> Result<RegistryEntry> {
        let id = self.resolve(id);
        self.lifecycle(id, LifecycleAction::Resume, VmState::Running, "resume")
            .await
    }

    /// Delete one VM or all of them.
    ///
    /// With `All`, every VM is attempted; the first failure is returned
    /// after the rest have been processed.
    pub async fn delete(&self, target: DeleteTarget) -> Result<DeleteOutcome> {
        let entries = self.registry.list().await?;
        if entries.is_empty() {
            tracing::info!("No VMMs available to delete");
            return Ok(DeleteOutcome::NothingToDelete);
        }

        let ids: Vec<String> = match target {
            DeleteTarget::All => entries.into_iter().map(|e| e.id).collect(),
            DeleteTarget::One(id) => {
                if !entries.iter().any(|e| e.id == id) && !self.registry.exists(&id) {
                    return Err(CoreError::NotFound(id));
                }
                vec![id]
            }
        };

        let mut first_error = None;
        for id in &ids {
            if let Err(e) = self.teardown(id).await {
                tracing::error!(vm_id = %id, error = %e, "Failed to delete VMM");
                first_error.get_or_insert(CoreError::management(id.clone(), "delete", e));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(DeleteOutcome::Deleted(ids)),
        }
    }

    /// Remove a VM's process, port forwards, network state and directory.
    /// Every part may already be missing.
    async fn teardown(&self, id: &str) -> Result<()> {
        let entry = self.registry.read(id).await?;
        let (tap, nat) = match &entry {
            Some(e) => (e.tap.clone(), e.bridge.is_none()),
            None => (tap_name(id), !self.config.bridge),
        };

        if let Some(pid) = entry.as_ref().and_then(|e| e.pid) {
            self.launcher.terminate(pid).await?;
        }
        if let Some(entry) = &entry {
            self.network.delete_port_forwards_to(&entry.ip_addr).await?;
        }
        self.network.delete_tap(&tap, nat).await?;
        self.registry.remove(id).await?;

        tracing::info!(vm_id = %id, "VMM deleted");
        Ok(())
    }

    /// Open an interactive shell on a VM. Blocks until the session ends.
    pub async fn connect(
        &self,
        id: Option<&str>,
        user: Option<&str>,
        key_path: impl Into<PathBuf>,
    ) -> Result<RelayEnd> {
        let id = self.resolve(id).to_string();
        let entry = self.require(&id).await?;

        let ip: IpAddr = entry.ip_addr.parse().map_err(|_| {
            ConfigError::Invalid(format!("invalid IP address: {}", entry.ip_addr))
        })?;
        let addr = SocketAddr::new(ip, SSH_PORT);
        let credentials = SshCredentials {
            user: user.unwrap_or(self.config.ssh_user.as_str()).to_string(),
            key_path: key_path.into(),
        };
        let retry = self.ssh_retry;

        tracing::info!(vm_id = %id, %addr, user = %credentials.user, "Connecting to VMM");
        let result = tokio::task::spawn_blocking(move || {
            ssh::interactive_shell(addr, &credentials, retry)
        })
        .await
        .map_err(|e| CoreError::Ssh(format!("session task failed: {e}")))
        .and_then(|r| r);

        result.map_err(|e| CoreError::management(id, "connect", e))
    }

    /// Add or remove a host-port forward to a VM.
    pub async fn port_forward(
        &self,
        id: Option<&str>,
        host_port: u16,
        dest_port: u16,
        remove: bool,
    ) -> Result<PortForwardOutcome> {
        let id = self.resolve(id);
        let entry = self.require(id).await?;

        let result = async {
            if remove {
                let host_ip = self.network.host_address().await?;
                let mapping =
                    PortForward::tcp(host_ip, host_port, entry.ip_addr.clone(), dest_port);
                self.network.delete_port_forward(&mapping).await?;
                Ok(PortForwardOutcome::Removed(mapping))
            } else {
                let mapping = self.add_forward(&entry, host_port, dest_port).await?;
                Ok(PortForwardOutcome::Added(mapping))
            }
        }
        .await;

        result.map_err(|e| CoreError::management(id, "port-forward", e))
    }

    /// Current state, refined by the control plane when the process is up.
    pub async fn status(&self, id: Option<&str>) -> Result<VmState> {
        let id = self.resolve(id);
        let entry = self.require(id).await?;
        if entry.state == VmState::Stopped || !entry.socket_path.exists() {
            return Ok(entry.state);
        }

        let mut client = self.connector.connect(&entry.socket_path);
        let info = client.instance_info().await;
        client.close();

        match info {
            Ok(info) => Ok(match info.state.as_str() {
                "Running" => VmState::Running,
                "Paused" => VmState::Paused,
                "Not started" => VmState::Configuring,
                _ => entry.state,
            }),
            Err(e) => {
                tracing::debug!(vm_id = %id, error = %e, "Instance info unavailable, using recorded state");
                Ok(entry.state)
            }
        }
    }

    /// Full VM configuration as reported by the control plane.
    pub async fn vm_config(&self, id: Option<&str>) -> Result<serde_json::Value> {
        let id = self.resolve(id);
        let entry = self.require(id).await?;

        let mut client = self.connector.connect(&entry.socket_path);
        let config = client.vm_config().await;
        client.close();

        config.map_err(|e| CoreError::management(id, "inspect", e.into()))
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// MMDS document served under `latest/`.
pub fn metadata_document(id: &str, hostname: &str, user_data: Option<&str>) -> serde_json::Value {
    let mut latest = json!({
        "meta-data": {
            "instance-id": id,
            "local-hostname": hostname,
        }
    });
    if let Some(user_data) = user_data {
        latest["user-data"] = json!(user_data);
    }
    json!({ "latest": latest })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{Harness, HarnessOptions};
    use ember_vm::ErrorKind;

    #[test]
    fn test_tap_name_and_id_validation() {
        assert_eq!(tap_name("abcd1234"), "tap_abcd1234");
        assert!(validate_id("abcd1234").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("ABCD1234").is_err());
        assert!(validate_id("abcd-123").is_err());
        assert!(validate_id("ab_cd").is_err());
        assert!(validate_id(&generate_id()).is_ok());
    }

    #[test]
    fn test_metadata_document() {
        let doc = metadata_document("abcd1234", "fc-vm", None);
        assert_eq!(doc["latest"]["meta-data"]["instance-id"], "abcd1234");
        assert!(doc["latest"].get("user-data").is_none());

        let doc = metadata_document("abcd1234", "fc-vm", Some("#cloud-config\n"));
        assert_eq!(doc["latest"]["user-data"], "#cloud-config\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_configures_in_order() {
        let harness = Harness::new(HarnessOptions::default());
        let vm = harness.vm("abcd1234");

        let outcome = vm.create().await.unwrap();
        let CreateOutcome::Created(entry) = outcome else {
            panic!("expected Created");
        };
        assert_eq!(entry.state, VmState::Running);
        assert_eq!(entry.tap, "tap_abcd1234");

        assert_eq!(
            harness.calls(),
            vec![
                "boot-source",
                "drive:rootfs",
                "machine-config",
                "network-interface:eth0",
                "action:start",
            ]
        );
        assert_eq!(harness.closed(), 1);

        let boot = harness.boot_args().unwrap();
        assert_eq!(
            boot,
            "console=ttyS0 reboot=k panic=1 pci=off ip=172.16.0.2::172.16.0.1:255.255.255.0:fc-vm:eth0:off "
        );

        let stored = vm.registry().read("abcd1234").await.unwrap().unwrap();
        assert_eq!(stored.state, VmState::Running);
        assert!(harness.tap_exists("tap_abcd1234"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_with_mmds_and_overlay() {
        let harness = Harness::new(HarnessOptions {
            mmds: true,
            overlay: true,
            ..Default::default()
        });
        let vm = harness.vm("abcd1234");

        vm.create().await.unwrap();
        assert_eq!(
            harness.calls(),
            vec![
                "boot-source",
                "drive:rootfs",
                "drive:overlayfs",
                "machine-config",
                "network-interface:eth0",
                "mmds-config",
                "mmds",
                "action:start",
            ]
        );
        let boot = harness.boot_args().unwrap();
        assert!(boot.starts_with("ds=nocloud-net;s=http://169.254.169.254/latest/ console=ttyS0"));
        assert!(boot.ends_with("overlay_root=vdb init=/sbin/init"));
        assert_eq!(
            harness.mmds_document().unwrap()["latest"]["meta-data"]["instance-id"],
            "abcd1234"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_twice_is_idempotent() {
        let harness = Harness::new(HarnessOptions::default());
        let vm = harness.vm("abcd1234");

        vm.create().await.unwrap();
        let second = vm.create().await.unwrap();

        assert_eq!(second, CreateOutcome::AlreadyExists("abcd1234".into()));
        assert_eq!(harness.launches(), 1);
        assert!(vm.registry().exists("abcd1234"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_configuration_rolls_back() {
        let harness = Harness::new(HarnessOptions {
            reject: Some("machine-config"),
            ..Default::default()
        });
        let vm = harness.vm("abcd1234");

        let err = vm.create().await.unwrap_err();
        assert!(matches!(err, CoreError::Vm(VmError::Config(_))), "{err:?}");

        assert!(!vm.registry().paths("abcd1234").dir.exists());
        assert_eq!(harness.terminated(), vec![harness.pid()]);
        assert_eq!(harness.closed(), 1);
        assert!(!harness.tap_exists("tap_abcd1234"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_is_wrapped_and_rolled_back() {
        let harness = Harness::new(HarnessOptions {
            fail_tap: true,
            ..Default::default()
        });
        let vm = harness.vm("abcd1234");

        let err = vm.create().await.unwrap_err();
        assert!(matches!(err, CoreError::Management { operation: "create", .. }));
        assert_eq!(err.vm_kind(), Some(ErrorKind::Network));
        assert!(!vm.registry().paths("abcd1234").dir.exists());
        assert_eq!(harness.terminated().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_removes_tap() {
        let harness = Harness::new(HarnessOptions {
            reject: Some("action:start"),
            ..Default::default()
        });
        let vm = harness.vm("abcd1234");

        vm.create().await.unwrap_err();
        assert!(!harness.tap_exists("tap_abcd1234"));
        assert!(harness.filter_rules().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_death_is_process_error() {
        let harness = Harness::new(HarnessOptions {
            process_dies: true,
            ..Default::default()
        });
        let vm = harness.vm("abcd1234");

        let err = vm.create().await.unwrap_err();
        assert!(matches!(err, CoreError::Vm(VmError::Process(_))), "{err:?}");
        assert_eq!(harness.closed(), 0);
        assert!(!vm.registry().paths("abcd1234").dir.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_never_appears_is_api_error() {
        let harness = Harness::new(HarnessOptions {
            no_socket: true,
            ..Default::default()
        });
        let vm = harness.vm("abcd1234");

        let err = vm.create().await.unwrap_err();
        assert_eq!(err.vm_kind(), Some(ErrorKind::Api));
        assert!(!vm.registry().paths("abcd1234").dir.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_kernel_is_config_error_without_side_effects() {
        let harness = Harness::new(HarnessOptions::default());
        let mut config = harness.config();
        config.kernel_file = harness.root().join("missing-vmlinux");
        let vm = harness.vm_with_config("abcd1234", config);

        let err = vm.create().await.unwrap_err();
        assert!(matches!(err, CoreError::Config(ConfigError::MissingFile { .. })));
        assert_eq!(harness.launches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_id_rejected_before_mutation() {
        let harness = Harness::new(HarnessOptions::default());
        let vm = harness.vm("abcdefghijklmnop");

        let err = vm.create().await.unwrap_err();
        assert!(matches!(err, CoreError::Vm(VmError::Config(_))));
        assert_eq!(harness.launches(), 0);
        assert!(!vm.registry().paths("abcdefghijklmnop").dir.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let harness = Harness::new(HarnessOptions::default());
        let vm = harness.vm("abcd1234");
        vm.create().await.unwrap();

        let paused = vm.pause(None).await.unwrap();
        assert_eq!(paused.state, VmState::Paused);
        let resumed = vm.resume(Some("abcd1234")).await.unwrap();
        assert_eq!(resumed.state, VmState::Running);

        let calls = harness.calls();
        assert_eq!(&calls[calls.len() - 2..], ["action:pause", "action:resume"]);
        assert_eq!(harness.closed(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_unknown_vm() {
        let harness = Harness::new(HarnessOptions::default());
        let vm = harness.vm("abcd1234");
        let err = vm.pause(Some("zzzz9999")).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(id) if id == "zzzz9999"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_rejection_is_wrapped() {
        let harness = Harness::new(HarnessOptions {
            reject: Some("action:pause"),
            ..Default::default()
        });
        let vm = harness.vm("abcd1234");
        vm.create().await.unwrap();

        let err = vm.pause(None).await.unwrap_err();
        assert!(matches!(err, CoreError::Management { operation: "pause", .. }));
        let stored = vm.registry().read("abcd1234").await.unwrap().unwrap();
        assert_eq!(stored.state, VmState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_reports_empty_registry() {
        let harness = Harness::new(HarnessOptions::default());
        let vm = harness.vm("abcd1234");
        assert_eq!(
            vm.delete(DeleteTarget::All).await.unwrap(),
            DeleteOutcome::NothingToDelete
        );
        assert_eq!(
            vm.delete(DeleteTarget::One("abcd1234".into())).await.unwrap(),
            DeleteOutcome::NothingToDelete
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_one_and_all() {
        let harness = Harness::new(HarnessOptions::default());
        for (id, ip) in [("aaaa1111", "172.16.0.2"), ("bbbb2222", "172.16.1.2"), ("cccc3333", "172.16.2.2")] {
            let mut config = harness.config();
            config.ip_addr = ip.into();
            harness.vm_with_config(id, config).create().await.unwrap();
        }
        let vm = harness.vm("aaaa1111");

        let err = vm.delete(DeleteTarget::One("zzzz9999".into())).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));

        let outcome = vm.delete(DeleteTarget::One("aaaa1111".into())).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted(vec!["aaaa1111".into()]));
        assert!(!harness.tap_exists("tap_aaaa1111"));
        assert_eq!(vm.list().await.unwrap().len(), 2);

        let DeleteOutcome::Deleted(ids) = vm.delete(DeleteTarget::All).await.unwrap() else {
            panic!("expected deletions");
        };
        assert_eq!(ids.len(), 2);
        assert!(vm.list().await.unwrap().is_empty());
        assert!(harness.filter_rules().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_without_tap_is_noop_for_network() {
        let harness = Harness::new(HarnessOptions::default());
        let vm = harness.vm("abcd1234");
        vm.create().await.unwrap();
        harness.remove_tap("tap_abcd1234");

        let outcome = vm.delete(DeleteTarget::One("abcd1234".into())).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted(vec!["abcd1234".into()]));
        assert!(!vm.registry().paths("abcd1234").dir.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_forward_round_trip() {
        let harness = Harness::new(HarnessOptions::default());
        let vm = harness.vm("abcd1234");
        vm.create().await.unwrap();

        let added = vm.port_forward(None, 8080, 80, false).await.unwrap();
        let PortForwardOutcome::Added(mapping) = added else {
            panic!("expected Added");
        };
        assert_eq!(mapping, PortForward::tcp("203.0.113.5", 8080, "172.16.0.2", 80));
        assert_eq!(harness.forward_rules(&mapping), 2);

        vm.port_forward(None, 8080, 80, true).await.unwrap();
        assert_eq!(harness.forward_rules(&mapping), 0);

        vm.port_forward(None, 8080, 80, true).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_with_exposed_port() {
        let harness = Harness::new(HarnessOptions::default());
        let mut config = harness.config();
        config.expose_ports = true;
        config.host_port = Some(2222);
        config.dest_port = Some(22);
        let vm = harness.vm_with_config("abcd1234", config);

        vm.create().await.unwrap();
        let mapping = PortForward::tcp("203.0.113.5", 2222, "172.16.0.2", 22);
        assert_eq!(harness.forward_rules(&mapping), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_removes_port_forwards() {
        let harness = Harness::new(HarnessOptions::default());
        let mut config = harness.config();
        config.expose_ports = true;
        config.host_port = Some(2222);
        config.dest_port = Some(22);
        let vm = harness.vm_with_config("abcd1234", config);
        vm.create().await.unwrap();
        vm.port_forward(None, 8080, 80, false).await.unwrap();

        let exposed = PortForward::tcp("203.0.113.5", 2222, "172.16.0.2", 22);
        let web = PortForward::tcp("203.0.113.5", 8080, "172.16.0.2", 80);
        assert_eq!(harness.forward_rules(&exposed), 2);

        vm.delete(DeleteTarget::One("abcd1234".into())).await.unwrap();
        assert_eq!(harness.forward_rules(&exposed), 0);
        assert_eq!(harness.forward_rules(&web), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_forward_keeps_first_intact() {
        let harness = Harness::new(HarnessOptions::default());
        let vm = harness.vm("abcd1234");
        vm.create().await.unwrap();

        vm.port_forward(None, 8080, 80, false).await.unwrap();
        vm.port_forward(None, 2222, 22, false).await.unwrap();
        let web = PortForward::tcp("203.0.113.5", 8080, "172.16.0.2", 80);
        let ssh = PortForward::tcp("203.0.113.5", 2222, "172.16.0.2", 22);
        assert_eq!(harness.forward_rules(&web), 2);
        assert_eq!(harness.forward_rules(&ssh), 2);

        vm.port_forward(None, 8080, 80, true).await.unwrap();
        assert_eq!(harness.forward_rules(&web), 0);
        assert_eq!(harness.forward_rules(&ssh), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_directory_setup_is_removed() {
        let harness = Harness::new(HarnessOptions::default());
        let vm = harness.vm("abcd1234");
        let dir = vm.registry().paths("abcd1234").dir;
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("logs"), b"").unwrap();

        vm.create().await.unwrap_err();
        assert!(!dir.exists());
        assert_eq!(harness.launches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_uses_instance_info() {
        let harness = Harness::new(HarnessOptions::default());
        let vm = harness.vm("abcd1234");
        vm.create().await.unwrap();

        harness.set_instance_state("Paused");
        assert_eq!(vm.status(None).await.unwrap(), VmState::Paused);

        harness.kill_process();
        assert_eq!(vm.status(None).await.unwrap(), VmState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vm_config_query() {
        let harness = Harness::new(HarnessOptions::default());
        let vm = harness.vm("abcd1234");
        vm.create().await.unwrap();

        let config = vm.vm_config(None).await.unwrap();
        assert_eq!(config["machine-config"]["vcpu_count"], 1);
    }
}
