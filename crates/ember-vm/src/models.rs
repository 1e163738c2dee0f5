//! Request and response bodies for the Firecracker control API.
//!
//! Every configuration endpoint takes a full representation of its
//! resource; there are no partial updates except the `/vm` state patch.

use serde::{Deserialize, Serialize};

/// Boot source configuration for the VM kernel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<String>,
}

/// Block device (drive) configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// vCPU and memory sizing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfiguration {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
}

/// Guest network interface backed by a host tap device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
}

/// Metadata service (MMDS) network configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MmdsConfig {
    pub version: String,
    pub ipv4_address: String,
    pub network_interfaces: Vec<String>,
}

/// Body of `PUT /actions`.
#[derive(Serialize, Debug, Clone)]
pub(crate) struct InstanceAction {
    pub action_type: &'static str,
}

/// Body of `PATCH /vm`.
#[derive(Serialize, Debug, Clone)]
pub(crate) struct VmStatePatch {
    pub state: &'static str,
}

/// Lifecycle actions understood by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    Pause,
    Resume,
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleAction::Start => write!(f, "start"),
            LifecycleAction::Pause => write!(f, "pause"),
            LifecycleAction::Resume => write!(f, "resume"),
        }
    }
}

/// Response of `GET /`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: String,
    /// "Not started", "Running" or "Paused".
    pub state: String,
    #[serde(default)]
    pub vmm_version: String,
    #[serde(default)]
    pub app_name: String,
}

/// Error body returned by Firecracker on non-2xx responses.
#[derive(Deserialize, Debug)]
pub(crate) struct Fault {
    pub fault_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_source_omits_missing_initrd() {
        let boot = BootSource {
            kernel_image_path: "/var/lib/firecracker/vmlinux".into(),
            boot_args: "console=ttyS0".into(),
            initrd_path: None,
        };
        let json = serde_json::to_string(&boot).unwrap();
        assert!(json.contains("\"kernel_image_path\":\"/var/lib/firecracker/vmlinux\""));
        assert!(!json.contains("initrd_path"));
    }

    #[test]
    fn test_machine_config_serialization() {
        let config = MachineConfiguration {
            vcpu_count: 2,
            mem_size_mib: 256,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"mem_size_mib\":256"));
        assert!(json.contains("\"vcpu_count\":2"));
    }

    #[test]
    fn test_instance_info_tolerates_missing_fields() {
        let info: InstanceInfo =
            serde_json::from_str(r#"{"id":"abcd1234","state":"Paused"}"#).unwrap();
        assert_eq!(info.state, "Paused");
        assert!(info.vmm_version.is_empty());
    }
}
