//! # ember-vm
//!
//! Host-side plumbing for ember microVMs: the Firecracker process
//! supervisor, the control-plane client and the host network provisioner.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ember_vm::{ApiClient, ControlPlane, LifecycleAction, MachineConfiguration};
//!
//! # async fn example() -> ember_vm::Result<()> {
//! let mut client = ApiClient::new("/var/lib/firecracker/abcd1234/firecracker.socket");
//! client
//!     .put_machine_config(&MachineConfiguration { vcpu_count: 2, mem_size_mib: 512 })
//!     .await?;
//! client.action(LifecycleAction::Start).await?;
//! client.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Process supervision**: detached launch, liveness probing, bounded readiness polling
//! - **Control plane**: boot source, drives, machine config, network, MMDS, lifecycle actions
//! - **Networking**: tap devices, NAT, shared masquerade, port forwarding via nftables

mod api;
mod error;
mod models;
pub mod network;
mod process;

pub use api::{ApiClient, ControlPlane, ControlPlaneConnector, Endpoint, SocketConnector};
pub use error::{ErrorKind, Result, VmError};
pub use models::{
    BootSource, Drive, InstanceInfo, LifecycleAction, MachineConfiguration, MmdsConfig,
    NetworkInterface,
};
pub use network::{NetworkProvisioner, PortForward, Protocol};
pub use process::{
    terminate, wait_for_socket, LaunchSpec, Launched, ProcessLauncher, ProcessProbe,
    ReadinessPolicy, SessionLauncher, SystemProbe,
};
