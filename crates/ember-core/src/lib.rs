//! # ember-core
//!
//! Lifecycle orchestration for Firecracker microVMs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ember-core (host)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │    MicroVm      │────▶│  VmmRegistry             │    │
//! │  │   - create()    │     │  <data_path>/<id>/       │    │
//! │  │   - pause()     │     │    vmm.json, socket,     │    │
//! │  │   - delete()    │     │    rootfs/, logs/        │    │
//! │  │   - connect()   │     └──────────────────────────┘    │
//! │  └─────────────────┘                                     │
//! │       │        │                                         │
//! │       │        ▼                                         │
//! │       │   ┌──────────────────────────┐                   │
//! │       │   │ Rollback (undo on error) │                   │
//! │       │   └──────────────────────────┘                   │
//! │       ▼                                                  │
//! │  ┌──────────────────────────────────────────────────┐    │
//! │  │ ember-vm: launcher, control plane, network       │    │
//! │  └──────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use ember_core::{CreateOutcome, DeleteTarget, MicroVm, MicroVmConfig};
//!
//! # async fn example() -> ember_core::Result<()> {
//! let config = MicroVmConfig::builder()
//!     .kernel("/var/lib/firecracker/vmlinux")
//!     .rootfs("/var/lib/firecracker/ubuntu-22.04.ext4")
//!     .memory_mib(1024)
//!     .vcpu_count(2)
//!     .build()?;
//!
//! let vm = MicroVm::new(config)?;
//! if let CreateOutcome::Created(entry) = vm.create().await? {
//!     println!("{} running at {}", entry.id, entry.ip_addr);
//! }
//!
//! vm.pause(None).await?;
//! vm.resume(None).await?;
//! vm.delete(DeleteTarget::One(vm.id().to_string())).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod manager;
mod registry;
mod rollback;
mod ssh;

#[cfg(test)]
mod fakes;

pub use config::{
    build_boot_args, generate_id, validate_hostname, validate_ip, MicroVmConfig,
    MicroVmConfigBuilder, GUEST_IFACE, ID_LENGTH, OPTIONS,
};
pub use error::{ConfigError, CoreError, Result};
pub use manager::{
    metadata_document, tap_name, validate_id, Collaborators, CreateOutcome, DeleteOutcome,
    DeleteTarget, MicroVm, PortForwardOutcome, SSH_PORT,
};
pub use registry::{RegistryEntry, VmPaths, VmState, VmmRegistry, RECORD_FILE};
pub use rollback::Rollback;
pub use ssh::{RelayEnd, RetryPolicy, SshCredentials};
