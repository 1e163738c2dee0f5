//! MicroVM descriptor configuration.
//!
//! [`MicroVmConfig`] holds every recognized option with its default.
//! Overrides arrive either through the typed [`MicroVmConfigBuilder`] or as
//! string key/value pairs via [`MicroVmConfig::apply`], which rejects any
//! key it does not know.

use crate::error::ConfigError;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Length of generated VM identifiers.
pub const ID_LENGTH: usize = 8;

/// Guest-side interface name used in boot args, MMDS and the API.
pub const GUEST_IFACE: &str = "eth0";

/// Minimum guest memory.
pub const MIN_MEMORY_MIB: u32 = 128;

/// Maximum vCPUs Firecracker accepts.
pub const MAX_VCPUS: u32 = 32;

const HOSTNAME_PATTERN: &str = r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?$";

/// Every option accepted by [`MicroVmConfig::apply`].
pub const OPTIONS: &[&str] = &[
    "data_path",
    "binary_path",
    "kernel_file",
    "initrd_file",
    "init_file",
    "base_rootfs",
    "overlayfs",
    "overlayfs_file",
    "ip_addr",
    "bridge",
    "bridge_name",
    "mmds_enabled",
    "mmds_ip",
    "user_data",
    "vcpu",
    "memory",
    "hostname",
    "ssh_user",
    "expose_ports",
    "host_port",
    "dest_port",
];

/// Generate a random 8-character lowercase alphanumeric identifier.
pub fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|b| (b as char).to_ascii_lowercase())
        .take(ID_LENGTH)
        .collect()
}

/// Configuration for one microVM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroVmConfig {
    /// Root directory for per-VM state.
    pub data_path: PathBuf,
    /// Firecracker binary.
    pub binary_path: PathBuf,
    pub kernel_file: PathBuf,
    pub initrd_file: Option<PathBuf>,
    /// Init passed to the guest when an overlay root is used.
    pub init_file: String,
    /// Source rootfs image; copied per VM.
    pub base_rootfs: Option<PathBuf>,
    pub overlayfs: bool,
    pub overlayfs_file: Option<PathBuf>,
    pub ip_addr: String,
    pub bridge: bool,
    pub bridge_name: String,
    pub mmds_enabled: bool,
    pub mmds_ip: String,
    pub user_data: Option<String>,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    /// Empty means "use the VM id".
    pub hostname: String,
    pub ssh_user: String,
    pub expose_ports: bool,
    pub host_port: Option<u16>,
    pub dest_port: Option<u16>,
}

impl Default for MicroVmConfig {
    fn default() -> Self {
        let data_path = PathBuf::from("/var/lib/firecracker");
        Self {
            kernel_file: data_path.join("vmlinux"),
            data_path,
            binary_path: PathBuf::from("/usr/local/bin/firecracker"),
            initrd_file: None,
            init_file: "/sbin/init".to_string(),
            base_rootfs: None,
            overlayfs: false,
            overlayfs_file: None,
            ip_addr: "172.16.0.2".to_string(),
            bridge: false,
            bridge_name: "docker0".to_string(),
            mmds_enabled: false,
            mmds_ip: "169.254.169.254".to_string(),
            user_data: None,
            vcpu_count: 1,
            mem_size_mib: 512,
            hostname: "fc-vm".to_string(),
            ssh_user: "root".to_string(),
            expose_ports: false,
            host_port: None,
            dest_port: None,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn optional_path(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

impl MicroVmConfig {
    /// Create a new config builder.
    pub fn builder() -> MicroVmConfigBuilder {
        MicroVmConfigBuilder::default()
    }

    /// Set one option by name.
    ///
    /// # Errors
    /// `UnknownOption` for keys outside [`OPTIONS`], `InvalidValue` when the
    /// value does not parse for the option's type.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "data_path" => self.data_path = PathBuf::from(value),
            "binary_path" => self.binary_path = PathBuf::from(value),
            "kernel_file" => self.kernel_file = PathBuf::from(value),
            "initrd_file" => self.initrd_file = optional_path(value),
            "init_file" => self.init_file = value.to_string(),
            "base_rootfs" => self.base_rootfs = optional_path(value),
            "overlayfs" => self.overlayfs = parse_bool(key, value)?,
            "overlayfs_file" => self.overlayfs_file = optional_path(value),
            "ip_addr" => self.ip_addr = value.to_string(),
            "bridge" => self.bridge = parse_bool(key, value)?,
            "bridge_name" => self.bridge_name = value.to_string(),
            "mmds_enabled" => self.mmds_enabled = parse_bool(key, value)?,
            "mmds_ip" => self.mmds_ip = value.to_string(),
            "user_data" => self.user_data = (!value.is_empty()).then(|| value.to_string()),
            "vcpu" => self.vcpu_count = parse(key, value)?,
            "memory" => self.mem_size_mib = parse(key, value)?,
            "hostname" => self.hostname = value.to_string(),
            "ssh_user" => self.ssh_user = value.to_string(),
            "expose_ports" => self.expose_ports = parse_bool(key, value)?,
            "host_port" => self.host_port = Some(parse(key, value)?),
            "dest_port" => self.dest_port = Some(parse(key, value)?),
            other => return Err(ConfigError::UnknownOption(other.to_string())),
        }
        Ok(())
    }

    /// Defaults with `overrides` applied in order.
    pub fn from_overrides<I, K, V>(overrides: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in overrides {
            config.apply(key.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Defaults overridden by `EMBER_<OPTION>` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let overrides = OPTIONS.iter().filter_map(|key| {
            std::env::var(format!("EMBER_{}", key.to_ascii_uppercase()))
                .ok()
                .map(|value| (*key, value))
        });
        Self::from_overrides(overrides)
    }

    /// Check option values. Does not touch the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vcpu_count == 0 || self.vcpu_count > MAX_VCPUS {
            return Err(ConfigError::Invalid(format!(
                "vcpu must be between 1 and {MAX_VCPUS}, got {}",
                self.vcpu_count
            )));
        }
        if self.mem_size_mib < MIN_MEMORY_MIB {
            return Err(ConfigError::Invalid(format!(
                "memory must be at least {MIN_MEMORY_MIB} MiB, got {}",
                self.mem_size_mib
            )));
        }
        if !self.hostname.is_empty() {
            validate_hostname(&self.hostname)?;
        }
        validate_ip(&self.ip_addr)?;
        if self.mmds_enabled {
            validate_ip(&self.mmds_ip)?;
        }
        if self.bridge && self.bridge_name.is_empty() {
            return Err(ConfigError::Invalid("bridge_name is required when bridge is enabled".into()));
        }
        if self.overlayfs && self.overlayfs_file.is_none() {
            return Err(ConfigError::Invalid("overlayfs_file is required when overlayfs is enabled".into()));
        }
        if self.expose_ports && (self.host_port.is_none() || self.dest_port.is_none()) {
            return Err(ConfigError::Invalid(
                "host_port and dest_port are required when expose_ports is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Check that the kernel, rootfs and optional images exist.
    pub fn check_files(&self) -> Result<(), ConfigError> {
        require_file("kernel file", &self.kernel_file)?;
        let rootfs = self
            .base_rootfs
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("base_rootfs is required".into()))?;
        require_file("base root filesystem", rootfs)?;
        if let Some(initrd) = &self.initrd_file {
            require_file("initrd file", initrd)?;
        }
        if self.overlayfs {
            if let Some(overlay) = &self.overlayfs_file {
                require_file("overlay filesystem", overlay)?;
            }
        }
        Ok(())
    }

    /// Hostname, or `id` when unset.
    pub fn hostname_for(&self, id: &str) -> String {
        if self.hostname.is_empty() {
            id.to_string()
        } else {
            self.hostname.clone()
        }
    }

    /// Kernel command line for a VM whose gateway is `gateway`.
    pub fn boot_args(&self, id: &str, gateway: &str) -> String {
        let mut args = build_boot_args(
            &self.ip_addr,
            gateway,
            &self.hostname_for(id),
            GUEST_IFACE,
            self.mmds_enabled.then_some(self.mmds_ip.as_str()),
        );
        if self.overlayfs {
            args.push_str(&format!("overlay_root=vdb init={}", self.init_file));
        }
        args
    }
}

/// `console=ttyS0 ... ip=<ip>::<gw>:255.255.255.0:<host>:<iface>:off `, with
/// the NoCloud datasource prefix when a metadata address is given.
pub fn build_boot_args(
    ip: &str,
    gateway: &str,
    hostname: &str,
    iface: &str,
    mmds_ip: Option<&str>,
) -> String {
    let base = format!(
        "console=ttyS0 reboot=k panic=1 pci=off ip={ip}::{gateway}:255.255.255.0:{hostname}:{iface}:off "
    );
    match mmds_ip {
        Some(mmds) => format!("ds=nocloud-net;s=http://{mmds}/latest/ {base}"),
        None => base,
    }
}

fn require_file(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::MissingFile {
            what,
            path: path.display().to_string(),
        })
    }
}

/// RFC 1123 single-label hostname.
pub fn validate_hostname(hostname: &str) -> Result<(), ConfigError> {
    let pattern = Regex::new(HOSTNAME_PATTERN).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    if pattern.is_match(hostname) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("invalid hostname: {hostname}")))
    }
}

/// Parseable address; IPv4 must not end in `.0`.
pub fn validate_ip(ip: &str) -> Result<(), ConfigError> {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) if v4.octets()[3] == 0 => Err(ConfigError::Invalid(format!(
            "IP address with .0 suffix is reserved: {ip}"
        ))),
        Ok(_) => Ok(()),
        Err(_) => Err(ConfigError::Invalid(format!("invalid IP address: {ip}"))),
    }
}

/// Builder for [`MicroVmConfig`].
#[derive(Debug, Default)]
pub struct MicroVmConfigBuilder {
    config: MicroVmConfig,
}

impl MicroVmConfigBuilder {
    pub fn data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_path = path.into();
        self
    }

    pub fn binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.binary_path = path.into();
        self
    }

    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_file = path.into();
        self
    }

    pub fn initrd(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.initrd_file = Some(path.into());
        self
    }

    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.base_rootfs = Some(path.into());
        self
    }

    /// Boot from a read-only rootfs with `path` as the writable overlay.
    pub fn overlay(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.overlayfs = true;
        self.config.overlayfs_file = Some(path.into());
        self
    }

    pub fn ip_addr(mut self, ip: impl Into<String>) -> Self {
        self.config.ip_addr = ip.into();
        self
    }

    /// Attach the tap to `name` instead of NAT-ing it.
    pub fn bridge(mut self, name: impl Into<String>) -> Self {
        self.config.bridge = true;
        self.config.bridge_name = name.into();
        self
    }

    /// Enable the metadata service on `ip`.
    pub fn mmds(mut self, ip: impl Into<String>) -> Self {
        self.config.mmds_enabled = true;
        self.config.mmds_ip = ip.into();
        self
    }

    pub fn user_data(mut self, data: impl Into<String>) -> Self {
        self.config.user_data = Some(data.into());
        self
    }

    pub fn vcpu_count(mut self, count: u32) -> Self {
        self.config.vcpu_count = count;
        self
    }

    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.mem_size_mib = mib;
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    pub fn ssh_user(mut self, user: impl Into<String>) -> Self {
        self.config.ssh_user = user.into();
        self
    }

    /// Forward `host_port` on the host to `dest_port` in the guest after boot.
    pub fn expose_port(mut self, host_port: u16, dest_port: u16) -> Self {
        self.config.expose_ports = true;
        self.config.host_port = Some(host_port);
        self.config.dest_port = Some(dest_port);
        self
    }

    /// Build the configuration, validating all values.
    pub fn build(self) -> Result<MicroVmConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
