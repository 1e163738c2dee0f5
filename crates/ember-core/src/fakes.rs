//! In-memory collaborators for orchestrator tests.

use crate::config::MicroVmConfig;
use crate::manager::{Collaborators, MicroVm};
use async_trait::async_trait;
use ember_vm::network::{LinkManager, Rule, RuleEngine, RuleRef};
use ember_vm::{
    BootSource, ControlPlane, ControlPlaneConnector, Drive, InstanceInfo, LaunchSpec, Launched,
    LifecycleAction, MachineConfiguration, MmdsConfig, NetworkInterface, NetworkProvisioner,
    PortForward, ProcessLauncher, ProcessProbe, Result, VmError,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HarnessOptions {
    pub mmds: bool,
    pub overlay: bool,
    /// Control-plane call to reject, e.g. `"machine-config"`.
    pub reject: Option<&'static str>,
    pub fail_tap: bool,
    pub process_dies: bool,
    pub no_socket: bool,
}

#[derive(Default)]
struct Shared {
    calls: Vec<String>,
    closed: usize,
    boot_args: Option<String>,
    mmds: Option<Value>,
    machine: Option<MachineConfiguration>,
    instance_state: String,
    launches: Vec<u32>,
    alive: HashSet<u32>,
    terminated: Vec<u32>,
}

type State = Arc<Mutex<Shared>>;

struct FakeLauncher {
    state: State,
    options: HarnessOptions,
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Launched> {
        let pid = {
            let mut state = self.state.lock().unwrap();
            let pid = 4000 + state.launches.len() as u32;
            state.launches.push(pid);
            if !self.options.process_dies {
                state.alive.insert(pid);
            }
            pid
        };
        if !self.options.no_socket && !self.options.process_dies {
            std::fs::write(&spec.socket_path, b"")?;
        }
        Ok(Launched {
            pid,
            session: spec.session_name(),
        })
    }

    async fn terminate(&self, pid: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.alive.remove(&pid);
        state.terminated.push(pid);
        Ok(())
    }
}

struct FakeProbe(State);

impl ProcessProbe for FakeProbe {
    fn exists(&self, pid: u32) -> bool {
        self.0.lock().unwrap().alive.contains(&pid)
    }
}

struct FakeConnector {
    state: State,
    reject: Option<&'static str>,
}

impl ControlPlaneConnector for FakeConnector {
    fn connect(&self, _socket_path: &Path) -> Box<dyn ControlPlane> {
        Box::new(FakeControlPlane {
            state: self.state.clone(),
            reject: self.reject,
        })
    }
}

struct FakeControlPlane {
    state: State,
    reject: Option<&'static str>,
}

impl FakeControlPlane {
    fn record(&self, call: String) -> Result<()> {
        let rejected = self.reject == Some(call.as_str());
        self.state.lock().unwrap().calls.push(call.clone());
        if rejected {
            return Err(VmError::Config(format!(
                "{call} rejected with status 400 Bad Request: invalid request"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn put_boot_source(&self, boot_source: &BootSource) -> Result<()> {
        self.record("boot-source".into())?;
        self.state.lock().unwrap().boot_args = Some(boot_source.boot_args.clone());
        Ok(())
    }

    async fn put_drive(&self, drive: &Drive) -> Result<()> {
        self.record(format!("drive:{}", drive.drive_id))
    }

    async fn put_machine_config(&self, machine: &MachineConfiguration) -> Result<()> {
        self.record("machine-config".into())?;
        self.state.lock().unwrap().machine = Some(*machine);
        Ok(())
    }

    async fn put_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        self.record(format!("network-interface:{}", iface.iface_id))
    }

    async fn put_mmds_config(&self, _config: &MmdsConfig) -> Result<()> {
        self.record("mmds-config".into())
    }

    async fn put_mmds(&self, document: &Value) -> Result<()> {
        self.record("mmds".into())?;
        self.state.lock().unwrap().mmds = Some(document.clone());
        Ok(())
    }

    async fn action(&self, action: LifecycleAction) -> Result<()> {
        self.record(format!("action:{action}"))
    }

    async fn instance_info(&self) -> Result<InstanceInfo> {
        Ok(InstanceInfo {
            id: "anonymous-instance".into(),
            state: self.state.lock().unwrap().instance_state.clone(),
            vmm_version: "1.7.0".into(),
            app_name: "Firecracker".into(),
        })
    }

    async fn vm_config(&self) -> Result<Value> {
        let machine = self.state.lock().unwrap().machine;
        Ok(json!({ "machine-config": machine }))
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed += 1;
    }
}

#[derive(Default)]
struct FakeRules {
    rules: Mutex<Vec<Rule>>,
    next_handle: Mutex<u64>,
}

#[async_trait]
impl RuleEngine for FakeRules {
    async fn apply(&self, batch: &Value) -> Result<()> {
        let mut rules = self.rules.lock().unwrap();
        let mut next = self.next_handle.lock().unwrap();
        for item in batch["nftables"].as_array().into_iter().flatten() {
            if let Some(r) = item.pointer("/add/rule") {
                *next += 1;
                rules.push(Rule {
                    family: r["family"].as_str().unwrap_or_default().into(),
                    table: r["table"].as_str().unwrap_or_default().into(),
                    chain: r["chain"].as_str().unwrap_or_default().into(),
                    handle: *next,
                    expr: r["expr"].as_array().cloned().unwrap_or_default(),
                    comment: r["comment"].as_str().map(String::from),
                });
            }
        }
        Ok(())
    }

    async fn list_rules(&self, table: &str) -> Result<Vec<Rule>> {
        Ok(self
            .rules
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect())
    }

    async fn delete_rule(&self, rule: &RuleRef) -> Result<()> {
        self.rules.lock().unwrap().retain(|r| {
            !(r.table == rule.table && r.chain == rule.chain && r.handle == rule.handle)
        });
        Ok(())
    }
}

#[derive(Default)]
struct FakeLinks {
    links: Mutex<HashMap<String, String>>,
    fail_create: bool,
}

#[async_trait]
impl LinkManager for FakeLinks {
    async fn default_interface(&self) -> Result<String> {
        Ok("eth0".into())
    }

    async fn interface_ipv4(&self, _name: &str) -> Result<Option<String>> {
        Ok(Some("203.0.113.5".into()))
    }

    async fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.links.lock().unwrap().contains_key(name))
    }

    async fn link_kind(&self, name: &str) -> Result<Option<String>> {
        Ok(self.links.lock().unwrap().get(name).cloned())
    }

    async fn create_tap(&self, name: &str) -> Result<()> {
        if self.fail_create {
            return Err(VmError::Network(format!(
                "ip tuntap add {name} failed: Operation not permitted"
            )));
        }
        self.links.lock().unwrap().insert(name.into(), "tun".into());
        Ok(())
    }

    async fn set_up(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn add_address(&self, _name: &str, _address: &str, _prefix_len: u8) -> Result<()> {
        Ok(())
    }

    async fn set_master(&self, _name: &str, _master: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        self.links.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Temp data root plus fake collaborators shared by every VM it builds.
pub(crate) struct Harness {
    dir: TempDir,
    state: State,
    links: Arc<FakeLinks>,
    rules: Arc<FakeRules>,
    options: HarnessOptions,
}

impl Harness {
    pub fn new(options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for image in ["vmlinux", "rootfs.ext4", "overlay.ext4"] {
            std::fs::write(dir.path().join(image), b"image").unwrap();
        }
        let state = Arc::new(Mutex::new(Shared {
            instance_state: "Running".into(),
            ..Default::default()
        }));
        Self {
            dir,
            state,
            links: Arc::new(FakeLinks {
                fail_create: options.fail_tap,
                ..Default::default()
            }),
            rules: Arc::new(FakeRules::default()),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> MicroVmConfig {
        let root = self.root();
        let mut config = MicroVmConfig {
            data_path: root.join("vms"),
            binary_path: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_file: root.join("vmlinux"),
            base_rootfs: Some(root.join("rootfs.ext4")),
            ..Default::default()
        };
        if self.options.mmds {
            config.mmds_enabled = true;
        }
        if self.options.overlay {
            config.overlayfs = true;
            config.overlayfs_file = Some(root.join("overlay.ext4"));
        }
        config
    }

    pub fn vm(&self, id: &str) -> MicroVm {
        self.vm_with_config(id, self.config())
    }

    pub fn vm_with_config(&self, id: &str, config: MicroVmConfig) -> MicroVm {
        let collaborators = Collaborators {
            launcher: Arc::new(FakeLauncher {
                state: self.state.clone(),
                options: self.options,
            }),
            probe: Arc::new(FakeProbe(self.state.clone())),
            connector: Arc::new(FakeConnector {
                state: self.state.clone(),
                reject: self.options.reject,
            }),
            network: NetworkProvisioner::new(
                self.links.clone(),
                self.rules.clone(),
                self.root().join("network.lock"),
            ),
        };
        MicroVm::with_collaborators(Some(id.to_string()), config, collaborators).unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn boot_args(&self) -> Option<String> {
        self.state.lock().unwrap().boot_args.clone()
    }

    pub fn mmds_document(&self) -> Option<Value> {
        self.state.lock().unwrap().mmds.clone()
    }

    pub fn launches(&self) -> usize {
        self.state.lock().unwrap().launches.len()
    }

    /// Most recently launched pid.
    pub fn pid(&self) -> u32 {
        *self.state.lock().unwrap().launches.last().unwrap()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.state.lock().unwrap().terminated.clone()
    }

    pub fn kill_process(&self) {
        self.state.lock().unwrap().alive.clear();
    }

    pub fn set_instance_state(&self, state: &str) {
        self.state.lock().unwrap().instance_state = state.to_string();
    }

    pub fn tap_exists(&self, name: &str) -> bool {
        self.links.links.lock().unwrap().contains_key(name)
    }

    pub fn remove_tap(&self, name: &str) {
        self.links.links.lock().unwrap().remove(name);
    }

    pub fn filter_rules(&self) -> Vec<Rule> {
        self.rules
            .rules
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.table == "filter")
            .cloned()
            .collect()
    }

    /// Installed rules of `mapping` (0, 1 or 2).
    pub fn forward_rules(&self, mapping: &PortForward) -> usize {
        let rules = self.rules.rules.lock().unwrap();
        let handles = mapping.find(&rules);
        [handles.prerouting, handles.postrouting]
            .iter()
            .filter(|h| h.is_some())
            .count()
    }
}
