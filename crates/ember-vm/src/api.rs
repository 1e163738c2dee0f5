//! Firecracker control-plane client.
//!
//! Every configuration call is a full-resource replace sent over the VM's
//! Unix API socket. The client owns its connection pool and must be closed
//! explicitly by whoever opened it.

use crate::error::{Result, VmError};
use crate::models::{
    BootSource, Drive, Fault, InstanceAction, InstanceInfo, LifecycleAction,
    MachineConfiguration, MmdsConfig, NetworkInterface, VmStatePatch,
};
use async_trait::async_trait;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// A control-plane resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    BootSource,
    Drive(String),
    MachineConfig,
    NetworkInterface(String),
    MmdsConfig,
    Mmds,
    Actions,
    VmState,
    InstanceInfo,
    VmConfig,
}

impl Endpoint {
    /// Request path on the API socket.
    pub fn path(&self) -> String {
        match self {
            Endpoint::BootSource => "/boot-source".to_string(),
            Endpoint::Drive(id) => format!("/drives/{id}"),
            Endpoint::MachineConfig => "/machine-config".to_string(),
            Endpoint::NetworkInterface(id) => format!("/network-interfaces/{id}"),
            Endpoint::MmdsConfig => "/mmds/config".to_string(),
            Endpoint::Mmds => "/mmds".to_string(),
            Endpoint::Actions => "/actions".to_string(),
            Endpoint::VmState => "/vm".to_string(),
            Endpoint::InstanceInfo => "/".to_string(),
            Endpoint::VmConfig => "/vm/config".to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Endpoint::BootSource => "boot source",
            Endpoint::Drive(_) => "drive",
            Endpoint::MachineConfig => "machine config",
            Endpoint::NetworkInterface(_) => "network interface",
            Endpoint::MmdsConfig => "metadata service config",
            Endpoint::Mmds => "metadata service data",
            Endpoint::Actions => "instance action",
            Endpoint::VmState => "vm state",
            Endpoint::InstanceInfo => "instance info",
            Endpoint::VmConfig => "vm config",
        };
        write!(f, "{name} ({})", self.path())
    }
}

/// Operations exposed by a VM's control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn put_boot_source(&self, boot_source: &BootSource) -> Result<()>;
    async fn put_drive(&self, drive: &Drive) -> Result<()>;
    async fn put_machine_config(&self, machine: &MachineConfiguration) -> Result<()>;
    async fn put_network_interface(&self, iface: &NetworkInterface) -> Result<()>;
    async fn put_mmds_config(&self, config: &MmdsConfig) -> Result<()>;
    async fn put_mmds(&self, document: &serde_json::Value) -> Result<()>;
    async fn action(&self, action: LifecycleAction) -> Result<()>;
    async fn instance_info(&self) -> Result<InstanceInfo>;
    async fn vm_config(&self) -> Result<serde_json::Value>;

    /// Release the transport. Further calls fail with an API error.
    fn close(&mut self);
}

/// Opens a [`ControlPlane`] bound to a socket path.
pub trait ControlPlaneConnector: Send + Sync {
    fn connect(&self, socket_path: &Path) -> Box<dyn ControlPlane>;
}

/// Connector producing [`ApiClient`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketConnector;

impl ControlPlaneConnector for SocketConnector {
    fn connect(&self, socket_path: &Path) -> Box<dyn ControlPlane> {
        Box::new(ApiClient::new(socket_path))
    }
}

/// HTTP-over-Unix-socket client for one Firecracker instance.
pub struct ApiClient {
    socket_path: PathBuf,
    client: Option<Client<UnixConnector, Body>>,
}

impl ApiClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Some(Client::unix()),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_none()
    }

    async fn send<T: Serialize + ?Sized>(
        &self,
        method: Method,
        endpoint: &Endpoint,
        payload: Option<&T>,
    ) -> Result<Vec<u8>> {
        let client = self.client.as_ref().ok_or_else(|| {
            VmError::Api(format!(
                "connection to {} is closed",
                self.socket_path.display()
            ))
        })?;

        let uri: hyper::Uri = Uri::new(&self.socket_path, &endpoint.path()).into();
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header("Accept", "application/json");

        let body = match payload {
            Some(payload) => {
                let json = serde_json::to_string(payload)?;
                tracing::trace!(%endpoint, body = %json, "Sending control-plane request");
                builder = builder.header("Content-Type", "application/json");
                Body::from(json)
            }
            None => Body::empty(),
        };

        let request = builder
            .body(body)
            .map_err(|e| VmError::Api(format!("failed to build {endpoint} request: {e}")))?;

        let response = client
            .request(request)
            .await
            .map_err(|e| VmError::Api(format!("{method} {endpoint} request failed: {e}")))?;

        let status = response.status();
        let body_bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| VmError::Api(format!("failed to read {endpoint} response: {e}")))?;

        if !status.is_success() {
            return Err(VmError::Config(format!(
                "{endpoint} rejected with status {status}: {}",
                fault_message(&body_bytes)
            )));
        }

        Ok(body_bytes.to_vec())
    }

    async fn put<T: Serialize + ?Sized>(&self, endpoint: Endpoint, payload: &T) -> Result<()> {
        self.send(Method::PUT, &endpoint, Some(payload)).await?;
        tracing::debug!(%endpoint, "Control-plane resource configured");
        Ok(())
    }
}

/// Extract Firecracker's `fault_message`, falling back to the raw body.
fn fault_message(body: &[u8]) -> String {
    match serde_json::from_slice::<Fault>(body) {
        Ok(fault) => fault.fault_message,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}

#[async_trait]
impl ControlPlane for ApiClient {
    async fn put_boot_source(&self, boot_source: &BootSource) -> Result<()> {
        self.put(Endpoint::BootSource, boot_source).await
    }

    async fn put_drive(&self, drive: &Drive) -> Result<()> {
        self.put(Endpoint::Drive(drive.drive_id.clone()), drive).await
    }

    async fn put_machine_config(&self, machine: &MachineConfiguration) -> Result<()> {
        self.put(Endpoint::MachineConfig, machine).await
    }

    async fn put_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        self.put(Endpoint::NetworkInterface(iface.iface_id.clone()), iface)
            .await
    }

    async fn put_mmds_config(&self, config: &MmdsConfig) -> Result<()> {
        self.put(Endpoint::MmdsConfig, config).await
    }

    async fn put_mmds(&self, document: &serde_json::Value) -> Result<()> {
        self.put(Endpoint::Mmds, document).await
    }

    async fn action(&self, action: LifecycleAction) -> Result<()> {
        match action {
            LifecycleAction::Start => {
                let body = InstanceAction {
                    action_type: "InstanceStart",
                };
                self.send(Method::PUT, &Endpoint::Actions, Some(&body)).await?;
            }
            LifecycleAction::Pause | LifecycleAction::Resume => {
                let state = if action == LifecycleAction::Pause {
                    "Paused"
                } else {
                    "Resumed"
                };
                let body = VmStatePatch { state };
                self.send(Method::PATCH, &Endpoint::VmState, Some(&body))
                    .await?;
            }
        }
        tracing::debug!(%action, "Lifecycle action accepted");
        Ok(())
    }

    async fn instance_info(&self) -> Result<InstanceInfo> {
        let body = self
            .send::<()>(Method::GET, &Endpoint::InstanceInfo, None)
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn vm_config(&self) -> Result<serde_json::Value> {
        let body = self.send::<()>(Method::GET, &Endpoint::VmConfig, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn close(&mut self) {
        if self.client.take().is_some() {
            tracing::trace!(socket = %self.socket_path.display(), "Control-plane client closed");
        }
    }
}
