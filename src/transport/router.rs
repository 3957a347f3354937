use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::error::VmError;
use crate::power::{PowerState, PowerVerb};
use crate::transport::{
    CloneRequest, CommandOutput, GuestCommand, GuestListing, Transport, VmSettings,
};
use crate::vmx::GuestDescriptor;

/// Operations a transport offers, used as routing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Power,
    Run,
    CopyTo,
    CopyFrom,
    Ip,
    Mac,
    List,
    Clone,
    Delete,
    Snapshot,
    Settings,
}

impl Capability {
    pub const ALL: [Capability; 11] = [
        Self::Power,
        Self::Run,
        Self::CopyTo,
        Self::CopyFrom,
        Self::Ip,
        Self::Mac,
        Self::List,
        Self::Clone,
        Self::Delete,
        Self::Snapshot,
        Self::Settings,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Power => "power",
            Self::Run => "run",
            Self::CopyTo => "copy_to",
            Self::CopyFrom => "copy_from",
            Self::Ip => "ip",
            Self::Mac => "mac",
            Self::List => "list",
            Self::Clone => "clone",
            Self::Delete => "delete",
            Self::Snapshot => "snapshot",
            Self::Settings => "settings",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == s)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    Remote,
}

impl Backend {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Remote => "remote",
        })
    }
}

/// Capability → backend map. Guest execution and file copies go through the
/// local CLI; state queries go through the REST session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    routes: BTreeMap<Capability, Backend>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        let routes = Capability::ALL
            .into_iter()
            .map(|cap| {
                let backend = match cap {
                    Capability::Power
                    | Capability::List
                    | Capability::Ip
                    | Capability::Mac
                    | Capability::Settings => Backend::Remote,
                    Capability::Run
                    | Capability::CopyTo
                    | Capability::CopyFrom
                    | Capability::Clone
                    | Capability::Delete
                    | Capability::Snapshot => Backend::Local,
                };
                (cap, backend)
            })
            .collect();
        Self { routes }
    }
}

impl RoutingTable {
    /// Defaults with `[routing]` entries applied on top.
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Result<Self, VmError> {
        let mut table = Self::default();
        for (name, backend) in overrides {
            let cap = Capability::parse(name).ok_or_else(|| VmError::Validation {
                message: format!("unknown routing capability \"{name}\""),
            })?;
            let backend = Backend::parse(backend).ok_or_else(|| VmError::Validation {
                message: format!(
                    "routing.{name} must be \"local\" or \"remote\", got \"{backend}\""
                ),
            })?;
            table.routes.insert(cap, backend);
        }
        Ok(table)
    }

    /// Route every capability to one backend.
    pub fn uniform(backend: Backend) -> Self {
        Self {
            routes: Capability::ALL.into_iter().map(|c| (c, backend)).collect(),
        }
    }

    pub fn backend_for(&self, cap: Capability) -> Backend {
        self.routes.get(&cap).copied().unwrap_or(Backend::Local)
    }

    pub fn routes(&self) -> impl Iterator<Item = (Capability, Backend)> + '_ {
        self.routes.iter().map(|(c, b)| (*c, *b))
    }
}

// ── Router ──────────────────────────────────────────────────

/// Dispatches each capability to the backend the table names. The remote
/// session is opened on first use and closed by `disconnect`.
pub struct Router {
    table: RoutingTable,
    local: Arc<dyn Transport>,
    remote: Option<Arc<dyn Transport>>,
    remote_session: OnceCell<()>,
}

impl Router {
    pub fn new(
        table: RoutingTable,
        local: Arc<dyn Transport>,
        remote: Option<Arc<dyn Transport>>,
    ) -> Self {
        Self {
            table,
            local,
            remote,
            remote_session: OnceCell::new(),
        }
    }

    async fn pick(&self, cap: Capability) -> Result<&dyn Transport, VmError> {
        match self.table.backend_for(cap) {
            Backend::Local => Ok(self.local.as_ref()),
            Backend::Remote => {
                let remote = self
                    .remote
                    .as_ref()
                    .ok_or_else(|| VmError::RemoteSessionRequired {
                        operation: cap.name().into(),
                    })?;
                self.remote_session
                    .get_or_try_init(|| async {
                        tracing::debug!(backend = remote.name(), "opening remote session");
                        remote.connect().await
                    })
                    .await?;
                Ok(remote.as_ref())
            }
        }
    }
}

#[async_trait]
impl Transport for Router {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn connect(&self) -> Result<(), VmError> {
        self.local.connect().await
    }

    async fn disconnect(&self) -> Result<(), VmError> {
        if let Some(remote) = self.remote.as_ref().filter(|_| self.remote_session.initialized()) {
            tracing::debug!(backend = remote.name(), "closing remote session");
            remote.disconnect().await?;
        }
        self.local.disconnect().await
    }

    async fn power_state(&self, vm: &GuestDescriptor) -> Result<PowerState, VmError> {
        self.pick(Capability::Power).await?.power_state(vm).await
    }

    async fn set_power(&self, vm: &GuestDescriptor, verb: PowerVerb) -> Result<(), VmError> {
        self.pick(Capability::Power).await?.set_power(vm, verb).await
    }

    async fn run_in_guest(
        &self,
        vm: &GuestDescriptor,
        command: &GuestCommand,
    ) -> Result<CommandOutput, VmError> {
        self.pick(Capability::Run).await?.run_in_guest(vm, command).await
    }

    async fn copy_to_guest(
        &self,
        vm: &GuestDescriptor,
        local: &Path,
        remote: &str,
    ) -> Result<(), VmError> {
        self.pick(Capability::CopyTo)
            .await?
            .copy_to_guest(vm, local, remote)
            .await
    }

    async fn copy_from_guest(
        &self,
        vm: &GuestDescriptor,
        remote: &str,
        local: &Path,
    ) -> Result<(), VmError> {
        self.pick(Capability::CopyFrom)
            .await?
            .copy_from_guest(vm, remote, local)
            .await
    }

    async fn ip_address(&self, vm: &GuestDescriptor) -> Result<String, VmError> {
        self.pick(Capability::Ip).await?.ip_address(vm).await
    }

    async fn mac_address(&self, vm: &GuestDescriptor) -> Result<String, VmError> {
        self.pick(Capability::Mac).await?.mac_address(vm).await
    }

    async fn list_guests(&self) -> Result<Vec<GuestListing>, VmError> {
        self.pick(Capability::List).await?.list_guests().await
    }

    async fn clone_guest(
        &self,
        source: &GuestDescriptor,
        request: &CloneRequest,
    ) -> Result<(), VmError> {
        self.pick(Capability::Clone)
            .await?
            .clone_guest(source, request)
            .await
    }

    async fn delete_guest(&self, vm: &GuestDescriptor) -> Result<(), VmError> {
        self.pick(Capability::Delete).await?.delete_guest(vm).await
    }

    async fn snapshot(&self, vm: &GuestDescriptor, name: &str) -> Result<(), VmError> {
        self.pick(Capability::Snapshot).await?.snapshot(vm, name).await
    }

    async fn settings(&self, vm: &GuestDescriptor) -> Result<VmSettings, VmError> {
        self.pick(Capability::Settings).await?.settings(vm).await
    }
}
