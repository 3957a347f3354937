//! Capability contract for reaching the hypervisor and its guests.
//!
//! Two backends implement it: [`vmrun::VmrunTransport`] shells out to the
//! local automation CLI, [`rest::RestTransport`] talks to the REST
//! management endpoint. [`router::Router`] combines them per capability.

pub mod rest;
pub mod router;
pub mod vmrun;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::VmError;
use crate::power::{PowerState, PowerVerb};
use crate::vmx::GuestDescriptor;

pub use router::{Backend, Capability, Router, RoutingTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCommand {
    pub program: String,
    pub args: Vec<String>,
    pub interactive: bool,
}

impl GuestCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            interactive: false,
        }
    }
}

/// Result of one guest program run. A non-zero exit code is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
}

/// One entry of a backend's inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestListing {
    /// Transport-assigned id (REST only).
    pub id: Option<String>,
    pub path: PathBuf,
}

impl GuestListing {
    pub fn nickname(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    /// Path of the new `.vmx`.
    pub destination: PathBuf,
    pub name: String,
    pub full: bool,
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSettings {
    pub cpus: u32,
    pub memory_mb: u64,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open the backend's session, if it has one.
    async fn connect(&self) -> Result<(), VmError> {
        Ok(())
    }

    /// Close the backend's session, if it has one.
    async fn disconnect(&self) -> Result<(), VmError> {
        Ok(())
    }

    async fn power_state(&self, vm: &GuestDescriptor) -> Result<PowerState, VmError>;

    async fn set_power(&self, vm: &GuestDescriptor, verb: PowerVerb) -> Result<(), VmError>;

    async fn run_in_guest(
        &self,
        vm: &GuestDescriptor,
        command: &GuestCommand,
    ) -> Result<CommandOutput, VmError>;

    async fn copy_to_guest(
        &self,
        vm: &GuestDescriptor,
        local: &Path,
        remote: &str,
    ) -> Result<(), VmError>;

    async fn copy_from_guest(
        &self,
        vm: &GuestDescriptor,
        remote: &str,
        local: &Path,
    ) -> Result<(), VmError>;

    async fn ip_address(&self, vm: &GuestDescriptor) -> Result<String, VmError>;

    async fn mac_address(&self, vm: &GuestDescriptor) -> Result<String, VmError>;

    async fn list_guests(&self) -> Result<Vec<GuestListing>, VmError>;

    async fn clone_guest(
        &self,
        source: &GuestDescriptor,
        request: &CloneRequest,
    ) -> Result<(), VmError>;

    async fn delete_guest(&self, vm: &GuestDescriptor) -> Result<(), VmError>;

    async fn snapshot(&self, vm: &GuestDescriptor, name: &str) -> Result<(), VmError>;

    async fn settings(&self, vm: &GuestDescriptor) -> Result<VmSettings, VmError>;
}
