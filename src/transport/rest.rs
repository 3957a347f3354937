use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use facet::Facet;
use tokio::sync::Mutex;

use crate::credentials::Credentials;
use crate::error::VmError;
use crate::power::{PowerState, PowerVerb};
use crate::transport::{
    CloneRequest, CommandOutput, GuestCommand, GuestListing, Transport, VmSettings,
};
use crate::vmx::GuestDescriptor;

const BACKEND: &str = "rest";
const MEDIA_TYPE: &str = "application/vnd.vmware.vmw.rest-v1+json";

// ── wire types ───────────────────────────────────────────

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct VmEntry {
    #[facet(default)]
    id: String,
    #[facet(default)]
    path: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct PowerBody {
    #[facet(default)]
    power_state: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct IpBody {
    #[facet(default)]
    ip: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct ParamBody {
    #[facet(default)]
    name: String,
    #[facet(default)]
    value: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct CpuBody {
    #[facet(default)]
    processors: u32,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct SettingsBody {
    #[facet(default)]
    cpu: CpuBody,
    #[facet(default)]
    memory: u64,
}

// ── server process ───────────────────────────────────────

/// How to start the REST server when the session opens.
#[derive(Debug, Clone)]
pub struct ServerSpawn {
    pub program: PathBuf,
    pub start_timeout: Duration,
}

/// Session against the REST management endpoint. One base URL and one
/// credential pair for its whole lifetime.
pub struct RestTransport {
    host: String,
    port: u16,
    base_url: String,
    credentials: Option<Credentials>,
    client: reqwest::Client,
    spawn: Option<ServerSpawn>,
    server: Mutex<Option<tokio::process::Child>>,
}

impl RestTransport {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        credentials: Option<Credentials>,
        spawn: Option<ServerSpawn>,
    ) -> Result<Self, VmError> {
        let host = host.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VmError::Transport {
                backend: BACKEND,
                operation: "client".into(),
                message: e.to_string(),
                detail: String::new(),
            })?;
        Ok(Self {
            base_url: base_url(&host, port),
            host,
            port,
            credentials,
            client,
            spawn,
            server: Mutex::new(None),
        })
    }

    fn url(&self, fragment: &str) -> String {
        format!("{}{fragment}", self.base_url)
    }

    async fn send(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<String, VmError> {
        let request = request
            .header(reqwest::header::ACCEPT, MEDIA_TYPE)
            .header(reqwest::header::CONTENT_TYPE, MEDIA_TYPE);
        let request = match &self.credentials {
            Some(c) => request.basic_auth(c.username(), Some(c.password())),
            None => request,
        };

        let transport_err = |message: String, detail: String| VmError::Transport {
            backend: BACKEND,
            operation: operation.to_string(),
            message,
            detail,
        };

        let response = request
            .send()
            .await
            .map_err(|e| transport_err(e.to_string(), String::new()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_err(e.to_string(), String::new()))?;
        tracing::debug!(operation, %status, "rest response");

        if !status.is_success() {
            return Err(transport_err(format!("HTTP {status}"), body));
        }
        Ok(body)
    }

    async fn get(&self, fragment: &str) -> Result<String, VmError> {
        tracing::debug!(url = %self.url(fragment), "GET");
        self.send(fragment, self.client.get(self.url(fragment))).await
    }

    async fn put(&self, fragment: &str, body: String) -> Result<String, VmError> {
        tracing::debug!(url = %self.url(fragment), %body, "PUT");
        self.send(fragment, self.client.put(self.url(fragment)).body(body))
            .await
    }

    async fn vms(&self) -> Result<Vec<VmEntry>, VmError> {
        let body = self.get("vms").await?;
        let vms: Vec<VmEntry> =
            facet_json::from_str(&body).map_err(|e| bad_response("vms", &body, e))?;
        Ok(vms)
    }

    /// The REST id for `vm`: carried on the descriptor, or looked up by path.
    async fn vm_id(&self, vm: &GuestDescriptor) -> Result<String, VmError> {
        if let Some(id) = &vm.remote_id {
            return Ok(id.clone());
        }
        self.vms()
            .await?
            .into_iter()
            .find(|e| Path::new(&e.path) == vm.path)
            .map(|e| e.id)
            .ok_or_else(|| VmError::Resolution {
                identifier: vm.path.display().to_string(),
            })
    }

    /// Read one `.vmx` parameter through `vms/{id}/params/{key}`.
    pub async fn param(&self, vm: &GuestDescriptor, key: &str) -> Result<String, VmError> {
        let id = self.vm_id(vm).await?;
        let operation = format!("vms/{id}/params/{key}");
        let raw = self.get(&operation).await?;
        let body: ParamBody =
            facet_json::from_str(&raw).map_err(|e| bad_response(&operation, &raw, e))?;
        if body.name != key || body.value.is_empty() {
            return Err(VmError::Transport {
                backend: BACKEND,
                operation,
                message: format!("parameter {key} not set"),
                detail: String::new(),
            });
        }
        Ok(body.value)
    }

    async fn port_open(&self) -> bool {
        tokio::net::TcpStream::connect((self.host.as_str(), self.port))
            .await
            .is_ok()
    }

    async fn start_server(&self, spawn: &ServerSpawn) -> Result<(), VmError> {
        if self.port_open().await {
            tracing::debug!(port = self.port, "REST server already listening");
            return Ok(());
        }
        tracing::info!(program = %spawn.program.display(), port = self.port, "starting REST server");
        let child = tokio::process::Command::new(&spawn.program)
            .args(["--port", &self.port.to_string()])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| VmError::Io {
                context: format!("spawning {}", spawn.program.display()),
                source,
            })?;
        *self.server.lock().await = Some(child);

        let deadline = tokio::time::Instant::now() + spawn.start_timeout;
        while tokio::time::Instant::now() < deadline {
            if self.port_open().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Err(VmError::Transport {
            backend: BACKEND,
            operation: "connect".into(),
            message: format!(
                "REST server did not listen on port {} within {}s",
                self.port,
                spawn.start_timeout.as_secs()
            ),
            detail: String::new(),
        })
    }
}

pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}/api/")
}

/// Plain-text body the power endpoint expects.
pub fn power_body(verb: PowerVerb) -> &'static str {
    match verb {
        PowerVerb::Start => "on",
        PowerVerb::Stop => "off",
        PowerVerb::Shutdown => "shutdown",
        PowerVerb::Suspend => "suspend",
        PowerVerb::Pause => "pause",
        PowerVerb::Unpause => "unpause",
    }
}

fn bad_response(operation: &str, body: &str, e: impl std::fmt::Display) -> VmError {
    VmError::Transport {
        backend: BACKEND,
        operation: operation.to_string(),
        message: format!("invalid response: {e}"),
        detail: body.to_string(),
    }
}

fn unsupported(operation: &str) -> VmError {
    VmError::Unsupported {
        backend: BACKEND,
        operation: operation.to_string(),
    }
}

#[async_trait]
impl Transport for RestTransport {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn connect(&self) -> Result<(), VmError> {
        if let Some(spawn) = &self.spawn {
            self.start_server(spawn).await?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), VmError> {
        if let Some(mut child) = self.server.lock().await.take() {
            tracing::info!(port = self.port, "stopping REST server");
            child.kill().await.map_err(|source| VmError::Io {
                context: "stopping REST server".into(),
                source,
            })?;
        }
        Ok(())
    }

    async fn power_state(&self, vm: &GuestDescriptor) -> Result<PowerState, VmError> {
        let operation = format!("vms/{}/power", self.vm_id(vm).await?);
        let raw = self.get(&operation).await?;
        let body: PowerBody =
            facet_json::from_str(&raw).map_err(|e| bad_response(&operation, &raw, e))?;
        PowerState::from_api(&body.power_state).ok_or_else(|| VmError::Transport {
            backend: BACKEND,
            operation,
            message: format!("unknown power state \"{}\"", body.power_state),
            detail: String::new(),
        })
    }

    async fn set_power(&self, vm: &GuestDescriptor, verb: PowerVerb) -> Result<(), VmError> {
        let operation = format!("vms/{}/power", self.vm_id(vm).await?);
        self.put(&operation, power_body(verb).to_string())
            .await
            .map(drop)
    }

    async fn run_in_guest(
        &self,
        _vm: &GuestDescriptor,
        _command: &GuestCommand,
    ) -> Result<CommandOutput, VmError> {
        Err(unsupported("run_in_guest"))
    }

    async fn copy_to_guest(
        &self,
        _vm: &GuestDescriptor,
        _local: &Path,
        _remote: &str,
    ) -> Result<(), VmError> {
        Err(unsupported("copy_to_guest"))
    }

    async fn copy_from_guest(
        &self,
        _vm: &GuestDescriptor,
        _remote: &str,
        _local: &Path,
    ) -> Result<(), VmError> {
        Err(unsupported("copy_from_guest"))
    }

    async fn ip_address(&self, vm: &GuestDescriptor) -> Result<String, VmError> {
        let operation = format!("vms/{}/ip", self.vm_id(vm).await?);
        let raw = self.get(&operation).await?;
        let body: IpBody =
            facet_json::from_str(&raw).map_err(|e| bad_response(&operation, &raw, e))?;
        if body.ip.is_empty() {
            return Err(VmError::Transport {
                backend: BACKEND,
                operation,
                message: "no IP address reported".into(),
                detail: String::new(),
            });
        }
        Ok(body.ip)
    }

    async fn mac_address(&self, vm: &GuestDescriptor) -> Result<String, VmError> {
        match self.param(vm, "ethernet0.address").await {
            Ok(mac) => Ok(mac),
            Err(VmError::Transport { .. }) => self.param(vm, "ethernet0.generatedAddress").await,
            Err(e) => Err(e),
        }
    }

    async fn list_guests(&self) -> Result<Vec<GuestListing>, VmError> {
        Ok(self
            .vms()
            .await?
            .into_iter()
            .map(|e| GuestListing {
                id: Some(e.id),
                path: PathBuf::from(e.path),
            })
            .collect())
    }

    async fn clone_guest(
        &self,
        _source: &GuestDescriptor,
        _request: &CloneRequest,
    ) -> Result<(), VmError> {
        Err(unsupported("clone"))
    }

    async fn delete_guest(&self, _vm: &GuestDescriptor) -> Result<(), VmError> {
        Err(unsupported("delete"))
    }

    async fn snapshot(&self, _vm: &GuestDescriptor, _name: &str) -> Result<(), VmError> {
        Err(unsupported("snapshot"))
    }

    async fn settings(&self, vm: &GuestDescriptor) -> Result<VmSettings, VmError> {
        let operation = format!("vms/{}", self.vm_id(vm).await?);
        let raw = self.get(&operation).await?;
        let body: SettingsBody =
            facet_json::from_str(&raw).map_err(|e| bad_response(&operation, &raw, e))?;
        Ok(VmSettings {
            cpus: body.cpu.processors,
            memory_mb: body.memory,
        })
    }
}
