#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;

use vmdrive::config::RunOptions;
use vmdrive::error::VmError;
use vmdrive::orchestrator::Orchestrator;
use vmdrive::power::{PowerState, PowerVerb};
use vmdrive::registry::Registry;
use vmdrive::transport::{
    CloneRequest, CommandOutput, GuestCommand, GuestListing, Transport, VmSettings,
};
use vmdrive::vmx::{GuestDescriptor, GuestOs};
use vmdrive_launcher::Invocation;

/// Transport whose "guest" is the host filesystem. The launcher runs
/// in-process through the real launcher library.
#[derive(Default)]
pub struct FakeTransport {
    power: Mutex<HashMap<PathBuf, PowerState>>,
    /// Readiness probes that fail before one succeeds.
    failing_probes: AtomicU32,
    pub probes: AtomicU32,
    pub clones: Mutex<Vec<PathBuf>>,
    pub deleted: Mutex<Vec<PathBuf>>,
    pub launches: AtomicU32,
    /// Launches that ran to completion.
    pub finished_launches: AtomicU32,
    /// Clone leaves a partial bundle behind and then fails.
    pub fail_clone: AtomicBool,
    /// Deletion reports failure without removing anything.
    pub fail_delete: AtomicBool,
    /// Extra delay before the launcher runs.
    pub launch_delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_probes(&self, n: u32) {
        self.failing_probes.store(n, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn state_of(&self, path: &Path) -> PowerState {
        self.power
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(PowerState::Stopped)
    }

    fn probe(&self) -> CommandOutput {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_probes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_probes.store(remaining - 1, Ordering::SeqCst);
            return CommandOutput {
                exit_code: 1,
                stdout: String::new(),
            };
        }
        CommandOutput {
            exit_code: 0,
            stdout: String::new(),
        }
    }

    async fn launch(&self, args: &[String]) -> CommandOutput {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.launch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let invocation =
            Invocation::try_parse_from(std::iter::once("launcher".to_string()).chain(args.iter().cloned()))
                .unwrap();
        let exit_code = vmdrive_launcher::launch(&invocation).await;
        self.finished_launches.fetch_add(1, Ordering::SeqCst);
        CommandOutput {
            exit_code,
            stdout: String::new(),
        }
    }
}

fn ok() -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: String::new(),
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn power_state(&self, vm: &GuestDescriptor) -> Result<PowerState, VmError> {
        Ok(self.state_of(&vm.path))
    }

    async fn set_power(&self, vm: &GuestDescriptor, verb: PowerVerb) -> Result<(), VmError> {
        let state = match verb {
            PowerVerb::Start | PowerVerb::Unpause => PowerState::Running,
            PowerVerb::Stop | PowerVerb::Shutdown => PowerState::Stopped,
            PowerVerb::Suspend => PowerState::Suspended,
            PowerVerb::Pause => PowerState::Paused,
        };
        self.power.lock().unwrap().insert(vm.path.clone(), state);
        Ok(())
    }

    async fn run_in_guest(
        &self,
        _vm: &GuestDescriptor,
        command: &GuestCommand,
    ) -> Result<CommandOutput, VmError> {
        if command.args.iter().any(|a| a == "exit 0") {
            return Ok(self.probe());
        }
        let program = Path::new(&command.program);
        if program.file_name().is_some_and(|n| n == "launcher") {
            return Ok(self.launch(&command.args).await);
        }
        match command.program.as_str() {
            "/bin/rm" => {
                let _ = std::fs::remove_dir_all(&command.args[1]);
                Ok(ok())
            }
            "/bin/mkdir" => {
                std::fs::create_dir_all(&command.args[1]).unwrap();
                Ok(ok())
            }
            "/bin/chmod" => Ok(ok()),
            other => {
                let out = std::process::Command::new(other)
                    .args(&command.args)
                    .output()
                    .unwrap();
                Ok(CommandOutput {
                    exit_code: out.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                })
            }
        }
    }

    async fn copy_to_guest(
        &self,
        _vm: &GuestDescriptor,
        local: &Path,
        remote: &str,
    ) -> Result<(), VmError> {
        std::fs::copy(local, remote).map_err(|source| VmError::Io {
            context: format!("fake copy to {remote}"),
            source,
        })?;
        Ok(())
    }

    async fn copy_from_guest(
        &self,
        _vm: &GuestDescriptor,
        remote: &str,
        local: &Path,
    ) -> Result<(), VmError> {
        std::fs::copy(remote, local).map_err(|source| VmError::Io {
            context: format!("fake copy from {remote}"),
            source,
        })?;
        Ok(())
    }

    async fn ip_address(&self, _vm: &GuestDescriptor) -> Result<String, VmError> {
        Ok("127.0.0.1".into())
    }

    async fn mac_address(&self, _vm: &GuestDescriptor) -> Result<String, VmError> {
        Ok("00:0c:29:00:00:01".into())
    }

    async fn list_guests(&self) -> Result<Vec<GuestListing>, VmError> {
        Err(VmError::RemoteSessionRequired {
            operation: "list".into(),
        })
    }

    async fn clone_guest(
        &self,
        source: &GuestDescriptor,
        request: &CloneRequest,
    ) -> Result<(), VmError> {
        std::fs::copy(&source.path, &request.destination).unwrap();
        self.clones.lock().unwrap().push(request.destination.clone());
        if self.fail_clone.load(Ordering::SeqCst) {
            return Err(VmError::Transport {
                backend: "fake",
                operation: "clone".into(),
                message: "clone interrupted".into(),
                detail: String::new(),
            });
        }
        Ok(())
    }

    async fn delete_guest(&self, vm: &GuestDescriptor) -> Result<(), VmError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(VmError::Transport {
                backend: "fake",
                operation: "deleteVM".into(),
                message: "guest is locked".into(),
                detail: String::new(),
            });
        }
        let _ = std::fs::remove_file(&vm.path);
        self.deleted.lock().unwrap().push(vm.path.clone());
        Ok(())
    }

    async fn snapshot(&self, _vm: &GuestDescriptor, _name: &str) -> Result<(), VmError> {
        Ok(())
    }

    async fn settings(&self, _vm: &GuestDescriptor) -> Result<VmSettings, VmError> {
        Ok(VmSettings {
            cpus: 2,
            memory_mb: 2048,
        })
    }
}

/// A VM directory with one Linux guest named `builder`, a guest temp root,
/// and an orchestrator wired to a [`FakeTransport`].
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub transport: Arc<FakeTransport>,
    pub orchestrator: Orchestrator,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_options(RunOptions {
            num_tries: 3,
            sleep: Duration::ZERO,
            ..RunOptions::default()
        })
    }

    pub fn with_options(options: RunOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let vms = dir.path().join("vms");
        let bundle = vms.join("builder");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(
            bundle.join("builder.vmx"),
            "displayName = \"Builder\"\nguestOS = \"ubuntu-64\"\n",
        )
        .unwrap();

        let guest_tmp = dir.path().join("guest-tmp");
        std::fs::create_dir_all(&guest_tmp).unwrap();
        let launcher = dir.path().join("launcher-bin");
        std::fs::write(&launcher, b"stand-in").unwrap();

        let transport = FakeTransport::new();
        let orchestrator = Orchestrator::new(transport.clone(), Registry::new(&vms))
            .with_options(options)
            .with_launcher(GuestOs::Linux, &launcher)
            .with_guest_temp_dir(guest_tmp.to_string_lossy());
        Self {
            dir,
            transport,
            orchestrator,
        }
    }

    pub fn vms_dir(&self) -> PathBuf {
        self.dir.path().join("vms")
    }

    pub fn guest_tmp(&self) -> PathBuf {
        self.dir.path().join("guest-tmp")
    }

    /// Bundle directories under the VM dir, sorted.
    pub fn bundles(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.vms_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Write a workload directory from `(path, contents)` pairs.
    pub fn workload(&self, files: &[(&str, &str)]) -> PathBuf {
        let root = self.dir.path().join("workload");
        for (rel, contents) in files {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, contents).unwrap();
        }
        root
    }
}
