use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::cleanup::CleanupGuard;
use crate::clone::{self, CloneOptions};
use crate::config::{Config, RunOptions, resolve_vm_dir};
use crate::credentials::Credentials;
use crate::error::VmError;
use crate::package::{ExecutionResult, Launchers, PackageExecutor, PackageRequest};
use crate::platform::HostPlatform;
use crate::power::{self, PowerState, PowerVerb, Readiness};
use crate::registry::Registry;
use crate::transport::rest::{RestTransport, ServerSpawn};
use crate::transport::vmrun::VmrunTransport;
use crate::transport::{
    Backend, CommandOutput, GuestCommand, Router, RoutingTable, Transport, VmSettings,
};
use crate::vmx::{GuestDescriptor, GuestOs};

/// Entry point for every VM operation: resolves identifiers, routes calls
/// to a backend, and owns the lifetime of ephemeral clones.
pub struct Orchestrator {
    transport: Arc<dyn Transport>,
    registry: Registry,
    options: RunOptions,
    clone_options: CloneOptions,
    launchers: Launchers,
    guest_temp_dir: Option<String>,
    failures: Arc<AtomicUsize>,
}

impl Orchestrator {
    pub fn new(transport: Arc<dyn Transport>, registry: Registry) -> Self {
        Self {
            transport,
            registry,
            options: RunOptions::default(),
            clone_options: CloneOptions::default(),
            launchers: Launchers::host_built(HostPlatform::detect()),
            guest_temp_dir: None,
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Build the local backend, the optional remote session, and the router
    /// between them from a loaded config.
    pub fn from_config(config: &Config, platform: HostPlatform) -> Result<Self, VmError> {
        let vmrun_path = match config.vmrun.path.as_str() {
            "" => platform.default_vmrun(),
            path => PathBuf::from(path),
        };
        let host_type = match config.vmrun.host_type.as_str() {
            "" => platform.vmrun_host_type(),
            other => other,
        };
        let local: Arc<dyn Transport> = Arc::new(VmrunTransport::new(
            vmrun_path,
            host_type,
            Credentials::from_config(&config.guest.username, &config.guest.password),
        ));

        let remote: Option<Arc<dyn Transport>> = if config.rest.enabled {
            let spawn = config.rest.spawn_server.then(|| ServerSpawn {
                program: match config.rest.server_path.as_str() {
                    "" => platform.default_vmrest(),
                    path => PathBuf::from(path),
                },
                start_timeout: Duration::from_secs(config.rest.start_timeout_s),
            });
            let rest: Arc<dyn Transport> = Arc::new(RestTransport::new(
                &config.rest.host,
                config.rest.port,
                Credentials::from_config(&config.rest.username, &config.rest.password),
                spawn,
            )?);
            Some(rest)
        } else {
            None
        };

        let table = match remote {
            Some(_) => RoutingTable::with_overrides(&config.routing)?,
            None => RoutingTable::uniform(Backend::Local),
        };
        tracing::debug!(remote = remote.is_some(), "transport router configured");
        let router = Router::new(table, local, remote);

        let mut orchestrator = Self::new(
            Arc::new(router),
            Registry::new(resolve_vm_dir(config, platform)?),
        );
        orchestrator.options = RunOptions::from_config(&config.run)?;
        orchestrator.clone_options = CloneOptions::from_config(&config.clone, platform);
        orchestrator.guest_temp_dir = config.run.guest_temp_dir.clone();
        orchestrator.launchers = Launchers::from_config(&config.launcher, platform);
        Ok(orchestrator)
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Use `launcher` for guests of the `os` family.
    pub fn with_launcher(mut self, os: GuestOs, launcher: impl Into<PathBuf>) -> Self {
        self.launchers = self.launchers.with(os, launcher);
        self
    }

    pub fn with_guest_temp_dir(mut self, dir: impl Into<String>) -> Self {
        self.guest_temp_dir = Some(dir.into());
        self
    }

    pub fn options_mut(&mut self) -> &mut RunOptions {
        &mut self.options
    }

    /// Cleanup steps that failed so far (each already logged as a warning).
    pub fn cleanup_failure_count(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn readiness(&self) -> Readiness {
        Readiness {
            num_tries: self.options.num_tries,
            sleep: self.options.sleep,
            interactive: self.options.interactive,
        }
    }

    // ── inventory ───────────────────────────────────────────

    pub async fn resolve(&self, identifier: &str) -> Result<GuestDescriptor, VmError> {
        self.registry
            .resolve(identifier, self.transport.as_ref())
            .await
    }

    pub async fn list_guests(&self) -> Result<Vec<GuestDescriptor>, VmError> {
        self.registry.list(self.transport.as_ref()).await
    }

    // ── power ───────────────────────────────────────────────

    pub async fn power_state(&self, identifier: &str) -> Result<PowerState, VmError> {
        let vm = self.resolve(identifier).await?;
        self.transport.power_state(&vm).await
    }

    /// Apply a power verb. With `wait`, waking verbs also wait for readiness.
    pub async fn set_power(
        &self,
        identifier: &str,
        verb: PowerVerb,
        wait: bool,
    ) -> Result<PowerState, VmError> {
        let vm = self.resolve(identifier).await?;
        let wait = wait.then(|| self.readiness());
        power::set_power(self.transport.as_ref(), &vm, verb, wait).await
    }

    pub async fn can_run_programs(&self, identifier: &str) -> Result<bool, VmError> {
        let vm = self.resolve(identifier).await?;
        Ok(power::can_run_programs(self.transport.as_ref(), &vm, self.options.interactive).await)
    }

    /// Returns the number of probe attempts used.
    pub async fn wait_until_ready(&self, identifier: &str) -> Result<u32, VmError> {
        let vm = self.resolve(identifier).await?;
        power::wait_until_ready(self.transport.as_ref(), &vm, self.readiness()).await
    }

    // ── execution ───────────────────────────────────────────

    /// Run a program in the guest (or in a throwaway clone of it).
    pub async fn run_program(
        &self,
        identifier: &str,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput, VmError> {
        let command = GuestCommand {
            program: program.to_string(),
            args: args.to_vec(),
            interactive: self.options.interactive,
        };
        let source = self.resolve(identifier).await?;
        let (output, _) = self
            .with_target(source, |vm| async move {
                self.transport.run_in_guest(&vm, &command).await
            })
            .await?;
        Ok(output)
    }

    /// Run `script` through the guest's configured interpreter.
    pub async fn run_script(&self, identifier: &str, script: &str) -> Result<CommandOutput, VmError> {
        let interactive = self.options.interactive;
        let source = self.resolve(identifier).await?;
        let (output, _) = self
            .with_target(source, |vm| async move {
                let command = GuestCommand {
                    program: vm.interpreter.clone(),
                    args: vm.guest_os.script_args(script),
                    interactive,
                };
                self.transport.run_in_guest(&vm, &command).await
            })
            .await?;
        Ok(output)
    }

    /// Ship a workload directory to the guest, run its entry command under
    /// the launcher, and bring the output back.
    pub async fn run_package(
        &self,
        identifier: &str,
        request: &PackageRequest,
    ) -> Result<ExecutionResult, VmError> {
        request.validate()?;
        let source = self.resolve(identifier).await?;
        let launcher = self.launchers.for_guest(&source)?;
        let (mut result, warnings) = self
            .with_target(source, |vm| async move {
                PackageExecutor {
                    transport: &self.transport,
                    launcher,
                    guest_temp_root: self.guest_temp_dir.as_deref(),
                    options: &self.options,
                    failures: &self.failures,
                }
                .run(&vm, request)
                .await
            })
            .await?;
        result.cleanup_warnings.extend(warnings);
        Ok(result)
    }

    /// Clone `source` when configured, make sure the target is ready, run
    /// `body`, then release the clone. Returns the clone's cleanup warnings.
    async fn with_target<T, F, Fut>(
        &self,
        source: GuestDescriptor,
        body: F,
    ) -> Result<(T, Vec<String>), VmError>
    where
        F: FnOnce(GuestDescriptor) -> Fut,
        Fut: Future<Output = Result<T, VmError>>,
    {
        let transport = self.transport.as_ref();

        if !self.options.clone {
            if self.options.ensure_ready {
                power::ensure_ready(transport, &source, self.readiness()).await?;
            }
            return Ok((body(source).await?, Vec::new()));
        }

        let (target, guard) = self.ephemeral_clone(&source).await?;
        let outcome = match power::ensure_ready(transport, &target, self.readiness()).await {
            Ok(_) => body(target).await,
            Err(e) => Err(e),
        };
        let warnings = self.release(guard).await;
        Ok((outcome?, warnings))
    }

    async fn ephemeral_clone(
        &self,
        source: &GuestDescriptor,
    ) -> Result<(GuestDescriptor, CleanupGuard), VmError> {
        let transport = self.transport.as_ref();
        let mut opts = self.clone_options.clone();
        opts.snapshot = clone::prepare_source(transport, source, &opts).await?;
        let plan = clone::plan_clone(source, &clone::now_stamp(), &opts, Path::exists)?;
        clone::create(&self.transport, &plan, &self.failures).await?;
        clone::resolve_created(&self.transport, &self.registry, &plan, &self.failures).await
    }

    async fn release(&self, guard: CleanupGuard) -> Vec<String> {
        if self.options.keeps_resources() {
            guard.disarm();
            Vec::new()
        } else {
            guard.run().await
        }
    }

    // ── files ───────────────────────────────────────────────

    pub async fn copy_to_guest(
        &self,
        identifier: &str,
        local: &Path,
        remote: &str,
    ) -> Result<(), VmError> {
        if !local.is_file() {
            return Err(VmError::InvalidArgument {
                message: format!("local file not found: \"{}\"", local.display()),
            });
        }
        let vm = self.resolve(identifier).await?;
        self.transport.copy_to_guest(&vm, local, remote).await
    }

    pub async fn copy_from_guest(
        &self,
        identifier: &str,
        remote: &str,
        local: &Path,
    ) -> Result<(), VmError> {
        let vm = self.resolve(identifier).await?;
        self.transport.copy_from_guest(&vm, remote, local).await
    }

    // ── queries ─────────────────────────────────────────────

    pub async fn ip_address(&self, identifier: &str) -> Result<String, VmError> {
        let vm = self.resolve(identifier).await?;
        self.transport.ip_address(&vm).await
    }

    pub async fn mac_address(&self, identifier: &str) -> Result<String, VmError> {
        let vm = self.resolve(identifier).await?;
        self.transport.mac_address(&vm).await
    }

    pub async fn vm_settings(&self, identifier: &str) -> Result<VmSettings, VmError> {
        let vm = self.resolve(identifier).await?;
        self.transport.settings(&vm).await
    }

    // ── persistent lifecycle ────────────────────────────────

    /// Create a clone that outlives the operation.
    pub async fn clone_vm(
        &self,
        identifier: &str,
        name: &str,
        where_dir: Option<&Path>,
    ) -> Result<GuestDescriptor, VmError> {
        let source = self.resolve(identifier).await?;
        let transport = self.transport.as_ref();
        let mut opts = self.clone_options.clone();
        let plan = clone::plan_named_clone(&source, name, where_dir, &opts)?;
        opts.snapshot = clone::prepare_source(transport, &source, &opts).await?;
        let plan = clone::CloneDescriptor {
            snapshot: opts.snapshot,
            ..plan
        };
        clone::create(&self.transport, &plan, &self.failures).await?;
        self.registry
            .resolve_by_path_remote(&plan.vmx_path, transport)
            .await
    }

    /// Delete a guest, optionally powering it off first.
    pub async fn delete_vm(&self, identifier: &str, shutdown: bool) -> Result<(), VmError> {
        let vm = self.resolve(identifier).await?;
        let transport = self.transport.as_ref();
        if shutdown && transport.power_state(&vm).await? != PowerState::Stopped {
            power::set_power(transport, &vm, PowerVerb::Stop, None).await?;
        }
        tracing::info!(vm = %vm.nickname, "deleting");
        transport.delete_guest(&vm).await?;
        let dir = vm.bundle_dir();
        if dir.exists() && dir != self.registry.vm_dir() {
            std::fs::remove_dir_all(dir).map_err(|source| VmError::Io {
                context: format!("removing {}", dir.display()),
                source,
            })?;
        }
        Ok(())
    }

    /// Close the remote session (and any server it spawned).
    pub async fn shutdown(&self) -> Result<(), VmError> {
        let failures = self.cleanup_failure_count();
        if failures > 0 {
            tracing::warn!(failures, "some resources could not be released");
        }
        self.transport.disconnect().await
    }
}
