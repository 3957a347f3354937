use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use vmdrive_launcher::{ENTRY_NOT_FOUND_EXIT_CODE, Invocation};

use crate::archive;
use crate::cleanup::CleanupGuard;
use crate::config::{LauncherConfig, RunOptions};
use crate::error::VmError;
use crate::paths;
use crate::platform::HostPlatform;
use crate::tail::{self, TailListener};
use crate::transport::{GuestCommand, Transport};
use crate::vmx::{GuestDescriptor, GuestOs};

/// How long the tail listener may keep reading after the guest call returns.
const TAIL_GRACE: Duration = Duration::from_secs(5);
const OUTPUT_LOG: &str = "output.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    pub workload_dir: PathBuf,
    pub entry_command: String,
    pub entry_args: Vec<String>,
    /// Host file that receives a copy of the captured output.
    pub output_log: Option<PathBuf>,
    /// Stream output live on this host port (0 = any free port).
    pub tail_port: Option<u16>,
}

impl PackageRequest {
    pub fn new(workload_dir: impl Into<PathBuf>, entry_command: impl Into<String>) -> Self {
        Self {
            workload_dir: workload_dir.into(),
            entry_command: entry_command.into(),
            entry_args: Vec::new(),
            output_log: None,
            tail_port: None,
        }
    }

    pub fn validate(&self) -> Result<(), VmError> {
        if !self.workload_dir.is_dir() {
            return Err(VmError::InvalidArgument {
                message: format!(
                    "workload directory not found or not a directory: \"{}\"",
                    self.workload_dir.display()
                ),
            });
        }
        if self.entry_command.is_empty() {
            return Err(VmError::InvalidArgument {
                message: "entry command must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Outcome of a package run. A non-zero exit code is a workload result, not a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    /// Merged stdout+stderr retrieved from the guest's output log.
    pub output: String,
    /// Lines received over the live-tail channel, when one was requested.
    pub streamed: Option<Vec<String>>,
    /// Resources that could not be released (already logged and counted).
    pub cleanup_warnings: Vec<String>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn guest_error(&self) -> Option<GuestError> {
        match self.exit_code {
            0 => None,
            ENTRY_NOT_FOUND_EXIT_CODE if self.output.contains("entry command not found") => {
                Some(GuestError::EntryNotFound {
                    detail: self
                        .output
                        .lines()
                        .find(|l| l.contains("entry command not found"))
                        .unwrap_or_default()
                        .to_string(),
                })
            }
            code => Some(GuestError::NonZeroExit { exit_code: code }),
        }
    }
}

/// Workload-level failure, reported as data on [`ExecutionResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestError {
    EntryNotFound { detail: String },
    NonZeroExit { exit_code: i32 },
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntryNotFound { detail } => f.write_str(detail),
            Self::NonZeroExit { exit_code } => write!(f, "entry command exited with {exit_code}"),
        }
    }
}

// ── launchers ───────────────────────────────────────────────

/// Launcher binaries keyed by guest OS family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Launchers {
    linux: Option<PathBuf>,
    windows: Option<PathBuf>,
    macos: Option<PathBuf>,
}

impl Launchers {
    /// The launcher built next to this executable, usable by guests of the
    /// host's own family only.
    pub fn host_built(platform: HostPlatform) -> Self {
        Self::default().with(platform.guest_family(), paths::default_launcher_path())
    }

    /// Configured paths on top of [`Launchers::host_built`].
    pub fn from_config(config: &LauncherConfig, platform: HostPlatform) -> Self {
        let configured = [
            (GuestOs::Linux, &config.linux),
            (GuestOs::Windows, &config.windows),
            (GuestOs::MacOs, &config.macos),
        ];
        configured
            .into_iter()
            .fold(Self::host_built(platform), |launchers, (os, path)| match path {
                Some(path) => launchers.with(os, path),
                None => launchers,
            })
    }

    pub fn with(mut self, os: GuestOs, path: impl Into<PathBuf>) -> Self {
        let path = Some(path.into());
        match os {
            GuestOs::Linux => self.linux = path,
            GuestOs::Windows => self.windows = path,
            GuestOs::MacOs => self.macos = path,
            GuestOs::Other => tracing::debug!("ignoring launcher for unknown guest family"),
        }
        self
    }

    /// The launcher that runs inside `vm`. Unrecognised guests are treated
    /// as Unix and get the Linux build.
    pub fn for_guest(&self, vm: &GuestDescriptor) -> Result<&Path, VmError> {
        let (key, path) = match vm.guest_os {
            GuestOs::Windows => ("windows", &self.windows),
            GuestOs::MacOs => ("macos", &self.macos),
            GuestOs::Linux | GuestOs::Other => ("linux", &self.linux),
        };
        match path {
            Some(path) if path.is_file() => Ok(path),
            Some(path) => Err(VmError::InvalidArgument {
                message: format!(
                    "launcher for {key} guests not found: \"{}\"",
                    path.display()
                ),
            }),
            None => Err(VmError::InvalidArgument {
                message: format!(
                    "no launcher for {key} guests such as {}; set [launcher] {key} in the config",
                    vm.nickname
                ),
            }),
        }
    }
}

/// Stages a workload and the launcher into a guest and runs it there.
pub struct PackageExecutor<'a> {
    pub transport: &'a Arc<dyn Transport>,
    pub launcher: &'a Path,
    pub guest_temp_root: Option<&'a str>,
    pub options: &'a RunOptions,
    pub failures: &'a Arc<AtomicUsize>,
}

/// Host and guest locations of the staged files.
struct Staging {
    archive: PathBuf,
    launcher: PathBuf,
    output_log: PathBuf,
    guest_dir: String,
    guest_archive: String,
    guest_launcher: String,
    guest_output_log: String,
}

impl PackageExecutor<'_> {
    /// Run `request` in `vm`, which must already be ready. The guest temp
    /// directory is removed on every exit path unless debug is set.
    pub async fn run(
        &self,
        vm: &GuestDescriptor,
        request: &PackageRequest,
    ) -> Result<ExecutionResult, VmError> {
        request.validate()?;

        let host_tmp = tempfile::Builder::new()
            .prefix("vmdrive-")
            .suffix("-run_package.dir")
            .tempdir()
            .map_err(|source| VmError::Io {
                context: "creating host temp dir".into(),
                source,
            })?;
        let staging = self.staging(vm, host_tmp.path());
        tracing::debug!(
            host_dir = %host_tmp.path().display(),
            guest_dir = %staging.guest_dir,
            "staging package"
        );

        archive::create(&request.workload_dir, &staging.archive, self.options.archive)?;
        std::fs::copy(self.launcher, &staging.launcher).map_err(|source| VmError::Io {
            context: format!("copying launcher {}", self.launcher.display()),
            source,
        })?;

        let guard = self.guest_dir_guard(vm, &staging.guest_dir);
        let outcome = self.stage_and_execute(vm, request, &staging).await;

        let mut cleanup_warnings = Vec::new();
        if self.options.debug {
            guard.disarm();
            let kept = host_tmp.keep();
            tracing::info!(host_dir = %kept.display(), guest_dir = %staging.guest_dir, "debug: keeping temp dirs");
        } else {
            cleanup_warnings = guard.run().await;
        }

        let (exit_code, output, streamed) = outcome?;
        if let Some(dest) = &request.output_log {
            std::fs::write(dest, &output).map_err(|source| VmError::Io {
                context: format!("writing {}", dest.display()),
                source,
            })?;
        }
        Ok(ExecutionResult {
            exit_code,
            output,
            streamed,
            cleanup_warnings,
        })
    }

    fn staging(&self, vm: &GuestDescriptor, host_dir: &Path) -> Staging {
        let os = vm.guest_os;
        let root = self
            .guest_temp_root
            .unwrap_or_else(|| os.default_temp_root());
        let basename = host_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vmdrive-run_package.dir".into());
        let guest_dir = os.join(root, &basename);
        let archive_name = self.options.archive.file_name();
        let launcher_name = if os.is_windows() { "launcher.exe" } else { "launcher" };

        Staging {
            archive: host_dir.join(archive_name),
            launcher: host_dir.join(launcher_name),
            output_log: host_dir.join(OUTPUT_LOG),
            guest_archive: os.join(&guest_dir, archive_name),
            guest_launcher: os.join(&guest_dir, launcher_name),
            guest_output_log: os.join(&guest_dir, OUTPUT_LOG),
            guest_dir,
        }
    }

    fn guest_dir_guard(&self, vm: &GuestDescriptor, guest_dir: &str) -> CleanupGuard {
        let transport = self.transport.clone();
        let vm = vm.clone();
        let dir = guest_dir.to_string();
        let interactive = self.options.interactive;
        CleanupGuard::new(
            format!("guest temp dir {guest_dir}"),
            self.failures.clone(),
            move || async move {
                let rm = remove_dir_command(&vm, &dir, interactive);
                match transport.run_in_guest(&vm, &rm).await {
                    Ok(out) if out.exit_code == 0 => Vec::new(),
                    Ok(out) => vec![format!("removing {dir} exited with {}", out.exit_code)],
                    Err(e) => vec![format!("removing {dir}: {e}")],
                }
            },
        )
    }

    async fn stage_and_execute(
        &self,
        vm: &GuestDescriptor,
        request: &PackageRequest,
        staging: &Staging,
    ) -> Result<(i32, String, Option<Vec<String>>), VmError> {
        let transport = self.transport.as_ref();
        let interactive = self.options.interactive;

        // Clear leftovers from an earlier run with the same name.
        let rm = remove_dir_command(vm, &staging.guest_dir, interactive);
        transport.run_in_guest(vm, &rm).await?;
        self.guest_checked(vm, make_dir_command(vm, &staging.guest_dir, interactive), "mkdir")
            .await?;

        transport
            .copy_to_guest(vm, &staging.archive, &staging.guest_archive)
            .await?;
        transport
            .copy_to_guest(vm, &staging.launcher, &staging.guest_launcher)
            .await?;
        if !vm.guest_os.is_windows() {
            let chmod = GuestCommand {
                program: "/bin/chmod".into(),
                args: vec!["755".into(), staging.guest_launcher.clone()],
                interactive,
            };
            self.guest_checked(vm, chmod, "chmod").await?;
        }

        let cancel = CancellationToken::new();
        let _stop_tail = cancel.clone().drop_guard();
        let (tail, callback_host) = match request.tail_port {
            Some(port) => {
                // The launcher falls back to loopback when given no host.
                let host = self.callback_host(vm).await;
                let bind = host.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
                let listener = TailListener::start(bind, port, cancel.child_token()).await?;
                (Some(listener), host)
            }
            None => (None, None),
        };

        let mut invocation = Invocation::new(
            &staging.guest_archive,
            &request.entry_command,
            &staging.guest_output_log,
        );
        invocation.debug = self.options.debug;
        invocation.tty = self.options.tty.clone();
        invocation.entry_args = request.entry_args.clone();
        if let Some(listener) = &tail {
            invocation.tail_log_port = Some(listener.address().port());
            invocation.tail_log_host = callback_host.map(|host| host.to_string());
        }

        let command = GuestCommand {
            program: staging.guest_launcher.clone(),
            args: invocation.to_args(),
            interactive,
        };
        tracing::info!(
            vm = %vm.nickname,
            entry = %request.entry_command,
            args = ?request.entry_args,
            "running package"
        );

        let call = transport.run_in_guest(vm, &command);
        let exec = match self.options.exec_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    if let Some(listener) = tail {
                        listener.join(Duration::ZERO).await;
                    }
                    return Err(VmError::ExecutionTimeout {
                        seconds: limit.as_secs(),
                    });
                }
            },
            None => call.await,
        };
        let exec = exec?;

        transport
            .copy_from_guest(vm, &staging.guest_output_log, &staging.output_log)
            .await?;
        let output = std::fs::read(&staging.output_log)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .map_err(|source| VmError::Io {
                context: format!("reading {}", staging.output_log.display()),
                source,
            })?;

        let streamed = match tail {
            Some(listener) => Some(listener.join(TAIL_GRACE).await),
            None => None,
        };

        tracing::info!(vm = %vm.nickname, exit_code = exec.exit_code, "package finished");
        Ok((exec.exit_code, output, streamed))
    }

    async fn guest_checked(
        &self,
        vm: &GuestDescriptor,
        command: GuestCommand,
        what: &str,
    ) -> Result<(), VmError> {
        let out = self.transport.run_in_guest(vm, &command).await?;
        if out.exit_code != 0 {
            return Err(VmError::Transport {
                backend: self.transport.name(),
                operation: what.to_string(),
                message: format!("{} exited with {}", command.program, out.exit_code),
                detail: out.stdout,
            });
        }
        Ok(())
    }

    /// Host address facing the guest, where the tail listener binds and the
    /// launcher connects back to.
    async fn callback_host(&self, vm: &GuestDescriptor) -> Option<IpAddr> {
        let guest_ip = match self.transport.ip_address(vm).await {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!(vm = %vm.nickname, error = %e, "no guest IP, tail may not connect");
                return None;
            }
        };
        let guest_ip: IpAddr = match guest_ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                tracing::warn!(vm = %vm.nickname, %guest_ip, "unparseable guest IP");
                return None;
            }
        };
        match tail::host_address_toward(guest_ip).await {
            Ok(host) => Some(host),
            Err(e) => {
                tracing::warn!(error = %e, "no route to guest for tail");
                None
            }
        }
    }
}

fn remove_dir_command(vm: &GuestDescriptor, dir: &str, interactive: bool) -> GuestCommand {
    if vm.guest_os.is_windows() {
        GuestCommand {
            program: "cmd.exe".into(),
            args: vec!["/c".into(), format!("if exist \"{dir}\" rmdir /s /q \"{dir}\"")],
            interactive,
        }
    } else {
        GuestCommand {
            program: "/bin/rm".into(),
            args: vec!["-rf".into(), dir.to_string()],
            interactive,
        }
    }
}

fn make_dir_command(vm: &GuestDescriptor, dir: &str, interactive: bool) -> GuestCommand {
    if vm.guest_os.is_windows() {
        GuestCommand {
            program: "cmd.exe".into(),
            args: vec!["/c".into(), format!("mkdir \"{dir}\"")],
            interactive,
        }
    } else {
        GuestCommand {
            program: "/bin/mkdir".into(),
            args: vec!["-p".into(), dir.to_string()],
            interactive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmx::parse_key_values;

    fn result(exit_code: i32, output: &str) -> ExecutionResult {
        ExecutionResult {
            exit_code,
            output: output.into(),
            streamed: None,
            cleanup_warnings: Vec::new(),
        }
    }

    #[test]
    fn guest_errors_are_classified() {
        assert_eq!(result(0, "hello\n").guest_error(), None);
        assert_eq!(
            result(2, "boom\n").guest_error(),
            Some(GuestError::NonZeroExit { exit_code: 2 })
        );
        let missing = result(127, "entry command not found: \"/tmp/x/work/nope.sh\"\n");
        match missing.guest_error() {
            Some(GuestError::EntryNotFound { detail }) => assert!(detail.contains("nope.sh")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_workload_dir_is_invalid_argument() {
        let req = PackageRequest::new("/nonexistent/workload", "run.sh");
        assert!(matches!(
            req.validate(),
            Err(VmError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn guest_dir_commands_follow_guest_os() {
        let linux = crate::vmx::GuestDescriptor::from_values(
            Path::new("l.vmx"),
            &parse_key_values("guestOS = \"ubuntu-64\"\n"),
        );
        let rm = remove_dir_command(&linux, "/tmp/x", false);
        assert_eq!(rm.program, "/bin/rm");
        assert_eq!(rm.args, vec!["-rf", "/tmp/x"]);

        let windows = crate::vmx::GuestDescriptor::from_values(
            Path::new("w.vmx"),
            &parse_key_values("guestOS = \"windows9-64\"\n"),
        );
        let mk = make_dir_command(&windows, r"C:\Windows\Temp\x", true);
        assert_eq!(mk.program, "cmd.exe");
        assert!(mk.interactive);
    }

    fn guest(os_id: &str) -> GuestDescriptor {
        GuestDescriptor::from_values(
            Path::new("/vms/g/g.vmx"),
            &parse_key_values(&format!("guestOS = \"{os_id}\"\n")),
        )
    }

    #[test]
    fn launcher_is_picked_by_guest_family() {
        let dir = tempfile::tempdir().unwrap();
        let linux = dir.path().join("launcher-linux");
        let windows = dir.path().join("launcher-windows.exe");
        std::fs::write(&linux, b"elf").unwrap();
        std::fs::write(&windows, b"pe").unwrap();

        let launchers = Launchers::default()
            .with(GuestOs::Linux, &linux)
            .with(GuestOs::Windows, &windows);
        assert_eq!(launchers.for_guest(&guest("ubuntu-64")).unwrap(), linux);
        assert_eq!(launchers.for_guest(&guest("windows9-64")).unwrap(), windows);
        assert_eq!(launchers.for_guest(&guest("other-64")).unwrap(), linux);

        let err = launchers.for_guest(&guest("darwin19-64")).unwrap_err();
        assert!(matches!(err, VmError::InvalidArgument { ref message } if message.contains("macos")));
    }

    #[test]
    fn missing_launcher_file_is_invalid_argument() {
        let launchers = Launchers::default().with(GuestOs::Linux, "/nonexistent/launcher");
        assert!(matches!(
            launchers.for_guest(&guest("ubuntu-64")),
            Err(VmError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn host_built_launcher_only_serves_host_family() {
        let launchers = Launchers::host_built(HostPlatform::Linux);
        let err = launchers.for_guest(&guest("windows9-64")).unwrap_err();
        assert!(matches!(err, VmError::InvalidArgument { .. }));

        let config = LauncherConfig {
            windows: Some("/srv/launchers/win.exe".into()),
            ..LauncherConfig::default()
        };
        let configured = Launchers::from_config(&config, HostPlatform::Linux);
        assert_eq!(
            configured,
            Launchers::host_built(HostPlatform::Linux)
                .with(GuestOs::Windows, "/srv/launchers/win.exe")
        );
    }
}
