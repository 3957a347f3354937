use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::error::VmError;
use crate::power::{PowerState, PowerVerb};
use crate::transport::{
    CloneRequest, CommandOutput, GuestCommand, GuestListing, Transport, VmSettings,
};
use crate::vmx::{self, GuestDescriptor};

const BACKEND: &str = "vmrun";
const GUEST_EXIT_MARKER: &str = "Guest program exited with non-zero exit code:";

/// Drives the hypervisor's local automation CLI, one subprocess per call.
pub struct VmrunTransport {
    program: PathBuf,
    host_type: String,
    guest: Option<Credentials>,
}

struct RawOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl VmrunTransport {
    pub fn new(
        program: impl Into<PathBuf>,
        host_type: impl Into<String>,
        guest: Option<Credentials>,
    ) -> Self {
        Self {
            program: program.into(),
            host_type: host_type.into(),
            guest,
        }
    }

    /// Full argument vector for one verb: host type, guest login, then the verb's own args.
    fn args_for(&self, verb: &str, rest: &[String]) -> Vec<String> {
        let mut args = vec!["-T".to_string(), self.host_type.clone()];
        if let Some(creds) = &self.guest {
            args.extend([
                "-gu".to_string(),
                creds.username().to_string(),
                "-gp".to_string(),
                creds.password().to_string(),
            ]);
        }
        args.push(verb.to_string());
        args.extend(rest.iter().cloned());
        args
    }

    async fn invoke(&self, verb: &str, rest: &[String]) -> Result<RawOutput, VmError> {
        let args = self.args_for(verb, rest);
        tracing::debug!(program = %self.program.display(), args = ?redact(&args), "vmrun");

        // Callers time out by dropping this future; the CLI must not outlive it.
        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| VmError::Io {
                context: format!("running {}", self.program.display()),
                source,
            })?;

        Ok(RawOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Invoke and treat any non-zero exit as a transport failure.
    async fn checked(&self, verb: &str, rest: &[String]) -> Result<String, VmError> {
        let out = self.invoke(verb, rest).await?;
        if out.success {
            return Ok(out.stdout);
        }
        Err(failure(verb, &out))
    }
}

fn failure(verb: &str, out: &RawOutput) -> VmError {
    let first_line = out
        .stdout
        .lines()
        .chain(out.stderr.lines())
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output")
        .trim()
        .to_string();
    VmError::Transport {
        backend: BACKEND,
        operation: verb.to_string(),
        message: match out.code {
            Some(code) => format!("exit code {code}: {first_line}"),
            None => format!("killed by signal: {first_line}"),
        },
        detail: format!("{}{}", out.stdout, out.stderr),
    }
}

/// Replace the value following `-gp` so argument vectors can be logged.
pub fn redact(args: &[String]) -> Vec<String> {
    let mut redacted = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            redacted.push("****".to_string());
            hide_next = false;
        } else {
            hide_next = arg == "-gp";
            redacted.push(arg.clone());
        }
    }
    redacted
}

/// Recover the guest exit code from vmrun's failure report.
pub fn parse_guest_exit_code(output: &str) -> Option<i32> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once(GUEST_EXIT_MARKER)?;
        rest.trim().parse().ok()
    })
}

/// Paths from `vmrun list` (first line is the "Total running VMs" header).
pub fn parse_list(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("Total running VMs"))
        .map(PathBuf::from)
        .collect()
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl Transport for VmrunTransport {
    fn name(&self) -> &'static str {
        BACKEND
    }

    /// vmrun only knows which VMs are running.
    async fn power_state(&self, vm: &GuestDescriptor) -> Result<PowerState, VmError> {
        let running = parse_list(&self.checked("list", &[]).await?);
        Ok(if running.iter().any(|p| p == &vm.path) {
            PowerState::Running
        } else {
            PowerState::Stopped
        })
    }

    async fn set_power(&self, vm: &GuestDescriptor, verb: PowerVerb) -> Result<(), VmError> {
        let vmx = path_arg(&vm.path);
        let (name, args) = match verb {
            PowerVerb::Start => ("start", vec![vmx, "nogui".into()]),
            PowerVerb::Stop => ("stop", vec![vmx, "hard".into()]),
            PowerVerb::Shutdown => ("stop", vec![vmx, "soft".into()]),
            PowerVerb::Suspend => ("suspend", vec![vmx]),
            PowerVerb::Pause => ("pause", vec![vmx]),
            PowerVerb::Unpause => ("unpause", vec![vmx]),
        };
        self.checked(name, &args).await.map(drop)
    }

    async fn run_in_guest(
        &self,
        vm: &GuestDescriptor,
        command: &GuestCommand,
    ) -> Result<CommandOutput, VmError> {
        let mut args = vec![path_arg(&vm.path)];
        if command.interactive {
            args.push("-interactive".into());
        }
        args.push(command.program.clone());
        args.extend(command.args.iter().cloned());

        let out = self.invoke("runProgramInGuest", &args).await?;
        if out.success {
            return Ok(CommandOutput {
                exit_code: 0,
                stdout: out.stdout,
            });
        }
        match parse_guest_exit_code(&out.stdout).or_else(|| parse_guest_exit_code(&out.stderr)) {
            Some(exit_code) => Ok(CommandOutput {
                exit_code,
                stdout: out.stdout,
            }),
            None => Err(failure("runProgramInGuest", &out)),
        }
    }

    async fn copy_to_guest(
        &self,
        vm: &GuestDescriptor,
        local: &Path,
        remote: &str,
    ) -> Result<(), VmError> {
        let args = [path_arg(&vm.path), path_arg(local), remote.to_string()];
        self.checked("CopyFileFromHostToGuest", &args).await.map(drop)
    }

    async fn copy_from_guest(
        &self,
        vm: &GuestDescriptor,
        remote: &str,
        local: &Path,
    ) -> Result<(), VmError> {
        let args = [path_arg(&vm.path), remote.to_string(), path_arg(local)];
        self.checked("CopyFileFromGuestToHost", &args).await.map(drop)
    }

    async fn ip_address(&self, vm: &GuestDescriptor) -> Result<String, VmError> {
        let out = self
            .checked("getGuestIPAddress", &[path_arg(&vm.path)])
            .await?;
        Ok(out.trim().to_string())
    }

    /// vmrun has no MAC query; read it from the descriptor file.
    async fn mac_address(&self, vm: &GuestDescriptor) -> Result<String, VmError> {
        let fresh = GuestDescriptor::load(&vm.path)?;
        fresh.mac_address.ok_or_else(|| VmError::Transport {
            backend: BACKEND,
            operation: "mac_address".into(),
            message: format!("no ethernet0 address in {}", vm.path.display()),
            detail: String::new(),
        })
    }

    async fn list_guests(&self) -> Result<Vec<GuestListing>, VmError> {
        let out = self.checked("list", &[]).await?;
        Ok(parse_list(&out)
            .into_iter()
            .map(|path| GuestListing { id: None, path })
            .collect())
    }

    async fn clone_guest(
        &self,
        source: &GuestDescriptor,
        request: &CloneRequest,
    ) -> Result<(), VmError> {
        let mut args = vec![
            path_arg(&source.path),
            path_arg(&request.destination),
            if request.full { "full" } else { "linked" }.to_string(),
        ];
        if let Some(snapshot) = &request.snapshot {
            args.push(format!("-snapshot={snapshot}"));
        }
        args.push(format!("-cloneName={}", request.name));
        self.checked("clone", &args).await.map(drop)
    }

    async fn delete_guest(&self, vm: &GuestDescriptor) -> Result<(), VmError> {
        self.checked("deleteVM", &[path_arg(&vm.path)]).await.map(drop)
    }

    async fn snapshot(&self, vm: &GuestDescriptor, name: &str) -> Result<(), VmError> {
        self.checked("snapshot", &[path_arg(&vm.path), name.to_string()])
            .await
            .map(drop)
    }

    /// Read from the descriptor file.
    async fn settings(&self, vm: &GuestDescriptor) -> Result<VmSettings, VmError> {
        let values = vmx::read_key_values(&vm.path)?;
        Ok(VmSettings {
            cpus: values
                .get("numvcpus")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            memory_mb: values
                .get("memsize")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_include_host_type_and_guest_login() {
        let t = VmrunTransport::new(
            "/usr/bin/vmrun",
            "ws",
            Some(Credentials::new("builder", "secret")),
        );
        let args = t.args_for("list", &[]);
        assert_eq!(
            args,
            vec!["-T", "ws", "-gu", "builder", "-gp", "secret", "list"]
        );
        let shown = redact(&args);
        assert!(!shown.contains(&"secret".to_string()));
        assert_eq!(shown[5], "****");
    }

    #[test]
    fn args_without_login() {
        let t = VmrunTransport::new("vmrun", "fusion", None);
        assert_eq!(
            t.args_for("start", &["/vms/a.vmx".into(), "nogui".into()]),
            vec!["-T", "fusion", "start", "/vms/a.vmx", "nogui"]
        );
    }

    #[test]
    fn guest_exit_code_recovered() {
        let out = "Error: The operation failed\nGuest program exited with non-zero exit code: 42\n";
        assert_eq!(parse_guest_exit_code(out), Some(42));
        assert_eq!(parse_guest_exit_code("Error: VM is not running"), None);
    }

    #[test]
    fn list_skips_header() {
        let out = "Total running VMs: 2\n/vms/a/a.vmx\n/vms/b/b.vmx\n";
        assert_eq!(
            parse_list(out),
            vec![PathBuf::from("/vms/a/a.vmx"), PathBuf::from("/vms/b/b.vmx")]
        );
        assert!(parse_list("Total running VMs: 0\n").is_empty());
    }

    #[test]
    fn failure_carries_raw_output() {
        let err = failure(
            "deleteVM",
            &RawOutput {
                success: false,
                code: Some(255),
                stdout: "Error: Cannot open VM\n".into(),
                stderr: String::new(),
            },
        );
        match err {
            VmError::Transport {
                message, detail, ..
            } => {
                assert_eq!(message, "exit code 255: Error: Cannot open VM");
                assert!(detail.contains("Cannot open VM"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abandoned_call_stops_the_cli() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = dir.path().join("vmrun");
        std::fs::write(
            &script,
            format!("#!/bin/sh\nsleep 1\ntouch '{}'\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let t = VmrunTransport::new(script.clone(), "ws", None);
        let vm = GuestDescriptor::from_values(Path::new("/vms/a/a.vmx"), &Default::default());
        let cmd = GuestCommand::new("/bin/true", Vec::new());
        let call = t.run_in_guest(&vm, &cmd);
        let timed = tokio::time::timeout(std::time::Duration::from_millis(100), call).await;
        assert!(timed.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
