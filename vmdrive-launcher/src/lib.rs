//! In-guest launcher for vmdrive workloads.
//!
//! The host copies a workload archive and this launcher into a guest temp
//! directory, then runs the launcher through the hypervisor's guest-exec
//! facility. The launcher unpacks the archive next to itself, runs the entry
//! command from the unpacked root, appends merged stdout+stderr to the output
//! log, optionally streams each line to a host tail port, and exits with the
//! entry command's exit code.

pub mod exec;
pub mod invocation;
pub mod unpack;

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use invocation::Invocation;
pub use unpack::ArchiveKind;

/// Line the launcher sends after the last output line on the tail connection.
pub const TAIL_SENTINEL: &str = "byebye";

/// Exit code reported when the entry command does not exist in the workload.
pub const ENTRY_NOT_FOUND_EXIT_CODE: i32 = 127;

/// Exit code reported when the launcher itself fails (bad archive, I/O).
pub const LAUNCHER_FAILURE_EXIT_CODE: i32 = 125;

/// Name of the directory, next to the archive, that receives the unpacked workload.
pub const WORK_DIR_NAME: &str = "work";

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown archive type: \"{path}\"")]
    UnknownArchive { path: String },

    #[error("zip archive error")]
    Zip(#[from] zip::result::ZipError),
}

/// Debug diagnostics written straight to a console device, bypassing the
/// captured output so they never end up in the workload log.
pub struct DebugLog {
    device: Option<PathBuf>,
}

impl DebugLog {
    pub fn new(enabled: bool, tty: Option<&str>) -> Self {
        let device = enabled.then(|| {
            tty.map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default_console_device()))
        });
        Self { device }
    }

    pub fn log(&self, message: fmt::Arguments<'_>) {
        let Some(device) = &self.device else {
            return;
        };
        if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(device) {
            let _ = writeln!(f, "vmdrive-launcher: {message}");
        }
    }
}

fn default_console_device() -> &'static str {
    if cfg!(windows) {
        "con:"
    } else if cfg!(target_os = "macos") {
        "/dev/ttys000"
    } else {
        "/dev/console"
    }
}

/// Directory the archive is unpacked into.
pub fn work_dir_for(archive: &Path) -> PathBuf {
    archive
        .parent()
        .unwrap_or(Path::new("."))
        .join(WORK_DIR_NAME)
}

/// Unpack and run. Workload failures (including a missing entry command)
/// come back as `Ok(exit_code)`; only launcher faults are errors.
pub async fn run(invocation: &Invocation) -> Result<i32, LauncherError> {
    // Truncate first so a log exists even if unpacking fails.
    std::fs::write(&invocation.output_log, b"").map_err(|source| LauncherError::Io {
        context: format!("creating {}", invocation.output_log.display()),
        source,
    })?;

    let debug = DebugLog::new(invocation.debug, invocation.tty.as_deref());
    debug.log(format_args!("{invocation:?}"));

    let work_dir = work_dir_for(&invocation.archive);
    let kind = unpack::unpack(&invocation.archive, &work_dir)?;
    debug.log(format_args!(
        "unpacked {kind:?} archive into {}",
        work_dir.display()
    ));

    let entry = work_dir.join(&invocation.entry_command);
    if !entry.is_file() {
        let message = format!("entry command not found: \"{}\"\n", entry.display());
        append_to_log(&invocation.output_log, &message)?;
        debug.log(format_args!("{}", message.trim_end()));
        return Ok(ENTRY_NOT_FOUND_EXIT_CODE);
    }
    make_executable(&entry)?;

    let tail = match invocation.tail_log_port {
        Some(port) => {
            let host = invocation.tail_log_host.as_deref().unwrap_or("127.0.0.1");
            exec::TailSink::connect(host, port, &debug).await
        }
        None => exec::TailSink::disconnected(),
    };

    exec::execute(
        &entry,
        &invocation.entry_args,
        &work_dir,
        &invocation.output_log,
        tail,
        &debug,
    )
    .await
}

/// Run and fold launcher faults into an exit code, recording the fault in
/// the output log so the host sees why. This is what the binary does.
pub async fn launch(invocation: &Invocation) -> i32 {
    match run(invocation).await {
        Ok(code) => code,
        Err(e) => {
            let mut message = format!("vmdrive-launcher: {e}");
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                message.push_str(&format!(": {cause}"));
                source = cause.source();
            }
            eprintln!("{message}");
            let _ = append_to_log(&invocation.output_log, &format!("{message}\n"));
            LAUNCHER_FAILURE_EXIT_CODE
        }
    }
}

fn append_to_log(path: &Path, text: &str) -> Result<(), LauncherError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(text.as_bytes()))
        .map_err(|source| LauncherError::Io {
            context: format!("writing {}", path.display()),
            source,
        })
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), LauncherError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|source| {
        LauncherError::Io {
            context: format!("chmod {}", path.display()),
            source,
        }
    })
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), LauncherError> {
    Ok(())
}
