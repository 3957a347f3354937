use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::{DebugLog, LauncherError, TAIL_SENTINEL};

const TAIL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound live-tail connection to the host. Best effort: the first write
/// error drops the connection and the launcher carries on.
pub struct TailSink {
    stream: Option<TcpStream>,
}

impl TailSink {
    pub async fn connect(host: &str, port: u16, debug: &DebugLog) -> Self {
        let attempt = tokio::time::timeout(TAIL_CONNECT_TIMEOUT, TcpStream::connect((host, port)));
        let stream = match attempt.await {
            Ok(Ok(stream)) => {
                debug.log(format_args!("tail connected to {host}:{port}"));
                Some(stream)
            }
            Ok(Err(e)) => {
                debug.log(format_args!("tail connect to {host}:{port} failed: {e}"));
                None
            }
            Err(_) => {
                debug.log(format_args!("tail connect to {host}:{port} timed out"));
                None
            }
        };
        Self { stream }
    }

    pub fn disconnected() -> Self {
        Self { stream: None }
    }

    async fn send(&mut self, line: &[u8]) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut result = stream.write_all(line).await;
        if result.is_ok() && !line.ends_with(b"\n") {
            result = stream.write_all(b"\n").await;
        }
        if result.is_err() {
            self.stream = None;
        }
    }

    async fn finish(mut self) {
        self.send(format!("{TAIL_SENTINEL}\n").as_bytes()).await;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// Run `entry` with `args` from `work_dir`, appending its merged stdout and
/// stderr to `output_log` as lines arrive. Returns the child's exit code.
pub async fn execute(
    entry: &Path,
    args: &[String],
    work_dir: &Path,
    output_log: &Path,
    mut tail: TailSink,
    debug: &DebugLog,
) -> Result<i32, LauncherError> {
    debug.log(format_args!(
        "exec {} {:?} cwd={}",
        entry.display(),
        args,
        work_dir.display()
    ));

    let mut child = Command::new(entry)
        .args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| LauncherError::Io {
            context: format!("spawning {}", entry.display()),
            source,
        })?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(LauncherError::Io {
            context: "capturing child output".into(),
            source: std::io::Error::other("stdout/stderr pipes missing"),
        });
    };
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);

    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output_log)
        .await
        .map_err(|source| LauncherError::Io {
            context: format!("opening {}", output_log.display()),
            source,
        })?;

    let write_err = |source| LauncherError::Io {
        context: format!("writing {}", output_log.display()),
        source,
    };
    let read_err = |source| LauncherError::Io {
        context: "reading child output".into(),
        source,
    };

    let mut out_line = Vec::new();
    let mut err_line = Vec::new();
    let mut out_open = true;
    let mut err_open = true;

    // read_until keeps partial data in the buffer when the other branch wins,
    // so the buffers must outlive each select round.
    while out_open || err_open {
        tokio::select! {
            n = stdout.read_until(b'\n', &mut out_line), if out_open => {
                if n.map_err(read_err)? == 0 {
                    out_open = false;
                } else {
                    log.write_all(&out_line).await.map_err(write_err)?;
                    tail.send(&out_line).await;
                    out_line.clear();
                }
            }
            n = stderr.read_until(b'\n', &mut err_line), if err_open => {
                if n.map_err(read_err)? == 0 {
                    err_open = false;
                } else {
                    log.write_all(&err_line).await.map_err(write_err)?;
                    tail.send(&err_line).await;
                    err_line.clear();
                }
            }
        }
    }
    log.flush().await.map_err(write_err)?;

    let status = child.wait().await.map_err(|source| LauncherError::Io {
        context: format!("waiting for {}", entry.display()),
        source,
    })?;
    tail.finish().await;

    let code = exit_code(status);
    debug.log(format_args!("exit code {code}"));
    Ok(code)
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
