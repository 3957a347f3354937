use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type SharedFile = Arc<Mutex<Option<File>>>;

// ── log file layer ──────────────────────────────────────────

/// `MakeWriter` for the file layer. Discards everything until the paired
/// [`LogFileHandle`] opens a file, so the subscriber can be installed before
/// the config (which names the file) is loaded.
#[derive(Clone)]
pub struct LogFileWriter {
    file: SharedFile,
}

#[derive(Clone)]
pub struct LogFileHandle {
    file: SharedFile,
}

pub fn log_file() -> (LogFileWriter, LogFileHandle) {
    let file: SharedFile = Arc::new(Mutex::new(None));
    (
        LogFileWriter { file: file.clone() },
        LogFileHandle { file },
    )
}

impl LogFileHandle {
    /// Start appending to `path`, creating parent directories as needed.
    pub fn open(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if let Ok(mut slot) = self.file.lock() {
            *slot = Some(file);
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }
}

pub struct LogFileGuard {
    file: SharedFile,
}

impl Write for LogFileGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock() {
            Ok(mut slot) => match slot.as_mut() {
                Some(f) => f.write(buf),
                None => Ok(buf.len()),
            },
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock() {
            Ok(mut slot) => slot.as_mut().map_or(Ok(()), |f| f.flush()),
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogFileWriter {
    type Writer = LogFileGuard;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileGuard {
            file: self.file.clone(),
        }
    }
}

// ── subscriber ──────────────────────────────────────────────

/// Install the global subscriber: stderr at `vmdrive=info` (debug with
/// `verbose`, `RUST_LOG` wins when set) plus the deferred file layer at
/// `vmdrive=debug`.
pub fn init(verbose: bool) -> LogFileHandle {
    let default_level = if verbose { "debug" } else { "info" };
    let stderr_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "vmdrive={default_level},vmdrive_launcher={default_level}"
        ))
    });
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(verbose)
        .with_filter(stderr_filter);

    let (writer, handle) = log_file();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(EnvFilter::new("vmdrive=debug,vmdrive_launcher=debug"));

    // A second init (tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    handle
}
