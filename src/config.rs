use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::archive::ArchiveFormat;
use crate::error::VmError;
use crate::platform::HostPlatform;
use crate::transport::RoutingTable;
use crate::vmx;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    /// Directory scanned for `.vmx` files. Empty means "ask the hypervisor's preferences".
    #[facet(default)]
    pub vm_dir: String,
    #[facet(default)]
    pub vmrun: VmrunConfig,
    #[facet(default)]
    pub rest: RestConfig,
    #[facet(default)]
    pub guest: GuestConfig,
    #[facet(default)]
    pub run: RunConfig,
    #[facet(default)]
    pub clone: CloneConfig,
    #[facet(default)]
    pub launcher: LauncherConfig,
    /// Capability name → "local" | "remote".
    #[facet(default)]
    pub routing: BTreeMap<String, String>,
    #[facet(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct VmrunConfig {
    #[facet(default)]
    pub path: String,
    #[facet(default)]
    pub host_type: String,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct RestConfig {
    #[facet(default)]
    pub enabled: bool,
    #[facet(default = "127.0.0.1")]
    pub host: String,
    #[facet(default = 8697)]
    pub port: u16,
    #[facet(default)]
    pub username: String,
    #[facet(default)]
    pub password: String,
    /// Spawn the REST server on session start instead of expecting one.
    #[facet(default)]
    pub spawn_server: bool,
    #[facet(default)]
    pub server_path: String,
    #[facet(default = 10)]
    pub start_timeout_s: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 8697,
            username: String::new(),
            password: String::new(),
            spawn_server: false,
            server_path: String::new(),
            start_timeout_s: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct GuestConfig {
    #[facet(default)]
    pub username: String,
    #[facet(default)]
    pub password: String,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct RunConfig {
    #[facet(default = 20)]
    pub num_tries: u32,
    #[facet(default = 5)]
    pub sleep_s: u64,
    pub exec_timeout_s: Option<u64>,
    #[facet(default)]
    pub interactive: bool,
    #[facet(default)]
    pub debug: bool,
    pub tty: Option<String>,
    #[facet(default)]
    pub clone: bool,
    #[facet(default)]
    pub keep_clone: bool,
    #[facet(default = true)]
    pub ensure_ready: bool,
    #[facet(default = "tar")]
    pub archive: String,
    pub guest_temp_dir: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_tries: 20,
            sleep_s: 5,
            exec_timeout_s: None,
            interactive: false,
            debug: false,
            tty: None,
            clone: false,
            keep_clone: false,
            ensure_ready: true,
            archive: "tar".into(),
            guest_temp_dir: None,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct CloneConfig {
    #[facet(default)]
    pub full: bool,
    #[facet(default = true)]
    pub stop_source: bool,
    pub snapshot: Option<String>,
    #[facet(default)]
    pub fresh_snapshot: bool,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            full: false,
            stop_source: true,
            snapshot: None,
            fresh_snapshot: false,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
/// Launcher binary per guest OS family. The launcher runs inside the guest,
/// so each family needs a build for its own target. Without an entry, only
/// guests of the host's own family can run packages.
pub struct LauncherConfig {
    pub linux: Option<String>,
    pub windows: Option<String>,
    pub macos: Option<String>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct LoggingConfig {
    pub file: Option<String>,
}

// ── RunOptions ──────────────────────────────────────────────

/// Per-operation knobs, seeded from `[run]` and overridden by CLI flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub num_tries: u32,
    pub sleep: Duration,
    pub exec_timeout: Option<Duration>,
    pub interactive: bool,
    pub debug: bool,
    pub tty: Option<String>,
    pub clone: bool,
    pub keep_clone: bool,
    pub ensure_ready: bool,
    pub archive: ArchiveFormat,
}

impl RunOptions {
    pub fn from_config(run: &RunConfig) -> Result<Self, VmError> {
        Ok(Self {
            num_tries: run.num_tries,
            sleep: Duration::from_secs(run.sleep_s),
            exec_timeout: run.exec_timeout_s.map(Duration::from_secs),
            interactive: run.interactive,
            debug: run.debug,
            tty: run.tty.clone(),
            clone: run.clone,
            keep_clone: run.keep_clone,
            ensure_ready: run.ensure_ready,
            archive: ArchiveFormat::parse(&run.archive)?,
        })
    }

    /// Ephemeral resources survive the operation.
    pub fn keeps_resources(&self) -> bool {
        self.debug || self.keep_clone
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            num_tries: 20,
            sleep: Duration::from_secs(5),
            exec_timeout: None,
            interactive: false,
            debug: false,
            tty: None,
            clone: false,
            keep_clone: false,
            ensure_ready: true,
            archive: ArchiveFormat::Tar,
        }
    }
}

// ── validation ──────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), VmError> {
    if config.run.num_tries == 0 {
        return Err(VmError::Validation {
            message: "run.num_tries must be at least 1".into(),
        });
    }
    if config.rest.port == 0 {
        return Err(VmError::Validation {
            message: "rest.port must not be 0".into(),
        });
    }
    if config.run.exec_timeout_s == Some(0) {
        return Err(VmError::Validation {
            message: "run.exec_timeout_s must be positive when set".into(),
        });
    }
    ArchiveFormat::parse(&config.run.archive).map_err(|_| VmError::Validation {
        message: format!(
            "run.archive must be \"tar\" or \"zip\", got \"{}\"",
            config.run.archive
        ),
    })?;
    RoutingTable::with_overrides(&config.routing)?;
    Ok(())
}

/// Directory holding the VM inventory: `vm_dir` if set, otherwise the
/// hypervisor's `prefvmx.defaultVMPath` preference.
pub fn resolve_vm_dir(config: &Config, platform: HostPlatform) -> Result<PathBuf, VmError> {
    if !config.vm_dir.is_empty() {
        return Ok(PathBuf::from(&config.vm_dir));
    }
    let prefs = platform.preferences_file();
    if let Some(prefs_path) = prefs.as_deref().filter(|p| p.is_file()) {
        let values = vmx::read_key_values(prefs_path)?;
        if let Some(dir) = values.get("prefvmx.defaultVMPath") {
            return Ok(PathBuf::from(dir));
        }
    }
    Err(VmError::Validation {
        message: format!(
            "no vm_dir configured and no prefvmx.defaultVMPath in {}",
            prefs
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "the hypervisor preferences".into())
        ),
    })
}

// ── public API ────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<Config, VmError> {
    let contents = std::fs::read_to_string(path).map_err(|source| VmError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = facet_toml::from_str(&contents).map_err(|e| VmError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate_config(&config)?;
    Ok(config)
}

/// Explicit paths must exist; the default location falls back to built-in defaults.
pub fn load_or_default(explicit: Option<&Path>, default_path: &Path) -> Result<Config, VmError> {
    match explicit {
        Some(path) => load_config(path),
        None if default_path.is_file() => load_config(default_path),
        None => Ok(Config::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        facet_toml::from_str(toml).unwrap()
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("");
        assert_eq!(config.rest.port, 8697);
        assert_eq!(config.run.num_tries, 20);
        assert_eq!(config.run.sleep_s, 5);
        assert!(config.run.ensure_ready);
        assert!(config.clone.stop_source);
        assert_eq!(config.run.archive, "tar");
        validate_config(&config).unwrap();
    }

    #[test]
    fn parse_full_config() {
        let config = parse(
            r#"
vm_dir = "/vms"

[rest]
enabled = true
username = "admin"
password = "pw"
port = 9000

[guest]
username = "builder"
password = "secret"

[run]
num_tries = 3
sleep_s = 0
exec_timeout_s = 600
clone = true
archive = "zip"

[clone]
full = true
snapshot = "base"

[launcher]
windows = "C:/launchers/vmdrive-launcher.exe"

[routing]
ip = "local"
"#,
        );
        validate_config(&config).unwrap();
        assert_eq!(config.vm_dir, "/vms");
        assert_eq!(config.rest.port, 9000);
        assert_eq!(config.guest.username, "builder");
        assert_eq!(config.clone.snapshot.as_deref(), Some("base"));
        assert_eq!(
            config.launcher.windows.as_deref(),
            Some("C:/launchers/vmdrive-launcher.exe")
        );
        assert_eq!(config.launcher.linux, None);

        let opts = RunOptions::from_config(&config.run).unwrap();
        assert_eq!(opts.num_tries, 3);
        assert_eq!(opts.sleep, Duration::ZERO);
        assert_eq!(opts.exec_timeout, Some(Duration::from_secs(600)));
        assert_eq!(opts.archive, ArchiveFormat::Zip);
        assert!(opts.clone);
    }

    #[test]
    fn zero_tries_rejected() {
        let config = parse("[run]\nnum_tries = 0\n");
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("num_tries"));
    }

    #[test]
    fn unknown_archive_rejected() {
        let config = parse("[run]\narchive = \"rar\"\n");
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("run.archive"));
    }

    #[test]
    fn unknown_routing_rejected() {
        let config = parse("[routing]\npower = \"sideways\"\n");
        assert!(matches!(
            validate_config(&config),
            Err(VmError::Validation { .. })
        ));
    }

    #[test]
    fn explicit_vm_dir_wins() {
        let config = parse("vm_dir = \"/somewhere\"\n");
        assert_eq!(
            resolve_vm_dir(&config, HostPlatform::Linux).unwrap(),
            PathBuf::from("/somewhere")
        );
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = load_or_default(
            Some(Path::new("/nonexistent/vmdrive.toml")),
            Path::new("/nonexistent/default.toml"),
        )
        .unwrap_err();
        assert!(matches!(err, VmError::ConfigLoad { .. }));
    }

    #[test]
    fn missing_default_config_uses_defaults() {
        let config = load_or_default(None, Path::new("/nonexistent/default.toml")).unwrap();
        assert_eq!(config.run.num_tries, 20);
    }
}
