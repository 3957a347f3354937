//! Reader for the hypervisor's `key = "value"` files: VM descriptors
//! (`.vmx`) and the preferences file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::VmError;

/// Key holding the guest's preferred command interpreter.
pub const INTERPRETER_KEY: &str = "guestinfo.vmdrive.interpreter";

/// Coarse guest OS family, derived from the descriptor's `guestOS` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestOs {
    Windows,
    Linux,
    MacOs,
    Other,
}

impl GuestOs {
    pub fn from_guest_os_id(id: &str) -> Self {
        let id = id.to_ascii_lowercase();
        if id.starts_with("darwin") {
            Self::MacOs
        } else if id.starts_with("win") || id.contains("windows") {
            Self::Windows
        } else if [
            "linux", "ubuntu", "debian", "centos", "rhel", "fedora", "sles", "suse", "oracle",
            "arm-", "asianux", "mandrake", "turbolinux", "vmware-photon",
        ]
        .iter()
        .any(|k| id.contains(k))
        {
            Self::Linux
        } else {
            Self::Other
        }
    }

    pub fn is_windows(self) -> bool {
        self == Self::Windows
    }

    pub fn default_interpreter(self) -> &'static str {
        if self.is_windows() { "cmd.exe" } else { "/bin/sh" }
    }

    /// Arguments that make the interpreter run `script` and exit.
    pub fn script_args(self, script: &str) -> Vec<String> {
        let flag = if self.is_windows() { "/c" } else { "-c" };
        vec![flag.to_string(), script.to_string()]
    }

    pub fn default_temp_root(self) -> &'static str {
        if self.is_windows() { r"C:\Windows\Temp" } else { "/tmp" }
    }

    /// Join guest path components using the guest's separator.
    pub fn join(self, dir: &str, name: &str) -> String {
        let sep = if self.is_windows() { '\\' } else { '/' };
        if dir.ends_with(sep) {
            format!("{dir}{name}")
        } else {
            format!("{dir}{sep}{name}")
        }
    }
}

/// Resolved, immutable description of one guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestDescriptor {
    pub path: PathBuf,
    /// File stem of the `.vmx`, used as the short name.
    pub nickname: String,
    pub uuid: Option<String>,
    pub display_name: String,
    pub guest_os_id: String,
    pub guest_os: GuestOs,
    pub interpreter: String,
    pub mac_address: Option<String>,
    /// Transport-assigned id, set when the descriptor came from the remote inventory.
    pub remote_id: Option<String>,
}

impl GuestDescriptor {
    pub fn from_values(path: &Path, values: &BTreeMap<String, String>) -> Self {
        let nickname = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let guest_os_id = values.get("guestOS").cloned().unwrap_or_default();
        let guest_os = GuestOs::from_guest_os_id(&guest_os_id);
        let interpreter = values
            .get(INTERPRETER_KEY)
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| guest_os.default_interpreter().to_string());
        let mac_address = values
            .get("ethernet0.address")
            .or_else(|| values.get("ethernet0.generatedAddress"))
            .filter(|s| !s.is_empty())
            .cloned();

        Self {
            path: path.to_path_buf(),
            display_name: values
                .get("displayName")
                .cloned()
                .unwrap_or_else(|| nickname.clone()),
            nickname,
            uuid: values.get("uuid.bios").cloned(),
            guest_os_id,
            guest_os,
            interpreter,
            mac_address,
            remote_id: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self, VmError> {
        let values = read_key_values(path)?;
        Ok(Self::from_values(path, &values))
    }

    /// Directory containing the `.vmx`.
    pub fn bundle_dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }

    /// Does `identifier` name this guest (nickname, display name, path or uuid)?
    pub fn matches(&self, identifier: &str) -> bool {
        self.nickname == identifier
            || self.display_name == identifier
            || self.path == Path::new(identifier)
            || self.uuid.as_deref() == Some(identifier)
            || self.remote_id.as_deref() == Some(identifier)
    }
}

/// Parse `key = "value"` lines. Blank lines and `#` comments are skipped;
/// quotes around the value are optional.
pub fn parse_key_values(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

pub fn read_key_values(path: &Path) -> Result<BTreeMap<String, String>, VmError> {
    let bytes = std::fs::read(path).map_err(|source| VmError::Io {
        context: format!("reading {}", path.display()),
        source,
    })?;
    Ok(parse_key_values(&decode_text(&bytes)))
}

/// Older descriptors are written in the host's legacy code page rather than
/// UTF-8. Anything that is not valid UTF-8 is read as Latin-1, which maps
/// every byte to a character.
fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}
