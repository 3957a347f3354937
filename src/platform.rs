use std::path::PathBuf;

use crate::vmx::GuestOs;

/// Host the orchestrator runs on. Detected once at startup and injected
/// wherever platform-specific defaults are needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    MacOs,
    Windows,
    Linux,
}

impl HostPlatform {
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(windows) {
            Self::Windows
        } else {
            Self::Linux
        }
    }

    /// Value for vmrun's `-T` flag.
    pub fn vmrun_host_type(self) -> &'static str {
        match self {
            Self::MacOs => "fusion",
            Self::Windows | Self::Linux => "ws",
        }
    }

    pub fn default_vmrun(self) -> PathBuf {
        match self {
            Self::MacOs => PathBuf::from("/Applications/VMware Fusion.app/Contents/Library/vmrun"),
            Self::Windows => {
                PathBuf::from(r"C:\Program Files (x86)\VMware\VMware Workstation\vmrun.exe")
            }
            Self::Linux => PathBuf::from("/usr/bin/vmrun"),
        }
    }

    pub fn default_vmrest(self) -> PathBuf {
        match self {
            Self::MacOs => PathBuf::from("/Applications/VMware Fusion.app/Contents/Library/vmrest"),
            Self::Windows => {
                PathBuf::from(r"C:\Program Files (x86)\VMware\VMware Workstation\vmrest.exe")
            }
            Self::Linux => PathBuf::from("/usr/bin/vmrest"),
        }
    }

    /// The hypervisor's own preferences file, source of `prefvmx.defaultVMPath`.
    pub fn preferences_file(self) -> Option<PathBuf> {
        match self {
            Self::MacOs => dirs::home_dir()
                .map(|h| h.join("Library/Preferences/VMware Fusion/preferences")),
            Self::Windows => dirs::config_dir().map(|d| d.join("VMware").join("preferences.ini")),
            Self::Linux => dirs::home_dir().map(|h| h.join(".vmware").join("preferences")),
        }
    }

    /// Guest family a binary built for this host can run in.
    pub fn guest_family(self) -> GuestOs {
        match self {
            Self::MacOs => GuestOs::MacOs,
            Self::Windows => GuestOs::Windows,
            Self::Linux => GuestOs::Linux,
        }
    }

    /// Suffix of a VM bundle directory; Fusion keeps VMs in `.vmwarevm` bundles.
    pub fn vm_dir_suffix(self) -> &'static str {
        match self {
            Self::MacOs => ".vmwarevm",
            Self::Windows | Self::Linux => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_types() {
        assert_eq!(HostPlatform::MacOs.vmrun_host_type(), "fusion");
        assert_eq!(HostPlatform::Linux.vmrun_host_type(), "ws");
        assert_eq!(HostPlatform::Windows.vmrun_host_type(), "ws");
    }

    #[test]
    fn only_macos_uses_bundle_suffix() {
        assert_eq!(HostPlatform::MacOs.vm_dir_suffix(), ".vmwarevm");
        assert_eq!(HostPlatform::Linux.vm_dir_suffix(), "");
    }
}
