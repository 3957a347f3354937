use std::path::PathBuf;

/// Default config file: `<config dir>/vmdrive/vmdrive.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vmdrive")
        .join("vmdrive.toml")
}

/// The launcher binary shipped next to the running executable.
pub fn default_launcher_path() -> PathBuf {
    let name = format!("vmdrive-launcher{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .unwrap_or_else(|| PathBuf::from(name))
}
