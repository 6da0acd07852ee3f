use std::path::PathBuf;

/// Per-user config directory: `~/.config/qops/`
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("qops")
}

/// Default config file: `~/.config/qops/qops.toml`
pub fn default_config_path() -> PathBuf {
    config_dir().join("qops.toml")
}
