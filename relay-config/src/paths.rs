use std::path::PathBuf;

use crate::error::ConfigError;

/// Get XDG config directory for the relay
/// Returns ~/.config/dvr-relay or $XDG_CONFIG_HOME/dvr-relay
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|p| p.join("dvr-relay"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Get default config file path
/// Returns ~/.config/dvr-relay/relay.toml
pub fn relay_config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("relay.toml"))
}

/// Ensure the directory holding `path` exists.
/// On Unix, a freshly created directory gets 0700 since the file holds DVR credentials.
pub fn ensure_parent_dir(path: &std::path::Path) -> Result<(), ConfigError> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(dir, perms)?;
    }
    Ok(())
}
