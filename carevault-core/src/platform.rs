//! Platform-specific paths for the local record store

use std::path::PathBuf;

/// Get the platform-specific data directory for the encrypted cache
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\CareVault
/// - macOS: ~/Library/Application Support/CareVault
/// - Linux/Other: ~/.local/share/CareVault
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("CareVault")
}

/// Get the platform-specific config directory
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("CareVault")
}

/// Get the default record cache database path
pub fn get_default_database_path() -> PathBuf {
    get_data_dir().join("records.db")
}

/// Get the default software wrapping key path (developer mode only)
pub fn get_default_software_key_path() -> PathBuf {
    get_data_dir().join("keys").join("software-wrapping.key")
}

/// Get the default configuration file path
pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("carevault.toml")
}

/// Ensure the data directory exists, creating it if necessary
pub fn ensure_data_dir() -> std::io::Result<PathBuf> {
    let dir = get_data_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_data_dir() {
        let dir = get_data_dir();
        assert!(dir.to_string_lossy().ends_with("CareVault"));
    }

    #[test]
    fn test_get_default_database_path() {
        let path = get_default_database_path();
        assert!(path.to_string_lossy().ends_with("records.db"));
    }

    #[test]
    fn test_software_key_lives_under_data_dir() {
        let key = get_default_software_key_path();
        assert!(key.starts_with(get_data_dir()));
    }

    #[test]
    fn test_config_path() {
        assert!(get_default_config_path()
            .to_string_lossy()
            .ends_with("carevault.toml"));
    }
}
