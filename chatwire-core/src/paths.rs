// ABOUTME: Where chatwire keeps its config file and persisted connection values
// ABOUTME: XDG directories by default; CHATWIRE_DATA_DIR relocates the value storage

use directories::ProjectDirs;
use std::ffi::OsString;
use std::path::PathBuf;

const QUALIFIER: &str = "io";
const ORGANIZATION: &str = "chatwire";
const APPLICATION: &str = "chatwire";

/// Environment variable that overrides the data directory
pub const DATA_DIR_ENV: &str = "CHATWIRE_DATA_DIR";

/// File holding visitor id, token, customer id and the other stored values
pub const STORAGE_FILE: &str = "storage.json";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// Data directory: `CHATWIRE_DATA_DIR`, else e.g. ~/.local/share/chatwire/, else ./data
pub fn data_dir() -> PathBuf {
    resolve_data_dir(std::env::var_os(DATA_DIR_ENV))
}

/// Blank overrides are ignored so an exported-but-empty variable keeps the default
fn resolve_data_dir(override_dir: Option<OsString>) -> PathBuf {
    match override_dir {
        Some(dir) if !dir.to_string_lossy().trim().is_empty() => PathBuf::from(dir),
        _ => project_dirs()
            .map(|p| p.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./data")),
    }
}

/// e.g. ~/.local/share/chatwire/storage.json
pub fn storage_file() -> PathBuf {
    data_dir().join(STORAGE_FILE)
}

/// Config directory (e.g., ~/.config/chatwire/), falling back to the working directory
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
