use directories::ProjectDirs;
use std::path::PathBuf;

// Fixed system locations; development mode redirects everything under ./dev_data.

pub fn system_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/facepunch")
}

/// Per-user data directory, used when the config does not name one.
pub fn default_data_dir() -> PathBuf {
    ProjectDirs::from("com", "facepunch", "FacePunch")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(system_data_dir)
}

pub fn system_config_file() -> PathBuf {
    PathBuf::from("/etc/facepunch/facepunch.toml")
}

pub fn blobs_dir(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("blobs")
}

pub fn references_dir(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("references")
}

pub fn verification_log_file(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("logs").join("verification.jsonl")
}
