use std::fs;
use std::path::{Path, PathBuf};

use crate::common::error::Result;

#[derive(Debug, Clone)]
pub struct DevMode {
    enabled: bool,
    base_dir: PathBuf,
}

impl DevMode {
    pub fn new(enabled: bool) -> Result<Self> {
        Self::with_base_dir(enabled, PathBuf::from("./dev_data"))
    }

    pub fn with_base_dir(enabled: bool, base_dir: PathBuf) -> Result<Self> {
        if enabled {
            for sub in ["blobs", "references", "logs", "captures", "config"] {
                fs::create_dir_all(base_dir.join(sub))?;
            }

            println!("📁 Development mode enabled - data will be saved to: {}",
                     base_dir.display());
        }

        Ok(Self { enabled, base_dir })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Root for blobs, references and the verification log.
    pub fn data_dir(&self, configured: &Path) -> PathBuf {
        if self.enabled {
            self.base_dir.clone()
        } else {
            configured.to_path_buf()
        }
    }

    pub fn config_file(&self) -> PathBuf {
        if self.enabled {
            let dev_config = self.base_dir.join("config").join("facepunch.toml");
            if dev_config.exists() {
                return dev_config;
            }
            PathBuf::from("configs/facepunch-dev.toml")
        } else {
            crate::common::paths::system_config_file()
        }
    }

    pub fn get_capture_path(&self, prefix: &str) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        if self.enabled {
            self.base_dir.join("captures").join(format!("{}_{}.jpg", prefix, timestamp))
        } else {
            PathBuf::from(format!("{}_{}.jpg", prefix, timestamp))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_mode_redirects_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dev = DevMode::with_base_dir(true, tmp.path().join("dev")).unwrap();
        assert!(tmp.path().join("dev").join("logs").is_dir());
        assert_eq!(dev.data_dir(Path::new("/var/lib/facepunch")), tmp.path().join("dev"));
        assert!(dev.get_capture_path("test").starts_with(tmp.path().join("dev").join("captures")));
    }

    #[test]
    fn test_production_keeps_configured_dir() {
        let prod = DevMode::new(false).unwrap();
        assert!(!prod.is_enabled());
        assert_eq!(prod.data_dir(Path::new("/srv/punch")), PathBuf::from("/srv/punch"));
        assert_eq!(prod.config_file(), PathBuf::from("/etc/facepunch/facepunch.toml"));
    }
}
