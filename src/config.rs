use anyhow::{Context, Result};
use std::{env, path::PathBuf, sync::OnceLock};

/// Process configuration loaded and validated at startup
///
/// This is the runtime environment of the service (ports, paths, interface
/// names). The persisted device configuration lives in
/// [`crate::services::config_store`].
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// HTTP server configuration
    pub http: HttpConfig,

    /// Wireless interface configuration
    pub wifi: WifiConfig,

    /// Path configuration
    pub paths: PathConfig,

    /// Skip the station join at startup and go straight to access point mode
    pub force_access_point: bool,
}

#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct WifiConfig {
    pub interface: String,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub data_dir: PathBuf,
    pub config_file: PathBuf,
    pub firmware_staging_file: PathBuf,
    pub firmware_image_file: PathBuf,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it loads
    /// and validates all configuration from environment variables.
    ///
    /// # Panics
    /// Panics if configuration loading fails. The service cannot run without
    /// a usable data directory.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| Self::load().expect("failed to load application configuration"))
    }

    fn load() -> Result<Self> {
        let http = HttpConfig::load()?;
        let wifi = WifiConfig::load();
        let paths = PathConfig::load()?;
        let force_access_point = env::var("FORCE_AP")
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            http,
            wifi,
            paths,
            force_access_point,
        })
    }
}

impl HttpConfig {
    fn load() -> Result<Self> {
        let port = env::var("HTTP_PORT")
            .unwrap_or_else(|_| "80".to_string())
            .parse::<u16>()
            .context("failed to parse HTTP_PORT: invalid format")?;

        Ok(Self { port })
    }
}

impl WifiConfig {
    fn load() -> Self {
        let interface = env::var("WIFI_INTERFACE").unwrap_or_else(|_| "wlan0".to_string());

        Self { interface }
    }
}

impl PathConfig {
    fn load() -> Result<Self> {
        let data_dir = Self::data_dir();

        std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;

        let config_file = env::var("CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("config.json"));
        let firmware_staging_file = data_dir.join("firmware.part");
        let firmware_image_file = data_dir.join("firmware.bin");

        Ok(Self {
            data_dir,
            config_file,
            firmware_staging_file,
            firmware_image_file,
        })
    }

    #[cfg(not(test))]
    fn data_dir() -> PathBuf {
        env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/data/"))
    }

    // In test mode, use temp directory as default to avoid /data requirement
    #[cfg(test)]
    fn data_dir() -> PathBuf {
        std::env::temp_dir().join("stick-core-test")
    }
}
