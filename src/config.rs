use anyhow::{Context, Result, ensure};
use std::{env, path::PathBuf, str::FromStr, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// HTTP server configuration
    pub http: HttpConfig,

    /// Wireless interface and timing configuration
    pub wifi: WifiConfig,

    /// Message bus timing configuration
    pub bus: BusConfig,

    /// Path configuration
    pub paths: PathConfig,

    /// Prefix of the generated hostname
    pub hostname_prefix: String,
}

#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct WifiConfig {
    pub interface: String,
    pub ap_interface: String,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct BusConfig {
    pub status_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub settings_file: PathBuf,
    pub static_dir: PathBuf,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it loads
    /// and validates all configuration from environment variables.
    ///
    /// # Panics
    /// Panics if configuration loading fails. This is intentional as the
    /// application cannot function without valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG
            .get_or_init(|| Self::load().expect("failed to load application configuration"))
    }

    /// Load and validate all configuration from environment variables
    pub fn load() -> Result<Self> {
        Ok(Self {
            http: HttpConfig::load()?,
            wifi: WifiConfig::load()?,
            bus: BusConfig::load()?,
            paths: PathConfig::load(),
            hostname_prefix: env::var("HOSTNAME_PREFIX").unwrap_or_else(|_| "netdev".to_string()),
        })
    }
}

impl HttpConfig {
    fn load() -> Result<Self> {
        Ok(Self {
            port: parse_var("HTTP_PORT", 80)?,
        })
    }
}

impl WifiConfig {
    fn load() -> Result<Self> {
        let interface = env::var("WIFI_IFACE").unwrap_or_else(|_| "wlan0".to_string());
        let ap_interface = env::var("WIFI_AP_IFACE").unwrap_or_else(|_| "ap0".to_string());
        let connect_timeout = secs_var("WIFI_CONNECT_TIMEOUT_SECS", 10)?;
        let reconnect_interval = secs_var("WIFI_RECONNECT_SECS", 30)?;

        Ok(Self {
            interface,
            ap_interface,
            connect_timeout,
            reconnect_interval,
        })
    }
}

impl BusConfig {
    fn load() -> Result<Self> {
        Ok(Self {
            status_interval: secs_var("BUS_STATUS_SECS", 60)?,
        })
    }
}

impl PathConfig {
    fn load() -> Self {
        let settings_file = env::var("SETTINGS_PATH")
            .unwrap_or_else(|_| "/data/config/settings.json".to_string())
            .into();

        let static_dir = env::var("STATIC_DIR")
            .unwrap_or_else(|_| "static".to_string())
            .into();

        Self {
            settings_file,
            static_dir,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .context(format!("failed to parse {name}: invalid format")),
        Err(_) => Ok(default),
    }
}

/// Interval in whole seconds. Zero would spin the timers.
fn secs_var(name: &str, default: u64) -> Result<Duration> {
    nonzero_secs(name, parse_var(name, default)?)
}

fn nonzero_secs(name: &str, secs: u64) -> Result<Duration> {
    ensure!(secs > 0, "{name} must be greater than zero");
    Ok(Duration::from_secs(secs))
}
