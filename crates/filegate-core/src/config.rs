//! Configuration module
//!
//! Reads the gateway configuration from the environment (after loading `.env`)
//! and validates it before the server starts.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

// Common constants
const SERVER_PORT: u16 = 5000;
const MAX_UPLOAD_SIZE_BYTES: usize = 500 * 1024 * 1024;
const STAGING_MAX_AGE_SECS: u64 = 3600;
const STAGING_SWEEP_INTERVAL_SECS: u64 = 900;
const HANDLER_TIMEOUT_SECS: u64 = 600;
const CLEANUP_GRACE_SECS: u64 = 5;

/// Settings every Filegate process shares
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub server_port: u16,
    pub cors_origins: Vec<String>,
    pub environment: String,
}

/// Where request-scoped staging directories live and how long leftovers survive
#[derive(Clone, Debug)]
pub struct StagingConfig {
    pub root: PathBuf,
    pub max_age: Duration,
    /// `None` means the stale sweep only runs at startup.
    pub sweep_interval: Option<Duration>,
}

/// External binaries the capability handlers shell out to
#[derive(Clone, Debug)]
pub struct ToolPaths {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub qpdf: String,
    pub soffice: String,
    pub gs: String,
    pub ytdlp: String,
    pub rembg: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            qpdf: "qpdf".to_string(),
            soffice: "soffice".to_string(),
            gs: "gs".to_string(),
            ytdlp: "yt-dlp".to_string(),
            rembg: "rembg".to_string(),
        }
    }
}

impl ToolPaths {
    /// `(name, configured path)` pairs, in a stable order for status reporting.
    pub fn entries(&self) -> [(&'static str, &str); 7] {
        [
            ("ffmpeg", &self.ffmpeg),
            ("ffprobe", &self.ffprobe),
            ("qpdf", &self.qpdf),
            ("soffice", &self.soffice),
            ("gs", &self.gs),
            ("yt-dlp", &self.ytdlp),
            ("rembg", &self.rembg),
        ]
    }
}

/// Gateway configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub base: BaseConfig,
    pub max_upload_size_bytes: usize,
    pub staging: StagingConfig,
    pub handler_timeout: Duration,
    pub cleanup_grace: Duration,
    pub tools: ToolPaths,
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Box<GatewayConfig>);

impl Config {
    fn as_gateway(&self) -> &GatewayConfig {
        &self.0
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        is_production_environment(&self.as_gateway().base.environment)
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        let config = GatewayConfig::from_lookup(|key| env::var(key).ok())?;
        Ok(Config(Box::new(config)))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.as_gateway().validate()
    }

    pub fn server_port(&self) -> u16 {
        self.as_gateway().base.server_port
    }

    pub fn cors_origins(&self) -> &[String] {
        &self.as_gateway().base.cors_origins
    }

    pub fn environment(&self) -> &str {
        &self.as_gateway().base.environment
    }

    pub fn max_upload_size_bytes(&self) -> usize {
        self.as_gateway().max_upload_size_bytes
    }

    pub fn staging(&self) -> &StagingConfig {
        &self.as_gateway().staging
    }

    pub fn handler_timeout(&self) -> Duration {
        self.as_gateway().handler_timeout
    }

    pub fn cleanup_grace(&self) -> Duration {
        self.as_gateway().cleanup_grace
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.as_gateway().tools
    }
}

pub fn is_production_environment(environment: &str) -> bool {
    let env = environment.to_lowercase();
    env == "production" || env == "prod"
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl GatewayConfig {
    /// Builds the configuration from a key lookup. `Config::from_env` passes the
    /// process environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = lookup("ENVIRONMENT")
            .or_else(|| lookup("APP_ENV"))
            .or_else(|| lookup("FLASK_ENV"))
            .unwrap_or_else(|| "development".to_string());

        let cors_origins_str = lookup("CORS_ORIGINS")
            .or_else(|| lookup("FRONTEND_URL"))
            .unwrap_or_else(|| "*".to_string());
        let cors_origins: Vec<String> = cors_origins_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if is_production_environment(&environment) && cors_origins.iter().any(|o| o == "*") {
            return Err(anyhow::anyhow!(
                "CORS_ORIGINS cannot contain '*' in production. Please specify explicit origins."
            ));
        }

        let server_port = match lookup("PORT") {
            Some(port) => port
                .trim()
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid port number, got '{}'", port))?,
            None => SERVER_PORT,
        };

        let staging_root = lookup("STAGING_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("filegate-staging"));

        let sweep_interval_secs = parse_or(
            lookup("STAGING_SWEEP_INTERVAL_SECS"),
            STAGING_SWEEP_INTERVAL_SECS,
        );

        let defaults = ToolPaths::default();
        let tools = ToolPaths {
            ffmpeg: lookup("FFMPEG_PATH").unwrap_or(defaults.ffmpeg),
            ffprobe: lookup("FFPROBE_PATH").unwrap_or(defaults.ffprobe),
            qpdf: lookup("QPDF_PATH").unwrap_or(defaults.qpdf),
            soffice: lookup("SOFFICE_PATH").unwrap_or(defaults.soffice),
            gs: lookup("GS_PATH").unwrap_or(defaults.gs),
            ytdlp: lookup("YTDLP_PATH").unwrap_or(defaults.ytdlp),
            rembg: lookup("REMBG_PATH").unwrap_or(defaults.rembg),
        };

        Ok(GatewayConfig {
            base: BaseConfig {
                server_port,
                cors_origins,
                environment,
            },
            max_upload_size_bytes: parse_or(lookup("MAX_UPLOAD_SIZE_BYTES"), MAX_UPLOAD_SIZE_BYTES),
            staging: StagingConfig {
                root: staging_root,
                max_age: Duration::from_secs(parse_or(
                    lookup("STAGING_MAX_AGE_SECS"),
                    STAGING_MAX_AGE_SECS,
                )),
                sweep_interval: (sweep_interval_secs > 0)
                    .then(|| Duration::from_secs(sweep_interval_secs)),
            },
            handler_timeout: Duration::from_secs(parse_or(
                lookup("HANDLER_TIMEOUT_SECS"),
                HANDLER_TIMEOUT_SECS,
            )),
            cleanup_grace: Duration::from_secs(parse_or(
                lookup("CLEANUP_GRACE_SECS"),
                CLEANUP_GRACE_SECS,
            )),
            tools,
        })
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.max_upload_size_bytes == 0 {
            return Err(anyhow::anyhow!(
                "MAX_UPLOAD_SIZE_BYTES must be greater than zero"
            ));
        }

        if self.handler_timeout.is_zero() {
            return Err(anyhow::anyhow!(
                "HANDLER_TIMEOUT_SECS must be greater than zero"
            ));
        }

        let busy_for = self.handler_timeout.saturating_add(self.cleanup_grace);
        if self.staging.max_age <= busy_for {
            return Err(anyhow::anyhow!(
                "STAGING_MAX_AGE_SECS ({}) must exceed HANDLER_TIMEOUT_SECS + CLEANUP_GRACE_SECS ({})",
                self.staging.max_age.as_secs(),
                busy_for.as_secs()
            ));
        }

        if self.staging.root.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("STAGING_ROOT must not be empty"));
        }

        if self.base.cors_origins.is_empty() {
            return Err(anyhow::anyhow!(
                "CORS_ORIGINS must list at least one origin"
            ));
        }

        Ok(())
    }
}
