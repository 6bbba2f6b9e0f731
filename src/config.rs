const PLACEHOLDER_ADMIN_KEY: &str = "CHANGE_ME_ADMIN_KEY";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub admin_key: String,
    /// Base for computed canonical landing URLs, e.g. `https://labels.example.com`.
    /// Set via QRLINK_PUBLIC_BASE_URL. Default: http://localhost:8080.
    pub public_base_url: String,
    /// TTL of the in-process rule cache. 0 = disabled.
    /// Set via QRLINK_RULE_CACHE_TTL_SECS. Default: 15.
    pub rule_cache_ttl_secs: u64,
    /// Period of the background expiry sweep. 0 = disabled (expiry stays lazy).
    /// Set via QRLINK_EXPIRY_SWEEP_SECS. Default: 300.
    pub expiry_sweep_secs: u64,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: "postgres://localhost/qrlink".into(),
            admin_key: PLACEHOLDER_ADMIN_KEY.into(),
            public_base_url: "http://localhost:8080".into(),
            rule_cache_ttl_secs: 15,
            expiry_sweep_secs: 300,
            log_format: LogFormat::Text,
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let defaults = Config::default();

    let admin_key = std::env::var("QRLINK_ADMIN_KEY").unwrap_or_else(|_| PLACEHOLDER_ADMIN_KEY.into());

    if admin_key == PLACEHOLDER_ADMIN_KEY {
        let env_mode = std::env::var("QRLINK_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "QRLINK_ADMIN_KEY is still the insecure placeholder. \
                 Set a real admin key before running in production."
            );
        }
        eprintln!("⚠️  QRLINK_ADMIN_KEY is not set, using insecure placeholder.");
    }

    let public_base_url = std::env::var("QRLINK_PUBLIC_BASE_URL")
        .unwrap_or(defaults.public_base_url);
    url::Url::parse(&public_base_url)
        .map_err(|e| anyhow::anyhow!("QRLINK_PUBLIC_BASE_URL is not a valid URL: {}", e))?;

    Ok(Config {
        port: std::env::var("QRLINK_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port),
        database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
        admin_key,
        public_base_url,
        rule_cache_ttl_secs: std::env::var("QRLINK_RULE_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.rule_cache_ttl_secs),
        expiry_sweep_secs: std::env::var("QRLINK_EXPIRY_SWEEP_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.expiry_sweep_secs),
        log_format: match std::env::var("QRLINK_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        },
    })
}
