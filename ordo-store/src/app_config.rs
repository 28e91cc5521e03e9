use ordo_order::CancellationPolicy;
use ordo_shared::Masked;
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub cancellation: CancellationPolicy,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: Masked<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: Masked<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub secret_key: Masked<String>,
    #[serde(default = "default_gateway_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_gateway_timeout_ms() -> u64 { 10_000 }

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecoveryConfig {
    pub interval_seconds: u64,
    /// PENDING attempts older than this are considered orphaned.
    pub stale_after_seconds: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            stale_after_seconds: 300,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `ORDO__GATEWAY__SECRET_KEY=...`
            .add_source(config::Environment::with_prefix("ORDO").separator("__"));

        builder.build()?.try_deserialize()
    }
}
