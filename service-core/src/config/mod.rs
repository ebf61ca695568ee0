use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Settings shared by every service binary.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        load_layered("APP")
    }
}

/// Load a settings struct from an optional `configuration` file overlaid with
/// `<PREFIX>__`-separated environment variables. `.env` is read first if present.
pub fn load_layered<T: DeserializeOwned>(prefix: &str) -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let config = Cfg::builder()
        .add_source(File::with_name("configuration").required(false))
        .add_source(Environment::with_prefix(prefix).separator("__"))
        .build()?;

    Ok(config.try_deserialize()?)
}

/// Read an environment variable and parse it, falling back to `default` when the
/// variable is unset. A value that is present but unparsable is a configuration error.
pub fn env_or<T>(name: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => parse_setting(name, &raw),
        Err(_) => Ok(default),
    }
}

pub fn parse_setting<T>(name: &str, raw: &str) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| {
        AppError::ConfigError(anyhow::anyhow!("Invalid value for {}: {}", name, e))
    })
}
