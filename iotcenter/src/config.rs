use crate::errors::{Error, Result};
use std::env;

pub const DEFAULT_GEO_URL: &str = "https://freegeoip.app/json/";

/// Which store implementation the server talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Influx,
    Memory,
}

/// Connection and server settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub influx_url: String,
    pub influx_token: String,
    pub influx_org: String,
    /// Bucket receiving `environment` telemetry points.
    pub bucket: String,
    /// Bucket holding `deviceauth` records.
    pub auth_bucket: String,
    pub http_addr: String,
    /// `None` skips the lookup and always uses the fallback coordinates.
    pub geo_url: Option<String>,
    pub allow_raw_query: bool,
    pub store: StoreKind,
}

impl Config {
    /// Builds the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let or_default =
            |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let store = match or_default("IOTCENTER_STORE", "influx").to_lowercase().as_str() {
            "influx" | "influxdb" => StoreKind::Influx,
            "memory" => StoreKind::Memory,
            other => {
                return Err(Error::Config(format!(
                    "IOTCENTER_STORE must be `influx` or `memory`, got `{}`",
                    other
                )))
            }
        };

        let required = |key: &str| -> Result<String> {
            match lookup(key).filter(|v| !v.is_empty()) {
                Some(v) => Ok(v),
                None if store == StoreKind::Memory => Ok(String::new()),
                None => Err(Error::Config(format!("{} is not set", key))),
            }
        };

        let allow_raw_query = match lookup("IOTCENTER_ALLOW_RAW_QUERY") {
            None => false,
            Some(v) => v.parse::<bool>().map_err(|_| {
                Error::Config(format!(
                    "IOTCENTER_ALLOW_RAW_QUERY must be `true` or `false`, got `{}`",
                    v
                ))
            })?,
        };

        let geo_url = match lookup("GEO_URL") {
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(v),
            None => Some(DEFAULT_GEO_URL.to_string()),
        };

        Ok(Self {
            influx_url: or_default("INFLUX_URL", "http://localhost:8086")
                .trim_end_matches('/')
                .to_string(),
            influx_token: required("INFLUX_TOKEN")?,
            influx_org: required("INFLUX_ORG")?,
            bucket: or_default("INFLUX_BUCKET", "iot_center"),
            auth_bucket: or_default("INFLUX_BUCKET_AUTH", "iot_center_devices"),
            http_addr: or_default("HTTP_ADDR", "0.0.0.0:5000"),
            geo_url,
            allow_raw_query,
            store,
        })
    }
}
