//! Typed server settings built from the `TMS__*` environment.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tms_auth::{AuthOptions, DEVELOPMENT_SECRET};
use tms_core::{TmsConfig, TmsConfigSnapshot};
use tms_tenancy::PoolConfig;

pub const ENV_PREFIX: &str = "TMS__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub environment: Environment,
    pub log_format: LogFormat,
    pub expose_errors: bool,
    pub database: PoolConfig,
    pub auth: AuthOptions,
    /// Set when the development secret was filled in.
    pub using_development_secret: bool,
}

impl ServerSettings {
    pub fn from_env() -> Result<Self> {
        let mut config = TmsConfig::new();
        config.load_env(ENV_PREFIX);
        Self::from_snapshot(&config.snapshot())
    }

    pub fn from_snapshot(snapshot: &TmsConfigSnapshot) -> Result<Self> {
        let environment = match snapshot.get("app.environment").map(str::trim) {
            None | Some("development") => Environment::Development,
            Some("production") => Environment::Production,
            Some(other) => bail!("app.environment must be development or production, got {other}"),
        };

        let log_format = match snapshot.get("log.format").map(str::trim) {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => bail!("log.format must be text or json, got {other}"),
        };

        let port = match snapshot.get_u32("http.port") {
            None => 3000,
            Some(raw) => u16::try_from(raw).map_err(|_| anyhow!("http.port out of range: {raw}"))?,
        };

        let url = snapshot
            .get_string("database.url")
            .ok_or_else(|| anyhow!("database.url is required"))?;
        let mut database = PoolConfig::new(url);
        if let Some(n) = snapshot.get_u32("database.max_connections") {
            database.max_connections = n;
        }
        if let Some(n) = snapshot.get_u32("database.min_connections") {
            database.min_connections = n;
        }
        if let Some(secs) = snapshot.get_u64("database.acquire_timeout_secs") {
            database.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = snapshot.get_u64("database.idle_timeout_secs") {
            database.idle_timeout = Duration::from_secs(secs);
        }
        if database.min_connections > database.max_connections {
            bail!("database.min_connections exceeds database.max_connections");
        }

        let mut auth = AuthOptions::from_snapshot(snapshot);
        let mut using_development_secret = false;
        if auth.jwt.secret.is_none() {
            if environment == Environment::Production {
                bail!("auth.jwt.secret is required in production");
            }
            auth.jwt.secret = Some(DEVELOPMENT_SECRET.to_string());
            using_development_secret = true;
        }
        auth.validate().map_err(|e| anyhow!(e))?;

        Ok(Self {
            host: snapshot
                .get_string("http.host")
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            environment,
            log_format,
            expose_errors: snapshot
                .get_bool("app.expose_errors")
                .unwrap_or(environment == Environment::Development),
            database,
            auth,
            using_development_secret,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
