use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

/// Value shipped in `.env.example`; refusing it keeps tokens unforgeable.
pub const PLACEHOLDER_SECRET: &str = "change-me";

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = lookup("HEARTH_JWT_SECRET").context("HEARTH_JWT_SECRET must be set")?;
        if jwt_secret.trim().is_empty() || jwt_secret == PLACEHOLDER_SECRET {
            bail!("HEARTH_JWT_SECRET is empty or still the placeholder");
        }

        let db_path = lookup("HEARTH_DB_PATH").unwrap_or_else(|| "hearth.db".into());
        let host = lookup("HEARTH_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = lookup("HEARTH_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("HEARTH_PORT is not a port number")?;

        Ok(Self {
            jwt_secret,
            db_path: PathBuf::from(db_path),
            host,
            port,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("HEARTH_JWT_SECRET", "s3cret")]).unwrap();
        assert_eq!(config.db_path, PathBuf::from("hearth.db"));
        assert_eq!(config.addr().unwrap().to_string(), "0.0.0.0:3000");
    }

    #[test]
    fn test_secret_is_required() {
        assert!(config(&[]).is_err());
        assert!(config(&[("HEARTH_JWT_SECRET", PLACEHOLDER_SECRET)]).is_err());
        assert!(config(&[("HEARTH_JWT_SECRET", "  ")]).is_err());
    }

    #[test]
    fn test_bad_port() {
        assert!(config(&[("HEARTH_JWT_SECRET", "x"), ("HEARTH_PORT", "http")]).is_err());
    }
}
