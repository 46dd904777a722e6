use std::{env, fmt::Display, fs::read_to_string, str::FromStr};

use anyhow::{Result, anyhow};
use tracing::{info, warn};

const REDIS_URL_SECRET: &str = "/run/secrets/REDIS_URL";

pub struct Config {
    pub port: u16,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1111,
            redis_url: None,
            redis_prefix: "tally".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Ok(Self {
            port: try_load("RUST_PORT", "1111")?,
            redis_url: var("REDIS_URL").or_else(|| {
                read_secret(&var("REDIS_URL_FILE").unwrap_or_else(|| REDIS_URL_SECRET.into()))
            }),
            redis_prefix: try_load("REDIS_PREFIX", "tally")?,
        })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: Display,
{
    let value = var(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    value.parse::<T>().map_err(|e| {
        warn!("Invalid {key} value: {e}");
        anyhow!("Environment misconfigured, {key}={value}: {e}")
    })
}

fn read_secret(path: &str) -> Option<String> {
    read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|_| {
            info!("No secret at {path}");
        })
        .ok()
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_read_secret_trims_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "  redis://cache:6379/  ").unwrap();

        let path = file.path().to_str().unwrap();
        assert_eq!(read_secret(path).as_deref(), Some("redis://cache:6379/"));
    }

    #[test]
    fn test_read_secret_missing_or_blank() {
        let file = NamedTempFile::new().unwrap();

        assert_eq!(read_secret(file.path().to_str().unwrap()), None);
        assert_eq!(read_secret("/nonexistent/REDIS_URL"), None);
    }
}
