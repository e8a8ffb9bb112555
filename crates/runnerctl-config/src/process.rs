//! Process-wide configuration read from the environment (§6 "Configuration").

use std::path::PathBuf;
use std::time::Duration;

use runnerctl_crypto::EncryptionKey;

use crate::error::ConfigError;

/// Recognized process environment options, exactly per spec.md §6 plus the
/// ambient additions SPEC_FULL.md calls for (BIND_ADDR, SSH_PRIVATE_KEY_DIR,
/// an operator bearer token, and database URL).
#[derive(Clone)]
pub struct ProcessConfig {
    /// `MAX_RUNNER_LIFETIME` — max session minutes. Default 180.
    pub max_runner_lifetime_minutes: i64,
    /// `DB_POOL_SIZE` — default 10.
    pub db_pool_size: u32,
    /// `DB_MAX_OVERFLOW` — default 5.
    pub db_max_overflow: u32,
    /// `DB_POOL_RECYCLE` seconds — default 1800.
    pub db_pool_recycle: Duration,
    /// `DB_POOL_TIMEOUT` seconds — default 30.
    pub db_pool_timeout: Duration,
    /// `ENCRYPTION_KEY` (≥16 bytes, first 16 used).
    pub encryption_key: EncryptionKey,
    /// `PROMETHEUS_PUSHGATEWAY_URL` — metrics sink for termination purge (§6).
    pub prometheus_pushgateway_url: Option<String>,
    /// `IDLE_POOL_MINUTES` — default 10.
    pub idle_pool_minutes: i64,
    /// `BIND_ADDR` — default `0.0.0.0:8080`.
    pub bind_addr: String,
    /// `SSH_PRIVATE_KEY_DIR` — scratch dir for decrypted keyfiles.
    pub ssh_private_key_dir: PathBuf,
    /// `DATABASE_URL` — Postgres connection string; absent means in-memory store.
    pub database_url: Option<String>,
    /// `API_AUTH_TOKEN` — bearer token the HTTP surface requires (§9 "Decorator-based
    /// endpoint guards" collapsed to a single operator-token middleware).
    pub api_auth_token: String,
}

impl ProcessConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_runner_lifetime_minutes = env_i64("MAX_RUNNER_LIFETIME", 180)?;
        let db_pool_size = env_u32("DB_POOL_SIZE", 10)?;
        let db_max_overflow = env_u32("DB_MAX_OVERFLOW", 5)?;
        let db_pool_recycle = Duration::from_secs(env_u32("DB_POOL_RECYCLE", 1800)? as u64);
        let db_pool_timeout = Duration::from_secs(env_u32("DB_POOL_TIMEOUT", 30)? as u64);

        let key_raw = std::env::var("ENCRYPTION_KEY")
            .map_err(|_| ConfigError::MissingEnv("ENCRYPTION_KEY".into()))?;
        let encryption_key =
            EncryptionKey::from_str(&key_raw).map_err(|e| ConfigError::InvalidEnv {
                name: "ENCRYPTION_KEY".into(),
                value: e.to_string(),
            })?;

        let prometheus_pushgateway_url = std::env::var("PROMETHEUS_PUSHGATEWAY_URL").ok();
        let idle_pool_minutes = env_i64("IDLE_POOL_MINUTES", 10)?;
        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let ssh_private_key_dir = std::env::var("SSH_PRIVATE_KEY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("runnerctl-keys"));
        let database_url = std::env::var("DATABASE_URL").ok();
        let api_auth_token = std::env::var("API_AUTH_TOKEN")
            .map_err(|_| ConfigError::MissingEnv("API_AUTH_TOKEN".into()))?;

        Ok(Self {
            max_runner_lifetime_minutes,
            db_pool_size,
            db_max_overflow,
            db_pool_recycle,
            db_pool_timeout,
            encryption_key,
            prometheus_pushgateway_url,
            idle_pool_minutes,
            bind_addr,
            ssh_private_key_dir,
            database_url,
            api_auth_token,
        })
    }
}

fn env_i64(name: &str, default: i64) -> Result<i64, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidEnv {
            name: name.to_string(),
            value: v,
        }),
        Err(_) => Ok(default),
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidEnv {
            name: name.to_string(),
            value: v,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("MAX_RUNNER_LIFETIME");
        std::env::remove_var("IDLE_POOL_MINUTES");
        std::env::set_var("ENCRYPTION_KEY", "0123456789abcdef");
        std::env::set_var("API_AUTH_TOKEN", "test-token");
        let cfg = ProcessConfig::from_env().unwrap();
        assert_eq!(cfg.max_runner_lifetime_minutes, 180);
        assert_eq!(cfg.idle_pool_minutes, 10);
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn missing_encryption_key_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("ENCRYPTION_KEY");
        std::env::set_var("API_AUTH_TOKEN", "test-token");
        assert!(ProcessConfig::from_env().is_err());
    }
}
