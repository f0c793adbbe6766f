//! Server configuration from environment variables.

use std::path::PathBuf;

use crawlspace_core::PrincipalId;

/// One provisioned API key.
#[derive(Debug, Clone)]
pub struct ApiKeyEntry {
    /// The bearer token (long-lived keys carry the `cp_` prefix).
    pub token: String,
    /// Principal the token resolves to.
    pub principal_id: PrincipalId,
    /// Grants trusted internal-caller rights.
    pub service: bool,
}

/// Crawlspace API configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub http_port: u16,
    /// Postgres connection URL; in-memory metadata store when absent.
    pub database_url: Option<String>,
    /// Filesystem blob root; in-memory blob store when absent.
    pub storage_dir: Option<PathBuf>,
    /// Base URL injected into containers (`APIFY_API_BASE_URL`).
    pub public_base_url: String,
    /// Storage-root path injected into containers.
    pub storage_root: String,
    /// Global concurrency cap for the orchestrator.
    pub max_concurrent_runs: usize,
    /// Provisioned API keys.
    pub api_keys: Vec<ApiKeyEntry>,
}

impl Config {
    /// Loads configuration from the environment.
    ///
    /// Optional (with defaults):
    /// - `CRAWLSPACE_HTTP_PORT` (default 8787)
    /// - `CRAWLSPACE_DATABASE_URL` (absent → in-memory metadata store)
    /// - `CRAWLSPACE_STORAGE_DIR` (absent → in-memory blob store)
    /// - `CRAWLSPACE_PUBLIC_BASE_URL` (default derived from the port)
    /// - `CRAWLSPACE_MAX_CONCURRENT_RUNS` (default 8)
    /// - `CRAWLSPACE_API_KEYS`: comma-separated `token:principalId` pairs,
    ///   with an optional `:service` suffix for trusted callers
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_port: u16 = std::env::var("CRAWLSPACE_HTTP_PORT")
            .unwrap_or_else(|_| "8787".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("CRAWLSPACE_HTTP_PORT", "must be a valid port"))?;

        let database_url = std::env::var("CRAWLSPACE_DATABASE_URL").ok();
        let storage_dir = std::env::var("CRAWLSPACE_STORAGE_DIR").ok().map(PathBuf::from);

        let public_base_url = std::env::var("CRAWLSPACE_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{http_port}"));
        let storage_root = std::env::var("CRAWLSPACE_STORAGE_ROOT")
            .unwrap_or_else(|_| "/var/lib/crawlspace".to_string());

        let max_concurrent_runs: usize = std::env::var("CRAWLSPACE_MAX_CONCURRENT_RUNS")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CRAWLSPACE_MAX_CONCURRENT_RUNS", "must be a positive integer")
            })?;
        if max_concurrent_runs == 0 {
            return Err(ConfigError::Invalid(
                "CRAWLSPACE_MAX_CONCURRENT_RUNS",
                "must be a positive integer",
            ));
        }

        let api_keys = match std::env::var("CRAWLSPACE_API_KEYS") {
            Ok(raw) => parse_api_keys(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            http_port,
            database_url,
            storage_dir,
            public_base_url,
            storage_root,
            max_concurrent_runs,
            api_keys,
        })
    }
}

fn parse_api_keys(raw: &str) -> Result<Vec<ApiKeyEntry>, ConfigError> {
    let mut keys = Vec::new();
    for entry in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let mut parts = entry.trim().split(':');
        let token = parts.next().unwrap_or_default();
        let principal = parts.next().unwrap_or_default();
        let service = matches!(parts.next(), Some("service"));
        if token.is_empty() || principal.is_empty() {
            return Err(ConfigError::Invalid(
                "CRAWLSPACE_API_KEYS",
                "entries must look like token:principalId[:service]",
            ));
        }
        let principal_id = principal.parse().map_err(|_| {
            ConfigError::Invalid("CRAWLSPACE_API_KEYS", "principal ids must be 21-char ids")
        })?;
        keys.push(ApiKeyEntry {
            token: token.to_string(),
            principal_id,
            service,
        });
    }
    Ok(keys)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_api_key_entries() {
        let principal = PrincipalId::generate();
        let raw = format!("cp_abc:{principal},cp_def:{principal}:service");
        let keys = parse_api_keys(&raw).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(!keys[0].service);
        assert!(keys[1].service);
        assert_eq!(keys[0].token, "cp_abc");
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_api_keys("just-a-token").is_err());
        assert!(parse_api_keys("cp_x:not-an-id").is_err());
    }
}
