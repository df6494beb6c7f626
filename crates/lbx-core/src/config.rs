use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Server configuration (loaded from lbxd.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub auth: AuthConfig,
    pub storage: ServerStorageConfig,
    pub mail: MailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// gRPC listen address (default: 127.0.0.1:50051)
    pub listen: String,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9100)
    pub metrics_addr: Option<String>,
    /// Per-request deadline applied by the gRPC server
    pub request_timeout_secs: u64,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC key for session tokens, at least 16 bytes.
    /// Usually supplied through LBXD_TOKEN_SECRET instead of the file.
    #[serde(skip_serializing)]
    pub token_secret: Option<String>,
    /// Session token lifetime (default: 168h)
    pub token_lifetime_secs: u64,
    /// Number of digits in the email verification code
    pub email_code_length: usize,
    /// How long a verification code stays valid (default: 24h)
    pub email_code_lifetime_secs: u64,
    /// TTL of the per-user last-mutation cache (default: 24h)
    pub last_mutation_ttl_secs: u64,
    /// Interval between expired-entry sweeps of the in-memory caches
    pub cache_evict_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerStorageConfig {
    /// SQLite database path
    pub db_path: PathBuf,
    /// Largest accepted item value in bytes (default: 1 MiB)
    pub max_item_value_bytes: usize,
    /// SQLite busy timeout in milliseconds
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// Concurrent mail jobs
    pub workers: usize,
    /// Retry limit for transient send failures
    pub max_retries: u32,
    /// Deadline for a single send attempt
    pub send_timeout_secs: u64,
    pub from_email: String,
    pub from_name: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:50051".into(),
            metrics_addr: Some("127.0.0.1:9100".into()),
            request_timeout_secs: 10,
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_lifetime_secs: 168 * 3600,
            email_code_length: 6,
            email_code_lifetime_secs: 24 * 3600,
            last_mutation_ttl_secs: 24 * 3600,
            cache_evict_interval_secs: 60,
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field(
                "token_secret",
                &self.token_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_lifetime_secs", &self.token_lifetime_secs)
            .field("email_code_length", &self.email_code_length)
            .field("email_code_lifetime_secs", &self.email_code_lifetime_secs)
            .field("last_mutation_ttl_secs", &self.last_mutation_ttl_secs)
            .field("cache_evict_interval_secs", &self.cache_evict_interval_secs)
            .finish()
    }
}

impl Default for ServerStorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/lbxd/lbxd.db"),
            max_item_value_bytes: 1024 * 1024,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 5,
            send_timeout_secs: 3,
            from_email: "noreply@lockbox.local".into(),
            from_name: "Lockbox".into(),
        }
    }
}

/// Client configuration (loaded from ~/.config/lbx/config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub remote: RemoteConfig,
    pub storage: ClientStorageConfig,
    pub sync: SyncConfig,
    pub kdf: KdfConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// lbxd gRPC endpoint
    pub endpoint: String,
    pub connect_timeout_secs: u64,
    /// Deadline for each RPC
    pub rpc_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientStorageConfig {
    /// Local vault database
    pub db_path: PathBuf,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Background sync period (default: 5 minutes)
    pub interval_secs: u64,
    /// Upper bound for one sync cycle
    pub cycle_timeout_secs: u64,
}

/// Argon2id cost parameters used for both client-side derivations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Baseline time cost; the auth hash uses one more
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:50051".into(),
            connect_timeout_secs: 5,
            rpc_timeout_secs: 5,
        }
    }
}

impl Default for ClientStorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("~/.local/share/lbx/vault.db"),
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            cycle_timeout_secs: 5,
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_server_config() {
        let toml_str = r#"
[server]
listen = "0.0.0.0:7443"
log_level = "debug"
log_format = "text"

[auth]
token_secret = "0123456789abcdef0123"
token_lifetime_secs = 3600
email_code_length = 8

[storage]
db_path = "/tmp/lbxd.db"
max_item_value_bytes = 4096

[mail]
workers = 2
max_retries = 1
from_email = "vault@example.com"
"#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:7443");
        assert_eq!(config.server.log_format, "text");
        assert_eq!(config.auth.token_secret.as_deref(), Some("0123456789abcdef0123"));
        assert_eq!(config.auth.token_lifetime_secs, 3600);
        assert_eq!(config.auth.email_code_length, 8);
        assert_eq!(config.storage.db_path, PathBuf::from("/tmp/lbxd.db"));
        assert_eq!(config.storage.max_item_value_bytes, 4096);
        assert_eq!(config.mail.workers, 2);
        assert_eq!(config.mail.from_email, "vault@example.com");
        // Defaults
        assert_eq!(config.mail.from_name, "Lockbox");
        assert_eq!(config.auth.last_mutation_ttl_secs, 24 * 3600);
    }

    #[test]
    fn test_parse_server_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:50051");
        assert_eq!(config.server.metrics_addr.as_deref(), Some("127.0.0.1:9100"));
        assert!(config.auth.token_secret.is_none());
        assert_eq!(config.auth.token_lifetime_secs, 168 * 3600);
        assert_eq!(config.auth.email_code_length, 6);
        assert_eq!(config.auth.email_code_lifetime_secs, 24 * 3600);
        assert_eq!(config.storage.max_item_value_bytes, 1_048_576);
        assert_eq!(config.mail.send_timeout_secs, 3);
    }

    #[test]
    fn test_parse_client_partial() {
        let toml_str = r#"
[remote]
endpoint = "https://vault.example.com:443"

[kdf]
mem_cost_kib = 1024
"#;
        let config: ClientConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.remote.endpoint, "https://vault.example.com:443");
        assert_eq!(config.kdf.mem_cost_kib, 1024);
        // Defaults
        assert_eq!(config.kdf.time_cost, 3);
        assert_eq!(config.sync.interval_secs, 300);
        assert_eq!(config.sync.cycle_timeout_secs, 5);
        assert_eq!(config.remote.rpc_timeout_secs, 5);
    }

    #[test]
    fn test_token_secret_not_serialized_or_logged() {
        let mut config = ServerConfig::default();
        config.auth.token_secret = Some("super-secret-hmac-key".into());

        let toml_str = toml::to_string(&config).unwrap();
        assert!(!toml_str.contains("super-secret"));
        assert!(!format!("{config:?}").contains("super-secret"));

        let parsed: ServerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.server.listen, config.server.listen);
        assert!(parsed.auth.token_secret.is_none());
    }
}
