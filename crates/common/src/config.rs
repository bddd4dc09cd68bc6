//! Configuration loading with TOML + serde.
//!
//! Layering, lowest to highest precedence: hard defaults, TOML file,
//! `AVID_*` environment variables, CLI flags (applied by the binaries).
//! Durations are written in humane form (`"24h"`, `"90s"`, `"1h30m"`).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid duration {input:?}: {reason}")]
    InvalidDuration { input: String, reason: String },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("invalid erasure parameters: data={data}, total={total}")]
    InvalidErasure { data: usize, total: usize },
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub erasure: ErasureConfig,
    pub object: ObjectConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ClusterConfig {
    /// Ordered `host:port` identities of every node in the cluster.
    pub peers: Vec<String>,
    /// This node's identity. Derived from the gRPC port when absent.
    #[serde(rename = "self")]
    pub self_addr: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ErasureConfig {
    /// Data fragment count (m).
    pub data: usize,
    /// Total fragment count (n).
    pub total: usize,
}

impl Default for ErasureConfig {
    fn default() -> Self {
        ErasureConfig { data: 3, total: 5 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ObjectConfig {
    /// Object lifetime before garbage collection.
    pub ttl: String,
}

impl Default for ObjectConfig {
    fn default() -> Self {
        ObjectConfig {
            ttl: "24h".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Fragment directory root.
    pub datadir: String,
    /// Durable KV path. Derived from the gRPC port when absent.
    pub db: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            datadir: "data".to_string(),
            db: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub grpc_port: u16,
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            grpc_port: 50051,
            metrics_port: 9102,
        }
    }
}

impl Config {
    /// Load config from a TOML file path.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let cfg: Config = toml::from_str(&raw)?;
        Ok(cfg)
    }

    /// Apply `AVID_*` environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `AVID_*` overrides from an arbitrary lookup, so tests can
    /// inject values without touching the process environment.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("AVID_CLUSTER_PEERS") {
            self.cluster.peers = split_peers(&v);
        }
        if let Some(v) = lookup("AVID_CLUSTER_SELF") {
            self.cluster.self_addr = Some(v);
        }
        if let Some(v) = lookup("AVID_ERASURE_DATA") {
            self.erasure.data = parse_env("AVID_ERASURE_DATA", &v)?;
        }
        if let Some(v) = lookup("AVID_ERASURE_TOTAL") {
            self.erasure.total = parse_env("AVID_ERASURE_TOTAL", &v)?;
        }
        if let Some(v) = lookup("AVID_OBJECT_TTL") {
            self.object.ttl = v;
        }
        if let Some(v) = lookup("AVID_STORAGE_DATADIR") {
            self.storage.datadir = v;
        }
        if let Some(v) = lookup("AVID_STORAGE_DB") {
            self.storage.db = Some(v);
        }
        if let Some(v) = lookup("AVID_SERVER_GRPC_PORT") {
            self.server.grpc_port = parse_env("AVID_SERVER_GRPC_PORT", &v)?;
        }
        if let Some(v) = lookup("AVID_SERVER_METRICS_PORT") {
            self.server.metrics_port = parse_env("AVID_SERVER_METRICS_PORT", &v)?;
        }
        Ok(())
    }

    /// Fill derived fields: self identity from the gRPC port, self appended
    /// to the peer list when missing, per-port default KV path.
    pub fn finalize(&mut self) {
        if self.cluster.self_addr.as_deref().unwrap_or("").is_empty() {
            self.cluster.self_addr = Some(format!("localhost:{}", self.server.grpc_port));
        }
        let self_addr = self.cluster.self_addr.clone().unwrap_or_default();
        if !self.cluster.peers.iter().any(|p| p == &self_addr) {
            self.cluster.peers.push(self_addr);
        }
        if self.storage.db.as_deref().unwrap_or("").is_empty() {
            self.storage.db = Some(format!("store-{}.redb", self.server.grpc_port));
        }
    }

    /// Reject configurations the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.erasure.data == 0 || self.erasure.total <= self.erasure.data {
            return Err(ConfigError::InvalidErasure {
                data: self.erasure.data,
                total: self.erasure.total,
            });
        }
        let ttl = self.ttl()?;
        if ttl.is_zero() {
            return Err(ConfigError::InvalidDuration {
                input: self.object.ttl.clone(),
                reason: "ttl must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Parsed object TTL.
    pub fn ttl(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.object.ttl)
    }

    /// This node's identity; call [`finalize`](Self::finalize) first.
    pub fn self_addr(&self) -> &str {
        self.cluster.self_addr.as_deref().unwrap_or("")
    }

    /// Durable KV path; call [`finalize`](Self::finalize) first.
    pub fn db_path(&self) -> &str {
        self.storage.db.as_deref().unwrap_or("")
    }
}

/// Split a comma-separated peer list, dropping empty entries.
pub fn split_peers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parse a compound humane duration: `"250ms"`, `"90s"`, `"1h30m45s"`, `"2d"`.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let err = |reason: &str| ConfigError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let s = input.trim();
    if s.is_empty() {
        return Err(err("empty"));
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut value: u64 = 0;
        let mut digits = 0usize;
        while let Some(c) = chars.peek().copied() {
            if let Some(d) = c.to_digit(10) {
                value = value.saturating_mul(10).saturating_add(d as u64);
                digits += 1;
                chars.next();
            } else {
                break;
            }
        }
        if digits == 0 {
            return Err(err("expected a number"));
        }

        let mut unit = String::new();
        while let Some(c) = chars.peek().copied() {
            if c.is_ascii_alphabetic() {
                unit.push(c);
                chars.next();
            } else {
                break;
            }
        }
        let step = match unit.as_str() {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            "d" => Duration::from_secs(value.saturating_mul(86_400)),
            "" => return Err(err("missing unit")),
            _ => return Err(err("unknown unit")),
        };
        total += step;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.erasure.data, 3);
        assert_eq!(cfg.erasure.total, 5);
        assert_eq!(cfg.object.ttl, "24h");
        assert_eq!(cfg.storage.datadir, "data");
        assert_eq!(cfg.server.grpc_port, 50051);
        assert!(cfg.cluster.peers.is_empty());
    }

    #[test]
    fn test_load_from_file_roundtrip() {
        use std::io::Write;
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let toml = r#"
            [cluster]
            peers = ["localhost:50051", "localhost:50052"]
            self = "localhost:50051"

            [erasure]
            data = 4
            total = 6

            [object]
            ttl = "12h"

            [storage]
            datadir = "./frags"
            db = "./meta.redb"

            [server]
            grpc_port = 50051
            metrics_port = 9200
        "#;
        let mut f = tmp.reopen().expect("reopen");
        write!(f, "{}", toml).expect("write");

        let cfg = Config::load_from_file(tmp.path()).expect("load");
        assert_eq!(cfg.cluster.peers.len(), 2);
        assert_eq!(cfg.cluster.self_addr.as_deref(), Some("localhost:50051"));
        assert_eq!(cfg.erasure.data, 4);
        assert_eq!(cfg.erasure.total, 6);
        assert_eq!(cfg.object.ttl, "12h");
        assert_eq!(cfg.storage.db.as_deref(), Some("./meta.redb"));
        assert_eq!(cfg.server.metrics_port, 9200);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [erasure]
            data = 2
            total = 4
        "#,
        )
        .expect("parse");
        assert_eq!(cfg.erasure.data, 2);
        assert_eq!(cfg.server.grpc_port, 50051);
        assert_eq!(cfg.object.ttl, "24h");
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_env_from(|key| match key {
            "AVID_CLUSTER_PEERS" => Some("a:1, b:2".to_string()),
            "AVID_ERASURE_DATA" => Some("4".to_string()),
            "AVID_OBJECT_TTL" => Some("30m".to_string()),
            _ => None,
        })
        .expect("env");
        assert_eq!(cfg.cluster.peers, vec!["a:1", "b:2"]);
        assert_eq!(cfg.erasure.data, 4);
        assert_eq!(cfg.object.ttl, "30m");
        // untouched keys keep their defaults
        assert_eq!(cfg.erasure.total, 5);
    }

    #[test]
    fn test_env_override_bad_number() {
        let mut cfg = Config::default();
        let result = cfg.apply_env_from(|key| match key {
            "AVID_SERVER_GRPC_PORT" => Some("not-a-port".to_string()),
            _ => None,
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_finalize_derives_self_and_db() {
        let mut cfg = Config::default();
        cfg.cluster.peers = vec!["localhost:50052".to_string()];
        cfg.finalize();
        assert_eq!(cfg.self_addr(), "localhost:50051");
        assert!(cfg.cluster.peers.iter().any(|p| p == "localhost:50051"));
        assert_eq!(cfg.db_path(), "store-50051.redb");
    }

    #[test]
    fn test_finalize_keeps_explicit_self() {
        let mut cfg = Config::default();
        cfg.cluster.self_addr = Some("node-a:7000".to_string());
        cfg.cluster.peers = vec!["node-a:7000".to_string(), "node-b:7000".to_string()];
        cfg.finalize();
        assert_eq!(cfg.self_addr(), "node-a:7000");
        assert_eq!(cfg.cluster.peers.len(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_erasure() {
        let mut cfg = Config::default();
        cfg.erasure.data = 5;
        cfg.erasure.total = 5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidErasure { .. })
        ));
    }

    #[test]
    fn test_parse_duration_compound() {
        let d = parse_duration("1h30m45s").expect("parse");
        assert_eq!(d, Duration::from_secs(3600 + 30 * 60 + 45));
        assert_eq!(parse_duration("250ms").expect("parse"), Duration::from_millis(250));
        assert_eq!(parse_duration("24h").expect("parse"), Duration::from_secs(86_400));
        assert_eq!(parse_duration("2d").expect("parse"), Duration::from_secs(172_800));
    }

    #[test]
    fn test_parse_duration_missing_unit() {
        assert!(matches!(
            parse_duration("90"),
            Err(ConfigError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn test_parse_duration_invalid_char() {
        assert!(matches!(
            parse_duration("1x"),
            Err(ConfigError::InvalidDuration { .. })
        ));
        assert!(matches!(
            parse_duration("h1"),
            Err(ConfigError::InvalidDuration { .. })
        ));
    }
}
