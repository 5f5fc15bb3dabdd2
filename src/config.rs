//! Process configuration, loaded from environment variables (§6.5).
//!
//! The core consumes a [`Config`] value; how it gets built is an outer
//! concern (CLI flags, a config file, orchestration secrets — all out of
//! scope per §1). `Config::from_env` is a minimal convenience for the binary
//! in `src/bin/server.rs`: a typed `from_env` constructor that fails closed
//! with a descriptive error rather than panicking on a malformed variable.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;

use crate::quota::QuotaLimits;

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for the SQLite file and the `thumbnails/` subdirectory.
    pub data_dir: PathBuf,
    /// Resource limits enforced by the quota guard (C2).
    pub quota: QuotaLimits,
    /// Address the HTTP/WS binary binds to.
    pub bind_addr: SocketAddr,
    /// Gates `details` in the API error envelope (§6.3).
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            quota: QuotaLimits::default(),
            bind_addr: "0.0.0.0:8080".parse().expect("valid default bind addr"),
            dev_mode: false,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset. Never panics; unparseable values are
    /// reported as a typed error.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();

        if let Ok(v) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BIND_ADDR") {
            config.bind_addr = v.parse().context("BIND_ADDR must be a socket address")?;
        }
        if let Ok(v) = std::env::var("DEV_MODE") {
            config.dev_mode = parse_bool(&v).context("DEV_MODE must be true/false")?;
        }

        macro_rules! env_usize {
            ($var:literal, $field:ident) => {
                if let Ok(v) = std::env::var($var) {
                    config.quota.$field = v.parse().context(concat!($var, " must be a number"))?;
                }
            };
        }
        env_usize!("MAX_NODES_PER_DIAGRAM", max_nodes_per_diagram);
        env_usize!("MAX_EDGES_PER_DIAGRAM", max_edges_per_diagram);
        env_usize!("MAX_GROUPS_PER_DIAGRAM", max_groups_per_diagram);
        env_usize!("MAX_SPEC_SIZE_BYTES", max_spec_size_bytes);
        env_usize!("MAX_DIAGRAMS_PER_USER", max_diagrams_per_user);
        env_usize!("MAX_MESSAGES_PER_DIAGRAM", max_messages_per_diagram);
        env_usize!("MAX_RELATIONSHIPS_PER_DIAGRAM", max_relationships_per_diagram);

        Ok(config)
    }

    /// Path to the SQLite database file under `data_dir`.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("diagrams.db")
    }

    /// Path to the thumbnail storage directory under `data_dir`.
    pub fn thumbnails_dir(&self) -> PathBuf {
        self.data_dir.join("thumbnails")
    }
}

fn parse_bool(v: &str) -> anyhow::Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("not a boolean: {other}"),
    }
}
