//! Exporter configuration.
//!
//! The main file is TOML with one table per target. Each target points at
//! one or more query files (also TOML) whose paths are relative to the main
//! file:
//!
//! ```toml
//! [production]
//! host = "db1.example.com"
//! port = 5432
//! user = "exporter"
//! password = "secret"
//! dbname = "postgres"
//! sslmode = "require"
//! workers = 2
//! statement_timeout = "5s"
//! query_files = ["queries/basic.toml"]
//!
//! [production.labels]
//! env = "prod"
//! ```

pub mod query;
pub mod version;

pub use query::{Metric, Query, Usage};
pub use version::{ServerVersion, VersionedSql};

use anyhow::{Context, Result};
use duration_str::deserialize_option_duration;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// `application_name` reported to the server.
pub const APPLICATION_NAME: &str = "pg_prometheus_exporter";

fn default_host() -> String {
    "localhost".to_string()
}

const fn default_port() -> u16 {
    5432
}

fn default_sslmode() -> String {
    "prefer".to_string()
}

const fn default_workers() -> i64 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetDef {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    user: String,
    password: Option<SecretString>,
    #[serde(default)]
    dbname: String,
    #[serde(default = "default_sslmode")]
    sslmode: String,
    #[serde(default = "default_workers")]
    workers: i64,
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    statement_timeout: Option<Duration>,
    #[serde(default)]
    skip_version_detection: bool,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    query_files: Vec<PathBuf>,
}

/// One database endpoint and the queries to run against it.
#[derive(Debug)]
pub struct Target {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<SecretString>,
    pub dbname: String,
    pub sslmode: String,
    pub workers: usize,
    pub statement_timeout: Option<Duration>,
    pub skip_version_detection: bool,
    pub labels: Arc<HashMap<String, String>>,
    pub queries: Vec<Arc<Query>>,
}

impl Target {
    /// A target with default connection settings and no queries.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: default_host(),
            port: default_port(),
            user: String::new(),
            password: None,
            dbname: String::new(),
            sslmode: default_sslmode(),
            workers: 1,
            statement_timeout: None,
            skip_version_detection: false,
            labels: Arc::new(HashMap::new()),
            queries: Vec::new(),
        }
    }

    /// Physical instance key; targets on the same `host:port` share a
    /// detected version.
    #[must_use]
    pub fn instance(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn from_def(name: String, def: TargetDef, base_dir: &Path) -> Result<Self> {
        let mut queries = Vec::new();

        for file in &def.query_files {
            let path = base_dir.join(file);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("could not open query file {}", path.display()))?;
            let parsed = query::parse_queries(&content)
                .with_context(|| format!("could not decode query file {}", path.display()))?;

            debug!(target_name = %name, file = %path.display(), queries = parsed.len(), "loaded query file");

            queries.extend(parsed.into_iter().map(Arc::new));
        }

        Ok(Self {
            name,
            host: def.host,
            port: def.port,
            user: def.user,
            password: def.password,
            dbname: def.dbname,
            sslmode: def.sslmode,
            workers: usize::try_from(def.workers)
                .ok()
                .filter(|w| *w > 0)
                .unwrap_or(1),
            statement_timeout: def.statement_timeout.filter(|d| !d.is_zero()),
            skip_version_detection: def.skip_version_detection,
            labels: Arc::new(def.labels.into_iter().collect()),
            queries,
        })
    }
}

#[derive(Debug, Default)]
pub struct Config {
    targets: Vec<Target>,
}

impl Config {
    #[must_use]
    pub const fn new(targets: Vec<Target>) -> Self {
        Self { targets }
    }

    /// Load the main config file and every query file it references.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or decoded.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not open config file {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        Self::from_toml(&content, base_dir)
            .with_context(|| format!("could not load config file {}", path.display()))
    }

    /// Parse a main config, resolving query files against `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a query file fails to load.
    pub fn from_toml(content: &str, base_dir: &Path) -> Result<Self> {
        let defs: BTreeMap<String, TargetDef> = toml::from_str(content)?;

        let targets = defs
            .into_iter()
            .map(|(name, def)| Target::from_def(name, def, base_dir))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { targets })
    }

    #[must_use]
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }
}
