use std::borrow::Cow;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio_postgres::config::Host;

use crate::error::ConfigError;

/// Top-level riskdash configuration, matching `riskdash.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashConfig {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub resolver: ResolverSection,
    #[serde(default)]
    pub batch: BatchSection,
}

impl DashConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.pool_size == 0 {
            return Err(ConfigError::Invalid("database.pool_size must be > 0".into()));
        }
        if self.batch.max_workers == 0 {
            return Err(ConfigError::Invalid("batch.max_workers must be > 0".into()));
        }
        if self.batch.chunk_size == 0 {
            return Err(ConfigError::Invalid("batch.chunk_size must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Postgres DSN. Empty means "embedded backend only".
    pub url: String,
    /// Namespace created on the client/server backend.
    pub schema: String,
    pub pool_size: u32,
    pub connect_timeout_secs: u64,
    pub sqlite_path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            schema: "riskdash".to_string(),
            pool_size: 4,
            connect_timeout_secs: 5,
            sqlite_path: PathBuf::from("dashboard.db"),
        }
    }
}

impl DatabaseSection {
    pub fn postgres_url(&self) -> Option<&str> {
        let url = self.url.trim();
        (!url.is_empty()).then_some(url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSection {
    /// Serialize concurrent resolves of the same (dataset, function, id).
    pub dedupe_inflight: bool,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            dedupe_inflight: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    pub max_workers: usize,
    pub chunk_size: usize,
    pub max_errors_per_chunk: usize,
    pub resume_dir: PathBuf,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            max_workers: 4,
            chunk_size: 100,
            max_errors_per_chunk: 10,
            resume_dir: PathBuf::from(".riskdash/progress"),
        }
    }
}

/// Shown in place of a connection string the driver cannot parse.
pub const UNPARSEABLE_DSN: &str = "<unparseable dsn>";

/// Render a connection string for logs and errors: user, hosts, ports and
/// database only.
///
/// URL and key/value forms both go through the driver's parser, so a
/// password never comes back out, whether it sits in the userinfo, in the
/// query string or in a quoted value.
pub fn redact_dsn(dsn: &str) -> String {
    let Ok(config) = strip_url_password(dsn).parse::<tokio_postgres::Config>() else {
        return UNPARSEABLE_DSN.to_string();
    };

    let ports = config.get_ports();
    let hosts: Vec<String> = config
        .get_hosts()
        .iter()
        .enumerate()
        .map(|(i, host)| {
            let name = match host {
                Host::Tcp(name) => name.clone(),
                #[cfg(unix)]
                Host::Unix(path) => path.display().to_string(),
            };
            let port = match ports {
                [only] => Some(only),
                _ => ports.get(i),
            };
            match port {
                Some(port) => format!("{name}:{port}"),
                None => name,
            }
        })
        .collect();

    let mut out = String::from("postgres://");
    if let Some(user) = config.get_user() {
        out.push_str(user);
        out.push('@');
    }
    out.push_str(&hosts.join(","));
    if let Some(dbname) = config.get_dbname() {
        out.push('/');
        out.push_str(dbname);
    }
    out
}

/// Drop the password from URL userinfo before parsing. The split is at the
/// last `@` ahead of the query, so a raw `@` inside a password stays on the
/// discarded side.
fn strip_url_password(dsn: &str) -> Cow<'_, str> {
    let Some(body) = ["postgres://", "postgresql://"]
        .iter()
        .find_map(|scheme| dsn.strip_prefix(scheme))
    else {
        return Cow::Borrowed(dsn);
    };
    let authority_end = body.find('?').unwrap_or(body.len());
    let Some(at) = body[..authority_end].rfind('@') else {
        return Cow::Borrowed(dsn);
    };
    let userinfo = &body[..at];
    let user = userinfo.split_once(':').map_or(userinfo, |(user, _)| user);
    let rest = &body[at + 1..];
    Cow::Owned(if user.is_empty() {
        format!("postgres://{rest}")
    } else {
        format!("postgres://{user}@{rest}")
    })
}
