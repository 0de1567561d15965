//! Connection and shell configuration.
//!
//! Connection parameters come from a `postgres://` URI or from individual
//! flags with libpq-style environment fallbacks. Shell preferences come from
//! an optional TOML file.

use crate::error::{SessionError, SessionResult};
use crate::output::OutputFormat;
use pgshell_pg::{ConnectOptions, SslMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_PORT: u16 = 5432;
const MAX_URI_LEN: usize = 2048;
const UNSAFE_CHARS: &[char] = &[';', '&', '|', '<', '>', '"', '\'', '`'];

/// Database connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub ssl_mode: SslMode,
}

/// Connection values given as individual command-line flags.
#[derive(Debug, Clone, Default)]
pub struct ConnectionFlags {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub ssl_mode: Option<SslMode>,
}

fn config_err(msg: impl Into<String>) -> SessionError {
    SessionError::Config(msg.into())
}

impl DbConfig {
    /// Parse a `postgres://` or `postgresql://` URI.
    pub fn from_uri(uri: &str) -> SessionResult<Self> {
        if uri.is_empty() {
            return Err(config_err("URI cannot be empty"));
        }
        if uri.len() > MAX_URI_LEN {
            return Err(config_err(format!(
                "URI too long (max {} characters)",
                MAX_URI_LEN
            )));
        }
        if !uri.starts_with("postgresql://") && !uri.starts_with("postgres://") {
            return Err(config_err(
                "invalid PostgreSQL URI: must start with postgresql:// or postgres://",
            ));
        }

        let url = Url::parse(uri)
            .map_err(|e| config_err(format!("failed to parse PostgreSQL URI: {}", e)))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| config_err("invalid PostgreSQL URI: hostname is required"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let database = percent_decode(url.path().trim_start_matches('/'))?;
        if database.is_empty() {
            return Err(config_err("invalid PostgreSQL URI: database name is required"));
        }
        if database.contains(UNSAFE_CHARS) {
            return Err(config_err("invalid database name: contains unsafe characters"));
        }

        let port = match url.port() {
            Some(0) => {
                return Err(config_err(
                    "invalid port in URI: must be between 1 and 65535",
                ));
            }
            Some(port) => port,
            None => DEFAULT_PORT,
        };

        let user = percent_decode(url.username())?;
        if user.is_empty() && has_userinfo(uri) {
            return Err(config_err("invalid PostgreSQL URI: username cannot be empty"));
        }
        if user.contains(UNSAFE_CHARS) {
            return Err(config_err("invalid username: contains unsafe characters"));
        }
        let password = url.password().map(percent_decode).transpose()?;

        let mut ssl_mode = SslMode::default();
        for (key, value) in url.query_pairs() {
            if key == "sslmode" {
                ssl_mode = value.parse().map_err(SessionError::Config)?;
            }
        }

        Ok(Self {
            host,
            port,
            database,
            user,
            password,
            ssl_mode,
        })
    }

    /// Build from flags, falling back to `PGHOST`, `PGPORT`, `PGUSER` (then
    /// `USER`), `PGPASSWORD`, `PGDATABASE` and `PGSSLMODE` via `env`.
    ///
    /// Empty environment values count as unset. An unparsable `PGPORT` is
    /// ignored.
    pub fn from_flags<F>(flags: &ConnectionFlags, env: F) -> SessionResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.is_empty());

        let ssl_mode = match (flags.ssl_mode, env("PGSSLMODE")) {
            (Some(mode), _) => mode,
            (None, Some(mode)) => mode.parse().map_err(SessionError::Config)?,
            (None, None) => SslMode::default(),
        };

        Ok(Self {
            host: flags
                .host
                .clone()
                .or_else(|| env("PGHOST"))
                .unwrap_or_else(|| "localhost".to_string()),
            port: flags
                .port
                .or_else(|| env("PGPORT").and_then(|p| p.parse().ok()))
                .unwrap_or(DEFAULT_PORT),
            database: flags
                .database
                .clone()
                .or_else(|| env("PGDATABASE"))
                .unwrap_or_default(),
            user: flags
                .user
                .clone()
                .or_else(|| env("PGUSER"))
                .or_else(|| env("USER"))
                .unwrap_or_default(),
            password: flags.password.clone().or_else(|| env("PGPASSWORD")),
            ssl_mode,
        })
    }

    /// Check that the fields needed to connect are present.
    pub fn validate(&self) -> SessionResult<()> {
        if self.host.is_empty() {
            return Err(config_err("database host is required"));
        }
        if self.user.is_empty() {
            return Err(config_err("database user is required"));
        }
        if self.database.is_empty() {
            return Err(config_err("database name is required"));
        }
        Ok(())
    }

    /// URI for display and logs, with the password replaced by `***`.
    pub fn masked_uri(&self) -> String {
        let userinfo = match (&self.user, &self.password) {
            (user, _) if user.is_empty() => String::new(),
            (user, Some(password)) if !password.is_empty() => format!("{}:***@", user),
            (user, _) => format!("{}@", user),
        };

        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let authority = if self.port == DEFAULT_PORT {
            host
        } else {
            format!("{}:{}", host, self.port)
        };

        let mut uri = format!("postgresql://{}{}/{}", userinfo, authority, self.database);
        if self.ssl_mode != SslMode::Prefer {
            uri.push_str("?sslmode=");
            uri.push_str(self.ssl_mode.as_str());
        }
        uri
    }

    /// Driver options for this configuration.
    pub fn connect_options(&self, settings: &Settings) -> ConnectOptions {
        let mut opts = ConnectOptions::new(&self.host, self.port, &self.user, &self.database);
        opts.password = self.password.clone();
        opts.ssl_mode = self.ssl_mode;
        opts.application_name = Some(settings.application_name.clone());
        opts.connect_timeout = settings.connect_timeout();
        opts
    }
}

/// True when the authority part of `uri` carries an `@`.
fn has_userinfo(uri: &str) -> bool {
    let rest = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(uri);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    authority.contains('@')
}

fn percent_decode(input: &str) -> SessionResult<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| config_err(format!("invalid percent-encoding in '{}'", input)))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| config_err(format!("'{}' is not valid UTF-8", input)))
}

/// Shell preferences loaded from `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Readline history file; defaults to `~/.pgshell_history`.
    pub history_file: Option<PathBuf>,
    /// Seconds to wait for the connection; 0 waits forever.
    pub connect_timeout_secs: u64,
    pub format: OutputFormat,
    pub application_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            history_file: None,
            connect_timeout_secs: 10,
            format: OutputFormat::Table,
            application_name: "pgshell".to_string(),
        }
    }
}

impl Settings {
    /// `<config_dir>/pgshell/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pgshell").join("config.toml"))
    }

    /// Load `path`, or the default location when it exists, or defaults.
    pub fn load(path: Option<&Path>) -> SessionResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.is_file() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&path).map_err(|e| {
            config_err(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| config_err(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs))
    }

    pub fn history_path(&self) -> Option<PathBuf> {
        self.history_file
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".pgshell_history")))
    }
}
