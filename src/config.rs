//! Configuration for the entrypoint
//!
//! Everything is read once from environment variables at startup and passed
//! into each component at construction. Nothing reads the environment after
//! `Config::from_env` returns.
//!
//! | Variable                          | Default                                    |
//! |-----------------------------------|--------------------------------------------|
//! | `PORTIER_WAIT_FOR`                | none (comma-separated targets)             |
//! | `DATABASE_URL`                    | none (adds a `database` target)            |
//! | `PORTIER_WAIT_FOR_DATABASE`       | `true`                                     |
//! | `PORTIER_READINESS_TIMEOUT_SECS`  | `60`                                       |
//! | `PORTIER_POLL_INTERVAL_MS`        | `1000`                                     |
//! | `PORTIER_PROBE_TIMEOUT_MS`        | `2000`                                     |
//! | `PORTIER_PROBE_LOG_INTERVAL_SECS` | `10`                                       |
//! | `PORTIER_MIGRATE_COMMAND`         | `python manage.py migrate --noinput`       |
//! | `PORTIER_SKIP_MIGRATIONS`         | `false`                                    |
//! | `PORTIER_MIGRATE_TIMEOUT_SECS`    | none (wait until the migration exits)      |
//! | `PORTIER_SERVER_COMMAND`          | `python manage.py runserver 0.0.0.0:8000`  |
//! | `PORTIER_GRACE_PERIOD_SECS`       | `10`                                       |
//! | `PORTIER_STATUS_PORT`             | none (status server disabled)              |
//! | `PORTIER_LOG_FORMAT`              | `text`                                     |

use reqwest::Url;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_PROBE_LOG_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_MIGRATE_COMMAND: &str = "python manage.py migrate --noinput";
pub const DEFAULT_SERVER_COMMAND: &str = "python manage.py runserver 0.0.0.0:8000";

/// Name given to the target derived from `DATABASE_URL`
pub const DATABASE_TARGET_NAME: &str = "database";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}: {reason}")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },

    #[error("invalid dependency target {0:?}: {1}")]
    InvalidTarget(String, String),

    #[error("no server command configured")]
    MissingServerCommand,
}

/// A program and its arguments, executed directly (never through a shell)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Build from an argv-style list. Returns `None` for an empty list.
    pub fn from_argv(argv: Vec<String>) -> Option<Self> {
        let mut words = argv.into_iter();
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
        })
    }

    /// Parse a command from an environment value
    ///
    /// Accepts either a JSON array of strings (`["gunicorn", "app.wsgi"]`),
    /// which allows arguments containing spaces, or plain whitespace-separated
    /// words. A blank value yields `Ok(None)`.
    pub fn parse(raw: &str) -> Result<Option<Self>, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let words: Vec<String> = if trimmed.starts_with('[') {
            serde_json::from_str(trimmed).map_err(|e| format!("invalid JSON array: {}", e))?
        } else {
            trimmed.split_whitespace().map(str::to_string).collect()
        };

        match Self::from_argv(words) {
            Some(cmd) if !cmd.program.is_empty() => Ok(Some(cmd)),
            _ => Ok(None),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Http => write!(f, "http"),
        }
    }
}

/// A service that must accept connections before migrations run
///
/// For `Protocol::Tcp` the address is `host:port`; for `Protocol::Http` it
/// is the full URL to GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyTarget {
    pub name: String,
    pub address: String,
    pub protocol: Protocol,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
}

impl DependencyTarget {
    pub fn tcp(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            protocol: Protocol::Tcp,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Http,
            ..Self::tcp(name, url)
        }
    }

    pub fn with_timing(mut self, probe_timeout: Duration, poll_interval: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Parse one `PORTIER_WAIT_FOR` entry
    ///
    /// Accepted forms: `tcp://host:port`, `http://...`, `https://...` and a
    /// bare `host:port` (treated as tcp). The entry itself becomes the name.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let invalid = |reason: &str| ConfigError::InvalidTarget(raw.to_string(), reason.into());

        if raw.starts_with("http://") || raw.starts_with("https://") {
            Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
            return Ok(Self::http(raw, raw));
        }

        let address = raw.strip_prefix("tcp://").unwrap_or(raw);
        if address.contains("://") {
            return Err(invalid("unsupported scheme (use tcp, http or https)"));
        }
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        port.parse::<u16>()
            .map_err(|_| invalid("port is not a number between 0 and 65535"))?;

        Ok(Self::tcp(raw, address))
    }

    /// Derive a tcp target from a database connection URL
    ///
    /// Returns `Ok(None)` for URLs that have no network endpoint (sqlite).
    pub fn from_database_url(raw: &str) -> Result<Option<Self>, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            var: "DATABASE_URL".to_string(),
            value: redact_url(raw),
            reason,
        };

        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        let default_port = match url.scheme() {
            "sqlite" | "sqlite3" => return Ok(None),
            "postgres" | "postgresql" | "pgsql" | "postgis" => 5432,
            "mysql" | "mariadb" | "mysqlgis" => 3306,
            "redis" | "rediss" => 6379,
            other => match url.port() {
                Some(_) => 0,
                None => return Err(invalid(format!("no default port for scheme {:?}", other))),
            },
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let port = url.port().unwrap_or(default_port);

        Ok(Some(Self::tcp(
            DATABASE_TARGET_NAME,
            format!("{}:{}", host, port),
        )))
    }
}

impl fmt::Display for DependencyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {})", self.name, self.protocol, self.address)
    }
}

/// Strip credentials before a URL ends up in an error message
fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            let _ = url.set_password(None);
            let _ = url.set_username("");
            url.to_string()
        }
        Err(_) => "<unparseable>".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessConfig {
    pub targets: Vec<DependencyTarget>,
    pub overall_timeout: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    /// Minimum spacing between repeated failure logs for one target
    pub log_interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            overall_timeout: DEFAULT_READINESS_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            log_interval: DEFAULT_PROBE_LOG_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationConfig {
    /// `None` disables the migration stage
    pub command: Option<CommandSpec>,
    /// `None` waits for the migration however long it takes
    pub timeout: Option<Duration>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::parse(DEFAULT_MIGRATE_COMMAND).ok().flatten(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub command: CommandSpec,
    pub grace_period: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub readiness: ReadinessConfig,
    pub migration: MigrationConfig,
    pub supervisor: SupervisorConfig,
    pub status_port: Option<u16>,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from the process environment
    ///
    /// `argv` is the container's arguments after the binary name; when
    /// non-empty it is the server command.
    pub fn from_env(argv: Vec<String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), argv)
    }

    /// Load configuration from an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F, argv: Vec<String>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let mut readiness = ReadinessConfig {
            targets: Vec::new(),
            overall_timeout: env
                .secs("PORTIER_READINESS_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_READINESS_TIMEOUT),
            poll_interval: env
                .millis("PORTIER_POLL_INTERVAL_MS")?
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            probe_timeout: env
                .millis("PORTIER_PROBE_TIMEOUT_MS")?
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
            log_interval: env
                .secs("PORTIER_PROBE_LOG_INTERVAL_SECS")?
                .unwrap_or(DEFAULT_PROBE_LOG_INTERVAL),
        };
        if readiness.poll_interval.is_zero() {
            return Err(env.invalid("PORTIER_POLL_INTERVAL_MS", "must be greater than zero"));
        }

        if env.flag("PORTIER_WAIT_FOR_DATABASE")?.unwrap_or(true) {
            if let Some(url) = env.get("DATABASE_URL") {
                if let Some(target) = DependencyTarget::from_database_url(&url)? {
                    readiness.targets.push(target);
                }
            }
        }
        if let Some(list) = env.get("PORTIER_WAIT_FOR") {
            for entry in list.split(',').filter(|e| !e.trim().is_empty()) {
                readiness.targets.push(DependencyTarget::parse(entry)?);
            }
        }
        let (probe_timeout, poll_interval) = (readiness.probe_timeout, readiness.poll_interval);
        for target in &mut readiness.targets {
            target.probe_timeout = probe_timeout;
            target.poll_interval = poll_interval;
        }

        let migration = if env.flag("PORTIER_SKIP_MIGRATIONS")?.unwrap_or(false) {
            MigrationConfig {
                command: None,
                timeout: None,
            }
        } else {
            MigrationConfig {
                command: env
                    .command("PORTIER_MIGRATE_COMMAND")?
                    .unwrap_or_else(|| MigrationConfig::default().command),
                timeout: env.secs("PORTIER_MIGRATE_TIMEOUT_SECS")?,
            }
        };

        let command = match CommandSpec::from_argv(argv) {
            Some(cmd) => cmd,
            None => match env.command("PORTIER_SERVER_COMMAND")? {
                Some(Some(cmd)) => cmd,
                Some(None) => return Err(ConfigError::MissingServerCommand),
                None => CommandSpec::parse(DEFAULT_SERVER_COMMAND)
                    .ok()
                    .flatten()
                    .ok_or(ConfigError::MissingServerCommand)?,
            },
        };
        let supervisor = SupervisorConfig {
            command,
            grace_period: env
                .secs("PORTIER_GRACE_PERIOD_SECS")?
                .unwrap_or(DEFAULT_GRACE_PERIOD),
        };

        let status_port = match env.get("PORTIER_STATUS_PORT") {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u16>()
                    .map_err(|_| env.invalid("PORTIER_STATUS_PORT", "expected a port number"))?,
            ),
            None => None,
        };

        let log_format = match env.get("PORTIER_LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("") | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(_) => return Err(env.invalid("PORTIER_LOG_FORMAT", "expected text or json")),
        };

        Ok(Config {
            readiness,
            migration,
            supervisor,
            status_port,
            log_format,
        })
    }
}

/// Typed accessors over a lookup function
struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
    }

    fn invalid(&self, var: &str, reason: &str) -> ConfigError {
        ConfigError::InvalidValue {
            var: var.to_string(),
            value: self.get(var).unwrap_or_default(),
            reason: reason.to_string(),
        }
    }

    fn number(&self, var: &str) -> Result<Option<u64>, ConfigError> {
        match self.get(var) {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| self.invalid(var, "expected a non-negative integer")),
        }
    }

    fn secs(&self, var: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.number(var)?.map(Duration::from_secs))
    }

    fn millis(&self, var: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.number(var)?.map(Duration::from_millis))
    }

    fn flag(&self, var: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(var).as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some("1") | Some("true") | Some("yes") => Ok(Some(true)),
            Some("0") | Some("false") | Some("no") => Ok(Some(false)),
            Some(_) => Err(self.invalid(var, "expected true or false")),
        }
    }

    /// `None` when unset, `Some(None)` when set but blank
    fn command(&self, var: &str) -> Result<Option<Option<CommandSpec>>, ConfigError> {
        match self.get(var) {
            None => Ok(None),
            Some(raw) => CommandSpec::parse(&raw)
                .map(Some)
                .map_err(|reason| self.invalid(var, &reason)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "config_test.rs"]
mod tests;
