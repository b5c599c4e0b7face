use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use parley_gateway::ConnectionSettings;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "your-secret-key",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PARLEY_JWT_SECRET is unset or still a placeholder")]
    MissingSecret,

    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("PARLEY_PING_INTERVAL_SECS ({ping}s) must be shorter than PARLEY_PONG_WAIT_SECS ({pong}s)")]
    PingNotBelowPong { ping: u64, pong: u64 },
}

/// Everything the server reads from its environment, validated once at
/// startup.
#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub connection: ConnectionSettings,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = lookup("PARLEY_JWT_SECRET").unwrap_or_default();
        if jwt_secret.trim().is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            return Err(ConfigError::MissingSecret);
        }

        let host = lookup("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse(&lookup, "PARLEY_PORT", 8082, "a port number")?;
        let db_path = lookup("PARLEY_DB_PATH").unwrap_or_else(|| "parley.db".into()).into();

        let ping = positive(&lookup, "PARLEY_PING_INTERVAL_SECS", 54)?;
        let pong = positive(&lookup, "PARLEY_PONG_WAIT_SECS", 60)?;
        if ping >= pong {
            return Err(ConfigError::PingNotBelowPong { ping, pong });
        }
        let write_wait = positive(&lookup, "PARLEY_WRITE_WAIT_SECS", 10)?;
        let max_message_size = positive(&lookup, "PARLEY_MAX_MESSAGE_BYTES", 512)?;
        let send_queue = positive(&lookup, "PARLEY_SEND_QUEUE", 256)?;
        let shutdown_grace: u64 = parse(&lookup, "PARLEY_SHUTDOWN_GRACE_SECS", 30, "a number of seconds")?;

        Ok(Self {
            host,
            port,
            db_path,
            jwt_secret,
            connection: ConnectionSettings {
                ping_interval: Duration::from_secs(ping),
                pong_wait: Duration::from_secs(pong),
                write_wait: Duration::from_secs(write_wait),
                max_message_size: max_message_size as usize,
                send_queue: send_queue as usize,
            },
            shutdown_grace: Duration::from_secs(shutdown_grace),
        })
    }

    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        let value = format!("{}:{}", self.host, self.port);
        value.parse().map_err(|_| ConfigError::Invalid {
            name: "PARLEY_HOST",
            value,
            expected: "an IP address",
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db_path", &self.db_path)
            .field("jwt_secret", &"<redacted>")
            .field("connection", &self.connection)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

fn parse<F, T>(lookup: &F, name: &'static str, default: T, expected: &'static str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
            expected,
        }),
    }
}

fn positive<F>(lookup: &F, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse(lookup, name, default, "a whole number")? {
        0 => Err(ConfigError::Zero(name)),
        n => Ok(n),
    }
}
