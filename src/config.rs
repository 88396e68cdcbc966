use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;

/// Runtime settings, read from `SLOTKEEPER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub utc_offset: FixedOffset,
    pub lock_timeout: Duration,
    /// Selects the Postgres store when set.
    pub database_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both SLOTKEEPER_TLS_CERT and SLOTKEEPER_TLS_KEY must be set, or neither")]
    PartialTls,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let tls_cert = get("SLOTKEEPER_TLS_CERT");
        let tls_key = get("SLOTKEEPER_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        let utc_offset = match get("SLOTKEEPER_UTC_OFFSET") {
            Some(v) => parse_offset(&v).ok_or(ConfigError::Invalid {
                var: "SLOTKEEPER_UTC_OFFSET",
                value: v,
            })?,
            None => FixedOffset::east_opt(0).ok_or(ConfigError::Invalid {
                var: "SLOTKEEPER_UTC_OFFSET",
                value: "+00:00".into(),
            })?,
        };

        Ok(Self {
            port: parsed(get("SLOTKEEPER_PORT"), "SLOTKEEPER_PORT")?.unwrap_or(5433),
            bind: get("SLOTKEEPER_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("SLOTKEEPER_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: get("SLOTKEEPER_PASSWORD").unwrap_or_else(|| "slotkeeper".into()),
            max_connections: parsed(get("SLOTKEEPER_MAX_CONNECTIONS"), "SLOTKEEPER_MAX_CONNECTIONS")?
                .unwrap_or(256),
            compact_threshold: parsed(get("SLOTKEEPER_COMPACT_THRESHOLD"), "SLOTKEEPER_COMPACT_THRESHOLD")?
                .unwrap_or(1000),
            metrics_port: parsed(get("SLOTKEEPER_METRICS_PORT"), "SLOTKEEPER_METRICS_PORT")?,
            tls_cert,
            tls_key,
            utc_offset,
            lock_timeout: Duration::from_millis(
                parsed(get("SLOTKEEPER_LOCK_TIMEOUT_MS"), "SLOTKEEPER_LOCK_TIMEOUT_MS")?.unwrap_or(5000),
            ),
            database_url: get("SLOTKEEPER_DATABASE_URL"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("schedule.wal")
    }
}

fn parsed<T: std::str::FromStr>(value: Option<String>, var: &'static str) -> Result<Option<T>, ConfigError> {
    match value {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: v }),
    }
}

/// `+HH:MM`, `-HH:MM`, `Z` or `UTC`.
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (h, m) = rest.split_once(':')?;
    let h: i32 = h.parse().ok()?;
    let m: i32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (h * 3600 + m * 60))
}
