use anyhow::{Context, Result, bail};
use chrono::TimeDelta;
use clap::Parser;
use std::{env, str::FromStr};

/// Upper bound on compensating abort attempts. With exponential backoff from
/// 100 ms this keeps a failed `complete` under a minute.
pub const MAX_COMPENSATION_ATTEMPTS: u32 = 8;

/// Where upload sessions live between requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBackend {
    /// Process-local map; sessions are lost on restart.
    Memory,
    /// Shared SQLite tables, visible to every instance using the same database.
    Sqlite,
}

impl FromStr for SessionBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(SessionBackend::Memory),
            "sqlite" => Ok(SessionBackend::Sqlite),
            other => bail!("unknown session store `{}` (expected memory or sqlite)", other),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub session_store: SessionBackend,
    pub bucket: String,
    pub region: String,
    pub session_ttl: TimeDelta,
    pub compensation_attempts: u32,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Adaptive media upload service")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_SERVICE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_SERVICE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides UPLOAD_SERVICE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides UPLOAD_SERVICE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Session store: memory or sqlite (overrides UPLOAD_SERVICE_SESSION_STORE)
    #[arg(long)]
    pub session_store: Option<String>,

    /// Bucket name used for keys and public URLs (overrides UPLOAD_SERVICE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Region used in public URLs (overrides UPLOAD_SERVICE_REGION)
    #[arg(long)]
    pub region: Option<String>,

    /// Hours before an idle upload session is swept (overrides UPLOAD_SERVICE_SESSION_TTL_HOURS)
    #[arg(long)]
    pub session_ttl_hours: Option<i64>,

    /// Abort attempts after a failed completion (overrides UPLOAD_SERVICE_COMPENSATION_ATTEMPTS)
    #[arg(long)]
    pub compensation_attempts: Option<u32>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read and parse `name`, falling back to `default` when it is unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    fn merge(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("UPLOAD_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("UPLOAD_SERVICE_PORT", 3000u16)?;
        let env_storage =
            env::var("UPLOAD_SERVICE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("UPLOAD_SERVICE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/upload_sessions.db".into());
        let env_sessions =
            env::var("UPLOAD_SERVICE_SESSION_STORE").unwrap_or_else(|_| "memory".into());
        let env_bucket = env::var("UPLOAD_SERVICE_BUCKET").unwrap_or_else(|_| "media".into());
        let env_region = env::var("UPLOAD_SERVICE_REGION").unwrap_or_else(|_| "us-east-1".into());
        let env_ttl = env_parse("UPLOAD_SERVICE_SESSION_TTL_HOURS", 24i64)?;
        let env_attempts = env_parse("UPLOAD_SERVICE_COMPENSATION_ATTEMPTS", 3u32)?;

        // --- Merge ---
        let ttl_hours = args.session_ttl_hours.unwrap_or(env_ttl);
        if ttl_hours <= 0 {
            bail!("session TTL must be at least one hour");
        }
        let session_ttl = TimeDelta::try_hours(ttl_hours)
            .with_context(|| format!("session TTL of {} hours is out of range", ttl_hours))?;

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            session_store: args.session_store.unwrap_or(env_sessions).parse()?,
            bucket: args.bucket.unwrap_or(env_bucket),
            region: args.region.unwrap_or(env_region),
            session_ttl,
            compensation_attempts: args.compensation_attempts.unwrap_or(env_attempts),
        };

        if cfg.compensation_attempts == 0 || cfg.compensation_attempts > MAX_COMPENSATION_ATTEMPTS {
            bail!(
                "compensation attempts must be between 1 and {}",
                MAX_COMPENSATION_ATTEMPTS
            );
        }
        if cfg.bucket.trim().is_empty() {
            bail!("bucket name must not be empty");
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_take_precedence() {
        let args = Args::parse_from([
            "media-upload",
            "--port",
            "8081",
            "--session-store",
            "sqlite",
            "--bucket",
            "assets",
            "--session-ttl-hours",
            "2",
        ]);
        let cfg = AppConfig::merge(args).unwrap();
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.session_store, SessionBackend::Sqlite);
        assert_eq!(cfg.bucket, "assets");
        assert_eq!(cfg.session_ttl, TimeDelta::hours(2));
        assert!(cfg.addr().ends_with(":8081"));
    }

    #[test]
    fn rejects_out_of_range_durations() {
        let huge = i64::MAX.to_string();
        let huge_ttl = Args::parse_from(["media-upload", "--session-ttl-hours", huge.as_str()]);
        let err = AppConfig::merge(huge_ttl).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{}", err);

        let zero_ttl = Args::parse_from(["media-upload", "--session-ttl-hours", "0"]);
        assert!(AppConfig::merge(zero_ttl).is_err());

        let attempts = Args::parse_from(["media-upload", "--compensation-attempts", "40"]);
        let err = AppConfig::merge(attempts).unwrap_err();
        assert!(err.to_string().contains("compensation attempts"), "{}", err);
    }

    #[test]
    fn rejects_unknown_session_store() {
        assert!("redis".parse::<SessionBackend>().is_err());
        assert_eq!(
            " Memory ".parse::<SessionBackend>().unwrap(),
            SessionBackend::Memory
        );
    }
}
