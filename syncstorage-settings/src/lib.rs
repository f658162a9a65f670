//! Application settings: loaded from an optional config file, then from
//! `SYNC_`-prefixed environment variables (`__`-separated for nesting), the
//! same two-stage `config::Config` pipeline the teacher uses for its own
//! settings crates.

#[macro_use]
extern crate slog_scope;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use syncstorage_common::hkdf_expand_32;

static PREFIX: &str = "sync";

static KILOBYTE: u32 = 1024;
static MEGABYTE: u32 = KILOBYTE * KILOBYTE;

static DEFAULT_LIMIT_MAX_REQUEST_BYTES: u32 = 2 * MEGABYTE + 4 * KILOBYTE;
static DEFAULT_LIMIT_MAX_BSO_GET_LIMIT: u32 = 2500;
static DEFAULT_LIMIT_MAX_POST_BYTES: u32 = 2 * MEGABYTE;
static DEFAULT_LIMIT_MAX_POST_RECORDS: u32 = 100;
static DEFAULT_LIMIT_MAX_TOTAL_BYTES: u32 = 20 * MEGABYTE;
static DEFAULT_LIMIT_MAX_TOTAL_RECORDS: u32 = 1000;
static DEFAULT_LIMIT_MAX_BATCH_TTL: u32 = 7200;

static DEFAULT_POOL_SIZE: u32 = 25;
static DEFAULT_POOL_PURGE_MIN_HOURS: u32 = 168;
static DEFAULT_POOL_PURGE_MAX_HOURS: u32 = 336;

/// Server-enforced limits on request/payload sizes, mirroring
/// `syncstorage-settings::ServerLimits` but renamed to match the `LIMIT_*`
/// environment variables this server actually exposes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_requests_bytes: u32,
    pub max_bso_get_limit: u32,
    pub max_post_bytes: u32,
    pub max_post_records: u32,
    pub max_total_bytes: u32,
    pub max_total_records: u32,
    /// Batch TTL ceiling, in seconds.
    pub max_batch_ttl: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_requests_bytes: DEFAULT_LIMIT_MAX_REQUEST_BYTES,
            max_bso_get_limit: DEFAULT_LIMIT_MAX_BSO_GET_LIMIT,
            max_post_bytes: DEFAULT_LIMIT_MAX_POST_BYTES,
            max_post_records: DEFAULT_LIMIT_MAX_POST_RECORDS,
            max_total_bytes: DEFAULT_LIMIT_MAX_TOTAL_BYTES,
            max_total_records: DEFAULT_LIMIT_MAX_TOTAL_RECORDS,
            max_batch_ttl: DEFAULT_LIMIT_MAX_BATCH_TTL,
        }
    }
}

/// Pool/dispatcher sizing and maintenance scheduling knobs.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Pool {
    /// Number of shards (and therefore `Pool`s / maintenance workers).
    /// Defaults to the CPU count, like the teacher auto-sizes
    /// `ACTIX_THREADPOOL`.
    pub num: u32,
    /// Max number of simultaneously-open database files per shard.
    pub size: u32,
    /// Reclaim a user's file via `VACUUM` once its free space exceeds this
    /// many KB. Zero disables vacuuming.
    pub vacuum_kb: u32,
    pub purge_min_hours: u32,
    pub purge_max_hours: u32,
}

impl Default for Pool {
    fn default() -> Self {
        Pool {
            num: num_cpus::get() as u32,
            size: DEFAULT_POOL_SIZE,
            vacuum_kb: 0,
            purge_min_hours: DEFAULT_POOL_PURGE_MIN_HOURS,
            purge_max_hours: DEFAULT_POOL_PURGE_MAX_HOURS,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Root directory under which every user's database file is created.
    /// `:memory:` is accepted for tests (each user gets its own in-memory
    /// connection rather than a file).
    pub data_dir: String,
    /// Ordered list of shared secrets for bearer token verification, most
    /// recent first. Parsed from a single `SYNC_SECRETS` CSV string.
    pub secrets: Secrets,
    pub hostname: Option<String>,

    pub log_level: String,
    pub log_mozlog: bool,
    pub log_disable_http: bool,

    pub limits: Limits,
    pub pool: Pool,

    /// MB of in-memory `info/collections` response caching performed by the
    /// (out of scope) HTTP layer; 0 disables it. Carried here only so that
    /// layer can read a single source of truth for its cache size.
    pub info_cache_size: u32,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            host: "0.0.0.0".to_string(),
            port: 8000,
            data_dir: "./data".to_string(),
            secrets: Secrets::default(),
            hostname: None,
            log_level: "info".to_string(),
            log_mozlog: true,
            log_disable_http: false,
            limits: Limits::default(),
            pool: Pool::default(),
            info_cache_size: 0,
        }
    }
}

impl Settings {
    /// Load settings from an optional config file, then from
    /// `SYNC_`-prefixed environment variables.
    pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut s = Config::default();

        if let Some(config_filename) = filename {
            s.merge(File::with_name(config_filename))?;
        }

        s.merge(Environment::with_prefix(&PREFIX.to_uppercase()).separator("__"))?;

        match s.try_into::<Self>() {
            Ok(mut settings) => {
                settings.normalize();
                Ok(settings)
            }
            Err(ConfigError::Message(v)) => {
                println!("Bad configuration: {:?}", &v);
                println!("Please set in config file or use environment variable.");
                println!(
                    "For example to set `data_dir` use env var `{}_DATA_DIR`\n",
                    PREFIX.to_uppercase()
                );
                error!("Configuration error: value undefined {:?}", &v);
                Err(ConfigError::NotFound(v))
            }
            Err(e) => {
                error!("Configuration error: {:?}", &e);
                Err(e)
            }
        }
    }

    fn normalize(&mut self) {
        if self.pool.num == 0 {
            self.pool.num = num_cpus::get().max(1) as u32;
        }
        if self.pool.purge_min_hours > self.pool.purge_max_hours {
            std::mem::swap(&mut self.pool.purge_min_hours, &mut self.pool.purge_max_hours);
        }
    }

    #[cfg(debug_assertions)]
    pub fn test_settings() -> Self {
        let mut settings =
            Self::with_env_and_config_file(None).expect("could not build test settings");
        settings.data_dir = ":memory:".to_string();
        settings.pool.num = 1;
        settings.pool.size = 5;
        settings
    }

    pub fn banner(&self) -> String {
        format!(
            "http://{}:{} (data_dir={}, shards={})",
            self.host, self.port, self.data_dir, self.pool.num
        )
    }
}

/// The rotating set of shared secrets used to verify bearer tokens, most
/// recent first. Deserialized from a single CSV environment variable the
/// way the teacher's `Secrets` deserializes a single master-secret string.
#[derive(Clone, Debug, Default)]
pub struct Secrets {
    pub values: Vec<String>,
}

impl Secrets {
    pub fn new(csv: &str) -> Result<Self, String> {
        let values: Vec<String> = csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        if values.is_empty() {
            return Err("at least one secret is required".to_owned());
        }
        Ok(Secrets { values })
    }

    /// Derives the signing secret for the most recent (first) shared
    /// secret, using the same HKDF info string as the rest of the token
    /// subsystem.
    pub fn signing_secret(&self) -> Result<[u8; 32], String> {
        let current = self
            .values
            .first()
            .ok_or_else(|| "no secrets configured".to_owned())?;
        hkdf_expand_32(
            b"services.mozilla.com/tokenlib/v1/signing",
            None,
            current.as_bytes(),
        )
    }
}

impl<'d> Deserialize<'d> for Secrets {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'d>,
    {
        let csv: String = Deserialize::deserialize(deserializer)?;
        Secrets::new(&csv).map_err(|e| serde::de::Error::custom(format!("bad secrets: {}", e)))
    }
}

#[cfg(test)]
mod test {
    use std::env;

    use super::*;

    #[test]
    fn test_environment_variable_prefix() {
        env::set_var("SYNC_SECRETS", "testing-secret");
        env::set_var("SYNC_POOL__SIZE", "42");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        assert_eq!(settings.pool.size, 42);
        assert_eq!(settings.secrets.values, vec!["testing-secret".to_string()]);
        env::remove_var("SYNC_SECRETS");
        env::remove_var("SYNC_POOL__SIZE");
    }

    #[test]
    fn secrets_parses_csv_in_order() {
        let secrets = Secrets::new("current-secret, previous-secret").unwrap();
        assert_eq!(secrets.values, vec!["current-secret", "previous-secret"]);
    }

    #[test]
    fn secrets_rejects_empty() {
        assert!(Secrets::new("").is_err());
    }

    #[test]
    fn normalize_swaps_inverted_purge_window() {
        let mut settings = Settings::default();
        settings.pool.purge_min_hours = 400;
        settings.pool.purge_max_hours = 168;
        settings.normalize();
        assert_eq!(settings.pool.purge_min_hours, 168);
        assert_eq!(settings.pool.purge_max_hours, 400);
    }
}
