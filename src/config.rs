//! 命令行参数、可选的 JSON 配置文件以及合并后的最终配置。

use clap::Parser;
use serde::Deserialize;
use shadow_rs::formatcp;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::build;
use crate::client::KeyMode;
use crate::quota::{Limits, LimitsError, OverflowPolicy};

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_STORAGE_DIR: &str = ".tempdrop/uploads";
pub const DEFAULT_LEDGER_PATH: &str = ".tempdrop/files.json";
pub const DEFAULT_MAX_STORAGE_GB: f64 = 10.0;
pub const DEFAULT_MAX_AGE_HOURS: f64 = 24.0;
pub const DEFAULT_CLIENT_LIMIT_GB: f64 = 1.0;
pub const DEFAULT_RATE_LIMIT_SECS: u64 = 0;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_STAGING_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RECENT_LIMIT: usize = 50;
pub const STAGING_CLEAN_INTERVAL_SECS: u64 = 900;
pub const THROTTLE_PRUNE_INTERVAL_SECS: u64 = 300;

/// 服务的命令行参数与环境变量配置。
#[derive(Parser, Debug)]
#[command(name = "tempdrop", version = VERSION_INFO, about = "Ephemeral file drop server")]
pub struct Args {
    #[arg(
        long,
        env = "TEMPDROP_CONFIG",
        help = "JSON config file (UPLOAD_DIR, FILES_DB, MAX_STORAGE_GB, ...)"
    )]
    pub config: Option<PathBuf>,
    #[arg(short = 's', long, env = "TEMPDROP_STORAGE_DIR", help = "Directory for uploaded blobs")]
    pub storage_dir: Option<PathBuf>,
    #[arg(long, env = "TEMPDROP_LEDGER", help = "Path of the upload ledger document")]
    pub ledger_path: Option<PathBuf>,
    #[arg(
        short = 'b',
        long,
        env = "TEMPDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "TEMPDROP_PORT",
        default_value_t = 54000,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(long, env = "TEMPDROP_MAX_STORAGE_GB", help = "Global storage ceiling in GB")]
    pub max_storage_gb: Option<f64>,
    #[arg(long, env = "TEMPDROP_MAX_AGE_HOURS", help = "Hours before an upload expires")]
    pub max_age_hours: Option<f64>,
    #[arg(long, env = "TEMPDROP_CLIENT_LIMIT_GB", help = "Per-client storage ceiling in GB")]
    pub client_limit_gb: Option<f64>,
    #[arg(
        long,
        env = "TEMPDROP_KEY_MODE",
        value_enum,
        default_value_t = KeyMode::Ip,
        help = "Bucket uploads by client IP or by upload token"
    )]
    pub key_mode: KeyMode,
    #[arg(
        long,
        env = "TEMPDROP_OVERFLOW",
        value_enum,
        default_value_t = OverflowPolicy::Evict,
        help = "Evict oldest uploads or reject when a client is over its limit"
    )]
    pub overflow: OverflowPolicy,
    #[arg(
        long,
        env = "TEMPDROP_RATE_LIMIT_SECS",
        help = "Minimum seconds between uploads per client (0 to disable)"
    )]
    pub rate_limit_secs: Option<u64>,
    #[arg(
        long,
        env = "TEMPDROP_CLEANUP_INTERVAL_SECS",
        help = "Seconds between background expiry sweeps (0 to disable)"
    )]
    pub cleanup_interval_secs: Option<u64>,
    #[arg(
        long,
        env = "TEMPDROP_STAGING_TTL_SECS",
        default_value_t = DEFAULT_STAGING_TTL_SECS,
        help = "Age after which abandoned staging files are removed (0 to disable)"
    )]
    pub staging_ttl_secs: u64,
    #[arg(
        long,
        env = "TEMPDROP_LOCK_TIMEOUT_SECS",
        default_value_t = DEFAULT_LOCK_WAIT_TIMEOUT_SECS,
        help = "Max seconds to wait for the ledger lock"
    )]
    pub lock_timeout_secs: u64,
    #[arg(
        long,
        env = "TEMPDROP_PUBLIC_URL",
        help = "Base URL used in download links (defaults to the request host)"
    )]
    pub public_url: Option<String>,
    #[arg(
        long,
        env = "TEMPDROP_RECENT_LIMIT",
        default_value_t = DEFAULT_RECENT_LIMIT,
        help = "Uploads listed on the status page"
    )]
    pub recent_limit: usize,
    #[arg(long, env = "TEMPDROP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
}

/// 部署用的 JSON 配置文件，沿用既有部署中的键名。
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FileConfig {
    pub upload_dir: Option<PathBuf>,
    pub files_db: Option<PathBuf>,
    pub max_storage_gb: Option<f64>,
    pub max_age_hours: Option<f64>,
    pub ip_limit_gb: Option<f64>,
    pub rate_limit_seconds: Option<u64>,
    pub cleanup_interval_seconds: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: FileConfig =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        // 相对路径以配置文件所在目录为基准
        if let Some(base) = path.parent() {
            config.upload_dir = config.upload_dir.map(|dir| base.join(dir));
            config.files_db = config.files_db.map(|db| base.join(db));
        }
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
    #[error(transparent)]
    Limits(#[from] LimitsError),
}

impl From<ConfigError> for io::Error {
    fn from(err: ConfigError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
    }
}

/// 合并后的配置：参数或环境变量优先，其次配置文件，最后默认值。
#[derive(Debug, Clone)]
pub struct Settings {
    pub storage_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub limits: Limits,
    pub key_mode: KeyMode,
    pub rate_limit: Duration,
    pub cleanup_interval: Duration,
    pub staging_ttl: Duration,
    pub lock_timeout: Duration,
    pub public_url: Option<String>,
    pub recent_limit: usize,
}

impl Settings {
    pub fn resolve(args: &Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    fn merge(args: &Args, file: FileConfig) -> Result<Self, ConfigError> {
        let limits = Limits::from_settings(
            args.max_storage_gb
                .or(file.max_storage_gb)
                .unwrap_or(DEFAULT_MAX_STORAGE_GB),
            args.client_limit_gb
                .or(file.ip_limit_gb)
                .unwrap_or(DEFAULT_CLIENT_LIMIT_GB),
            args.max_age_hours
                .or(file.max_age_hours)
                .unwrap_or(DEFAULT_MAX_AGE_HOURS),
            args.overflow,
        )?;

        let public_url = args
            .public_url
            .as_deref()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        let storage_dir = args
            .storage_dir
            .clone()
            .or(file.upload_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));
        let ledger_path = args
            .ledger_path
            .clone()
            .or(file.files_db)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER_PATH));
        // 存储目录里的普通文件都会被当作 Blob 列出、下载和对账删除
        if let Some(parent) = ledger_path.parent()
            && absolute_dir(parent) == absolute_dir(&storage_dir)
        {
            return Err(ConfigError::Invalid(format!(
                "ledger {} must not live inside the storage directory {}",
                ledger_path.display(),
                storage_dir.display()
            )));
        }

        Ok(Self {
            storage_dir,
            ledger_path,
            limits,
            key_mode: args.key_mode,
            rate_limit: Duration::from_secs(
                args.rate_limit_secs
                    .or(file.rate_limit_seconds)
                    .unwrap_or(DEFAULT_RATE_LIMIT_SECS),
            ),
            cleanup_interval: Duration::from_secs(
                args.cleanup_interval_secs
                    .or(file.cleanup_interval_seconds)
                    .unwrap_or(DEFAULT_CLEANUP_INTERVAL_SECS),
            ),
            staging_ttl: Duration::from_secs(args.staging_ttl_secs),
            lock_timeout: Duration::from_secs(args.lock_timeout_secs),
            public_url,
            recent_limit: args.recent_limit,
        })
    }
}

fn absolute_dir(path: &Path) -> PathBuf {
    let path = if path.as_os_str().is_empty() {
        Path::new(".")
    } else {
        path
    };
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["tempdrop"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("parse args")
    }

    #[test]
    fn defaults_apply_without_flags_or_file() {
        let settings = Settings::merge(&args(&[]), FileConfig::default()).expect("settings");
        assert_eq!(settings.limits.global_cap_bytes, 10 * GIB);
        assert_eq!(settings.limits.client_cap_bytes, GIB);
        assert_eq!(settings.limits.max_age, Duration::from_secs(24 * 3600));
        assert_eq!(settings.limits.policy, OverflowPolicy::Evict);
        assert_eq!(settings.key_mode, KeyMode::Ip);
        assert_eq!(settings.cleanup_interval, Duration::from_secs(300));
        assert!(settings.rate_limit.is_zero());
    }

    #[test]
    fn file_values_apply_and_flags_win() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            br#"{"UPLOAD_DIR": "uploads", "FILES_DB": "files.json", "MAX_STORAGE_GB": 2,
                "MAX_AGE_HOURS": 0.5, "IP_LIMIT_GB": 0.25, "RATE_LIMIT_SECONDS": 30}"#,
        )
        .expect("write");
        let file = FileConfig::load(&path).expect("load");

        let settings = Settings::merge(
            &args(&["--max-storage-gb", "4", "--overflow", "reject", "--key-mode", "token"]),
            file,
        )
        .expect("settings");
        assert_eq!(settings.storage_dir, temp.path().join("uploads"));
        assert_eq!(settings.ledger_path, temp.path().join("files.json"));
        assert_eq!(settings.limits.global_cap_bytes, 4 * GIB);
        assert_eq!(settings.limits.client_cap_bytes, GIB / 4);
        assert_eq!(settings.limits.max_age, Duration::from_secs(1800));
        assert_eq!(settings.limits.policy, OverflowPolicy::Reject);
        assert_eq!(settings.key_mode, KeyMode::Token);
        assert_eq!(settings.rate_limit, Duration::from_secs(30));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let result = Settings::merge(&args(&["--max-age-hours=-1"]), FileConfig::default());
        assert!(matches!(
            result,
            Err(ConfigError::Limits(LimitsError::InvalidAge(_)))
        ));

        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        std::fs::write(&path, b"[1, 2").expect("write");
        assert!(matches!(
            FileConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn public_url_is_normalized() {
        let settings = Settings::merge(
            &args(&["--public-url", "https://dl.example.com/"]),
            FileConfig::default(),
        )
        .expect("settings");
        assert_eq!(settings.public_url.as_deref(), Some("https://dl.example.com"));
    }

    #[test]
    fn ledger_inside_storage_dir_is_rejected() {
        let result = Settings::merge(
            &args(&["--storage-dir", "data", "--ledger-path", "./data/files.json"]),
            FileConfig::default(),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        std::fs::write(&path, br#"{"UPLOAD_DIR": "uploads", "FILES_DB": "uploads/files.json"}"#)
            .expect("write");
        let file = FileConfig::load(&path).expect("load");
        assert!(matches!(
            Settings::merge(&args(&[]), file),
            Err(ConfigError::Invalid(_))
        ));

        let nested = Settings::merge(
            &args(&["--storage-dir", "data/blobs", "--ledger-path", "data/files.json"]),
            FileConfig::default(),
        );
        assert!(nested.is_ok());
    }
}
