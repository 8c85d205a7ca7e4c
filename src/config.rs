#![forbid(unsafe_code)]

//! Runtime settings: CLI overrides, then process environment, then a `.env`
//! file, then built-in defaults. Blank values count as unset.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{extractor::DEFAULT_YTDLP_BIN, jobs::DEFAULT_MAX_RUNNING};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const DEFAULT_PORT: u16 = 5000;

const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_SERVE_TIMEOUT_SECS: u64 = 60 * 60;
const DEFAULT_STALE_AFTER_SECS: u64 = 6 * 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_JOB_TTL_SECS: u64 = 60 * 60;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub host: IpAddr,
    pub port: u16,
    pub temp_root: PathBuf,
    pub www_root: Option<PathBuf>,
    pub ytdlp: PathBuf,
    pub socket_timeout: Duration,
    pub probe_timeout: Duration,
    pub download_timeout: Duration,
    pub serve_timeout: Duration,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub job_ttl: Duration,
    pub max_running_jobs: usize,
    pub allow_root: bool,
}

impl RuntimeConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Values supplied on the command line. They win over everything else.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub temp_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub ytdlp: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config(&file_vars, env_var_string, overrides)
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let host = match non_blank(overrides.host).or_else(|| lookup("TUBEGRAB_HOST")) {
        Some(raw) => raw
            .parse::<IpAddr>()
            .with_context(|| format!("TUBEGRAB_HOST {raw:?} is not an IP address"))?,
        None => DEFAULT_HOST,
    };
    let port = overrides
        .port
        .or_else(|| parse_u16(lookup("TUBEGRAB_PORT")))
        .or_else(|| parse_u16(lookup("PORT")))
        .unwrap_or(DEFAULT_PORT);
    let temp_root = overrides
        .temp_root
        .or_else(|| lookup("TUBEGRAB_TEMP_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| env::temp_dir().join("tubegrab"));
    let www_root = overrides
        .www_root
        .or_else(|| lookup("TUBEGRAB_WWW_ROOT").map(PathBuf::from));
    let ytdlp = overrides
        .ytdlp
        .or_else(|| lookup("TUBEGRAB_YTDLP").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));
    let secs = |key: &str, default: u64| {
        Duration::from_secs(
            lookup(key)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(default),
        )
    };

    Ok(RuntimeConfig {
        host,
        port,
        temp_root,
        www_root,
        ytdlp,
        socket_timeout: secs("TUBEGRAB_SOCKET_TIMEOUT_SECS", DEFAULT_SOCKET_TIMEOUT_SECS),
        probe_timeout: secs("TUBEGRAB_PROBE_TIMEOUT_SECS", DEFAULT_PROBE_TIMEOUT_SECS),
        download_timeout: secs(
            "TUBEGRAB_DOWNLOAD_TIMEOUT_SECS",
            DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        ),
        serve_timeout: secs("TUBEGRAB_SERVE_TIMEOUT_SECS", DEFAULT_SERVE_TIMEOUT_SECS),
        stale_after: secs("TUBEGRAB_STALE_AFTER_SECS", DEFAULT_STALE_AFTER_SECS),
        sweep_interval: secs("TUBEGRAB_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
        job_ttl: secs("TUBEGRAB_JOB_TTL_SECS", DEFAULT_JOB_TTL_SECS),
        max_running_jobs: lookup("TUBEGRAB_MAX_RUNNING_JOBS")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_RUNNING)
            .max(1),
        allow_root: lookup("TUBEGRAB_ALLOW_ROOT").is_some_and(|value| is_truthy(&value)),
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u16(value: Option<String>) -> Option<u16> {
    value.and_then(|value| value.parse::<u16>().ok())
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| non_blank(file_vars.get(key).cloned()))
}

/// Parses `KEY=value` lines, accepting `export` prefixes, single or double
/// quotes and `#` comments. A missing file is treated as empty.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(value_raw.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| {
            value
                .strip_prefix(quote)
                .and_then(|inner| inner.strip_suffix(quote))
        })
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> RuntimeConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, |_| None, RuntimeOverrides::default()).unwrap()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from("");
        assert_eq!(config.bind_addr().to_string(), "127.0.0.1:5000");
        assert_eq!(config.temp_root, env::temp_dir().join("tubegrab"));
        assert!(config.www_root.is_none());
        assert_eq!(config.ytdlp, PathBuf::from("yt-dlp"));
        assert_eq!(config.socket_timeout, Duration::from_secs(10));
        assert_eq!(config.probe_timeout, Duration::from_secs(120));
        assert_eq!(config.download_timeout, Duration::from_secs(1800));
        assert_eq!(config.serve_timeout, Duration::from_secs(3600));
        assert_eq!(config.stale_after, Duration::from_secs(21600));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.job_ttl, Duration::from_secs(3600));
        assert_eq!(config.max_running_jobs, 4);
        assert!(!config.allow_root);
    }

    #[test]
    fn reads_values_from_env_file() {
        let config = config_from(
            "TUBEGRAB_HOST=\"0.0.0.0\"\nTUBEGRAB_PORT=8088\nTUBEGRAB_TEMP_ROOT=/scratch\n\
             TUBEGRAB_WWW_ROOT='/srv/www'\nTUBEGRAB_YTDLP=/opt/yt-dlp\n\
             TUBEGRAB_PROBE_TIMEOUT_SECS=30\nTUBEGRAB_ALLOW_ROOT=yes\n",
        );
        assert_eq!(config.bind_addr().to_string(), "0.0.0.0:8088");
        assert_eq!(config.temp_root, PathBuf::from("/scratch"));
        assert_eq!(config.www_root, Some(PathBuf::from("/srv/www")));
        assert_eq!(config.ytdlp, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(config.probe_timeout, Duration::from_secs(30));
        assert!(config.allow_root);
    }

    #[test]
    fn plain_port_is_a_fallback() {
        assert_eq!(config_from("PORT=7000\n").port, 7000);
        assert_eq!(config_from("PORT=7000\nTUBEGRAB_PORT=7001\n").port, 7001);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = config_from("TUBEGRAB_PORT=nope\nTUBEGRAB_JOB_TTL_SECS=-5\n");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.job_ttl, Duration::from_secs(DEFAULT_JOB_TTL_SECS));
    }

    #[test]
    fn running_job_limit_is_at_least_one() {
        assert_eq!(config_from("TUBEGRAB_MAX_RUNNING_JOBS=2\n").max_running_jobs, 2);
        assert_eq!(config_from("TUBEGRAB_MAX_RUNNING_JOBS=0\n").max_running_jobs, 1);
        assert_eq!(config_from("TUBEGRAB_MAX_RUNNING_JOBS=many\n").max_running_jobs, 4);
    }

    #[test]
    fn invalid_host_is_an_error() {
        let vars = read_env_file(make_config("TUBEGRAB_HOST=localhost\n").path()).unwrap();
        let err = build_runtime_config(&vars, |_| None, RuntimeOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("not an IP address"));
    }

    #[test]
    fn env_wins_over_file_and_overrides_win_over_env() {
        let vars = read_env_file(
            make_config("TUBEGRAB_TEMP_ROOT=/file\nTUBEGRAB_PORT=7000\nTUBEGRAB_HOST=10.0.0.1\n")
                .path(),
        )
        .unwrap();
        let env_lookup = |key: &str| match key {
            "TUBEGRAB_TEMP_ROOT" => Some("/env".to_string()),
            "TUBEGRAB_PORT" => Some("8000".to_string()),
            _ => None,
        };

        let config = build_runtime_config(&vars, env_lookup, RuntimeOverrides::default()).unwrap();
        assert_eq!(config.temp_root, PathBuf::from("/env"));
        assert_eq!(config.port, 8000);

        let config = build_runtime_config(
            &vars,
            env_lookup,
            RuntimeOverrides {
                port: Some(9000),
                host: Some("::1".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind_addr().to_string(), "[::1]:9000");
        assert_eq!(config.temp_root, PathBuf::from("/env"));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let vars = read_env_file(make_config("TUBEGRAB_WWW_ROOT=\"\"\n").path()).unwrap();
        let config = build_runtime_config(
            &vars,
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert!(config.www_root.is_none());
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export TUBEGRAB_TEMP_ROOT="/media"
            TUBEGRAB_WWW_ROOT='/www'
            TUBEGRAB_HOST =  "0.0.0.0"
            TUBEGRAB_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("TUBEGRAB_TEMP_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("TUBEGRAB_WWW_ROOT").unwrap(), "/www");
        assert_eq!(vars.get("TUBEGRAB_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("TUBEGRAB_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn truthy_values() {
        for value in ["1", "true", "YES", " on "] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["0", "false", "no", ""] {
            assert!(!is_truthy(value), "{value}");
        }
    }
}
