use anyhow::{Context, Result};
use std::{
    env,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub cors_origins: Vec<String>,
    pub max_code_bytes: usize,
    pub store: StoreConfig,
    pub executor: ExecutorConfig,
    pub ws: WsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_path: PathBuf,
    pub pool_size: usize,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    pub op_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub execution_timeout_secs: u64,
    pub compile_timeout: Duration,
    pub probe_timeout: Duration,
    pub kill_grace: Duration,
    pub max_output_bytes: usize,
    pub workspace_root: PathBuf,
    pub go_bin: String,
    pub java_bin: String,
    pub javac_bin: String,
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub ping_interval: Duration,
    /// A socket with no inbound frame (pongs included) for this long is
    /// treated as gone.
    pub idle_timeout: Duration,
    pub outbound_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!("unsupported log format: {s}")),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let store = StoreConfig {
            database_path: database_path(
                env::var("DATABASE_URL").ok().as_deref(),
                &env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
                &env::var("DB_NAME").unwrap_or_else(|_| "coding_interview.db".to_string()),
            ),
            pool_size: parse_env("DB_POOL_SIZE", 4usize).clamp(1, 64),
            connect_attempts: parse_env("DB_CONNECT_ATTEMPTS", 5u32).max(1),
            connect_retry_delay: Duration::from_secs(parse_env("DB_CONNECT_RETRY_SECS", 2u64)),
            op_timeout: Duration::from_secs(parse_env("DB_OP_TIMEOUT_SECS", 5u64).max(1)),
        };

        let executor = ExecutorConfig {
            execution_timeout_secs: parse_env("EXECUTION_TIMEOUT_SECS", 10u64).clamp(1, 300),
            compile_timeout: Duration::from_secs(parse_env("COMPILE_TIMEOUT_SECS", 10u64).max(1)),
            probe_timeout: Duration::from_secs(parse_env("PROBE_TIMEOUT_SECS", 5u64).max(1)),
            kill_grace: Duration::from_secs(parse_env("KILL_GRACE_SECS", 2u64).max(1)),
            max_output_bytes: parse_env("MAX_OUTPUT_BYTES", 1024 * 1024usize).max(1024),
            workspace_root: env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir()),
            go_bin: env::var("GO_BIN").unwrap_or_else(|_| "go".to_string()),
            java_bin: env::var("JAVA_BIN").unwrap_or_else(|_| "java".to_string()),
            javac_bin: env::var("JAVAC_BIN").unwrap_or_else(|_| "javac".to_string()),
        };

        let ping_interval = Duration::from_secs(parse_env("WS_PING_INTERVAL_SECS", 25u64).max(1));
        let ws = WsConfig {
            ping_interval,
            idle_timeout: Duration::from_secs(parse_env("WS_IDLE_TIMEOUT_SECS", 60u64))
                .max(ping_interval * 2),
            outbound_capacity: parse_env("WS_OUTBOUND_CAPACITY", 256usize).max(1),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: parse_env("LOG_FORMAT", LogFormat::Compact),
        };

        Ok(Self {
            bind_addr,
            cors_origins: parse_csv("CORS_ORIGINS", "http://localhost:3000"),
            max_code_bytes: parse_env("MAX_CODE_BYTES", 256 * 1024usize).max(1024),
            store,
            executor,
            ws,
            logging,
        })
    }
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
            outbound_capacity: 256,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: 10,
            compile_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
            max_output_bytes: 1024 * 1024,
            workspace_root: env::temp_dir(),
            go_bin: "go".to_string(),
            java_bin: "java".to_string(),
            javac_bin: "javac".to_string(),
        }
    }
}

/// Resolves `DATABASE_URL` (`sqlite://path` or a bare path), falling back to
/// `<data_dir>/<db_name>` when it is unset or empty.
fn database_path(url: Option<&str>, data_dir: &str, db_name: &str) -> PathBuf {
    match url.map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => {
            let path = url
                .strip_prefix("sqlite://")
                .or_else(|| url.strip_prefix("sqlite:"))
                .unwrap_or(url);
            PathBuf::from(path)
        }
        None => PathBuf::from(data_dir).join(db_name),
    }
}

fn parse_csv(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
