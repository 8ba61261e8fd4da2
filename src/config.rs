//! 命令行参数与由其派生的运行时配置。

use clap::Parser;
use shadow_rs::formatcp;
use std::net::IpAddr;
use std::path::PathBuf;
use url::Url;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

/// 上传文件在内存中暂存的上限，超出后落盘。
pub const FORM_MEMORY_LIMIT: usize = 32 * 1024 * 1024;
/// zip 编码线程与响应体之间缓冲的分块数。
pub const ARCHIVE_CHANNEL_CAPACITY: usize = 16;
pub const ARCHIVE_WRITE_BUFFER: usize = 64 * 1024;
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// 服务器命令行参数与环境变量配置。
#[derive(Parser, Debug)]
#[command(name = "fileshare", version = VERSION_INFO, about = "Minimal file sharing server")]
pub struct Args {
    #[arg(
        short = 'u',
        long = "baseurl",
        env = "FILESHARE_BASE_URL",
        default_value = DEFAULT_BASE_URL,
        help = "Base URL for the application (e.g. http://example.com:8080/fileshare)"
    )]
    pub base_url: String,
    #[arg(
        short = 'b',
        long,
        env = "FILESHARE_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub bind: String,
    #[arg(
        short = 's',
        long,
        env = "FILESHARE_STORAGE_DIR",
        default_value = "static/uploads",
        help = "Storage directory for uploaded files"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "FILESHARE_STATIC_DIR",
        default_value = "static",
        help = "Directory served under /static"
    )]
    pub static_dir: String,
    #[arg(
        long,
        env = "FILESHARE_TEMPLATE",
        default_value = "templates/index.html",
        help = "Home page template"
    )]
    pub template: String,
    #[arg(
        long,
        env = "FILESHARE_SPOOL_DIR",
        help = "Directory for upload parts that exceed the in-memory limit"
    )]
    pub spool_dir: Option<String>,
    #[arg(
        long,
        env = "FILESHARE_CORS_ORIGINS",
        help = "Comma separated CORS origins"
    )]
    pub cors_origins: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),
    #[error("unsupported base URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid bind address: {0}")]
    InvalidBind(String),
}

/// 启动时构建、所有处理器共享的配置。
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// 原样保留的基础 URL，会回传给客户端。
    pub base_url: String,
    /// 路由挂载点：为空或不带尾部斜杠的 `/prefix`。
    pub base_path: String,
    pub host: IpAddr,
    pub port: u16,
    pub static_dir: PathBuf,
    pub template_path: PathBuf,
    pub spool_dir: Option<PathBuf>,
    pub form_memory_limit: usize,
}

impl AppConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let url = Url::parse(&args.base_url)?;
        let port = match url.scheme() {
            "http" | "https" => url.port_or_known_default().unwrap_or(80),
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        let host = args
            .bind
            .parse::<IpAddr>()
            .map_err(|err| ConfigError::InvalidBind(err.to_string()))?;

        Ok(Self {
            base_url: args.base_url.clone(),
            base_path: url.path().trim_end_matches('/').to_string(),
            host,
            port,
            static_dir: PathBuf::from(&args.static_dir),
            template_path: PathBuf::from(&args.template),
            spool_dir: args.spool_dir.as_ref().map(PathBuf::from),
            form_memory_limit: FORM_MEMORY_LIMIT,
        })
    }
}
