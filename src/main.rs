//! fileshare 服务入口。
//!
//! 轻量文件分享服务：上传内容保存在本地存储目录，通过 HTTP 列出、下载、
//! 打包与删除，文件系统即全部状态。

mod archive;
mod config;
mod error;
mod etag;
mod files;
mod frontend;
mod http;
mod logging;
mod routes;
mod spool;
mod storage;
mod upload;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::config::{AppConfig, Args, SHUTDOWN_GRACE_SECS};
use crate::storage::Storage;

shadow!(build);

/// 启动服务器并阻塞直到关闭。
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let config = AppConfig::from_args(&args)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;
    if let Some(spool_dir) = &config.spool_dir {
        tokio::fs::create_dir_all(spool_dir).await?;
    }

    let addr = SocketAddr::new(config.host, config.port);
    let config = Arc::new(config);
    let app = routes::build_router(config.clone(), storage.clone(), args.cors_origins.as_deref());
    let handle = Handle::new();

    info!(
        base_url = config.base_url,
        storage = ?storage.root_path(),
        "🚀 Starting HTTP server at {}",
        addr
    );

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
