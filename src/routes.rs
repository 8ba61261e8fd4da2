//! 路由装配：所有路由挂载在配置的基础路径下。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{any, delete, get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::config::AppConfig;
use crate::error::{method_not_allowed, not_found};
use crate::http::{add_security_headers, build_cors_layer, resolve_client_ip};
use crate::storage::Storage;
use crate::{archive, files, frontend, upload};

/// 构建应用路由。
pub fn build_router(
    config: Arc<AppConfig>,
    storage: Arc<Storage>,
    cors_origins: Option<&str>,
) -> Router {
    let base = config.base_path.as_str();
    let mount = |suffix: &str| format!("{base}{suffix}");

    let mut app = Router::new()
        .route(&mount("/"), get(frontend::home_page))
        .route(
            &mount("/upload"),
            post(upload::upload_file)
                .fallback(method_not_allowed)
                .layer(DefaultBodyLimit::disable()),
        )
        .route(&mount("/files"), any(files::list_files))
        .route(&mount("/download/"), any(files::missing_file_path))
        .route(&mount("/download/{*path}"), any(files::download_file))
        .route(&mount("/download-zip/"), any(archive::missing_folder))
        .route(&mount("/download-zip/{*folder}"), any(archive::download_zip))
        .route(
            &mount("/delete/"),
            delete(files::missing_file_path).fallback(method_not_allowed),
        )
        .route(
            &mount("/delete/{*path}"),
            delete(files::delete_entry).fallback(method_not_allowed),
        )
        .nest_service(&mount("/static"), ServeDir::new(&config.static_dir))
        .fallback(not_found);

    if !base.is_empty() {
        app = app.route(base, get(frontend::home_page));
    }

    let mut app = app
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(config));

    if let Some(cors_layer) = build_cors_layer(cors_origins) {
        app = app.layer(cors_layer);
    }
    app
}
