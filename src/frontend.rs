//! 首页渲染。

use axum::extract::Extension;
use axum::response::Html;
use minijinja::{Environment, context};
use std::sync::Arc;
use tokio::fs;

use crate::config::AppConfig;
use crate::error::ApiError;

/// 渲染首页模板并注入基础 URL，每次请求都重新读取模板文件。
pub async fn home_page(
    Extension(config): Extension<Arc<AppConfig>>,
) -> Result<Html<String>, ApiError> {
    let source = fs::read_to_string(&config.template_path)
        .await
        .map_err(|err| ApiError::Internal(format!("Failed to load template: {err}")))?;
    render_home(&source, &config.base_url).map(Html)
}

fn render_home(source: &str, base_url: &str) -> Result<String, ApiError> {
    let mut env = Environment::new();
    env.add_template("index.html", source)
        .map_err(|err| ApiError::Internal(format!("Failed to load template: {err}")))?;
    env.get_template("index.html")
        .and_then(|template| template.render(context! { base_url => base_url }))
        .map_err(|err| ApiError::Internal(format!("Failed to render template: {err}")))
}
