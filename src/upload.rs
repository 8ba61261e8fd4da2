//! 表单上传处理与目标路径解析。

use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::{Extension, Multipart, Query};
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs::{self, File};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::spool::SpooledFile;
use crate::storage::{Storage, remove_entry};

#[derive(Deserialize)]
pub struct UploadQuery {
    path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    message: &'static str,
    filename: String,
    url: String,
    path: String,
    #[serde(rename = "baseURL")]
    base_url: String,
}

/// 上传目标，相对于存储根目录。
#[derive(Debug, PartialEq, Eq)]
pub struct UploadTarget {
    pub relative: String,
    /// 回传给客户端的实际 `path`，单文件上传时为空。
    pub path_field: String,
}

/// 计算上传文件的目标路径。
///
/// 未提供 `path` 时只取原始文件名的最后一段；提供 `path` 时保留目录结构，
/// 但若 `path` 不含目录而原始文件名带有目录（拖拽文件夹时会把相对路径作为文件名提交），
/// 则改用原始文件名。
pub fn upload_target(original_name: &str, path: Option<&str>) -> Result<UploadTarget, ApiError> {
    let Some(path) = path.filter(|value| !value.is_empty()) else {
        let name = base_name(original_name);
        if name.is_empty() || name == "." || name == ".." {
            return Err(ApiError::BadRequest("invalid file name".into()));
        }
        return Ok(UploadTarget {
            relative: name.to_string(),
            path_field: String::new(),
        });
    };

    let effective = if dir_is_current(path) && original_name.contains('/') {
        debug!(original_name, "using file name as upload path");
        original_name
    } else {
        path
    };
    Ok(UploadTarget {
        relative: effective.to_string(),
        path_field: effective.to_string(),
    })
}

/// 客户端文件名的最后一段，兼容 `/` 与 `\`。
fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or_default()
}

/// `path` 的目录部分是否为当前目录（不含斜杠，或最后一段之前只有 `.`）。
fn dir_is_current(path: &str) -> bool {
    let Some((dir, _)) = path.rsplit_once('/') else {
        return true;
    };
    let mut segments = dir.split('/').filter(|segment| !segment.is_empty()).peekable();
    segments.peek().is_some() && segments.all(|segment| segment == ".")
}

/// 接收包含 `file` 字段与可选 `path` 字段的表单上传。
pub async fn upload_file(
    Query(query): Query<UploadQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(config): Extension<Arc<AppConfig>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    let mut multipart = multipart.map_err(|err| parse_error(&err.to_string()))?;
    let mut upload: Option<(String, SpooledFile)> = None;
    let mut path_field: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| parse_error(&err.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") if upload.is_none() => {
                let Some(original_name) = field.file_name().map(str::to_string) else {
                    continue;
                };
                let spool = spool_field(field, &config).await?;
                upload = Some((original_name, spool));
            }
            Some("path") if path_field.is_none() => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| parse_error(&err.to_string()))?;
                path_field = Some(value);
            }
            _ => {}
        }
    }

    let Some((original_name, spool)) = upload else {
        return Err(ApiError::BadRequest(
            "Failed to get file: no file field in form".into(),
        ));
    };
    let path = path_field.or(query.path);
    if let Some(path) = path.as_deref().filter(|value| !value.is_empty()) {
        info!(path, "folder upload");
    }

    let target = upload_target(&original_name, path.as_deref())?;
    let destination = storage
        .resolve_path_checked(&target.relative, true)
        .await?;
    if storage.is_root(&destination) {
        return Err(ApiError::BadRequest("invalid path".into()));
    }

    if let Ok(existing) = fs::metadata(&destination).await {
        remove_entry(&destination, existing.is_dir())
            .await
            .map_err(|err| {
                ApiError::Internal(format!("Failed to delete existing file/folder: {err}"))
            })?;
        info!(path = target.relative, is_dir = existing.is_dir(), "replaced existing entry");
    }

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await.map_err(|err| {
            ApiError::Internal(format!("Failed to create directory structure: {err}"))
        })?;
    }

    let spilled = spool.is_spilled();
    let mut file = File::create(&destination)
        .await
        .map_err(|err| ApiError::Internal(format!("Failed to create file: {err}")))?;
    let written = spool
        .copy_to(&mut file)
        .await
        .map_err(|err| ApiError::Internal(format!("Failed to save file: {err}")))?;
    info!(path = target.relative, bytes = written, spilled, "upload complete");

    let filename = destination
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let url = if target.path_field.is_empty() {
        format!("/download/{filename}")
    } else {
        format!("/download/{}", target.path_field)
    };

    Ok(JsonResponse(UploadResponse {
        message: "File uploaded successfully",
        filename,
        url,
        path: target.path_field,
        base_url: config.base_url.clone(),
    }))
}

async fn spool_field(mut field: Field<'_>, config: &AppConfig) -> Result<SpooledFile, ApiError> {
    let mut spool = SpooledFile::new(config.form_memory_limit, config.spool_dir.as_deref());
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| parse_error(&err.to_string()))?
    {
        spool
            .write_chunk(&chunk)
            .await
            .map_err(|err| parse_error(&err.to_string()))?;
    }
    debug!(bytes = spool.len(), spilled = spool.is_spilled(), "file part spooled");
    Ok(spool)
}

fn parse_error(detail: &str) -> ApiError {
    ApiError::Internal(format!("Failed to parse form: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_upload_uses_base_name() {
        let target = upload_target("report.pdf", None).expect("target");
        assert_eq!(target.relative, "report.pdf");
        assert_eq!(target.path_field, "");

        let target = upload_target("../../etc/passwd", None).expect("target");
        assert_eq!(target.relative, "passwd");

        let target = upload_target("C:\\Users\\me\\notes.txt", Some("")).expect("target");
        assert_eq!(target.relative, "notes.txt");
    }

    #[test]
    fn plain_upload_rejects_empty_name() {
        for name in ["", "dir/", ".", "a/.."] {
            assert!(
                matches!(upload_target(name, None), Err(ApiError::BadRequest(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn path_field_keeps_directories() {
        let target = upload_target("c.txt", Some("a/b/c.txt")).expect("target");
        assert_eq!(target.relative, "a/b/c.txt");
        assert_eq!(target.path_field, "a/b/c.txt");
    }

    #[test]
    fn flat_path_defers_to_file_name_with_directories() {
        let target = upload_target("photos/2024/cat.jpg", Some("cat.jpg")).expect("target");
        assert_eq!(target.relative, "photos/2024/cat.jpg");
        assert_eq!(target.path_field, "photos/2024/cat.jpg");

        let target = upload_target("photos/cat.jpg", Some("./cat.jpg")).expect("target");
        assert_eq!(target.relative, "photos/cat.jpg");
    }

    #[test]
    fn flat_path_and_flat_name_keep_path() {
        let target = upload_target("cat.jpg", Some("renamed.jpg")).expect("target");
        assert_eq!(target.relative, "renamed.jpg");
    }

    #[test]
    fn nested_path_ignores_file_name() {
        let target = upload_target("x/y.txt", Some("a/y.txt")).expect("target");
        assert_eq!(target.relative, "a/y.txt");
    }

    #[test]
    fn current_dir_detection() {
        assert!(dir_is_current("file.txt"));
        assert!(dir_is_current("./file.txt"));
        assert!(dir_is_current("././file.txt"));
        assert!(!dir_is_current("a/file.txt"));
        assert!(!dir_is_current("/file.txt"));
        assert!(!dir_is_current("./a/file.txt"));
    }
}
