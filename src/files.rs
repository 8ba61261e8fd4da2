//! 文件列表、下载与删除处理。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use serde::Serialize;
use std::io::{ErrorKind, SeekFrom};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::etag::{etag_from_metadata, if_range_matches, is_not_modified};
use crate::http::attachment_disposition;
use crate::storage::{Storage, StorageError, StoredFile, remove_entry};

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    message: &'static str,
    path: String,
}

/// 列出存储根目录下的所有文件。
pub async fn list_files(
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<Vec<StoredFile>>, ApiError> {
    let files = storage
        .list_files()
        .await
        .map_err(|err| ApiError::Internal(format!("Failed to list files: {err}")))?;
    info!(count = files.len(), "list files");
    Ok(JsonResponse(files))
}

/// 以附件形式下载文件，支持 Range 请求与条件请求。
pub async fn download_file(
    Path(path): Path<String>,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let target = storage
        .resolve_path_checked(&path, false)
        .await
        .map_err(|err| missing_as(err, "File not found"))?;
    if storage.is_root(&target) {
        return Err(missing_file_path().await);
    }
    let metadata = fs::metadata(&target)
        .await
        .map_err(|err| missing_as(err.into(), "File not found"))?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest("path is not a file".into()));
    }
    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_from_metadata(&metadata);
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let mime = mime_guess::from_path(&target).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(modified) = modified {
        response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }
    response_headers.insert(header::ETAG, header_value(&etag)?);

    if is_not_modified(&request_headers, &etag, modified) {
        debug!(path, "download not modified");
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    response_headers.insert(header::CONTENT_TYPE, header_value(mime.essence_str())?);
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        attachment_disposition(&file_name)?,
    );

    let range = if if_range_matches(&request_headers, &etag, modified) {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let file = File::open(&target)
        .await
        .map_err(|err| missing_as(err.into(), "File not found"))?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(path, start, end, length, "download range request accepted");
        let mut file = file;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let stream = ReaderStream::new(file.take(length));
        response_headers.insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {}-{}/{}", start, end, file_size))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(
        header::CONTENT_LENGTH,
        header_value(&file_size.to_string())?,
    );
    info!(path, size = file_size, "download full file");
    let stream = ReaderStream::new(file);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 删除文件或整个目录。
pub async fn delete_entry(
    Path(path): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<DeleteResponse>, ApiError> {
    let target = storage
        .resolve_path_checked(&path, false)
        .await
        .map_err(|err| missing_as(err, "File not found"))?;
    if storage.is_root(&target) {
        return Err(missing_file_path().await);
    }
    let metadata = fs::metadata(&target)
        .await
        .map_err(|err| missing_as(err.into(), "File not found"))?;
    remove_entry(&target, metadata.is_dir())
        .await
        .map_err(|err| ApiError::Internal(format!("Failed to delete: {err}")))?;
    info!(path, is_dir = metadata.is_dir(), "delete entry");
    Ok(JsonResponse(DeleteResponse {
        message: "Successfully deleted",
        path,
    }))
}

/// `/download/` 与 `/delete/` 缺少路径段时的处理。
pub async fn missing_file_path() -> ApiError {
    ApiError::BadRequest("File not specified".into())
}

/// 将不存在的条目映射为携带 `message` 的 404。
pub(crate) fn missing_as(error: StorageError, message: &str) -> ApiError {
    match error {
        StorageError::Io(err)
            if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) =>
        {
            ApiError::NotFound(message.into())
        }
        other => other.into(),
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("failed to build header".into()))
}

/// 解析单个 `bytes=` Range，返回闭区间；语法错误按不可满足处理。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::RangeNotSatisfiable(file_size))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }

    let mut parts = range.splitn(2, '-');
    let start_part = parts.next().unwrap_or_default().trim();
    let end_part = parts.next().unwrap_or_default().trim();

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part
            .parse()
            .map_err(|_| ApiError::RangeNotSatisfiable(file_size))?;
        if suffix == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part
            .parse()
            .map_err(|_| ApiError::RangeNotSatisfiable(file_size))?;
        let end: u64 = if end_part.is_empty() {
            file_size - 1
        } else {
            let end: u64 = end_part
                .parse()
                .map_err(|_| ApiError::RangeNotSatisfiable(file_size))?;
            end.min(file_size - 1)
        };
        (start, end)
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }

    Ok(Some((start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("uploads");
        std::fs::create_dir_all(&root).expect("create storage root");
        (temp, Arc::new(Storage::new(root)))
    }

    fn range(value: &'static str, size: u64) -> Result<Option<(u64, u64)>, ApiError> {
        parse_range(Some(&HeaderValue::from_static(value)), size)
    }

    #[test]
    fn parse_range_variants() {
        assert_eq!(range("bytes=0-4", 10).ok().flatten(), Some((0, 4)));
        assert_eq!(range("bytes=5-", 10).ok().flatten(), Some((5, 9)));
        assert_eq!(range("bytes=-3", 10).ok().flatten(), Some((7, 9)));
        assert_eq!(range("bytes=8-100", 10).ok().flatten(), Some((8, 9)));
        assert!(matches!(
            range("bytes=10-12", 10),
            Err(ApiError::RangeNotSatisfiable(10))
        ));
        assert!(matches!(
            range("bytes=0-1", 0),
            Err(ApiError::RangeNotSatisfiable(0))
        ));
        for malformed in ["items=0-1", "bytes=a-3", "bytes=2-x", "bytes=-", "bytes=-y"] {
            assert!(
                matches!(range(malformed, 10), Err(ApiError::RangeNotSatisfiable(10))),
                "{malformed:?} should be unsatisfiable"
            );
        }
        assert!(matches!(
            range("bytes=0-1,3-4", 10),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn download_missing_file_is_not_found() {
        let (_temp, storage) = make_storage();
        let result = download_file(
            Path("nope.txt".to_string()),
            HeaderMap::new(),
            Extension(storage),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound(ref msg)) if msg == "File not found"));
    }

    #[tokio::test]
    async fn download_rejects_traversal_path() {
        let (_temp, storage) = make_storage();
        let result = download_file(
            Path("../secret.txt".to_string()),
            HeaderMap::new(),
            Extension(storage),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn delete_removes_directory_tree() {
        let (_temp, storage) = make_storage();
        let root = storage.root_path().to_path_buf();
        std::fs::create_dir_all(root.join("album/inner")).expect("mkdir");
        std::fs::write(root.join("album/inner/a.jpg"), b"a").expect("write");
        std::fs::write(root.join("keep.txt"), b"k").expect("write");

        let JsonResponse(body) = delete_entry(Path("album".to_string()), Extension(storage.clone()))
            .await
            .unwrap_or_else(|_| panic!("delete failed"));
        assert_eq!(body.path, "album");
        assert!(!root.join("album").exists());
        assert!(root.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn delete_refuses_storage_root() {
        let (_temp, storage) = make_storage();
        let result = delete_entry(Path(".".to_string()), Extension(storage.clone())).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        assert!(storage.root_path().exists());
    }
}
