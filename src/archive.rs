//! 目录打包下载：zip 在阻塞线程中边写边经有界通道推送给响应体。

use axum::body::{Body as AxumBody, Bytes};
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::{Stream, stream};
use std::io::{self, BufWriter, Write};
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::{ARCHIVE_CHANNEL_CAPACITY, ARCHIVE_WRITE_BUFFER};
use crate::error::ApiError;
use crate::files::missing_as;
use crate::http::attachment_disposition;
use crate::storage::{Storage, relative_slash_path};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("{0}")]
    Walk(#[from] walkdir::Error),
    #[error("{0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("{0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub entries: u64,
    pub bytes: u64,
}

/// 将目录打包为 zip 流式下载。
pub async fn download_zip(
    Path(folder): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let target = storage
        .resolve_path_checked(&folder, false)
        .await
        .map_err(|err| missing_as(err, "Folder not found"))?;
    if storage.is_root(&target) {
        return Err(missing_folder().await);
    }
    let metadata = fs::metadata(&target)
        .await
        .map_err(|err| missing_as(err.into(), "Folder not found"))?;
    if !metadata.is_dir() {
        return Err(ApiError::BadRequest("path is not a folder".into()));
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        attachment_disposition(&format!("{folder}.zip"))?,
    );

    let body = archive_stream(target, folder);
    Ok((StatusCode::OK, headers, AxumBody::from_stream(body)).into_response())
}

/// `/download-zip/` 缺少目录段时的处理。
pub async fn missing_folder() -> ApiError {
    ApiError::BadRequest("Folder not specified".into())
}

/// 启动打包线程，返回响应体分块流；打包失败时以一个错误项结束。
fn archive_stream(target: PathBuf, folder: String) -> impl Stream<Item = io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(ARCHIVE_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || {
        let sink = ChannelWriter { tx: tx.clone() };
        match write_archive(&target, sink) {
            Ok(summary) => {
                info!(
                    folder,
                    entries = summary.entries,
                    bytes = summary.bytes,
                    "zip archive streamed"
                );
            }
            Err(err) => {
                warn!(folder, error = %err, "zip archive aborted");
                let message = format!("Failed to create zip file: {err}");
                let _ = tx.blocking_send(Err(io::Error::other(message)));
            }
        }
    });

    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
}

/// 将目录下所有普通文件写入 zip 流，条目名为以 `/` 分隔的相对路径。
///
/// 遍历中途出错时仍会写出中央目录，并返回遍历错误。
pub fn write_archive<W: Write>(folder: &FsPath, sink: W) -> Result<ArchiveSummary, ArchiveError> {
    let mut zip = ZipWriter::new_stream(BufWriter::with_capacity(ARCHIVE_WRITE_BUFFER, sink));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut summary = ArchiveSummary::default();

    let walked = (|| -> Result<(), ArchiveError> {
        for entry in WalkDir::new(folder).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = relative_slash_path(folder, entry.path()) else {
                continue;
            };
            let len = entry.metadata()?.len();
            zip.start_file(name, options.large_file(needs_zip64(len)))?;
            let mut source = std::fs::File::open(entry.path())?;
            summary.bytes += io::copy(&mut source, &mut zip)?;
            summary.entries += 1;
        }
        Ok(())
    })();

    let finished = zip
        .finish()
        .map_err(ArchiveError::from)
        .and_then(|mut inner| inner.flush().map_err(ArchiveError::from));
    walked?;
    finished?;
    Ok(summary)
}

/// 流式写入无法回填本地头，大小达到 4 GiB 的条目须预先声明 ZIP64。
fn needs_zip64(len: u64) -> bool {
    len >= u64::from(u32::MAX)
}

/// 把每次写入转发为一个响应体分块的阻塞写入器。
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::io::{Cursor, Read};
    use tempfile::tempdir;
    use zip::ZipArchive;

    fn read_entries(bytes: Vec<u8>) -> Vec<(String, Vec<u8>)> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).expect("open archive");
        let mut entries = Vec::new();
        for index in 0..archive.len() {
            let mut file = archive.by_index(index).expect("entry");
            let mut content = Vec::new();
            file.read_to_end(&mut content).expect("read entry");
            entries.push((file.name().to_string(), content));
        }
        entries
    }

    #[test]
    fn archive_contains_nested_files_only() {
        let temp = tempdir().expect("tempdir");
        let folder = temp.path().join("album");
        std::fs::create_dir_all(folder.join("sub/empty")).expect("mkdir");
        std::fs::write(folder.join("x.txt"), b"hello").expect("write");
        std::fs::write(folder.join("sub/y.txt"), b"").expect("write");

        let mut out = Vec::new();
        let summary = write_archive(&folder, &mut out).expect("archive");
        assert_eq!(summary, ArchiveSummary { entries: 2, bytes: 5 });

        let entries = read_entries(out);
        assert_eq!(
            entries,
            vec![
                ("sub/y.txt".to_string(), Vec::new()),
                ("x.txt".to_string(), b"hello".to_vec()),
            ]
        );
    }

    #[test]
    fn empty_folder_yields_valid_empty_archive() {
        let temp = tempdir().expect("tempdir");
        let mut out = Vec::new();
        let summary = write_archive(temp.path(), &mut out).expect("archive");
        assert_eq!(summary.entries, 0);
        assert!(read_entries(out).is_empty());
    }

    #[test]
    fn missing_folder_fails_walk() {
        let temp = tempdir().expect("tempdir");
        let mut out = Vec::new();
        let result = write_archive(&temp.path().join("gone"), &mut out);
        assert!(matches!(result, Err(ArchiveError::Walk(_))));
    }

    #[test]
    fn zip64_threshold() {
        assert!(!needs_zip64(0));
        assert!(!needs_zip64(u64::from(u32::MAX) - 1));
        assert!(needs_zip64(u64::from(u32::MAX)));
        assert!(needs_zip64(u64::from(u32::MAX) + 10));
    }

    #[test]
    #[ignore = "streams more than 4 GiB through the deflate encoder"]
    fn archives_files_past_four_gib() {
        let temp = tempdir().expect("tempdir");
        let big = std::fs::File::create(temp.path().join("big.bin")).expect("create");
        big.set_len(u64::from(u32::MAX) + 10).expect("sparse length");
        drop(big);

        let summary = write_archive(temp.path(), io::sink()).expect("archive");
        assert_eq!(summary.entries, 1);
        assert_eq!(summary.bytes, u64::from(u32::MAX) + 10);
    }

    #[test]
    fn closed_receiver_stops_the_writer() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.txt"), b"payload").expect("write");
        let (tx, rx) = mpsc::channel(ARCHIVE_CHANNEL_CAPACITY);
        drop(rx);

        let result = write_archive(temp.path(), ChannelWriter { tx });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stream_ends_with_error_when_walk_fails() {
        let temp = tempdir().expect("tempdir");
        let items: Vec<io::Result<Bytes>> =
            archive_stream(temp.path().join("vanished"), "vanished".into())
                .collect()
                .await;

        let (last, chunks) = items.split_last().expect("stream items");
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(Result::is_ok));
        let err = last.as_ref().expect_err("final item is an error");
        assert!(err.to_string().starts_with("Failed to create zip file"));
    }

    #[tokio::test]
    async fn stream_delivers_complete_archive() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("n.txt"), b"note").expect("write");
        let items: Vec<io::Result<Bytes>> =
            archive_stream(temp.path().to_path_buf(), "root".into())
                .collect()
                .await;

        let mut bytes = Vec::new();
        for item in items {
            bytes.extend_from_slice(&item.expect("chunk"));
        }
        assert_eq!(read_entries(bytes), vec![("n.txt".to_string(), b"note".to_vec())]);
    }
}
