use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;
use walkdir::WalkDir;

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 判断 `path` 是否为存储根目录本身。
    pub fn is_root(&self, path: &Path) -> bool {
        path == self.root
    }

    pub async fn resolve_path_checked(
        &self,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let mut normalized = PathBuf::new();
        let trimmed = relative.trim_start_matches(['/', '\\']);
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }

        Ok(self.root.join(normalized))
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);

        for component in relative.components() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if !metadata.is_dir() {
                        return Ok(());
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// 递归列出根目录下的普通文件，按文件名深度优先排序；根目录不存在时返回空列表。
    pub async fn list_files(&self) -> Result<Vec<StoredFile>, StorageError> {
        match fs::metadata(&self.root).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::Io(err)),
        }

        let root = self.root.clone();
        tokio::task::spawn_blocking(move || walk_files(&root))
            .await
            .map_err(|err| StorageError::Io(io::Error::other(err.to_string())))?
    }
}

fn walk_files(root: &Path) -> Result<Vec<StoredFile>, StorageError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|err| StorageError::Io(io::Error::other(err.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Some(path) = relative_slash_path(root, entry.path()) else {
            continue;
        };

        files.push(StoredFile {
            name: entry.file_name().to_string_lossy().to_string(),
            size: metadata.len(),
            url: format!("/download/{path}"),
            path,
            uploaded_at: metadata.modified().map(DateTime::from).unwrap_or_default(),
        });
    }
    Ok(files)
}

/// 计算 `path` 相对 `base` 的路径，以 `/` 连接。
pub fn relative_slash_path(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let segments: Vec<_> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect();
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

/// 删除文件或整个目录。
pub async fn remove_entry(path: &Path, is_dir: bool) -> io::Result<()> {
    if is_dir {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 文件列表中的一条记录。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
    pub url: String,
    pub path: String,
    pub uploaded_at: DateTime<Utc>,
}
