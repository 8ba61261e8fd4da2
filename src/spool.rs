//! 上传文件在目标路径确定前的暂存区。

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};

/// 未超过阈值时保存在内存，超出后转存到匿名临时文件（释放即删除）。
pub struct SpooledFile {
    limit: usize,
    spool_dir: Option<PathBuf>,
    len: u64,
    state: SpoolState,
}

enum SpoolState {
    Memory(Vec<u8>),
    Disk(File),
}

impl SpooledFile {
    pub fn new(limit: usize, spool_dir: Option<&Path>) -> Self {
        Self {
            limit,
            spool_dir: spool_dir.map(Path::to_path_buf),
            len: 0,
            state: SpoolState::Memory(Vec::new()),
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.state, SpoolState::Disk(_))
    }

    /// 追加数据块，超出阈值时把已缓冲内容转存到磁盘。
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        if let SpoolState::Memory(buffer) = &mut self.state {
            if buffer.len() + chunk.len() <= self.limit {
                buffer.extend_from_slice(chunk);
                self.len += chunk.len() as u64;
                return Ok(());
            }
            let mut file = create_spill_file(self.spool_dir.clone()).await?;
            file.write_all(buffer.as_slice()).await?;
            self.state = SpoolState::Disk(file);
        }

        if let SpoolState::Disk(file) = &mut self.state {
            file.write_all(chunk).await?;
        }
        self.len += chunk.len() as u64;
        Ok(())
    }

    /// 将暂存内容写入 `writer`，返回字节数。
    pub async fn copy_to<W>(self, writer: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let copied = match self.state {
            SpoolState::Memory(buffer) => {
                writer.write_all(&buffer).await?;
                buffer.len() as u64
            }
            SpoolState::Disk(mut file) => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                tokio::io::copy(&mut file, writer).await?
            }
        };
        writer.flush().await?;
        Ok(copied)
    }
}

async fn create_spill_file(spool_dir: Option<PathBuf>) -> io::Result<File> {
    let file = tokio::task::spawn_blocking(move || match spool_dir {
        Some(dir) => tempfile::tempfile_in(dir),
        None => tempfile::tempfile(),
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))??;
    Ok(File::from_std(file))
}
