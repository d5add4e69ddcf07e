//! Scratch-space assembly of chunked uploads for the local backend.
//!
//! Each session owns `<scratch>/<session_id>/` holding `<index>.part` files
//! and a `total` marker written by the first chunk. Chunks may arrive in any
//! order and may be retried; the last write of an index wins.

use bytes::Bytes;
use log::{debug, info, warn};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{DriveError, DriveResult};

const TOTAL_MARKER: &str = "total";
const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub index: u32,
    pub received: u32,
    pub total: u32,
}

/// An assembled upload waiting to be moved into object storage.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHandle {
    pub path: PathBuf,
    pub size: u64,
    pub md5: String,
}

pub struct ChunkAssembler {
    scratch_root: PathBuf,
}

impl ChunkAssembler {
    pub fn new(scratch_root: impl Into<PathBuf>) -> DriveResult<Self> {
        let scratch_root = scratch_root.into();
        std::fs::create_dir_all(&scratch_root)?;
        info!("Chunk scratch directory: {}", scratch_root.display());
        Ok(Self { scratch_root })
    }

    fn session_dir(&self, session_id: &str) -> DriveResult<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(DriveError::InvalidRequest(format!("invalid session id '{}'", session_id)));
        }
        Ok(self.scratch_root.join(session_id))
    }

    fn assembled_path(&self, session_id: &str) -> PathBuf {
        self.scratch_root.join(format!("{}.assembled", session_id))
    }

    async fn read_total(dir: &Path) -> DriveResult<Option<u32>> {
        match fs::read_to_string(dir.join(TOTAL_MARKER)).await {
            Ok(text) => text
                .trim()
                .parse::<u32>()
                .map(Some)
                .map_err(|_| DriveError::Storage(format!("corrupt chunk marker in {}", dir.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn present_indices(dir: &Path) -> DriveResult<Vec<u32>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(index) = name.strip_suffix(".part").and_then(|s| s.parse::<u32>().ok()) {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Store chunk `index` of `total`. `max_chunk` of 0 disables the size check.
    pub async fn put_chunk(&self, session_id: &str, index: u32, total: u32, data: Bytes, max_chunk: u64) -> DriveResult<ChunkAck> {
        if total == 0 || index >= total {
            return Err(DriveError::InvalidRequest(format!("chunk {} outside 0..{}", index, total)));
        }
        if max_chunk > 0 && data.len() as u64 > max_chunk {
            return Err(DriveError::InvalidRequest(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                data.len(),
                max_chunk
            )));
        }

        let dir = self.session_dir(session_id)?;
        fs::create_dir_all(&dir).await?;
        match Self::read_total(&dir).await? {
            Some(known) if known != total => {
                return Err(DriveError::InvalidRequest(format!(
                    "chunk total {} differs from the announced {}",
                    total, known
                )));
            }
            Some(_) => {}
            None => fs::write(dir.join(TOTAL_MARKER), total.to_string()).await?,
        }

        // Write aside, then rename over the final name so a retried chunk
        // never leaves a half-written part behind.
        let tmp = dir.join(format!("{}.{}.tmp", index, Uuid::new_v4().simple()));
        let mut file = File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&tmp, dir.join(format!("{}.part", index))).await?;

        let received = Self::present_indices(&dir).await?.len() as u32;
        debug!("Session {} chunk {}/{} stored ({} bytes)", session_id, index, total, data.len());
        Ok(ChunkAck { index, received, total })
    }

    /// Announced total and the indices still missing.
    pub async fn missing(&self, session_id: &str) -> DriveResult<(Option<u32>, Vec<u32>)> {
        let dir = self.session_dir(session_id)?;
        let total = Self::read_total(&dir).await?;
        let present = Self::present_indices(&dir).await?;
        let missing = match total {
            Some(total) => (0..total).filter(|i| present.binary_search(i).is_err()).collect(),
            None => vec![0],
        };
        Ok((total, missing))
    }

    /// Concatenate every chunk in index order. Fails with `IncompleteUpload`
    /// while any index is missing, leaving the scratch directory intact.
    pub async fn finalize(&self, session_id: &str) -> DriveResult<FileHandle> {
        let (total, missing) = self.missing(session_id).await?;
        if !missing.is_empty() {
            warn!("Session {} finalized with {} missing chunks", session_id, missing.len());
            return Err(DriveError::IncompleteUpload { missing });
        }
        let total = total.unwrap_or(0);
        let dir = self.session_dir(session_id)?;
        let output_path = self.assembled_path(session_id);
        let mut output = File::create(&output_path).await?;
        let mut digest = md5::Context::new();
        let mut size: u64 = 0;
        let mut buffer = vec![0u8; COPY_BUFFER];

        for index in 0..total {
            let mut part = File::open(dir.join(format!("{}.part", index))).await?;
            loop {
                let read = part.read(&mut buffer).await?;
                if read == 0 {
                    break;
                }
                digest.consume(&buffer[..read]);
                output.write_all(&buffer[..read]).await?;
                size += read as u64;
            }
        }
        output.flush().await?;
        drop(output);

        fs::remove_dir_all(&dir).await?;
        let md5 = format!("{:x}", digest.compute());
        info!("Assembled session {}: {} chunks, {} bytes", session_id, total, size);
        Ok(FileHandle { path: output_path, size, md5 })
    }

    /// Remove whatever scratch data a session left behind.
    pub async fn discard(&self, session_id: &str) -> DriveResult<()> {
        let dir = self.session_dir(session_id)?;
        if let Err(e) = fs::remove_dir_all(&dir).await {
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        if let Err(e) = fs::remove_file(self.assembled_path(session_id)).await {
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler() -> (ChunkAssembler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (ChunkAssembler::new(dir.path().join("scratch")).unwrap(), dir)
    }

    #[tokio::test]
    async fn test_out_of_order_and_retried_chunks() {
        let (assembler, _dir) = assembler();
        assembler.put_chunk("s1", 1, 3, Bytes::from_static(b"stale"), 0).await.unwrap();
        assembler.put_chunk("s1", 0, 3, Bytes::from_static(b"aa"), 0).await.unwrap();
        assembler.put_chunk("s1", 1, 3, Bytes::from_static(b"bb"), 0).await.unwrap();
        let ack = assembler.put_chunk("s1", 2, 3, Bytes::from_static(b"cc"), 0).await.unwrap();
        assert_eq!(ack, ChunkAck { index: 2, received: 3, total: 3 });

        let handle = assembler.finalize("s1").await.unwrap();
        assert_eq!(std::fs::read(&handle.path).unwrap(), b"aabbcc");
        assert_eq!(handle.size, 6);
        assert_eq!(handle.md5, format!("{:x}", md5::compute(b"aabbcc")));
    }

    #[tokio::test]
    async fn test_finalize_reports_missing_chunks() {
        let (assembler, _dir) = assembler();
        assembler.put_chunk("s1", 0, 4, Bytes::from_static(b"a"), 0).await.unwrap();
        assembler.put_chunk("s1", 2, 4, Bytes::from_static(b"c"), 0).await.unwrap();

        match assembler.finalize("s1").await {
            Err(DriveError::IncompleteUpload { missing }) => assert_eq!(missing, vec![1, 3]),
            other => panic!("unexpected {:?}", other),
        }
        // Still resumable after a failed finalize.
        assembler.put_chunk("s1", 1, 4, Bytes::from_static(b"b"), 0).await.unwrap();
        assembler.put_chunk("s1", 3, 4, Bytes::from_static(b"d"), 0).await.unwrap();
        assert_eq!(assembler.finalize("s1").await.unwrap().size, 4);
    }

    #[tokio::test]
    async fn test_chunk_validation() {
        let (assembler, _dir) = assembler();
        assert!(assembler.put_chunk("s1", 3, 3, Bytes::new(), 0).await.is_err());
        assert!(assembler.put_chunk("s1", 0, 2, Bytes::from_static(b"toolong"), 4).await.is_err());
        assert!(assembler.put_chunk("../x", 0, 1, Bytes::new(), 0).await.is_err());

        assembler.put_chunk("s1", 0, 2, Bytes::from_static(b"ok"), 4).await.unwrap();
        let err = assembler.put_chunk("s1", 1, 5, Bytes::from_static(b"ok"), 4).await.unwrap_err();
        assert!(matches!(err, DriveError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_discard_is_idempotent() {
        let (assembler, dir) = assembler();
        assembler.put_chunk("s1", 0, 1, Bytes::from_static(b"x"), 0).await.unwrap();
        assembler.discard("s1").await.unwrap();
        assembler.discard("s1").await.unwrap();
        assert!(!dir.path().join("scratch/s1").exists());
    }
}
