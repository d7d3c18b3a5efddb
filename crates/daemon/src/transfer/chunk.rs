//! Chunk sizing and source reads for resumable uploads.

use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Chunk size tier for a file of `file_size` bytes.
///
/// Larger files use larger chunks to keep the request count down. Every tier
/// is a multiple of 256 KiB, which resumable endpoints require.
pub fn chunk_size_for(file_size: u64) -> u64 {
    match file_size {
        s if s < 50 * MIB => MIB,
        s if s < 500 * MIB => 5 * MIB,
        s if s < 2 * GIB => 10 * MIB,
        _ => 25 * MIB,
    }
}

/// Content type sent with the upload, by extension.
pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "webm" => "video/webm",
        "ts" | "m2ts" => "video/mp2t",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "zip" => "application/zip",
        "rar" => "application/x-rar-compressed",
        "7z" => "application/x-7z-compressed",
        _ => "application/octet-stream",
    }
}

/// Random-access reader over the upload source
#[derive(Debug)]
pub struct ChunkReader {
    file: File,
    size: u64,
}

impl ChunkReader {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self { file, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `len` bytes starting at `offset`
    pub async fn read_at(&mut self, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        let len = len.min(self.size.saturating_sub(offset)) as usize;
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_chunk_tiers() {
        assert_eq!(chunk_size_for(0), MIB);
        assert_eq!(chunk_size_for(49 * MIB), MIB);
        assert_eq!(chunk_size_for(50 * MIB), 5 * MIB);
        assert_eq!(chunk_size_for(499 * MIB), 5 * MIB);
        assert_eq!(chunk_size_for(500 * MIB), 10 * MIB);
        assert_eq!(chunk_size_for(2 * GIB), 25 * MIB);
        assert_eq!(chunk_size_for(5 * GIB), 25 * MIB);
    }

    #[test]
    fn test_mime_types() {
        assert_eq!(mime_type_for(Path::new("a.MKV")), "video/x-matroska");
        assert_eq!(mime_type_for(Path::new("a.mp4")), "video/mp4");
        assert_eq!(mime_type_for(Path::new("a")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_read_at_clamps_final_chunk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("src.bin");
        std::fs::write(&path, (0u8..100).collect::<Vec<_>>()).unwrap();

        let mut reader = ChunkReader::open(&path).await.unwrap();
        assert_eq!(reader.size(), 100);
        let chunk = reader.read_at(90, 64).await.unwrap();
        assert_eq!(chunk, (90u8..100).collect::<Vec<_>>());
        assert!(reader.read_at(100, 64).await.unwrap().is_empty());
    }
}
