//! Fixed-size binary chunks over a memory-mapped file

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use pipeinfer_core::{Source, SourceStream};

use crate::error::{Error, Result};

/// Yields a file as `Vec<u8>` chunks of at most `chunk_size` bytes.
///
/// Each pass maps the file read-only and copies one chunk per item, so the
/// last chunk may be short. An empty file yields nothing.
#[derive(Debug, Clone)]
pub struct ChunkSource {
    path: PathBuf,
    chunk_size: usize,
}

impl ChunkSource {
    /// Read `path` in chunks of `chunk_size` bytes
    pub fn new(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk_size must be positive".into()));
        }
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            chunk_size,
        })
    }

    /// The file being read
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes per chunk
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[allow(unsafe_code)]
    fn map(&self) -> Result<Option<Mmap>> {
        let file = File::open(&self.path).map_err(|err| Error::at(&self.path, err))?;
        if file.metadata()?.len() == 0 {
            return Ok(None);
        }
        // The map is read-only; truncating the file while a pass is running is not supported.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Some(mmap))
    }
}

impl Source<Vec<u8>> for ChunkSource {
    fn open(&self) -> pipeinfer_core::Result<SourceStream<Vec<u8>>> {
        let Some(mmap) = self.map()? else {
            return Ok(Box::new(std::iter::empty()));
        };
        tracing::debug!(
            path = %self.path.display(),
            bytes = mmap.len(),
            chunk_size = self.chunk_size,
            "mapped chunk source"
        );
        Ok(Box::new(ChunkStream {
            mmap,
            offset: 0,
            chunk_size: self.chunk_size,
        }))
    }

    fn size_hint(&self) -> Option<u64> {
        let len = fs::metadata(&self.path).ok()?.len();
        Some(len.div_ceil(self.chunk_size as u64))
    }
}

struct ChunkStream {
    mmap: Mmap,
    offset: usize,
    chunk_size: usize,
}

impl Iterator for ChunkStream {
    type Item = pipeinfer_core::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.mmap.len() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.mmap.len());
        let chunk = self.mmap[self.offset..end].to_vec();
        self.offset = end;
        Some(Ok(chunk))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.mmap.len() - self.offset).div_ceil(self.chunk_size);
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use test_case::test_case;

    #[test_case(10, 3, &[3, 3, 3, 1] ; "ragged tail")]
    #[test_case(8, 4, &[4, 4] ; "exact fit")]
    #[test_case(2, 16, &[2] ; "single short chunk")]
    #[test_case(0, 4, &[] ; "empty file")]
    fn test_chunk_lengths(len: usize, chunk_size: usize, expected: &[usize]) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let bytes: Vec<u8> = (0..len).map(|i| i as u8).collect();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();

        let source = ChunkSource::new(file.path(), chunk_size).unwrap();
        let chunks: Vec<Vec<u8>> = source.open().unwrap().map(|c| c.unwrap()).collect();
        let lengths: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(lengths, expected);
        assert_eq!(chunks.concat(), bytes);
        assert_eq!(source.size_hint(), Some(expected.len() as u64));
    }

    #[test]
    fn test_zero_chunk_size_is_invalid() {
        let err = ChunkSource::new("anything.bin", 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let core: pipeinfer_core::Error = err.into();
        assert_eq!(core.kind(), pipeinfer_core::ErrorKind::OperatorSetup);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = ChunkSource::new(dir.path().join("gone.bin"), 4).unwrap();
        assert!(source.open().is_err());
        assert_eq!(source.size_hint(), None);
    }
}
