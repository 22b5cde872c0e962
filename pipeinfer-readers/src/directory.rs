//! Directory listings

use std::fs;
use std::path::{Path, PathBuf};

use pipeinfer_core::{Source, SourceStream};

use crate::error::{Error, Result};

/// Yields the paths of the regular files in a directory, sorted.
///
/// Subdirectories are not descended into. The listing is taken when a pass
/// starts, so files created during the pass are not seen until the next one.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    extension: Option<String>,
}

impl DirectorySource {
    /// List `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            extension: None,
        }
    }

    /// Keep only files with this extension; case-insensitive, leading dot optional
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = Some(extension.trim_start_matches('.').to_ascii_lowercase());
        self
    }

    /// The directory being listed
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn accepts(&self, path: &Path) -> bool {
        match &self.extension {
            None => true,
            Some(wanted) => path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted)),
        }
    }

    /// The current listing
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| Error::at(&self.dir, err))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if self.accepts(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl Source<String> for DirectorySource {
    fn open(&self) -> pipeinfer_core::Result<SourceStream<String>> {
        let paths = self.list()?;
        tracing::debug!(dir = %self.dir.display(), files = paths.len(), "listed directory source");
        Ok(Box::new(
            paths
                .into_iter()
                .map(|path| Ok(path.to_string_lossy().into_owned())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.txt", "a.TXT", "c.bin", "notes"] {
            fs::write(dir.path().join(name), name).unwrap();
        }
        fs::create_dir(dir.path().join("nested.txt")).unwrap();
        dir
    }

    fn names(source: &DirectorySource) -> Vec<String> {
        source
            .open()
            .unwrap()
            .map(|path| {
                let path = PathBuf::from(path.unwrap());
                path.file_name().unwrap().to_string_lossy().into_owned()
            })
            .collect()
    }

    #[test]
    fn test_lists_files_sorted() {
        let dir = populated();
        let source = DirectorySource::new(dir.path());
        assert_eq!(names(&source), vec!["a.TXT", "b.txt", "c.bin", "notes"]);
    }

    #[test]
    fn test_extension_filter() {
        let dir = populated();
        let text = DirectorySource::new(dir.path()).with_extension(".txt");
        assert_eq!(names(&text), vec!["a.TXT", "b.txt"]);
        let binary = DirectorySource::new(dir.path()).with_extension("bin");
        assert_eq!(names(&binary), vec!["c.bin"]);
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path().join("nowhere"));
        assert!(matches!(source.list(), Err(Error::NotFound(_))));
        assert!(source.open().is_err());
    }
}
