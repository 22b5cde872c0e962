//! Line-oriented text files

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use pipeinfer_core::{Source, SourceStream};

use crate::error::Error;

const BOM: char = '\u{feff}';

/// Options for line reading
#[derive(Debug, Clone)]
pub struct LineOptions {
    /// Whether to trim surrounding whitespace from each line
    pub trim_whitespace: bool,

    /// Whether to drop lines that are empty (after trimming)
    pub skip_empty_lines: bool,

    /// Whether to strip a leading byte order mark
    pub strip_bom: bool,
}

impl Default for LineOptions {
    fn default() -> Self {
        Self {
            trim_whitespace: false,
            skip_empty_lines: false,
            strip_bom: true,
        }
    }
}

/// Yields the lines of a UTF-8 text file, without line terminators.
///
/// The file is opened on every [`Source::open`], so each pass rereads it.
/// Invalid UTF-8 ends the stream with an I/O error.
#[derive(Debug, Clone)]
pub struct LineSource {
    path: PathBuf,
    options: LineOptions,
}

impl LineSource {
    /// Read lines from `path`
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options: LineOptions::default(),
        }
    }

    /// Replace the reading options
    pub fn with_options(mut self, options: LineOptions) -> Self {
        self.options = options;
        self
    }

    /// The file being read
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Source<String> for LineSource {
    fn open(&self) -> pipeinfer_core::Result<SourceStream<String>> {
        let file = File::open(&self.path).map_err(|err| Error::at(&self.path, err))?;
        tracing::debug!(path = %self.path.display(), "opened line source");
        Ok(Box::new(LineStream {
            lines: BufReader::new(file).lines(),
            options: self.options.clone(),
            first: true,
            failed: false,
        }))
    }
}

struct LineStream {
    lines: Lines<BufReader<File>>,
    options: LineOptions,
    first: bool,
    failed: bool,
}

impl Iterator for LineStream {
    type Item = pipeinfer_core::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let mut line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(Error::Io(err).into()));
                }
            };
            if std::mem::take(&mut self.first) && self.options.strip_bom && line.starts_with(BOM) {
                line.remove(0);
            }
            if self.options.trim_whitespace {
                let trimmed = line.trim();
                if trimmed.len() != line.len() {
                    line = trimmed.to_string();
                }
            }
            if self.options.skip_empty_lines && line.is_empty() {
                continue;
            }
            return Some(Ok(line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn collect(source: &LineSource) -> Vec<String> {
        source.open().unwrap().map(|line| line.unwrap()).collect()
    }

    fn write_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_reads_lines_and_replays() {
        let file = write_file(b"alpha\nbeta\r\ngamma");
        let source = LineSource::new(file.path());
        assert_eq!(collect(&source), vec!["alpha", "beta", "gamma"]);
        assert_eq!(collect(&source), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_bom_trim_and_skip() {
        let file = write_file("\u{feff}  one \n\n   \ntwo\n".as_bytes());
        let source = LineSource::new(file.path()).with_options(LineOptions {
            trim_whitespace: true,
            skip_empty_lines: true,
            strip_bom: true,
        });
        assert_eq!(collect(&source), vec!["one", "two"]);

        let untouched = LineSource::new(file.path());
        assert_eq!(collect(&untouched), vec!["  one ", "", "   ", "two"]);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let source = LineSource::new(dir.path().join("absent.txt"));
        let err = source.open().err().unwrap();
        assert_eq!(err.kind(), pipeinfer_core::ErrorKind::Io);
        assert!(err.to_string().contains("absent.txt"), "{err}");
    }

    #[test]
    fn test_invalid_utf8_ends_with_error() {
        let file = write_file(b"ok\n\xff\xfe\n");
        let results: Vec<_> = LineSource::new(file.path()).open().unwrap().collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), "ok");
        assert!(results[1].is_err());
    }
}
