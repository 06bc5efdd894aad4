//! Pull-based reader over tab-separated dataset dumps.
//!
//! A [`TsvReader`] validates the header once when the source is opened and then
//! yields one [`Row`] per line, holding a single line buffer at a time so that
//! multi-gigabyte dumps can be streamed. Files ending in `.gz` are decompressed
//! on the fly.

use crate::common::constants::{FIELD_DELIMITER, GZIP_SUFFIX, NULL_SENTINEL};
use crate::common::error::{ImporterError, Result};
use flate2::read::MultiGzDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Column layout established by the first line of a source
#[derive(Debug)]
pub struct Header {
    columns: Vec<String>,
    index: HashMap<String, usize>,
}

impl Header {
    fn parse(line: &str) -> Self {
        let columns: Vec<String> = line.split(FIELD_DELIMITER).map(str::to_string).collect();
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Self { columns, index }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    fn missing<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required
            .iter()
            .copied()
            .filter(|c| !self.index.contains_key(*c))
            .collect()
    }
}

/// One data line tagged with the source header.
#[derive(Debug, Clone)]
pub struct Row {
    header: Arc<Header>,
    fields: Vec<String>,
}

impl Row {
    /// Value of `column`, or `None` when the field holds the `\N` sentinel, is
    /// empty, or lies past the end of a short row.
    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.header.position(column)?;
        let value = self.fields.get(idx)?.as_str();
        if value.is_empty() || value == NULL_SENTINEL {
            None
        } else {
            Some(value)
        }
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }
}

pub struct TsvReader {
    path: PathBuf,
    lines: Box<dyn BufRead + Send>,
    header: Arc<Header>,
    buf: String,
    rows_read: u64,
}

impl std::fmt::Debug for TsvReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsvReader")
            .field("path", &self.path)
            .field("rows_read", &self.rows_read)
            .finish()
    }
}

impl TsvReader {
    /// Opens `path` and checks that every column in `required` is present in
    /// its header.
    pub fn open<P: AsRef<Path>>(path: P, required: &[&str]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(ImporterError::SourceNotFound(path));
        }

        let file = File::open(&path)?;
        let is_gz = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(GZIP_SUFFIX))
            .unwrap_or(false);
        let mut lines: Box<dyn BufRead + Send> = if is_gz {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let mut first = String::new();
        if lines.read_line(&mut first)? == 0 {
            return Err(ImporterError::EmptySource(path));
        }
        let header = Header::parse(trim_line_end(&first));

        let missing = header.missing(required);
        if !missing.is_empty() {
            return Err(ImporterError::MissingColumns {
                path,
                columns: missing.into_iter().map(str::to_string).collect(),
            });
        }

        info!(
            "Opened source {} ({} columns, gzip={})",
            path.display(),
            header.columns().len(),
            is_gz
        );

        Ok(Self {
            path,
            lines,
            header: Arc::new(header),
            buf: String::new(),
            rows_read: 0,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }
}

impl Iterator for TsvReader {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.lines.read_line(&mut self.buf) {
                Ok(0) => {
                    debug!("Reached end of {} after {} rows", self.path.display(), self.rows_read);
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }

            let line = trim_line_end(&self.buf);
            if line.is_empty() {
                continue;
            }

            self.rows_read += 1;
            let fields = line.split(FIELD_DELIMITER).map(str::to_string).collect();
            return Some(Ok(Row {
                header: Arc::clone(&self.header),
                fields,
            }));
        }
    }
}

fn trim_line_end(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_source(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn sentinel_becomes_absent() {
        let dir = tempdir().unwrap();
        let path = write_source(
            dir.path(),
            "basics.tsv",
            "tconst\tprimaryTitle\tstartYear\ntt1\tHeat\t\\N\n",
        );

        let rows: Vec<Row> = TsvReader::open(&path, &["tconst"])
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("tconst"), Some("tt1"));
        assert_eq!(rows[0].get("primaryTitle"), Some("Heat"));
        assert_eq!(rows[0].get("startYear"), None);
    }

    #[test]
    fn short_row_yields_missing_trailing_values() {
        let dir = tempdir().unwrap();
        let path = write_source(dir.path(), "r.tsv", "a\tb\tc\n1\n4\t5\t6\t7\n");

        let rows: Vec<Row> = TsvReader::open(&path, &[]).unwrap().map(|r| r.unwrap()).collect();

        assert_eq!(rows[0].get("a"), Some("1"));
        assert_eq!(rows[0].get("b"), None);
        assert_eq!(rows[0].get("c"), None);
        assert_eq!(rows[1].get("c"), Some("6"));
        assert_eq!(rows[1].width(), 4);
    }

    #[test]
    fn crlf_and_blank_lines_are_tolerated() {
        let dir = tempdir().unwrap();
        let path = write_source(dir.path(), "r.tsv", "a\tb\r\n\r\nx\ty\r\n");

        let mut reader = TsvReader::open(&path, &["a", "b"]).unwrap();
        let row = reader.next().unwrap().unwrap();
        assert_eq!(row.get("b"), Some("y"));
        assert!(reader.next().is_none());
        assert_eq!(reader.rows_read(), 1);
    }

    #[test]
    fn gzip_sources_are_decompressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ratings.tsv.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(b"tconst\tnumVotes\ntt9\t1200\n").unwrap();
        enc.finish().unwrap();

        let rows: Vec<Row> = TsvReader::open(&path, &["tconst", "numVotes"])
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("numVotes"), Some("1200"));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = TsvReader::open("/definitely/not/here.tsv", &[]).unwrap_err();
        assert!(matches!(err, ImporterError::SourceNotFound(_)));
    }

    #[test]
    fn missing_columns_are_rejected() {
        let dir = tempdir().unwrap();
        let path = write_source(dir.path(), "r.tsv", "tconst\tfoo\n");

        let err = TsvReader::open(&path, &["tconst", "numVotes", "averageRating"]).unwrap_err();
        match err {
            ImporterError::MissingColumns { columns, .. } => {
                assert_eq!(columns, vec!["numVotes".to_string(), "averageRating".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_file_has_no_header() {
        let dir = tempdir().unwrap();
        let path = write_source(dir.path(), "empty.tsv", "");
        assert!(matches!(
            TsvReader::open(&path, &[]).unwrap_err(),
            ImporterError::EmptySource(_)
        ));
    }
}
