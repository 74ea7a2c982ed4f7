use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use dbprobe_core::{
    records::{ConnectionRecord, MIN_COLUMNS},
    settings::Settings,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordErrorKind {
    Io,
    Parse,
    Schema,
    Config,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("could not open file {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not read file")]
    Read(#[source] io::Error),
    #[error("could not read first line of file: file is empty")]
    EmptyFile,
    #[error("could not read first line of file")]
    Header(#[source] csv::Error),
    #[error(
        "unexpected number of columns in file: {columns} (need at least {min})",
        min = MIN_COLUMNS
    )]
    Schema { columns: usize },
    #[error("problem parsing file at line {line}")]
    Row {
        line: u64,
        #[source]
        source: csv::Error,
    },
    #[error("problem parsing file at line {line}")]
    Quote {
        line: u64,
        #[source]
        source: QuoteError,
    },
    #[error(
        "problem parsing file at line {line}: {columns} columns, need at least {min}",
        min = MIN_COLUMNS
    )]
    ShortRow { line: u64, columns: usize },
    #[error("comment marker {0:?} is not an ASCII character")]
    CommentMarker(char),
}

impl RecordError {
    pub fn kind(&self) -> RecordErrorKind {
        match self {
            Self::Open { .. } | Self::Read(_) => RecordErrorKind::Io,
            Self::EmptyFile
            | Self::Header(_)
            | Self::Row { .. }
            | Self::Quote { .. }
            | Self::ShortRow { .. } => RecordErrorKind::Parse,
            Self::Schema { .. } => RecordErrorKind::Schema,
            Self::CommentMarker(_) => RecordErrorKind::Config,
        }
    }

    /// Input line the error points at, when it is tied to one.
    pub fn line(&self) -> Option<u64> {
        match self {
            Self::Row { line, .. } | Self::Quote { line, .. } | Self::ShortRow { line, .. } => {
                Some(*line)
            }
            _ => None,
        }
    }
}

/// Quoting the `csv` crate tolerates but a strict reader refuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QuoteError {
    #[error("bare \" in non-quoted field")]
    Bare,
    #[error("extraneous \" after quoted field")]
    Extraneous,
    #[error("missing closing \" in quoted field")]
    Unterminated,
}

/// Reads connection records out of comma-separated text.
///
/// The first non-comment line is a header and is discarded. The whole input
/// is consumed before anything is returned; the first bad line aborts the read.
#[derive(Clone, Debug)]
pub struct RecordReader {
    comment: Option<u8>,
    flexible: bool,
}

impl RecordReader {
    pub fn new(settings: &Settings) -> Result<Self, RecordError> {
        let comment = settings
            .comment
            .map(|marker| {
                if marker.is_ascii() {
                    Ok(marker as u8)
                } else {
                    Err(RecordError::CommentMarker(marker))
                }
            })
            .transpose()?;
        Ok(Self {
            comment,
            flexible: settings.flexible,
        })
    }

    pub fn read_path(&self, path: &Path) -> Result<Vec<ConnectionRecord>, RecordError> {
        let file = File::open(path).map_err(|source| RecordError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        self.read(file)
    }

    pub fn read<R: Read>(&self, mut input: R) -> Result<Vec<ConnectionRecord>, RecordError> {
        let mut raw = Vec::new();
        input.read_to_end(&mut raw).map_err(RecordError::Read)?;
        let mut lines = RawLines::new(&raw, self.comment);

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(self.flexible)
            .comment(self.comment)
            .from_reader(raw.as_slice());
        let mut rows = reader.records();

        let header = match rows.next() {
            Some(header) => header.map_err(RecordError::Header)?,
            None => return Err(RecordError::EmptyFile),
        };
        lines.check(header.position())?;
        if header.len() < MIN_COLUMNS {
            return Err(RecordError::Schema {
                columns: header.len(),
            });
        }

        let mut records = Vec::new();
        for row in rows {
            let row = row.map_err(|source| RecordError::Row {
                line: lines.line_of(source.position()),
                source,
            })?;
            let line = lines.check(row.position())?;
            let record = ConnectionRecord::from_columns(|idx| row.get(idx)).ok_or(
                RecordError::ShortRow {
                    line,
                    columns: row.len(),
                },
            )?;
            records.push(record);
        }

        tracing::debug!(count = records.len(), "Parsed connection records");
        Ok(records)
    }
}

/// Maps record positions reported by `csv` back onto the raw input.
struct RawLines<'a> {
    bytes: &'a [u8],
    comment: Option<u8>,
    cursor: usize,
    line: u64,
}

impl<'a> RawLines<'a> {
    fn new(bytes: &'a [u8], comment: Option<u8>) -> Self {
        Self {
            bytes,
            comment,
            cursor: 0,
            line: 1,
        }
    }

    /// `csv` stamps a record with the offset where it started looking, which
    /// sits before any blank or comment lines it skipped.
    fn locate(&mut self, pos: Option<&csv::Position>) -> Option<(usize, u64)> {
        let mut at = usize::try_from(pos?.byte()).ok()?;
        loop {
            match self.bytes.get(at) {
                Some(b'\n' | b'\r') => at += 1,
                Some(byte) if Some(*byte) == self.comment => {
                    at = self.bytes[at..]
                        .iter()
                        .position(|b| *b == b'\n')
                        .map_or(self.bytes.len(), |end| at + end + 1);
                }
                _ => break,
            }
        }

        if at < self.cursor {
            self.cursor = 0;
            self.line = 1;
        }
        self.line += self.bytes[self.cursor..at]
            .iter()
            .filter(|b| **b == b'\n')
            .count() as u64;
        self.cursor = at;
        Some((at, self.line))
    }

    fn line_of(&mut self, pos: Option<&csv::Position>) -> u64 {
        self.locate(pos).map_or(self.line, |(_, line)| line)
    }

    /// Checks the quoting of the record starting at `pos` and returns its line.
    fn check(&mut self, pos: Option<&csv::Position>) -> Result<u64, RecordError> {
        let Some((start, line)) = self.locate(pos) else {
            return Ok(self.line);
        };
        check_quoting(&self.bytes[start..])
            .map_err(|source| RecordError::Quote { line, source })?;
        Ok(line)
    }
}

/// Walks one record from its first byte up to the line end outside quotes.
fn check_quoting(record: &[u8]) -> Result<(), QuoteError> {
    let mut i = 0;
    loop {
        if record.get(i) == Some(&b'"') {
            i += 1;
            loop {
                match record.get(i) {
                    None => return Err(QuoteError::Unterminated),
                    Some(b'"') if record.get(i + 1) == Some(&b'"') => i += 2,
                    Some(b'"') => {
                        i += 1;
                        break;
                    }
                    Some(_) => i += 1,
                }
            }
            match record.get(i) {
                None | Some(b'\n' | b'\r') => return Ok(()),
                Some(b',') => i += 1,
                Some(_) => return Err(QuoteError::Extraneous),
            }
        } else {
            loop {
                match record.get(i) {
                    None | Some(b'\n' | b'\r') => return Ok(()),
                    Some(b',') => {
                        i += 1;
                        break;
                    }
                    Some(b'"') => return Err(QuoteError::Bare),
                    Some(_) => i += 1,
                }
            }
        }
    }
}
