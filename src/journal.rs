//! Append-only grant journal: the durable source of truth.
//!
//! Each committed grant is one text line,
//! `<class> <certificate_number> <amount> <holder>`, newline-terminated. The
//! holder is the final field and runs to the end of the line, so it may
//! contain spaces; line terminators are rejected upstream. A record's bytes
//! are flushed and synced before the grant is acknowledged, which makes the
//! sync the commit point. On startup the file is replayed in order, after
//! truncating a torn final line left by a crash mid-write.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use thiserror::Error;
use tracing::warn;

use crate::model::GrantRecord;

/// Errors opening, appending to, or replaying the journal.
///
/// Everything except `Io` means the journal content itself is bad, which
/// aborts startup rather than risk issuing duplicate certificate numbers.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal i/o: {0}")]
    Io(#[from] io::Error),

    #[error("journal is not valid utf-8")]
    NotUtf8,

    #[error("line {line}: expected '<class> <number> <amount> <holder>', got '{content}'")]
    MalformedLine { line: usize, content: String },

    #[error("line {line}: invalid certificate number '{field}'")]
    BadNumber { line: usize, field: String },

    #[error("line {line}: invalid amount '{field}'")]
    BadAmount { line: usize, field: String },
}

/// Open journal handle held by the engine's writer. The file is opened in
/// append mode and owned exclusively for the life of the process.
pub struct Journal {
    file: File,
}

impl Journal {
    /// Open the journal for appending, creating it if absent.
    ///
    /// Callers run [`replay`] first; it repairs a torn tail in place.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self { file })
    }

    /// Append one record and sync it to disk.
    ///
    /// Returns only once the bytes are durable. A failure here is not
    /// recoverable in-process: memory and disk may already disagree.
    pub fn append(&mut self, record: &GrantRecord) -> Result<(), JournalError> {
        self.file.write_all(format_line(record).as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Outcome of scanning the journal at startup.
#[derive(Debug)]
pub struct Replay {
    /// Committed records, in journal order.
    pub records: Vec<GrantRecord>,
    /// Byte offset the file was truncated to, if a torn tail was discarded.
    pub truncated_tail: Option<u64>,
}

/// Read the journal end to end, discarding a torn (newline-less) final line.
///
/// The torn tail is truncated from the file on disk before parsing, so a
/// subsequent [`Journal::open`] appends from a clean record boundary. A
/// missing file is an empty journal. An unparseable interior line is
/// corruption and fails the replay.
pub fn replay(path: impl AsRef<Path>) -> Result<Replay, JournalError> {
    let path = path.as_ref();
    let mut raw = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(Replay {
                records: Vec::new(),
                truncated_tail: None,
            })
        }
        Err(err) => return Err(err.into()),
    };

    let mut truncated_tail = None;
    if !raw.is_empty() && raw.last() != Some(&b'\n') {
        let keep = raw
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|i| i as u64 + 1)
            .unwrap_or(0);
        warn!(
            discarded = raw.len() as u64 - keep,
            "discarding torn journal tail"
        );
        truncate_to(path, keep)?;
        raw.truncate(keep as usize);
        truncated_tail = Some(keep);
    }

    let text = String::from_utf8(raw).map_err(|_| JournalError::NotUtf8)?;
    let mut records = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        records.push(parse_line(line, idx + 1)?);
    }

    Ok(Replay {
        records,
        truncated_tail,
    })
}

fn truncate_to(path: &Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()
}

fn format_line(record: &GrantRecord) -> String {
    format!(
        "{} {} {} {}\n",
        record.class, record.number, record.amount, record.holder
    )
}

/// Parse one journal line. The first three space-delimited fields are class,
/// certificate number, and amount; the rest of the line is the holder.
fn parse_line(line: &str, line_no: usize) -> Result<GrantRecord, JournalError> {
    let malformed = || JournalError::MalformedLine {
        line: line_no,
        content: line.to_string(),
    };

    let mut fields = line.splitn(4, ' ');
    let (Some(class), Some(number), Some(amount)) =
        (fields.next(), fields.next(), fields.next())
    else {
        return Err(malformed());
    };
    if class.is_empty() {
        return Err(malformed());
    }

    let number = number
        .parse::<u64>()
        .ok()
        .filter(|n| *n >= 1)
        .ok_or_else(|| JournalError::BadNumber {
            line: line_no,
            field: number.to_string(),
        })?;
    let amount = amount
        .parse::<u32>()
        .ok()
        .filter(|a| *a >= 1)
        .ok_or_else(|| JournalError::BadAmount {
            line: line_no,
            field: amount.to_string(),
        })?;
    let holder = fields.next().unwrap_or("");

    Ok(GrantRecord::new(class, number, amount, holder))
}
