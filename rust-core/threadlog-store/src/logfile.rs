// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Store - Session log file helpers
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Line-level access to a session's `log.jsonl`. Only bytes up to and
// including the last newline are ever treated as data; anything after it is
// a torn write.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Take};
use std::path::Path;

use tracing::warn;

use crate::error::StoreResult;

const TAIL_CHUNK: u64 = 8 * 1024;

/// Lengths describing the state of a log file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogExtent {
    /// Bytes up to and including the last newline.
    pub complete: u64,
    /// Physical file length.
    pub physical: u64,
}

impl LogExtent {
    /// Returns `true` when the file ends in a partial line.
    pub fn is_torn(&self) -> bool {
        self.physical > self.complete
    }
}

/// Measure a log without reading it front to back. A missing file has zero
/// extent.
pub fn measure(path: &Path) -> StoreResult<LogExtent> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LogExtent::default()),
        Err(e) => return Err(e.into()),
    };
    let physical = file.metadata()?.len();

    let mut end = physical;
    let mut chunk = Vec::with_capacity(TAIL_CHUNK as usize);
    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK);
        chunk.resize((end - start) as usize, 0);
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk)?;
        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(LogExtent {
                complete: start + pos as u64 + 1,
                physical,
            });
        }
        end = start;
    }

    Ok(LogExtent {
        complete: 0,
        physical,
    })
}

/// Cut a log back to `len` bytes and make the cut durable.
pub fn truncate_to(path: &Path, len: u64) -> StoreResult<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    let before = file.metadata()?.len();
    if before > len {
        file.set_len(len)?;
        file.sync_all()?;
        warn!(
            path = %path.display(),
            removed_bytes = before - len,
            "Truncated partial log tail"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// LineCursor
// ---------------------------------------------------------------------------

/// Forward iterator over complete lines in `[start, end)` of a log file.
///
/// A final line without its newline inside the window is never yielded.
pub struct LineCursor {
    reader: BufReader<Take<File>>,
    offset: u64,
    buf: Vec<u8>,
}

impl LineCursor {
    /// Position a cursor at `start`. Returns `None` if the file does not
    /// exist.
    pub fn open(path: &Path, start: u64, end: u64) -> StoreResult<Option<Self>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(start))?;
        Ok(Some(Self {
            reader: BufReader::new(file.take(end.saturating_sub(start))),
            offset: start,
            buf: Vec::new(),
        }))
    }

    /// Byte offset of the next line.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next complete line. Returns its starting offset and its
    /// bytes without the newline.
    pub fn next_line(&mut self) -> StoreResult<Option<(u64, &[u8])>> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf)?;
        if n == 0 || self.buf.last() != Some(&b'\n') {
            return Ok(None);
        }
        let start = self.offset;
        self.offset += n as u64;
        let mut line = &self.buf[..n - 1];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        Ok(Some((start, line)))
    }
}
