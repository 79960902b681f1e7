use crate::error::TailError;
use crate::events::LineIndex;
use log::{debug, warn};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// Size of each backwards read when collecting the last lines of the file
const TAIL_CHUNK_BYTES: u64 = 8 * 1024;

/// Size of each forward read when counting newly appended lines
const SCAN_CHUNK_BYTES: usize = 64 * 1024;

/// Future returned by a line source read
pub type TailFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<TailLine>, TailError>> + Send + 'a>>;

/// Where the poll loop gets its most recent log lines from
pub trait LineSource: Send {
    /// Return at most `max_lines` most recent complete lines of `path`, oldest first
    fn read_tail<'a>(&'a mut self, path: &'a Path, max_lines: usize) -> TailFuture<'a>;

    /// Forget any position kept for the current file
    fn reset(&mut self);
}

/// One complete line returned by a tail read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailLine {
    /// Zero-based position of the line in the file
    pub index: LineIndex,
    /// Line text without the trailing newline
    pub text: String,
}

/// How far into the current file complete lines have been counted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LineCursor {
    /// Byte offset just past the last counted newline
    offset: u64,
    /// Number of complete lines before `offset`
    lines: u64,
}

/// Reads the most recent complete lines of a growing log file
///
/// The reader never re-reads the whole file. It remembers how many complete lines
/// precede a byte offset and on every call only scans the bytes appended since, which
/// gives each returned line its absolute index. The last lines themselves are read
/// backwards from the end. A trailing line without a newline is still being written
/// by the producer and is left for a later call.
#[derive(Debug, Default)]
pub struct TailReader {
    /// File the cursor belongs to
    path: Option<PathBuf>,
    cursor: LineCursor,
}

impl TailReader {
    /// Create a reader with no position in any file
    pub fn new() -> Self {
        Self::default()
    }

    /// Return at most `max_lines` most recent complete lines of `path`, oldest first
    ///
    /// # Errors
    ///
    /// Returns `TailError::NotFound` when the file does not exist yet and
    /// `TailError::Io` when it cannot be read. Both mean "unavailable for this tick".
    pub async fn tail(&mut self, path: &Path, max_lines: usize) -> Result<Vec<TailLine>, TailError> {
        if self.path.as_deref() != Some(path) {
            debug!("Tail reader switching to {}", path.display());
            self.path = Some(path.to_path_buf());
            self.cursor = LineCursor::default();
        }

        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TailError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(TailError::Io(e)),
        };
        let file_len = file.metadata().await?.len();

        if file_len < self.cursor.offset {
            warn!(
                "{} shrank from {} to {} bytes; recounting lines from the start",
                path.display(),
                self.cursor.offset,
                file_len
            );
            self.cursor = LineCursor::default();
        }

        self.cursor = Self::count_new_lines(&mut file, self.cursor, file_len).await?;

        if max_lines == 0 || self.cursor.lines == 0 {
            return Ok(Vec::new());
        }

        let texts = Self::read_last_lines(&mut file, self.cursor.offset, max_lines).await?;
        let first_index = self.cursor.lines - texts.len() as u64;

        Ok(texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| TailLine {
                index: first_index + i as u64,
                text,
            })
            .collect())
    }

    /// Scan bytes appended after `cursor` and advance it past the last full line
    async fn count_new_lines(
        file: &mut File,
        cursor: LineCursor,
        file_len: u64,
    ) -> Result<LineCursor, TailError> {
        let mut next = cursor;
        if file_len == cursor.offset {
            return Ok(next);
        }

        file.seek(SeekFrom::Start(cursor.offset)).await?;
        let mut position = cursor.offset;
        let mut buffer = vec![0u8; SCAN_CHUNK_BYTES];

        while position < file_len {
            let want = ((file_len - position) as usize).min(SCAN_CHUNK_BYTES);
            let read = file.read(&mut buffer[..want]).await?;
            if read == 0 {
                break;
            }
            for (i, byte) in buffer[..read].iter().enumerate() {
                if *byte == b'\n' {
                    next.lines += 1;
                    next.offset = position + i as u64 + 1;
                }
            }
            position += read as u64;
        }

        Ok(next)
    }

    /// Read the last `max_lines` lines that end at `end`, which sits just past a newline
    async fn read_last_lines(
        file: &mut File,
        end: u64,
        max_lines: usize,
    ) -> Result<Vec<String>, TailError> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut start = end;

        // Stop once the buffer holds max_lines full lines plus the newline before them
        while start > 0 && newline_count(&buffer) <= max_lines {
            let chunk_start = start.saturating_sub(TAIL_CHUNK_BYTES);
            let mut chunk = vec![0u8; (start - chunk_start) as usize];
            file.seek(SeekFrom::Start(chunk_start)).await?;
            file.read_exact(&mut chunk).await?;
            chunk.extend_from_slice(&buffer);
            buffer = chunk;
            start = chunk_start;
        }

        let text = String::from_utf8_lossy(&buffer);
        let body = text.strip_suffix('\n').unwrap_or(&text);
        let lines: Vec<&str> = body.split('\n').collect();

        // Without reaching the start of the file the first piece is a partial line
        let complete = if start > 0 { &lines[1..] } else { &lines[..] };
        let skip = complete.len().saturating_sub(max_lines);

        Ok(complete[skip..].iter().map(|line| line.to_string()).collect())
    }
}

impl LineSource for TailReader {
    fn read_tail<'a>(&'a mut self, path: &'a Path, max_lines: usize) -> TailFuture<'a> {
        Box::pin(self.tail(path, max_lines))
    }

    fn reset(&mut self) {
        *self = TailReader::new();
    }
}

fn newline_count(bytes: &[u8]) -> usize {
    bytes.iter().filter(|b| **b == b'\n').count()
}
