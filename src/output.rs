//! Buffered, gzip-compressed event log
//!
//! An [`OutputLog`] owns one destination file, an in-memory buffer of
//! pending events and at most one open write handle. Events are appended to
//! the buffer from anywhere (including asynchronous callbacks) and written
//! out at explicit flush points as newline-delimited JSON.
//!
//! # Flush ordering
//!
//! ```text
//! add(ev) ──► buffer: Mutex<Vec<Event>>
//!                │
//! flush():       │ mem::take (buffer lock held only for the swap)
//!                ▼
//!             batch ──► serialize ──► sink: Mutex<Option<Sink>> ──► gzip member
//! ```
//!
//! The buffer and the sink have separate locks, so an `add` racing a write
//! lands in the next batch instead of being dropped or written twice.
//!
//! # Segments
//!
//! A finished log is a sequence of gzip members. Appending another log's
//! file verbatim yields a multi-member stream that [`MultiGzDecoder`] reads
//! as one logical stream.

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, ScrutinizeError};
use crate::event::Event;

/// File name used for per-process temporary logs
pub const LOG_FILE_NAME: &str = "output.jsonl.gz";

/// Write side of an open log
enum Sink {
    /// Inside a gzip member
    Encoding(GzEncoder<BufWriter<File>>),
    /// Between members: raw bytes may be appended
    Raw(BufWriter<File>),
    /// A member failed to finish; nothing more can be written
    Broken,
}

impl Sink {
    fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = BufWriter::new(File::create(path)?);
        Ok(Sink::Encoding(GzEncoder::new(file, Compression::fast())))
    }

    /// Current gzip member, starting a new one if needed
    fn encoder(&mut self) -> io::Result<&mut GzEncoder<BufWriter<File>>> {
        if let Sink::Raw(_) = self {
            if let Sink::Raw(file) = std::mem::replace(self, Sink::Broken) {
                *self = Sink::Encoding(GzEncoder::new(file, Compression::fast()));
            }
        }
        match self {
            Sink::Encoding(encoder) => Ok(encoder),
            _ => Err(broken_sink()),
        }
    }

    /// Underlying file, finishing the current gzip member first
    fn raw(&mut self) -> io::Result<&mut BufWriter<File>> {
        if let Sink::Encoding(_) = self {
            if let Sink::Encoding(encoder) = std::mem::replace(self, Sink::Broken) {
                *self = Sink::Raw(encoder.finish()?);
            }
        }
        match self {
            Sink::Raw(file) => Ok(file),
            _ => Err(broken_sink()),
        }
    }

    fn close(self) -> io::Result<()> {
        let mut file = match self {
            Sink::Encoding(encoder) => encoder.finish()?,
            Sink::Raw(file) => file,
            Sink::Broken => return Err(broken_sink()),
        };
        file.flush()
    }
}

fn broken_sink() -> io::Error {
    io::Error::other("log sink is unusable after a failed gzip member")
}

/// How a segment was merged into a log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Complete segment appended byte for byte
    Copied { bytes: u64 },
    /// Truncated segment: its decodable events were re-encoded
    Recovered { events: usize },
    /// Zero-length segment, nothing appended
    Empty,
}

/// One event stream on disk
pub struct OutputLog {
    path: PathBuf,
    buffer: Mutex<Vec<Event>>,
    sink: Mutex<Option<Sink>>,
}

impl OutputLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buffer: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
        }
    }

    /// Log in a fresh temporary directory
    ///
    /// The directory is left on disk: a worker's log must outlive the
    /// worker so the coordinator can merge it.
    pub fn temporary() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("scrutinize-").tempdir()?.keep();
        Ok(Self::new(dir.join(LOG_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Number of buffered events not yet flushed
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Queue an event for the next flush
    pub fn add(&self, event: impl Into<Event>) {
        self.buffer.lock().push(event.into());
    }

    /// Open the exclusive write handle
    ///
    /// The returned guard flushes the buffer and releases the handle when
    /// closed or dropped.
    pub fn open_for_write(self: &Arc<Self>) -> Result<WriteGuard> {
        let mut slot = self.sink.lock();
        if slot.is_some() {
            return Err(ScrutinizeError::AlreadyOpen {
                path: self.path.clone(),
            });
        }
        *slot = Some(Sink::open(&self.path)?);
        tracing::debug!(path = %self.path.display(), "opened event log for write");
        Ok(WriteGuard {
            log: Arc::clone(self),
            closed: false,
        })
    }

    /// Queue an event only while a write handle is open
    ///
    /// Hands the event back once the log has been closed, since nothing
    /// would ever flush it.
    pub fn add_if_open(&self, event: impl Into<Event>) -> std::result::Result<(), Event> {
        // Sink before buffer, the same order flush takes them in
        let slot = self.sink.lock();
        if slot.is_none() {
            return Err(event.into());
        }
        self.buffer.lock().push(event.into());
        Ok(())
    }

    /// Write out everything buffered so far, returning the event count
    ///
    /// The buffer is swapped for an empty one before writing starts. An
    /// empty buffer writes nothing.
    pub fn flush(&self) -> Result<usize> {
        let mut slot = self.sink.lock();
        let sink = slot.as_mut().ok_or_else(|| ScrutinizeError::NotOpen {
            path: self.path.clone(),
        })?;
        self.write_batch(sink)
    }

    fn write_batch(&self, sink: &mut Sink) -> Result<usize> {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return Ok(0);
        }

        let mut bytes = Vec::with_capacity(batch.len() * 256);
        for event in &batch {
            serde_json::to_writer(&mut bytes, event)?;
            bytes.push(b'\n');
        }

        let encoder = sink.encoder()?;
        encoder.write_all(&bytes)?;
        // Sync flush: a crash after this point still leaves a decodable prefix
        encoder.flush()?;

        tracing::trace!(events = batch.len(), bytes = bytes.len(), "flushed event batch");
        Ok(batch.len())
    }

    /// Open a decompressing reader; fails while a write handle is open
    pub fn open_for_read(&self) -> Result<LogReader> {
        if self.is_open() {
            return Err(ScrutinizeError::WriterActive {
                path: self.path.clone(),
            });
        }
        LogReader::open(&self.path)
    }

    /// Move the closed log file to `dest`
    pub fn move_to(&self, dest: &Path) -> Result<()> {
        if self.is_open() {
            return Err(ScrutinizeError::WriterActive {
                path: self.path.clone(),
            });
        }
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        if fs::rename(&self.path, dest).is_err() {
            // Different filesystem
            fs::copy(&self.path, dest)?;
            fs::remove_file(&self.path)?;
        }
        tracing::debug!(from = %self.path.display(), to = %dest.display(), "moved event log");
        Ok(())
    }
}

impl std::fmt::Debug for OutputLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputLog")
            .field("path", &self.path)
            .field("pending", &self.pending())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Exclusive write handle on an [`OutputLog`]
pub struct WriteGuard {
    log: Arc<OutputLog>,
    closed: bool,
}

impl WriteGuard {
    pub fn log(&self) -> &Arc<OutputLog> {
        &self.log
    }

    pub fn flush(&self) -> Result<usize> {
        self.log.flush()
    }

    /// Append another closed log's segment after everything flushed so far
    ///
    /// A complete segment is copied byte for byte. A truncated one is decoded
    /// up to its last complete event, and those events are written as a new
    /// gzip member.
    pub fn append_segment(&self, segment: &OutputLog) -> Result<SegmentOutcome> {
        self.log.flush()?;

        if same_file(segment.path(), self.log.path()) {
            return Err(ScrutinizeError::SegmentIsDestination {
                path: segment.path().to_path_buf(),
            });
        }
        if fs::metadata(segment.path())?.len() == 0 {
            return Ok(SegmentOutcome::Empty);
        }

        // Validate by streaming; only a damaged segment is decoded into events
        let mut reader = segment.open_for_read()?;
        reader.verify()?;

        let mut slot = self.log.sink.lock();
        let sink = slot.as_mut().ok_or_else(|| ScrutinizeError::NotOpen {
            path: self.log.path.clone(),
        })?;

        if reader.truncated() {
            let events = segment.open_for_read()?.events()?;
            let mut bytes = Vec::new();
            for event in &events {
                serde_json::to_writer(&mut bytes, event)?;
                bytes.push(b'\n');
            }
            let encoder = sink.encoder()?;
            encoder.write_all(&bytes)?;
            encoder.flush()?;
            return Ok(SegmentOutcome::Recovered {
                events: events.len(),
            });
        }

        let file = sink.raw()?;
        let mut source = File::open(segment.path())?;
        let bytes = io::copy(&mut source, file)?;
        file.flush()?;
        Ok(SegmentOutcome::Copied { bytes })
    }

    /// Flush remaining events and release the handle
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        close_log(&self.log)
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = close_log(&self.log) {
            tracing::error!(path = %self.log.path.display(), error = %e, "failed to close event log");
        }
    }
}

/// True if both paths name one existing file
pub(crate) fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn close_log(log: &OutputLog) -> Result<()> {
    // One lock across the final flush and the take: no add can slip between
    let mut slot = log.sink.lock();
    let flushed = match slot.as_mut() {
        Some(sink) => log.write_batch(sink),
        None => Ok(0),
    };
    let closed = match slot.take() {
        Some(sink) => sink.close().map_err(ScrutinizeError::from),
        None => Ok(()),
    };
    drop(slot);
    flushed?;
    closed?;
    tracing::debug!(path = %log.path.display(), "closed event log");
    Ok(())
}

/// Decompressing reader over a (possibly multi-segment) log file
pub struct LogReader {
    path: PathBuf,
    decoder: MultiGzDecoder<BufReader<File>>,
    truncated: bool,
}

impl LogReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            decoder: MultiGzDecoder::new(BufReader::new(file)),
            truncated: false,
        })
    }

    /// True if the stream ended in an incomplete or corrupt gzip member
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Decompressed bytes up to the last valid boundary
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.decode_into(&mut data)?;
        Ok(data)
    }

    /// Decode the whole stream without keeping it, returning its length
    ///
    /// Sets [`truncated`](Self::truncated) exactly as a full read would.
    pub fn verify(&mut self) -> Result<u64> {
        self.decode_into(&mut io::sink())
    }

    fn decode_into<W: Write>(&mut self, out: &mut W) -> Result<u64> {
        let mut total = 0u64;
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match self.decoder.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    out.write_all(&chunk[..n])?;
                    total += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::UnexpectedEof
                            | io::ErrorKind::InvalidInput
                            | io::ErrorKind::InvalidData
                    ) =>
                {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "event log ends in a damaged segment, treating as end of stream"
                    );
                    self.truncated = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Parse every complete event record
    ///
    /// After truncation, a trailing record without its newline is dropped.
    pub fn events(&mut self) -> Result<Vec<Event>> {
        let data = self.read_to_end()?;
        let complete = if self.truncated {
            match data.iter().rposition(|&b| b == b'\n') {
                Some(end) => &data[..=end],
                None => &[][..],
            }
        } else {
            &data[..]
        };

        complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(|line| serde_json::from_slice(line).map_err(ScrutinizeError::from))
            .collect()
    }
}

/// Read every event from a log file
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    LogReader::open(path)?.events()
}
