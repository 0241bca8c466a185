use regex::Regex;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};

pub const DEFAULT_OUTPUT_BUFFER_LINES: usize = 200;

/// Longest line kept from a service. Bytes past this are dropped up to the
/// next newline.
pub const MAX_LINE_BYTES: usize = 16 * 1024;

/// Where a service's output goes besides the in-memory tail.
#[derive(Debug, Clone)]
pub struct OutputOptions {
    pub buffer_lines: usize,
    pub log_dir: Option<PathBuf>,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            buffer_lines: DEFAULT_OUTPUT_BUFFER_LINES,
            log_dir: None,
        }
    }
}

impl OutputOptions {
    pub fn log_path(&self, service: &str) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{service}.log")))
    }
}

pub type SharedOutput = Arc<Mutex<OutputBuffer>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    /// The line as stored in the tail and the log sink.
    pub fn tag(self, line: &str) -> Cow<'_, str> {
        match self {
            OutputStream::Stdout => Cow::Borrowed(line),
            OutputStream::Stderr => Cow::Owned(format!("[stderr] {line}")),
        }
    }
}

/// Bounded tail of a service's combined stdout/stderr.
///
/// Only the most recent `capacity` lines are retained. The readiness marker is
/// evaluated on every line as it arrives, so a match is remembered even after
/// the matching line has been evicted from the tail.
#[derive(Debug)]
pub struct OutputBuffer {
    service: String,
    lines: VecDeque<String>,
    capacity: usize,
    total_lines: u64,
    marker: Option<Regex>,
    marker_hit: Option<String>,
}

impl OutputBuffer {
    pub fn new(service: &str, capacity: usize) -> Self {
        Self {
            service: service.to_string(),
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            total_lines: 0,
            marker: None,
            marker_hit: None,
        }
    }

    pub fn with_marker(mut self, marker: Option<Regex>) -> Self {
        self.marker = marker;
        self
    }

    pub fn into_shared(self) -> SharedOutput {
        Arc::new(Mutex::new(self))
    }

    pub fn push_line(&mut self, stream: OutputStream, line: String) {
        self.total_lines += 1;

        if self.marker_hit.is_none() {
            if let Some(marker) = &self.marker {
                if marker.is_match(&line) {
                    log::debug!("{}: readiness marker seen: {line}", self.service);
                    self.marker_hit = Some(line.clone());
                }
            }
        }

        let line = match stream {
            OutputStream::Stdout => line,
            OutputStream::Stderr => stream.tag(&line).into_owned(),
        };

        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn last_line(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    pub fn marker_hit(&self) -> Option<&str> {
        self.marker_hit.as_deref()
    }
}

/// Buffered `<log_dir>/<service>.log` file shared by a service's stdout and
/// stderr readers.
///
/// It has its own lock so probes reading the tail never wait on the disk.
/// A write failure disables the sink for the rest of the run.
#[derive(Debug)]
pub struct LogSink {
    service: String,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl LogSink {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(service: &str, path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            service: service.to_string(),
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn write_line(&self, line: &str) {
        self.with_writer(|writer| writeln!(writer, "{line}"));
    }

    pub fn flush(&self) {
        self.with_writer(|writer| writer.flush());
    }

    fn with_writer(&self, f: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>) {
        let mut guard = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(writer) = guard.as_mut() {
            if let Err(e) = f(writer) {
                log::warn!(
                    "{}: disabling output log after write failure: {e}",
                    self.service
                );
                *guard = None;
            }
        }
    }
}

/// Read one line of at most `max` bytes into `line`, without the newline.
///
/// Returns `None` at end of stream, otherwise the number of bytes dropped
/// because the line was longer than `max`.
pub async fn read_capped_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max: usize,
) -> io::Result<Option<usize>>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut dropped = 0;
    let mut read_any = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read_any.then_some(dropped));
        }
        read_any = true;

        let (chunk, used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(end) => (&available[..end], end + 1, true),
            None => (available, available.len(), false),
        };
        let room = max.saturating_sub(line.len());
        let kept = chunk.len().min(room);
        line.extend_from_slice(&chunk[..kept]);
        dropped += chunk.len() - kept;
        reader.consume(used);

        if done {
            return Ok(Some(dropped));
        }
    }
}

/// Feed every line of `reader` into `output` and, if present, `sink` until
/// the stream closes.
pub async fn capture_lines<R>(
    service: &str,
    mut reader: BufReader<R>,
    stream: OutputStream,
    output: &SharedOutput,
    sink: Option<&LogSink>,
) where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    loop {
        let dropped = match read_capped_line(&mut reader, &mut raw, MAX_LINE_BYTES).await {
            Ok(Some(dropped)) => dropped,
            Ok(None) => break,
            Err(e) => {
                log::debug!("{service}: output stream closed: {e}");
                break;
            }
        };

        let mut line = String::from_utf8_lossy(&raw)
            .trim_end_matches('\r')
            .to_string();
        if dropped > 0 {
            line.push_str(&format!(" [{dropped} bytes truncated]"));
        }
        log::debug!(target: "labstack::service", "[{service}] {line}");

        if let Some(sink) = sink {
            sink.write_line(&stream.tag(&line));
            if reader.buffer().is_empty() {
                sink.flush();
            }
        }
        push_line(output, stream, line);
    }

    if let Some(sink) = sink {
        sink.flush();
    }
}

/// Append a line to a shared buffer, tolerating a poisoned lock.
pub fn push_line(buffer: &SharedOutput, stream: OutputStream, line: String) {
    match buffer.lock() {
        Ok(mut guard) => guard.push_line(stream, line),
        Err(poisoned) => poisoned.into_inner().push_line(stream, line),
    }
}

/// Run `f` against a shared buffer, tolerating a poisoned lock.
pub fn with_output<T>(buffer: &SharedOutput, f: impl FnOnce(&OutputBuffer) -> T) -> T {
    match buffer.lock() {
        Ok(guard) => f(&guard),
        Err(poisoned) => f(&poisoned.into_inner()),
    }
}
