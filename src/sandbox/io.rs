//! Output capture for the child's stdout and stderr.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug)]
struct Buffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

/// A bounded writer that captures output to a shared buffer.
///
/// Writes past the limit are accepted and dropped so the producer never
/// blocks on a full pipe; the capture is flagged as truncated instead.
#[derive(Clone, Debug)]
pub struct CapturedOutput {
    buffer: Arc<Mutex<Buffer>>,
}

impl CapturedOutput {
    /// Create a capture that keeps at most `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Buffer {
                bytes: Vec::new(),
                limit,
                truncated: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&mut self, data: &[u8]) {
        let mut buffer = self.lock();
        let room = buffer.limit.saturating_sub(buffer.bytes.len());
        if data.len() > room {
            buffer.truncated = true;
        }
        let keep = data.len().min(room);
        buffer.bytes.extend_from_slice(&data[..keep]);
    }

    /// Get the captured output as a string.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock().bytes).into_owned()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.lock().bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether output was dropped because the limit was reached.
    pub fn is_truncated(&self) -> bool {
        self.lock().truncated
    }

    pub fn limit(&self) -> usize {
        self.lock().limit
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Read `reader` to EOF into `sink`.
pub async fn drain<R>(mut reader: R, mut sink: CapturedOutput) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        sink.write_all(&chunk[..n])?;
    }
}

/// Stdout and stderr captures for one run.
#[derive(Clone, Debug)]
pub struct SandboxIo {
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
}

impl SandboxIo {
    /// Create captures that each keep at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            stdout: CapturedOutput::with_limit(limit),
            stderr: CapturedOutput::with_limit(limit),
        }
    }

    pub fn stdout_str(&self) -> String {
        self.stdout.to_string_lossy()
    }

    pub fn stderr_str(&self) -> String {
        self.stderr.to_string_lossy()
    }

    /// Whether either stream lost output to the limit.
    pub fn truncated(&self) -> bool {
        self.stdout.is_truncated() || self.stderr.is_truncated()
    }
}

/// What a launcher observed about one child run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Exit status when the child exited normally.
    pub exit_code: Option<i32>,
    /// How the child ended when it did not exit normally (signal, trap).
    pub termination: Option<String>,
    pub timed_out: bool,
    pub truncated: bool,
    pub elapsed: Duration,
}

impl RunOutcome {
    pub(crate) fn from_io(io: &SandboxIo, elapsed: Duration) -> Self {
        Self {
            stdout: io.stdout_str(),
            stderr: io.stderr_str(),
            exit_code: None,
            termination: None,
            timed_out: false,
            truncated: io.truncated(),
            elapsed,
        }
    }
}
