use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Limit on captured output per command, stdout and stderr combined.
pub const OUTPUT_CAP: usize = 1024 * 1024;

/// Byte allowance shared by the streams of one command. Clones draw from the
/// same pool.
#[derive(Debug, Clone)]
pub struct OutputBudget {
    remaining: Arc<AtomicUsize>,
}

impl OutputBudget {
    pub fn new(cap: usize) -> Self {
        Self {
            remaining: Arc::new(AtomicUsize::new(cap)),
        }
    }

    /// Reserves up to `wanted` bytes and returns how many were granted.
    pub fn take(&self, wanted: usize) -> usize {
        let mut granted = 0;
        let _ = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                granted = left.min(wanted);
                Some(left - granted)
            });
        granted
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

/// Byte buffer that keeps what its budget allows and counts the rest.
#[derive(Debug)]
pub struct BoundedBuffer {
    buf: Vec<u8>,
    budget: OutputBudget,
    dropped: usize,
}

impl BoundedBuffer {
    pub fn new(budget: OutputBudget) -> Self {
        Self {
            buf: Vec::new(),
            budget,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let take = self.budget.take(chunk.len());
        self.buf.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    pub fn truncated(&self) -> bool {
        self.dropped > 0
    }

    pub fn finish(self) -> String {
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if self.dropped > 0 {
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!("[output truncated: {} bytes omitted]\n", self.dropped));
        }
        text
    }
}

/// Reads a stream to EOF, keeping what `budget` allows. Reading continues
/// past the cap so the writer never blocks on a full pipe.
pub async fn drain<R: AsyncRead + Unpin>(mut reader: R, budget: OutputBudget) -> std::io::Result<String> {
    let mut buffer = BoundedBuffer::new(budget);
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.push(&chunk[..n]);
    }
    Ok(buffer.finish())
}
