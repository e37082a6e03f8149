//! Background capture of a child's stdout/stderr.
//!
//! Each pipe is drained by its own task into a shared buffer so the
//! bytes read so far stay available even if the reader has to be
//! abandoned (timeout, grandchild holding the pipe open).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::debug;

const CHUNK_SIZE: usize = 8192;

#[derive(Default)]
struct Buffer {
    bytes: Vec<u8>,
    /// Bytes read past the limit and thrown away
    dropped: u64,
}

pub struct Capture {
    buf: Arc<Mutex<Buffer>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    /// Starts draining `pipe`, keeping at most `limit` bytes.
    ///
    /// The pipe is read to EOF even past the limit so the writer never
    /// blocks on a full pipe. A missing pipe yields an empty capture.
    pub fn spawn<R>(pipe: Option<R>, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Buffer::default()));
        let task = pipe.map(|mut pipe| {
            let sink = Arc::clone(&buf);
            tokio::spawn(async move {
                let mut chunk = vec![0u8; CHUNK_SIZE];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            let mut buf = sink.lock();
                            let keep = n.min(limit.saturating_sub(buf.bytes.len()));
                            buf.bytes.extend_from_slice(&chunk[..keep]);
                            buf.dropped += (n - keep) as u64;
                        }
                        Err(e) => {
                            debug!("Pipe read failed: {e}");
                            break;
                        }
                    }
                }
            })
        });
        Self { buf, task }
    }

    /// Resolves once the pipe reached EOF. Cancel safe.
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
            self.task = None;
        }
    }

    /// Waits up to `within` for EOF, then returns whatever was captured.
    ///
    /// A reader still running after `within` is aborted; its partial
    /// output is kept.
    pub async fn finish(mut self, within: Duration) -> String {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(within, &mut task).await.is_err() {
                task.abort();
            }
        }
        let buf = std::mem::take(&mut *self.buf.lock());
        let mut out = String::from_utf8_lossy(&buf.bytes).into_owned();
        if buf.dropped > 0 {
            out.push_str(&format!("\n[output truncated: {} bytes omitted]\n", buf.dropped));
        }
        out
    }
}
