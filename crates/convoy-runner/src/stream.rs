//! Child output streaming
//!
//! Both execution modes — pseudo-terminal and plain pipes — feed the same
//! `mpsc` channel of [`OutputChunk`]s, so consumers see one incremental
//! log stream regardless of how the child was attached. Readers run as
//! their own tasks; nothing buffers to completion.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CHUNK_SIZE: usize = 8192;

/// Where a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
    /// Combined stream from a pseudo terminal
    Terminal,
}

/// One incremental piece of child output
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub source: StreamSource,
    pub bytes: Vec<u8>,
}

/// Read an async pipe to EOF, forwarding chunks to the log channel.
pub fn spawn_piped_reader<R>(
    mut reader: R,
    source: StreamSource,
    tx: mpsc::Sender<OutputChunk>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = OutputChunk {
                        source,
                        bytes: buf[..n].to_vec(),
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("output stream closed: {}", e);
                    break;
                }
            }
        }
    })
}

/// Read a pty master to EOF on the blocking pool.
///
/// A pty master is a character device, so reads block; EIO after the child
/// exits is the normal end-of-stream signal.
#[cfg(unix)]
pub fn spawn_pty_reader(master: std::fs::File, tx: mpsc::Sender<OutputChunk>) -> JoinHandle<()> {
    use std::io::Read;

    tokio::task::spawn_blocking(move || {
        let mut master = master;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match master.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = OutputChunk {
                        source: StreamSource::Terminal,
                        bytes: buf[..n].to_vec(),
                    };
                    if tx.blocking_send(chunk).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}
