//! Readiness-driven pump for one attached exec session.
//!
//! Reads the multiplexed output stream and writes stdin on the same
//! non-blocking socket until the stream ends, the process exits, or the
//! deadline passes. Whatever was decoded before the loop stopped is kept.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::Interest;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::attach::AttachStream;
use crate::error::Result;
use crate::stream::StreamParser;

/// How long to wait for readiness before checking whether the process exited.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 4096;

/// Answers whether the process behind a stream is still running.
#[async_trait]
pub trait ExecProbe: Send + Sync {
    async fn is_running(&self) -> Result<bool>;
}

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The daemon closed the output stream.
    Eof,
    /// The process exited while the stream was idle.
    Exited,
    /// The peer reset the connection.
    ConnectionReset,
    /// An unrecoverable socket error.
    Failed,
    /// The deadline passed first.
    TimedOut,
}

#[derive(Debug)]
pub struct PumpOutcome {
    pub parser: StreamParser,
    pub completion: Completion,
    /// Bytes of stdin accepted by the socket.
    pub stdin_written: usize,
}

fn is_recoverable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Drive one exec session.
///
/// `prefix` holds stream bytes received before the pump took over.
pub async fn pump<P>(
    stream: &mut AttachStream,
    prefix: &[u8],
    stdin: &[u8],
    deadline: Instant,
    probe: &P,
) -> PumpOutcome
where
    P: ExecProbe + ?Sized,
{
    let mut parser = StreamParser::new();
    parser.feed(prefix);

    let mut buf = vec![0u8; READ_CHUNK];
    let mut cursor = 0usize;
    let mut stdin_open = !stdin.is_empty();

    if !stdin_open {
        close_stdin(stream).await;
    }

    let completion = loop {
        let now = Instant::now();
        if now >= deadline {
            break Completion::TimedOut;
        }

        let interest = if stdin_open {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let wait = POLL_INTERVAL.min(deadline - now);

        let ready = match tokio::time::timeout(wait, stream.ready(interest)).await {
            Err(_) => None,
            Ok(Ok(ready)) => Some(ready),
            Ok(Err(e)) if is_recoverable(&e) => continue,
            Ok(Err(e)) => {
                warn!(error = %e, "Readiness check failed on attach socket");
                break Completion::Failed;
            }
        };

        let Some(ready) = ready else {
            match probe.is_running().await {
                Ok(true) => continue,
                Ok(false) => {
                    drain(stream, &mut parser, &mut buf);
                    debug!("Process exited, stream drained");
                    break Completion::Exited;
                }
                Err(e) => {
                    debug!(error = %e, "Liveness check failed, will retry");
                    continue;
                }
            }
        };

        if ready.is_readable() {
            match stream.try_read(&mut buf) {
                Ok(0) => {
                    debug!("Output stream reached EOF");
                    break Completion::Eof;
                }
                Ok(n) => {
                    trace!(bytes = n, "Read from attach socket");
                    parser.feed(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    warn!("Connection reset while reading exec output");
                    break Completion::ConnectionReset;
                }
                Err(e) if is_recoverable(&e) => {}
                Err(e) => {
                    warn!(error = %e, "Read from attach socket failed");
                    break Completion::Failed;
                }
            }
        }

        if stdin_open && ready.is_writable() {
            match stream.try_write(&stdin[cursor..]) {
                Ok(n) => {
                    cursor += n;
                    if cursor == stdin.len() {
                        debug!(bytes = cursor, "All stdin sent");
                        stdin_open = false;
                        close_stdin(stream).await;
                    }
                }
                Err(e) if is_recoverable(&e) => {}
                Err(e) => {
                    if e.kind() == io::ErrorKind::BrokenPipe {
                        warn!(
                            remaining = stdin.len() - cursor,
                            "Broken pipe on stdin, discarding the rest"
                        );
                    } else {
                        warn!(
                            error = %e,
                            remaining = stdin.len() - cursor,
                            "Writing stdin failed, discarding the rest"
                        );
                    }
                    stdin_open = false;
                }
            }
        }
    };

    PumpOutcome {
        parser,
        completion,
        stdin_written: cursor,
    }
}

/// Read everything already buffered on the socket.
fn drain(stream: &AttachStream, parser: &mut StreamParser, buf: &mut [u8]) {
    loop {
        match stream.try_read(buf) {
            Ok(0) => return,
            Ok(n) => parser.feed(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

async fn close_stdin(stream: &mut AttachStream) {
    if let Err(e) = stream.shutdown_write().await {
        debug!(error = %e, "Could not half-close attach socket");
    }
}
