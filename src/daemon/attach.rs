//! Raw bidirectional streams to exec instances.
//!
//! The Docker client library demultiplexes exec output itself, so the exec is
//! started over a separate connection: an HTTP request asking the daemon to
//! upgrade the connection, after which the socket carries the raw multiplexed
//! stream.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest, Ready};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::error::{Result, SandboxError};

const MAX_RESPONSE_HEAD: usize = 16 * 1024;
const DEFAULT_TCP_PORT: u16 = 2375;

/// Where the daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEndpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl DaemonEndpoint {
    /// Parse `unix:///path`, `tcp://host:port` or `http://host:port`.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = url::Url::parse(raw)
            .map_err(|e| SandboxError::config("daemon_url", format!("'{}': {}", raw, e)))?;
        match url.scheme() {
            "unix" => {
                if url.path().is_empty() {
                    return Err(SandboxError::config(
                        "daemon_url",
                        format!("'{}' has no socket path", raw),
                    ));
                }
                Ok(Self::Unix(PathBuf::from(url.path())))
            }
            "tcp" | "http" => {
                let host = url.host_str().ok_or_else(|| {
                    SandboxError::config("daemon_url", format!("'{}' has no host", raw))
                })?;
                Ok(Self::Tcp {
                    host: host.to_string(),
                    port: url.port().unwrap_or(DEFAULT_TCP_PORT),
                })
            }
            other => Err(SandboxError::config(
                "daemon_url",
                format!("unsupported scheme '{}'", other),
            )),
        }
    }

    fn host_header(&self) -> String {
        match self {
            Self::Unix(_) => "localhost".to_string(),
            Self::Tcp { host, port } => format!("{}:{}", host, port),
        }
    }
}

/// A connected raw stream, used without blocking.
#[derive(Debug)]
pub enum AttachStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AttachStream {
    /// Wait until the stream is ready for any of the given interests.
    pub async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.ready(interest).await,
            Self::Tcp(s) => s.ready(interest).await,
        }
    }

    /// Read whatever is available without waiting.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.try_read(buf),
            Self::Tcp(s) => s.try_read(buf),
        }
    }

    /// Write as much as the socket accepts without waiting.
    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.try_write(buf),
            Self::Tcp(s) => s.try_write(buf),
        }
    }

    /// Close the write half, signalling end of stdin.
    pub async fn shutdown_write(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.shutdown().await,
            Self::Tcp(s) => s.shutdown().await,
        }
    }
}

/// An exec instance whose stdio is attached.
#[derive(Debug)]
pub struct AttachedExec {
    pub stream: AttachStream,
    /// Stream bytes that arrived together with the upgrade response.
    pub prefix: Vec<u8>,
}

/// Start an exec instance and hijack the connection for its stdio.
pub async fn open_exec_stream(
    endpoint: &DaemonEndpoint,
    exec_id: &str,
    timeout: Duration,
) -> Result<AttachedExec> {
    tokio::time::timeout(timeout, connect_and_upgrade(endpoint, exec_id))
        .await
        .map_err(|_| {
            SandboxError::daemon("start_exec", format!("attach timed out after {:?}", timeout))
        })?
        .map_err(|e| match e {
            SandboxError::Io(io) => SandboxError::daemon("start_exec", io),
            other => other,
        })
}

async fn connect_and_upgrade(endpoint: &DaemonEndpoint, exec_id: &str) -> Result<AttachedExec> {
    let host = endpoint.host_header();
    match endpoint {
        #[cfg(unix)]
        DaemonEndpoint::Unix(path) => {
            let mut stream = UnixStream::connect(path).await?;
            let prefix = upgrade_exec_start(&mut stream, &host, exec_id).await?;
            Ok(AttachedExec {
                stream: AttachStream::Unix(stream),
                prefix,
            })
        }
        #[cfg(not(unix))]
        DaemonEndpoint::Unix(_) => Err(SandboxError::config(
            "daemon_url",
            "unix sockets are not supported on this platform",
        )),
        DaemonEndpoint::Tcp { host: addr, port } => {
            let mut stream = TcpStream::connect((addr.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            let prefix = upgrade_exec_start(&mut stream, &host, exec_id).await?;
            Ok(AttachedExec {
                stream: AttachStream::Tcp(stream),
                prefix,
            })
        }
    }
}

/// Send the exec start request asking for a connection upgrade and consume
/// the response head. Returns any stream bytes read past the head.
pub(crate) async fn upgrade_exec_start<S>(
    stream: &mut S,
    host: &str,
    exec_id: &str,
) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = serde_json::json!({ "Detach": false, "Tty": false }).to_string();
    let request = format!(
        "POST /exec/{exec_id}/start HTTP/1.1\r\n\
         Host: {host}\r\n\
         User-Agent: agentic-sandbox\r\n\
         Content-Type: application/json\r\n\
         Connection: Upgrade\r\n\
         Upgrade: tcp\r\n\
         Content-Length: {len}\r\n\
         \r\n\
         {body}",
        len = body.len(),
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = find_head_end(&head) {
            break pos;
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(SandboxError::daemon("start_exec", "response head too large"));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(SandboxError::daemon(
                "start_exec",
                "daemon closed the connection before responding",
            ));
        }
        head.extend_from_slice(&chunk[..n]);
    };

    let status_line = String::from_utf8_lossy(&head[..head_end]);
    let status = status_line
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok());

    match status {
        Some(101) | Some(200) => Ok(head[head_end + 4..].to_vec()),
        Some(code) => {
            let detail = String::from_utf8_lossy(&head[head_end + 4..]).trim().to_string();
            Err(SandboxError::daemon(
                "start_exec",
                format!("daemon answered {}: {}", code, detail),
            ))
        }
        None => Err(SandboxError::daemon("start_exec", "malformed response status line")),
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::stream::encode_frame;

    async fn read_request<S: AsyncRead + Unpin>(server: &mut S) -> String {
        let mut request = Vec::new();
        let mut chunk = [0u8; 256];
        while !request.ends_with(b"}") {
            let n = server.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client hung up mid-request");
            request.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8(request).unwrap()
    }

    #[test]
    fn test_parse_unix_endpoint() {
        assert_eq!(
            DaemonEndpoint::parse("unix:///var/run/docker.sock").unwrap(),
            DaemonEndpoint::Unix(PathBuf::from("/var/run/docker.sock"))
        );
    }

    #[test]
    fn test_parse_tcp_endpoints() {
        assert_eq!(
            DaemonEndpoint::parse("tcp://10.1.2.3:2376").unwrap(),
            DaemonEndpoint::Tcp {
                host: "10.1.2.3".to_string(),
                port: 2376
            }
        );
        assert_eq!(
            DaemonEndpoint::parse("http://docker").unwrap(),
            DaemonEndpoint::Tcp {
                host: "docker".to_string(),
                port: DEFAULT_TCP_PORT
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(matches!(
            DaemonEndpoint::parse("npipe:////./pipe/docker_engine"),
            Err(SandboxError::Config { .. })
        ));
        assert!(DaemonEndpoint::parse("not a url").is_err());
    }

    #[tokio::test]
    async fn test_upgrade_returns_bytes_after_head() {
        let (mut client, mut server) = duplex(64 * 1024);
        let daemon = tokio::spawn(async move {
            let request = read_request(&mut server).await;
            let mut response = b"HTTP/1.1 101 UPGRADED\r\n\
                Content-Type: application/vnd.docker.raw-stream\r\n\
                Connection: Upgrade\r\n\
                Upgrade: tcp\r\n\r\n"
                .to_vec();
            response.extend(encode_frame(1, b"early"));
            server.write_all(&response).await.unwrap();
            request
        });

        let prefix = upgrade_exec_start(&mut client, "localhost", "abc123").await.unwrap();
        assert_eq!(prefix, encode_frame(1, b"early"));

        let request = daemon.await.unwrap();
        assert!(request.starts_with("POST /exec/abc123/start HTTP/1.1\r\n"));
        assert!(request.contains("Upgrade: tcp\r\n"));
        assert!(request.ends_with(r#"{"Detach":false,"Tty":false}"#));
    }

    #[tokio::test]
    async fn test_upgrade_reports_daemon_error() {
        let (mut client, mut server) = duplex(64 * 1024);
        tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(
                    b"HTTP/1.1 404 Not Found\r\n\
                      Content-Type: application/json\r\n\r\n\
                      {\"message\":\"No such exec instance\"}",
                )
                .await
                .unwrap();
        });

        let err = upgrade_exec_start(&mut client, "localhost", "gone").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("404"));
        assert!(msg.contains("No such exec instance"));
    }

    #[tokio::test]
    async fn test_upgrade_handles_early_close() {
        let (mut client, mut server) = duplex(64 * 1024);
        tokio::spawn(async move {
            read_request(&mut server).await;
            drop(server);
        });

        let err = upgrade_exec_start(&mut client, "localhost", "x").await.unwrap_err();
        assert!(matches!(err, SandboxError::DaemonOperation { .. }));
    }
}
