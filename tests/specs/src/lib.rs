// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `agtmux` binary as a subprocess and exercises it over
//! its Unix socket: plain HTTP requests and the TTY v2 upgrade.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use agtmux::tty::frame::{self, Envelope};

/// Resolve the path to the compiled `agtmux` binary.
pub fn agtmux_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("agtmux")
}

/// Make a raw HTTP/1.1 request over the Unix socket, returning status line
/// and body.
pub async fn unix_http(
    socket_path: &Path,
    method: &str,
    path: &str,
    body: Option<&serde_json::Value>,
) -> anyhow::Result<(u16, String)> {
    use tokio::io::AsyncReadExt;

    let mut stream = UnixStream::connect(socket_path).await?;
    let payload = body.map(|b| b.to_string()).unwrap_or_default();
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    if !payload.is_empty() {
        request.push_str("Content-Type: application/json\r\n");
        request.push_str(&format!("Content-Length: {}\r\n", payload.len()));
    }
    request.push_str("\r\n");
    request.push_str(&payload);
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf).into_owned();

    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("no status line in: {response}"))?;
    let body = response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("").to_string();
    Ok((status, body))
}

pub async fn unix_http_get(socket_path: &Path, path: &str) -> anyhow::Result<(u16, String)> {
    unix_http(socket_path, "GET", path, None).await
}

pub async fn unix_http_post(
    socket_path: &Path,
    path: &str,
    body: &serde_json::Value,
) -> anyhow::Result<(u16, String)> {
    unix_http(socket_path, "POST", path, Some(body)).await
}

/// A framed TTY client over an upgraded Unix socket connection.
pub struct TtyClient {
    framed: Framed<UnixStream, tokio_util::codec::LengthDelimitedCodec>,
    seq: u64,
}

impl TtyClient {
    /// Perform the `agtmux-tty-v2` upgrade handshake.
    pub async fn connect(socket_path: &Path) -> anyhow::Result<Self> {
        use tokio::io::AsyncReadExt;

        let mut stream = UnixStream::connect(socket_path).await?;
        let request = "GET /v2/tty/session HTTP/1.1\r\nHost: localhost\r\n\
                       Connection: Upgrade\r\nUpgrade: agtmux-tty-v2\r\n\r\n";
        stream.write_all(request.as_bytes()).await?;

        // Read until the end of the 101 response headers.
        let mut header = Vec::new();
        let mut byte = [0u8; 1];
        while !header.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await?;
            anyhow::ensure!(n == 1, "connection closed during upgrade");
            header.push(byte[0]);
            anyhow::ensure!(header.len() < 8192, "oversized upgrade response");
        }
        let head = String::from_utf8_lossy(&header);
        anyhow::ensure!(head.starts_with("HTTP/1.1 101"), "upgrade refused: {head}");

        Ok(Self { framed: Framed::new(stream, frame::frame_codec()), seq: 0 })
    }

    pub async fn send(&mut self, frame_type: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        self.seq += 1;
        let envelope = Envelope {
            frame_type: frame_type.to_owned(),
            seq: self.seq,
            request_id: None,
            payload,
        };
        self.framed.send(frame::encode_envelope(&envelope)?).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<Envelope> {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("tty stream closed"))??;
        Ok(frame::decode_envelope(&frame)?)
    }
}

/// A running `agtmux` daemon, killed on drop.
pub struct AgtmuxProcess {
    child: Child,
    socket_path: PathBuf,
    _socket_dir: tempfile::TempDir,
}

impl AgtmuxProcess {
    /// Spawn the daemon against a fresh temp socket.
    pub fn start() -> anyhow::Result<Self> {
        let binary = agtmux_binary();
        anyhow::ensure!(binary.exists(), "agtmux binary not found at {}", binary.display());

        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("agtmux.sock");

        let child = Command::new(&binary)
            .args([
                "--socket",
                &socket_path.to_string_lossy(),
                "--log-format",
                "text",
                "--log-level",
                "warn",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self { child, socket_path, _socket_dir: dir })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Poll `/v1/health` until the daemon responds or the timeout elapses.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("daemon never became healthy");
            }
            if let Ok((200, body)) = unix_http_get(&self.socket_path, "/v1/health").await {
                if body.contains("\"ok\"") {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for AgtmuxProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
