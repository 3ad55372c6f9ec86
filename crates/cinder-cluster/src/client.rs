//! Peer clients.
//!
//! A [`PeerClient`] is one pooled connection to another node: it
//! performs the AUTH handshake at connect time, sends single-shot
//! commands with a fixed response timeout, and reconnects with backoff
//! before giving up. [`PeerStream`] is the dedicated-connection mode
//! used for snapshot transfer and bulk migration payloads — one
//! request, many replies, including the raw RDB payload that follows a
//! `+FULLRESYNC` status.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use cinder_protocol::{parse_frame, parse_rdb_payload, CmdLine, Frame};

use crate::error::ClusterError;

/// Response deadline for a single request.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Reconnect attempts before a send fails permanently.
const MAX_RECONNECTS: usize = 3;

/// Backoff between reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// A pooled single-request connection to a peer.
#[derive(Debug)]
pub struct PeerClient {
    addr: String,
    password: Option<String>,
    stream: TcpStream,
    buf: BytesMut,
}

impl PeerClient {
    /// Connects and authenticates.
    pub async fn connect(addr: &str, password: Option<&str>) -> Result<Self, ClusterError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClusterError::PeerUnreachable {
                addr: addr.to_owned(),
                reason: e.to_string(),
            })?;
        let mut client = Self {
            addr: addr.to_owned(),
            password: password.map(str::to_owned),
            stream,
            buf: BytesMut::with_capacity(4096),
        };
        client.handshake().await?;
        Ok(client)
    }

    async fn handshake(&mut self) -> Result<(), ClusterError> {
        let Some(password) = self.password.clone() else {
            return Ok(());
        };
        let line = cinder_protocol::cmdline(["AUTH", password.as_str()]);
        let reply = self.request(&line).await?;
        match reply {
            Frame::Simple(_) => Ok(()),
            Frame::Error(msg) => Err(ClusterError::PeerError(msg)),
            other => Err(ClusterError::PeerError(format!(
                "unexpected AUTH reply: {}",
                other.type_name()
            ))),
        }
    }

    /// The peer address this client talks to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends one command and awaits its reply, reconnecting up to
    /// [`MAX_RECONNECTS`] times on timeout or connection failure. The
    /// connection is never left mid-frame: a failed exchange is
    /// retried on a fresh connection.
    pub async fn send(&mut self, line: &CmdLine) -> Result<Frame, ClusterError> {
        let mut attempt = 0;
        loop {
            match self.request(line).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    attempt += 1;
                    if attempt > MAX_RECONNECTS {
                        return Err(e);
                    }
                    warn!(
                        addr = %self.addr,
                        attempt,
                        error = %e,
                        "peer send failed, reconnecting"
                    );
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    let fresh = Self::connect(&self.addr, self.password.as_deref()).await?;
                    self.stream = fresh.stream;
                    self.buf = fresh.buf;
                }
            }
        }
    }

    async fn request(&mut self, line: &CmdLine) -> Result<Frame, ClusterError> {
        let payload = Frame::from_cmdline(line).to_bytes();
        self.stream.write_all(&payload).await?;
        tokio::time::timeout(RESPONSE_TIMEOUT, self.read_reply())
            .await
            .map_err(|_| ClusterError::Timeout)?
    }

    async fn read_reply(&mut self) -> Result<Frame, ClusterError> {
        loop {
            if let Some((frame, consumed)) = parse_frame(&self.buf)? {
                let _ = self.buf.split_to(consumed);
                return Ok(frame);
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(ClusterError::PeerUnreachable {
                    addr: self.addr.clone(),
                    reason: "connection closed".into(),
                });
            }
        }
    }
}

/// A dedicated streaming connection: send one command, then consume a
/// reply stream.
pub struct PeerStream {
    addr: String,
    stream: TcpStream,
    buf: BytesMut,
}

impl PeerStream {
    /// Opens a dedicated connection, authenticates, and sends `line`.
    pub async fn open(
        addr: &str,
        password: Option<&str>,
        line: &CmdLine,
    ) -> Result<Self, ClusterError> {
        let client = PeerClient::connect(addr, password).await?;
        let mut me = Self {
            addr: client.addr,
            stream: client.stream,
            buf: client.buf,
        };
        let payload = Frame::from_cmdline(line).to_bytes();
        me.stream.write_all(&payload).await?;
        Ok(me)
    }

    /// The next parsed reply frame.
    pub async fn next_reply(&mut self) -> Result<Frame, ClusterError> {
        loop {
            if let Some((frame, consumed)) = parse_frame(&self.buf)? {
                let _ = self.buf.split_to(consumed);
                debug!(addr = %self.addr, kind = frame.type_name(), "stream reply");
                return Ok(frame);
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(ClusterError::PeerUnreachable {
                    addr: self.addr.clone(),
                    reason: "stream closed".into(),
                });
            }
        }
    }

    /// Reads the raw RDB payload that follows a `+FULLRESYNC` reply:
    /// `$<len>` then `len` bytes with no trailing CRLF. Callers switch
    /// to this after recognizing the prefix on [`Self::next_reply`].
    pub async fn read_rdb_payload(&mut self) -> Result<Bytes, ClusterError> {
        loop {
            if let Some((data, consumed)) = parse_rdb_payload(&self.buf)? {
                let _ = self.buf.split_to(consumed);
                return Ok(data);
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(ClusterError::PeerUnreachable {
                    addr: self.addr.clone(),
                    reason: "stream closed mid-payload".into(),
                });
            }
        }
    }
}
