//! Per-connection handler.
//!
//! Reads RESP requests (multi-bulk or inline) from a TCP stream,
//! executes them through the standalone engine or the cluster router,
//! and writes replies back. Pipelining works by draining every
//! complete request in the buffer before the next read. Dropping the
//! connection's session aborts any open MULTI and releases watches.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use cinder_cluster::Cluster;
use cinder_core::{CmdLine, Engine, Frame, Session};
use cinder_protocol::parse_command;

/// Initial read buffer capacity.
const BUF_CAPACITY: usize = 4096;

/// Maximum buffered bytes before the client is disconnected.
const MAX_BUF_SIZE: usize = 64 * 1024 * 1024;

/// Idle cutoff; an abandoned connection is reclaimed after this.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How commands reach the keyspace: directly, or through the slot
/// router when cluster mode is on.
#[derive(Clone)]
pub enum Executor {
    Standalone(Arc<Engine>),
    Cluster(Arc<Cluster>),
}

impl Executor {
    pub async fn exec(&self, session: &mut Session, line: &CmdLine) -> Frame {
        match self {
            Executor::Standalone(engine) => engine.exec(session, line),
            Executor::Cluster(cluster) => cluster.exec(session, line).await,
        }
    }
}

/// Drives one client connection to completion.
pub async fn handle(mut stream: TcpStream, executor: Executor) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(BUF_CAPACITY);
    let mut out = BytesMut::with_capacity(BUF_CAPACITY);
    let mut session = Session::new();

    loop {
        if buf.len() > MAX_BUF_SIZE {
            let mut err = BytesMut::new();
            Frame::error("ERR max buffer size exceeded, closing connection").serialize(&mut err);
            let _ = stream.write_all(&err).await;
            return Ok(());
        }

        match tokio::time::timeout(IDLE_TIMEOUT, stream.read_buf(&mut buf)).await {
            Ok(Ok(0)) => return Ok(()), // clean disconnect
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!("closing idle connection");
                return Ok(());
            }
        }

        out.clear();
        loop {
            match parse_command(&buf) {
                Ok(Some((line, consumed))) => {
                    let _ = buf.split_to(consumed);
                    let reply = executor.exec(&mut session, &line).await;
                    reply.serialize(&mut out);
                }
                Ok(None) => break,
                Err(e) => {
                    // protocol errors close the connection after replying
                    Frame::error(format!("ERR protocol error: {e}")).serialize(&mut out);
                    let _ = stream.write_all(&out).await;
                    return Ok(());
                }
            }
        }

        if !out.is_empty() {
            stream.write_all(&out).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::EngineConfig;
    use tokio::net::TcpListener;

    async fn spawn_server() -> String {
        let engine = Engine::new(EngineConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let executor = Executor::Standalone(Arc::clone(&engine));
                tokio::spawn(async move {
                    let _ = handle(stream, executor).await;
                });
            }
        });
        addr
    }

    async fn send(stream: &mut TcpStream, data: &[u8]) -> Vec<u8> {
        stream.write_all(data).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn ping_over_the_wire() {
        let addr = spawn_server().await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let reply = send(&mut stream, b"*1\r\n$4\r\nPING\r\n").await;
        assert_eq!(reply, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn set_get_round_trip() {
        let addr = spawn_server().await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let reply = send(&mut stream, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n").await;
        assert_eq!(reply, b"+OK\r\n");
        let reply = send(&mut stream, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await;
        assert_eq!(reply, b"$1\r\nv\r\n");
    }

    #[tokio::test]
    async fn inline_commands_accepted() {
        let addr = spawn_server().await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let reply = send(&mut stream, b"PING\r\n").await;
        assert_eq!(reply, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn pipelined_commands_batch_replies() {
        let addr = spawn_server().await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let reply = send(
            &mut stream,
            b"*2\r\n$4\r\nINCR\r\n$1\r\nn\r\n*2\r\n$4\r\nINCR\r\n$1\r\nn\r\n",
        )
        .await;
        assert_eq!(reply, b":1\r\n:2\r\n");
    }

    #[tokio::test]
    async fn multi_state_is_per_connection() {
        let addr = spawn_server().await;
        let mut a = TcpStream::connect(&addr).await.unwrap();
        let mut b = TcpStream::connect(&addr).await.unwrap();

        assert_eq!(send(&mut a, b"MULTI\r\n").await, b"+OK\r\n");
        assert_eq!(send(&mut a, b"SET k v\r\n").await, b"+QUEUED\r\n");
        // connection b is not in multi: its write runs immediately
        assert_eq!(send(&mut b, b"SET k direct\r\n").await, b"+OK\r\n");
        assert_eq!(send(&mut a, b"EXEC\r\n").await, b"*1\r\n+OK\r\n");
    }

    #[tokio::test]
    async fn protocol_error_closes_connection() {
        let addr = spawn_server().await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let reply = send(&mut stream, b"*1\r\n$99999999999999\r\n").await;
        assert!(reply.starts_with(b"-ERR protocol error"));
        // server closes; the next read reports EOF
        let mut probe = [0u8; 8];
        let n = stream.read(&mut probe).await.unwrap();
        assert_eq!(n, 0);
    }
}
