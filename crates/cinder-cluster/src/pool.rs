//! Bounded per-peer connection pools.
//!
//! Each peer address gets its own pool with `max_idle` and
//! `max_active` caps. Borrowing prefers an idle client, creates a new
//! one while under the active cap, and otherwise parks the caller on a
//! waiter queue that hands clients over directly as they come back.
//! Returning a client over the idle cap destroys it. Closing the pool
//! destroys all idle clients and fails parked waiters.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::client::PeerClient;
use crate::error::ClusterError;

/// Default idle cap per peer.
const DEFAULT_MAX_IDLE: usize = 4;

/// Default active cap per peer.
const DEFAULT_MAX_ACTIVE: usize = 16;

struct PeerPoolState {
    idles: VecDeque<PeerClient>,
    active: usize,
    waiters: VecDeque<oneshot::Sender<PeerClient>>,
    closed: bool,
}

struct PeerPool {
    addr: String,
    state: Mutex<PeerPoolState>,
}

impl PeerPool {
    fn new(addr: String) -> Self {
        Self {
            addr,
            state: Mutex::new(PeerPoolState {
                idles: VecDeque::new(),
                active: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    async fn borrow(
        &self,
        password: Option<&str>,
        max_active: usize,
    ) -> Result<PeerClient, ClusterError> {
        let waiter = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(ClusterError::PoolClosed);
            }
            if let Some(client) = state.idles.pop_front() {
                return Ok(client);
            }
            if state.active < max_active {
                state.active += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        match waiter {
            Some(rx) => rx.await.map_err(|_| ClusterError::PoolClosed),
            None => match PeerClient::connect(&self.addr, password).await {
                Ok(client) => Ok(client),
                Err(e) => {
                    self.state.lock().await.active -= 1;
                    Err(e)
                }
            },
        }
    }

    async fn give_back(&self, client: PeerClient, max_idle: usize) {
        let mut state = self.state.lock().await;
        if state.closed {
            state.active = state.active.saturating_sub(1);
            return;
        }
        // hand over directly when someone is parked
        let mut client = client;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(client) {
                Ok(()) => return,
                // the waiter gave up; try the next one
                Err(back) => client = back,
            }
        }
        if state.idles.len() < max_idle {
            state.idles.push_back(client);
        } else {
            state.active = state.active.saturating_sub(1);
            debug!(addr = %self.addr, "over idle cap, destroying client");
        }
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.idles.clear();
        state.waiters.clear();
    }
}

/// Pools for every known peer.
pub struct ClientPool {
    password: Option<String>,
    max_idle: usize,
    max_active: usize,
    pools: Mutex<HashMap<String, Arc<PeerPool>>>,
}

impl ClientPool {
    pub fn new(password: Option<String>) -> Self {
        Self {
            password,
            max_idle: DEFAULT_MAX_IDLE,
            max_active: DEFAULT_MAX_ACTIVE,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Pool with explicit caps.
    pub fn with_caps(password: Option<String>, max_idle: usize, max_active: usize) -> Self {
        Self {
            password,
            max_idle,
            max_active: max_active.max(1),
            pools: Mutex::new(HashMap::new()),
        }
    }

    async fn pool_of(&self, addr: &str) -> Arc<PeerPool> {
        let mut pools = self.pools.lock().await;
        Arc::clone(
            pools
                .entry(addr.to_owned())
                .or_insert_with(|| Arc::new(PeerPool::new(addr.to_owned()))),
        )
    }

    /// Borrows a client for `addr`, creating or waiting as the caps
    /// dictate.
    pub async fn borrow(&self, addr: &str) -> Result<PeerClient, ClusterError> {
        let pool = self.pool_of(addr).await;
        pool.borrow(self.password.as_deref(), self.max_active).await
    }

    /// Returns a still-healthy client to its pool.
    pub async fn give_back(&self, client: PeerClient) {
        let pool = self.pool_of(client.addr()).await;
        pool.give_back(client, self.max_idle).await;
    }

    /// Convenience: borrow, send one command, give the client back.
    pub async fn request(
        &self,
        addr: &str,
        line: &cinder_protocol::CmdLine,
    ) -> Result<cinder_protocol::Frame, ClusterError> {
        let mut client = self.borrow(addr).await?;
        match client.send(line).await {
            Ok(reply) => {
                self.give_back(client).await;
                Ok(reply)
            }
            // a failed client is dropped, not returned
            Err(e) => {
                let pool = self.pool_of(addr).await;
                pool.state.lock().await.active -= 1;
                Err(e)
            }
        }
    }

    /// Destroys all idle clients and fails parked waiters.
    pub async fn close(&self) {
        let pools = self.pools.lock().await;
        for pool in pools.values() {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use cinder_protocol::cmdline;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A peer that answers +OK to everything, forever, on any number
    /// of connections.
    async fn echo_peer() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = BytesMut::new();
                    loop {
                        let n = stream.read_buf(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        while let Ok(Some((_, consumed))) = cinder_protocol::parse_command(&buf) {
                            let _ = buf.split_to(consumed);
                            if stream.write_all(b"+OK\r\n").await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn borrow_reuses_idle_clients() {
        let addr = echo_peer().await;
        let pool = ClientPool::new(None);

        let client = pool.borrow(&addr).await.unwrap();
        pool.give_back(client).await;
        // the second borrow must reuse the idle connection
        let _client = pool.borrow(&addr).await.unwrap();
        let inner = pool.pool_of(&addr).await;
        assert_eq!(inner.state.lock().await.active, 1);
    }

    #[tokio::test]
    async fn over_cap_borrow_waits_for_return() {
        let addr = echo_peer().await;
        let pool = Arc::new(ClientPool::with_caps(None, 1, 1));

        let held = pool.borrow(&addr).await.unwrap();
        let p2 = Arc::clone(&pool);
        let addr2 = addr.clone();
        let waiter = tokio::spawn(async move { p2.borrow(&addr2).await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "borrow must park at the cap");

        pool.give_back(held).await;
        let handed = waiter.await.unwrap();
        assert!(handed.is_ok());
    }

    #[tokio::test]
    async fn request_round_trips() {
        let addr = echo_peer().await;
        let pool = ClientPool::new(None);
        let reply = pool.request(&addr, &cmdline(["PING"])).await.unwrap();
        assert_eq!(reply, cinder_protocol::Frame::Simple("OK".into()));
    }

    #[tokio::test]
    async fn closed_pool_rejects_borrows() {
        let addr = echo_peer().await;
        let pool = ClientPool::new(None);
        let client = pool.borrow(&addr).await.unwrap();
        pool.give_back(client).await;
        pool.close().await;
        let err = pool.borrow(&addr).await.unwrap_err();
        assert!(matches!(err, ClusterError::PoolClosed));
    }

    #[tokio::test]
    async fn failed_connect_releases_active_slot() {
        let pool = ClientPool::with_caps(None, 1, 1);
        // nothing listens on this port
        let err = pool.borrow("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, ClusterError::PeerUnreachable { .. }));
        let inner = pool.pool_of("127.0.0.1:1").await;
        assert_eq!(inner.state.lock().await.active, 0);
    }
}
