//! TCP front end and lifecycle.
//!
//! Binds the listen address, spawns one task per connection, and on
//! the shutdown signal stops accepting, gives in-flight handlers a
//! bounded grace period, then flushes and closes the persister.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use cinder_persistence::AofPersister;

use crate::connection::{self, Executor};

/// How long in-flight handlers get to finish after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runs the accept loop until `shutdown` is notified.
pub async fn run(
    listener: TcpListener,
    executor: Executor,
    persister: Option<Arc<AofPersister>>,
    shutdown: Arc<Notify>,
) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let executor = executor.clone();
                        handlers.spawn(async move {
                            if let Err(e) = connection::handle(stream, executor).await {
                                warn!(peer = %peer, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown.notified() => break,
        }
        // reap finished handlers without blocking the loop
        while handlers.try_join_next().is_some() {}
    }

    info!(in_flight = handlers.len(), "shutting down, draining handlers");
    let drain = async {
        while handlers.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("grace period elapsed, aborting remaining handlers");
        handlers.abort_all();
    }

    if let Some(persister) = persister {
        persister.close();
    }
    info!("shutdown complete");
}

/// Binds the client listener; a failure here is the bind exit code.
pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "listening");
    Ok(listener)
}
