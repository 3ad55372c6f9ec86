mod config;
mod connection;
mod server;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info};

use cinder_cluster::{Cluster, ClusterConfig, PeerClient, RaftNode, RaftNodeConfig, TopologyFsm};
use cinder_core::Engine;
use cinder_persistence::AofPersister;
use cinder_protocol::cmdline;

use config::{exit, Cli, ServerContext};
use connection::Executor;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cinder=info".into()),
        )
        .init();

    let context = match Cli::parse().into_context() {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(exit::CONFIG as u8);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "runtime start failed");
            return ExitCode::from(exit::CONFIG as u8);
        }
    };
    let code = runtime.block_on(run(context));
    ExitCode::from(code as u8)
}

async fn run(context: ServerContext) -> i32 {
    info!("cinder server starting");
    let engine = Engine::new(context.engine.clone());
    let _wheel = engine.start_wheel();

    // persistence: load the AOF before the sink is bound, so replayed
    // commands never echo back into the file
    let persister = if let Some(aof) = &context.aof {
        match AofPersister::open(Arc::clone(&engine), aof.clone(), true) {
            Ok(p) => {
                engine.bind_aof_sink(p.sink());
                info!(keys = engine.total_keys(), "aof loaded");
                Some(p)
            }
            Err(e) => {
                error!(error = %e, "aof open failed");
                return exit::PERSISTENCE;
            }
        }
    } else {
        None
    };

    // cluster mode: raft node, router, bootstrap-or-join
    let executor = if let Some(settings) = &context.cluster {
        let raft = match RaftNode::start(
            RaftNodeConfig {
                id: settings.node_id,
                addr: settings.raft_addr,
            },
            Arc::new(TopologyFsm::new()),
        )
        .await
        {
            Ok(node) => node,
            Err(e) => {
                error!(error = %e, "raft start failed");
                return exit::BIND;
            }
        };

        let cluster = Cluster::new(
            Arc::clone(&engine),
            Arc::clone(&raft),
            ClusterConfig {
                self_id: settings.announce_addr.clone(),
                password: settings.password.clone(),
            },
        );
        cluster.watch_failover(|new_master| {
            info!(master = %new_master, "replicating from new master");
        });

        match &settings.join {
            Some(seed) => {
                let line = {
                    let mut line = cmdline([
                        "cluster-meet",
                        settings.node_id.to_string().as_str(),
                        settings.raft_addr.to_string().as_str(),
                        settings.announce_addr.as_str(),
                    ]);
                    if let Some(master) = &settings.master {
                        line.push(bytes::Bytes::copy_from_slice(master.as_bytes()));
                    }
                    line
                };
                match join_cluster(seed, settings.password.as_deref(), &line).await {
                    Ok(()) => info!(seed = %seed, "joined cluster"),
                    Err(e) => {
                        error!(error = %e, "cluster join failed");
                        return exit::CONFIG;
                    }
                }
            }
            None => {
                if !raft.has_existing_state().await {
                    if let Err(e) = raft
                        .bootstrap(settings.announce_addr.clone(), cinder_cluster::SLOT_COUNT)
                        .await
                    {
                        error!(error = %e, "cluster bootstrap failed");
                        return exit::CONFIG;
                    }
                    info!("cluster bootstrapped");
                }
            }
        }
        Executor::Cluster(cluster)
    } else {
        Executor::Standalone(Arc::clone(&engine))
    };

    let listener = match server::bind(context.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %context.listen, error = %e, "bind failed");
            return exit::BIND;
        }
    };

    let shutdown = Arc::new(Notify::new());
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.notify_one();
            }
        });
    }

    server::run(listener, executor, persister, shutdown).await;
    exit::OK
}

async fn join_cluster(
    seed: &str,
    password: Option<&str>,
    line: &cinder_protocol::CmdLine,
) -> Result<(), cinder_cluster::ClusterError> {
    let mut client = PeerClient::connect(seed, password).await?;
    match client.send(line).await? {
        cinder_protocol::Frame::Error(msg) => {
            Err(cinder_cluster::ClusterError::PeerError(msg))
        }
        _ => Ok(()),
    }
}
