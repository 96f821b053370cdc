//! Cairn replicated file store node.
//!
//! Commands:
//!   serve   Listen, dial bootstrap peers, replicate until Ctrl-C
//!   demo    Two in-process nodes: store on one, read back from the other

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use cairn_p2p::{FileServer, FileServerConfig, ServerError};
use clap::Parser;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

/// How long the demo waits for the nodes to connect and replicate.
const DEMO_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    tracing::info!("cairn-node v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command.clone() {
        Commands::Serve => serve(&cli).await,
        Commands::Demo { key, content } => demo(&cli, &key, &content).await,
    }
}

async fn serve(cli: &Cli) -> anyhow::Result<()> {
    let server = FileServer::new(cli.server_config());
    let mut running = spawn_server(&server);

    let signal = tokio::select! {
        result = &mut running => {
            // Exited without a stop request: bind failure or a dead dispatch loop.
            result.context("server task failed")?.context("server stopped")?;
            bail!("server stopped unexpectedly");
        }
        signal = shutdown_signal() => signal,
    };
    if signal.is_ok() {
        tracing::info!("shutdown signal received");
    }

    server.stop();
    running
        .await
        .context("server task failed")?
        .context("server shutdown failed")?;
    signal?;
    tracing::info!("node stopped");
    Ok(())
}

async fn demo(cli: &Cli, key: &str, content: &str) -> anyhow::Result<()> {
    let base = cli.server_config();

    let a = FileServer::new(FileServerConfig {
        listen_addr: "127.0.0.1:0".into(),
        storage_root: cli.storage_root.join("node_a"),
        bootstrap_nodes: Vec::new(),
        ..base.clone()
    });
    let a_task = spawn_server(&a);
    let a_addr = wait_for(|| a.listen_addr())
        .await
        .context("node A did not start listening")?;

    let b = FileServer::new(FileServerConfig {
        listen_addr: "127.0.0.1:0".into(),
        storage_root: cli.storage_root.join("node_b"),
        bootstrap_nodes: vec![a_addr.to_string()],
        ..base
    });
    let b_task = spawn_server(&b);

    wait_for(|| (a.peer_count() > 0 && b.peer_count() > 0).then_some(()))
        .await
        .context("nodes did not connect")?;
    println!("node A {a_addr} <-> node B {:?}", b.listen_addr());

    let size = a
        .store_file(key, &mut content.as_bytes())
        .await
        .with_context(|| format!("storing {key:?} on node A"))?;
    println!("node A stored {key:?} ({size} bytes)");

    let replicated = tokio::time::timeout(DEMO_WAIT, async {
        while !b.has(key).await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok();
    if !replicated {
        tracing::warn!(key, "not replicated to node B yet, falling back to a network lookup");
    }

    let data = b
        .get(key)
        .await
        .with_context(|| format!("reading {key:?} on node B"))?;
    println!("node B read {key:?}: {}", String::from_utf8_lossy(&data));

    for (name, server, task) in [("A", a, a_task), ("B", b, b_task)] {
        server.stop();
        task.await
            .with_context(|| format!("node {name} task failed"))?
            .with_context(|| format!("node {name} shutdown failed"))?;
    }
    Ok(())
}

fn spawn_server(server: &Arc<FileServer>) -> JoinHandle<Result<(), ServerError>> {
    tokio::spawn(Arc::clone(server).start())
}

async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> anyhow::Result<T> {
    tokio::time::timeout(DEMO_WAIT, async {
        loop {
            if let Some(v) = probe() {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("timed out")
}

/// `RUST_LOG` wins; otherwise `-v` raises our own crates first.
fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "info",
        1 => "info,cairn_core=debug,cairn_p2p=debug,cairn_node=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity > 0)
        .init();
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            ctrl_c = tokio::signal::ctrl_c() => ctrl_c.context("listening for Ctrl-C")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;

    Ok(())
}
