// share-node: P2P distribution daemon for a self-hosted file-sharing server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use share_core::{ChunkStore, PeerId, ShareCore};
use share_node::{config, FsStore, Node, NodeConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Args {
    force_p2p: bool,
    config: Option<PathBuf>,
    fetch: Option<String>,
    add: Option<(String, PathBuf)>,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = Args {
        force_p2p: false,
        config: None,
        fetch: None,
        add: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("share-node {}", VERSION);
                return Ok(None);
            }
            "--p2p" => args.force_p2p = true,
            "--config" => {
                let path = it.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "fetch" => {
                let id = it.next().context("fetch needs a file id")?;
                args.fetch = Some(id);
            }
            "add" => {
                let id = it.next().context("add needs a file id")?;
                let path = it.next().context("add needs a path")?;
                args.add = Some((id, PathBuf::from(path)));
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(Some(args))
}

fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };
    init_logging();

    let mut cfg: NodeConfig = match &args.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };
    if args.force_p2p {
        cfg.enable_p2p = true;
    }

    if let Some((id, path)) = &args.add {
        let store = FsStore::open(&cfg.data_dir)
            .with_context(|| format!("opening store at {}", cfg.data_dir.display()))?;
        let file = store
            .import(id, path)
            .with_context(|| format!("importing {}", path.display()))?;
        info!(file = %file.id, size = file.size, "added to store");
        println!("{} {} {}", file.id, file.size, file.fingerprint);
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, args.fetch))
}

async fn run(cfg: NodeConfig, fetch: Option<String>) -> anyhow::Result<()> {
    let tracker = match &cfg.tracker {
        Some(host) => Some(resolve(host).await?),
        None => None,
    };
    let store: Arc<dyn ChunkStore> = Arc::new(
        FsStore::open(&cfg.data_dir)
            .with_context(|| format!("opening store at {}", cfg.data_dir.display()))?,
    );
    let core = Arc::new(ShareCore::new(
        PeerId::generate(&cfg.listen),
        cfg.transfer.clone(),
        store,
    ));

    if let Some(file_id) = fetch {
        if tracker.is_none() {
            bail!("fetch needs a tracker (set `tracker` or GOFILE_P2P_TRACKER)");
        }
        let node = Node::new(core, tracker);
        let file = node.fetch(&file_id).await?;
        println!("{} {} {}", file.id, file.size, file.fingerprint);
        return Ok(());
    }

    if !cfg.enable_p2p {
        info!("p2p disabled; set enable_p2p or pass --p2p");
        return Ok(());
    }
    let mut node = Node::new(core, tracker);
    let local = node
        .serve(cfg.listen)
        .await
        .with_context(|| format!("starting p2p server on {}", cfg.listen))?;
    info!(addr = %local, version = VERSION, "share-node running");
    shutdown_signal().await?;
    info!("shutting down");
    node.shutdown().await;
    Ok(())
}

async fn resolve(host: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(host)
        .await
        .with_context(|| format!("resolving tracker {host}"))?
        .next()
        .with_context(|| format!("tracker {host} has no address"))
}

/// Initialize logging with tracing. `RUST_LOG` overrides the default filter.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("share_node=info,share_core=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
