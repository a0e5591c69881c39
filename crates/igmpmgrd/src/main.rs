//! igmpmgrd - multicast membership manager daemon
//!
//! Entry point: argument handling, logging, startup resync and the event
//! loop.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use igmpmgrd::{GroupRetention, IgmpMgr, MembershipConfig};
use pfe_client::{MockEngine, Transport};
use pfe_object_model::CommandConfig;

#[derive(Debug, Parser)]
#[command(name = "igmpmgrd", about = "Multicast membership manager daemon")]
struct Args {
    /// Run against the in-memory mock engine instead of a live transport.
    #[arg(long)]
    mock: bool,

    /// Delete groups that lose their last source.
    #[arg(long)]
    prune_empty_groups: bool,

    /// Log verbosely.
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    info!("--- Starting igmpmgrd ---");

    let transport: Arc<dyn Transport> = if args.mock {
        info!("using in-memory mock engine");
        Arc::new(MockEngine::new())
    } else {
        // Live engine transports register here as they land.
        anyhow::bail!("no live transport configured; run with --mock");
    };

    let membership_config = MembershipConfig {
        retention: if args.prune_empty_groups {
            GroupRetention::PruneEmpty
        } else {
            GroupRetention::RetainEmpty
        },
    };
    let mgr = IgmpMgr::new(transport, CommandConfig::default(), membership_config);

    let summary = mgr
        .resync()
        .await
        .context("startup resync against the engine failed")?;
    info!(
        "startup resync: adopted {}, confirmed {}, reapplied {}",
        summary.adopted, summary.confirmed, summary.reapplied
    );

    mgr.start().await.context("event subscription failed")?;
    info!("igmpmgrd initialization complete, entering event loop");

    let runner = {
        let mgr = mgr.clone();
        tokio::spawn(async move { mgr.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    mgr.stop().await;
    runner.abort();
    info!("--- igmpmgrd stopped ---");
    Ok(())
}
