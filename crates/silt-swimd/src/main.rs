//! silt-swimd: a standalone SWIM gossip node.
//!
//! Single OS process running a Tokio runtime around one
//! [`silt_swim::node::UdpNode`]. Configured from a TOML file; announces
//! a voluntary quit on ctrl-c.

mod config;

use std::path::PathBuf;

use tracing::info;
use uuid::Uuid;

use silt_swim::node::UdpNode;
use silt_swim::SwimCfg;

use crate::config::SwimdConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("swimd.toml"));
    let config = if path.exists() {
        SwimdConfig::load(&path)?
    } else {
        SwimdConfig::default()
    };

    // 2. Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("silt={}", config.log_level).parse()?),
        )
        .init();

    info!(config = %path.display(), "silt-swimd starting");

    // 3. Bind the node
    let uuid = config.uuid.unwrap_or_else(Uuid::new_v4);
    let mut node = UdpNode::bind(SwimCfg {
        uri: Some(config.listen.clone()),
        heartbeat: Some(config.heartbeat_ms),
        ack_timeout: config.ack_timeout_ms,
        gc_mode: Some(config.gc),
        uuid: Some(uuid),
    })
    .await?;
    info!(addr = %node.addr(), %uuid, "node is up");

    // 4. Seed peers
    for peer in &config.peers {
        node.swim_mut().add_member(&peer.uri, peer.uuid)?;
        info!(uri = %peer.uri, uuid = %peer.uuid, "seed peer added");
    }

    // 5. Run until ctrl-c, then leave gracefully
    let interrupted = tokio::select! {
        result = node.run() => {
            result?;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        info!("shutting down");
        node.quit().await?;
    }

    Ok(())
}
