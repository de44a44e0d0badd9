// KawPoW Stratum pool
//
// Loads pool_config.json (or $POOL_CONFIG), runs the staged startup and
// serves miners until Ctrl-C.

use anyhow::Result;
use kawpow_pool::events::{LogSeverity, PoolEvent};
use kawpow_pool::{Pool, PoolConfig, PoolOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    println!("🚀 KawPoW Pool v{}", env!("CARGO_PKG_VERSION"));

    let config = PoolConfig::load()?;
    tracing::info!(
        "📄 Loaded config: coin={} ports={:?} daemons={}",
        config.coin.symbol,
        config.ports.keys().collect::<Vec<_>>(),
        config.daemons.len()
    );

    let pool = Pool::setup(config, PoolOptions::default()).await?;
    pool.on_event(|event| match event {
        PoolEvent::Share { share, block_accepted, tx_hash } if share.is_block_candidate() => {
            tracing::info!(
                "⛏️ Block candidate at height {} from {}: accepted={} tx={}",
                share.height,
                share.worker,
                block_accepted,
                tx_hash.as_deref().unwrap_or("-")
            );
        }
        PoolEvent::Share { share, .. } => {
            tracing::debug!(
                "Share from {} diff={:.4} valid={}",
                share.worker,
                share.share_diff,
                share.is_valid_share()
            );
        }
        PoolEvent::Log(log) if log.severity == LogSeverity::Special => {
            println!("{}", log.text);
        }
        _ => {}
    });

    let addrs = pool.start().await?;
    tracing::info!("✅ Pool running, stratum on {:?}", addrs);

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutting down");
    pool.stop();
    Ok(())
}
