//! Platform server command: `shipyard serve`.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use shipyard::config::PlatformConfig;
use shipyard::platform;

pub async fn cmd_serve(config: PlatformConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let mut sequencer = platform::sequencer(&config, shutdown)?;
    let ready = sequencer.run().await?;
    info!(
        addr = %ready.local_addr(),
        steps = ?ready.steps().names(),
        worker = ?ready.worker_state(),
        "Platform ready"
    );
    ready.wait().await
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });
}
