//! Host provisioning command: `shipyard setup`.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use shipyard::config::PlatformConfig;
use shipyard::platform;

pub async fn cmd_setup(config: &PlatformConfig) -> Result<()> {
    let mut sequencer = platform::sequencer(config, CancellationToken::new())?;
    sequencer.run_provisioning().await?;
    info!(
        base = %config.paths.base.display(),
        steps = ?sequencer.trace().names(),
        "Infrastructure provisioned"
    );
    Ok(())
}
