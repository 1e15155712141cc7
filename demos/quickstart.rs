use anyhow::Result;
use ghost_thumb::device::DeviceBackend;
use ghost_thumb::pilot::DiskCaptureStore;
use ghost_thumb::{
    ComputerUseClient, ComputerUseConfig, Pilot, PilotConfig, SandboxClient, SandboxConfig,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let device = SandboxClient::new(SandboxConfig::default())?;
    let mut predict_cfg = ComputerUseConfig::default();

    // Reuse a warm device when one is provided, and calibrate the predicted
    // coordinates to its real panel if the backend can report it.
    let session_id = std::env::var("SANDBOX_SESSION_ID").ok();
    if let Some(id) = &session_id {
        if let Ok(size) = device.screen_size(id).await {
            predict_cfg.display = size;
        }
    }
    let predictor = ComputerUseClient::new(predict_cfg)?;

    let store = Arc::new(DiskCaptureStore::new(
        std::env::temp_dir().join("ghost_thumb_runs"),
    ));
    let pilot =
        Pilot::new(device, predictor, PilotConfig::default()).with_capture_store(store);

    let outcome = pilot
        .run_with(
            "Open the YouTube app, search for 'lofi beats', and play the first result.",
            session_id.as_deref(),
            None,
        )
        .await?;

    println!(
        "{} after {} iteration(s) on session {}\n  {}\n  ({})",
        if outcome.success { "SUCCESS" } else { "FAILURE" },
        outcome.iterations,
        outcome.session_id,
        outcome.message,
        outcome.reason
    );
    Ok(())
}
