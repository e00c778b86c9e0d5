//! gaze_monitor - attach to the shared gaze state and print updates
//!
//! Stands in for the actuator process: maps the same shared block, follows
//! the published target and optionally writes the config block.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Backing file of the shared state.
    #[arg(long, env = "EYE_CATCHER_SHARED_PATH", default_value = "/dev/shm/eye-catcher")]
    path: PathBuf,
    /// Poll interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,
    /// Write this JSON document into the config block and exit.
    #[arg(long, value_name = "JSON")]
    set_config: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    monitor(Args::parse())
}

#[cfg(unix)]
fn monitor(args: Args) -> Result<()> {
    use anyhow::{anyhow, Context};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use eye_catcher::SharedState;

    let state = SharedState::open(&args.path)
        .with_context(|| format!("no shared gaze state at {}", args.path.display()))?;

    if let Some(raw) = &args.set_config {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| anyhow!("--set-config is not JSON: {}", e))?;
        state.write_config(&value)?;
        log::info!("config block written to {}", args.path.display());
        return Ok(());
    }

    if let Some(config) = state.read_config::<serde_json::Value>()? {
        log::info!("config block: {}", config);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("monitoring {} (Ctrl-C to stop)", args.path.display());
    let interval = Duration::from_millis(args.interval_ms.max(1));
    let mut last_sequence = None;
    while !stop.load(Ordering::SeqCst) {
        let snapshot = state.snapshot()?;
        if last_sequence != Some(snapshot.sequence) {
            println!(
                "#{} x={:.3} y={:.3}",
                snapshot.sequence, snapshot.target.x, snapshot.target.y
            );
            last_sequence = Some(snapshot.sequence);
        }
        std::thread::sleep(interval);
    }
    Ok(())
}

#[cfg(not(unix))]
fn monitor(_args: Args) -> Result<()> {
    anyhow::bail!("gaze_monitor needs a unix shared-memory mapping")
}
