//! eye_catcher - pose-tracking pipeline daemon
//!
//! This daemon:
//! 1. Resolves configuration (file, environment, flags)
//! 2. Describes the pipeline for the selected source and validates it
//! 3. Creates the shared gaze state for the actuator process
//! 4. Runs the pipeline, publishing a gaze target per tracked person
//! 5. Stops on end of stream, a pipeline error, or Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use eye_catcher::{build_topology, EyeCatcherConfig, Graph};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "EYE_CATCHER_CONFIG")]
    config: Option<PathBuf>,
    /// Source kind (camera|rpi|usb|file). Inferred from --input when omitted.
    #[arg(long, value_name = "KIND")]
    source: Option<String>,
    /// Device path for usb sources, media path for file sources.
    #[arg(long)]
    input: Option<String>,
    /// Draw the fps overlay and log fps measurements.
    #[arg(long)]
    show_fps: bool,
    /// Map pixel data for the frame callback.
    #[arg(long)]
    use_frame: bool,
    /// Render as fast as frames arrive instead of by timestamp.
    #[arg(long)]
    no_sync: bool,
    /// Restart file sources at end of stream.
    #[arg(long)]
    loop_file: bool,
    /// Print the launch description and exit.
    #[arg(long)]
    dump_pipeline: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut builder =
        EyeCatcherConfig::builder(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(kind) = &args.source {
        builder.source_kind(kind);
    }
    if let Some(input) = &args.input {
        builder.input(input);
    }
    if args.show_fps {
        builder.show_fps(true);
    }
    if args.use_frame {
        builder.use_frame(true);
    }
    if args.no_sync {
        builder.sync(false);
    }
    if args.loop_file {
        builder.loop_file(true);
    }
    let config = builder.build().context("invalid configuration")?;

    let graph = build_topology(&config.pipeline).context("failed to describe pipeline")?;
    let launch = graph.to_launch_string();
    if args.dump_pipeline {
        println!("{}", launch);
        return Ok(());
    }
    log::info!(
        "eye_catcher {} source={} input={:?}",
        env!("CARGO_PKG_VERSION"),
        config.pipeline.source.kind,
        config.pipeline.source.input
    );
    log::info!("pipeline: {}", launch);

    config.pipeline.model.check_files()?;
    run(&config, &graph)
}

#[cfg(all(feature = "gstreamer", unix))]
fn run(config: &EyeCatcherConfig, graph: &Graph) -> Result<()> {
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use eye_catcher::gst::{CustomMetaRoiReader, LivePipeline};
    use eye_catcher::{FrameReducer, SharedState, CALLBACK_STAGE, DISPLAY_STAGE};

    let state = SharedState::create(&config.shared_path).with_context(|| {
        format!(
            "failed to create shared gaze state at {}",
            config.shared_path.display()
        )
    })?;
    log::info!("shared gaze state at {}", state.path().display());

    let live = LivePipeline::build(graph).context("failed to construct pipeline")?;
    let reducer = FrameReducer::new(state)
        .with_mapping(config.gaze)
        .with_frame_access(config.use_frame);
    let observer = live.attach_observer(CALLBACK_STAGE, reducer, CustomMetaRoiReader::new())?;
    if config.pipeline.display.show_fps {
        live.log_fps(DISPLAY_STAGE)?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let result = live.run(&stop, config.loop_file);

    let stats = match observer.lock() {
        Ok(reducer) => reducer.stats(),
        Err(poisoned) => poisoned.into_inner().stats(),
    };
    log::info!(
        "processed {} frames: {} persons, {} targets published, {} skipped",
        stats.frames,
        stats.persons,
        stats.published,
        stats.skipped
    );
    result?;
    Ok(())
}

#[cfg(not(all(feature = "gstreamer", unix)))]
fn run(_config: &EyeCatcherConfig, _graph: &Graph) -> Result<()> {
    anyhow::bail!("eye_catcher was built without the `gstreamer` feature; rebuild with --features gstreamer or use --dump-pipeline")
}
