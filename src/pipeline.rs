//! Pipeline topology.
//!
//! Composes a source fragment with the fixed processing spine:
//!
//! ```text
//! source ─ tee ┬─ bypass_queue ──────────────────────────┐
//!              └─ convert ─ hailonet ─ hailofilter ──────┴─ hailomuxer ─┐
//!                                                                       │
//!   ┌───────────────────────────────────────────────────────────────────┘
//!   └─ tracker ─ identity_callback ─ overlay ─ convert ─ display
//! ```
//!
//! Every spine boundary is a bounded queue. The bypass queue is deeper than
//! the rest because the display branch waits there while the inference
//! branch catches up at the muxer.

use std::path::PathBuf;

use crate::error::{ConfigError, GraphError, Result};
use crate::graph::{Graph, GraphBuilder, StageSpec};
use crate::source::{queue, source_fragment, NetworkInput, SourceSettings, QUEUE_DEPTH};

/// Depth of the display bypass queue.
pub const BYPASS_QUEUE_DEPTH: u32 = 20;

/// Name of the element the frame observer is attached to.
pub const CALLBACK_STAGE: &str = "identity_callback";
/// Name of the display sink.
pub const DISPLAY_STAGE: &str = "hailo_display";
pub const TEE_STAGE: &str = "t";
pub const MUXER_STAGE: &str = "hmux";

/// Inference model and its post-process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelParams {
    /// Compiled network (`.hef`).
    pub hef_path: PathBuf,
    pub batch_size: u32,
    /// Shared object implementing the detection decoder.
    pub postprocess_so: PathBuf,
    /// Entry point inside `postprocess_so`.
    pub function_name: String,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            hef_path: PathBuf::from("resources/yolov8s_pose_h8l_pi.hef"),
            batch_size: 2,
            postprocess_so: PathBuf::from("postprocess/libyolov8pose_post.so"),
            function_name: "filter".to_string(),
        }
    }
}

impl ModelParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Zero { field: "batch size" });
        }
        if self.function_name.trim().is_empty() {
            return Err(ConfigError::Empty("post-process function name"));
        }
        if self.hef_path.as_os_str().is_empty() {
            return Err(ConfigError::Empty("model path"));
        }
        if self.postprocess_so.as_os_str().is_empty() {
            return Err(ConfigError::Empty("post-process library path"));
        }
        Ok(())
    }

    /// Both files must exist before a live pipeline is constructed.
    pub fn check_files(&self) -> Result<(), ConfigError> {
        if !self.hef_path.is_file() {
            return Err(ConfigError::MissingFile {
                what: "model",
                path: self.hef_path.clone(),
            });
        }
        if !self.postprocess_so.is_file() {
            return Err(ConfigError::MissingFile {
                what: "post-process library",
                path: self.postprocess_so.clone(),
            });
        }
        Ok(())
    }
}

/// Display sink settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayParams {
    /// Video sink element the fps display sink wraps.
    pub video_sink: String,
    pub sync: bool,
    pub show_fps: bool,
}

impl Default for DisplayParams {
    fn default() -> Self {
        Self {
            video_sink: "autovideosink".to_string(),
            sync: true,
            show_fps: false,
        }
    }
}

/// Tracker tuning. Fixed constants; not exposed through configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerParams {
    pub class_id: u32,
    pub kalman_dist_thr: f64,
    pub iou_thr: f64,
    pub init_iou_thr: f64,
    pub keep_new_frames: u32,
    pub keep_tracked_frames: u32,
    pub keep_lost_frames: u32,
}

/// Person tracking (class 0).
pub const PERSON_TRACKER: TrackerParams = TrackerParams {
    class_id: 0,
    kalman_dist_thr: 0.8,
    iou_thr: 0.9,
    init_iou_thr: 0.7,
    keep_new_frames: 2,
    keep_tracked_frames: 15,
    keep_lost_frames: 2,
};

impl TrackerParams {
    fn stage(&self) -> StageSpec {
        StageSpec::element("hailotracker")
            .named("hailo_tracker")
            .prop("class-id", self.class_id)
            .prop("kalman-dist-thr", self.kalman_dist_thr)
            .prop("iou-thr", self.iou_thr)
            .prop("init-iou-thr", self.init_iou_thr)
            .prop("keep-new-frames", self.keep_new_frames)
            .prop("keep-tracked-frames", self.keep_tracked_frames)
            .prop("keep-lost-frames", self.keep_lost_frames)
            .prop("keep-past-metadata", true)
            .prop("qos", false)
    }
}

/// Everything needed to describe the pipeline. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub source: SourceSettings,
    pub network: NetworkInput,
    pub model: ModelParams,
    pub display: DisplayParams,
}

impl PipelineConfig {
    pub fn new(source: SourceSettings) -> Self {
        Self {
            source,
            network: NetworkInput::default(),
            model: ModelParams::default(),
            display: DisplayParams::default(),
        }
    }
}

/// Describe the full pipeline for `config`.
///
/// Configuration problems are reported before any stage is described; the
/// returned graph has already passed structural validation.
pub fn build_topology(config: &PipelineConfig) -> Result<Graph> {
    config.model.validate()?;
    let fragment = source_fragment(&config.source, &config.network)?;
    log::debug!(
        "source fragment for {}: {} stages",
        fragment.kind,
        fragment.stages.len()
    );

    let model = &config.model;
    let display = &config.display;

    let graph = GraphBuilder::new()
        .declare(StageSpec::element("hailomuxer").named(MUXER_STAGE))
        .chain_all(fragment.stages)
        .chain(StageSpec::element("tee").named(TEE_STAGE))
        // branch A: display bypass
        .chain(queue("bypass_queue", BYPASS_QUEUE_DEPTH))
        .link_into(MUXER_STAGE, Some("sink_0"))
        // branch B: inference
        .resume(TEE_STAGE)
        .chain(queue("queue_hailonet", QUEUE_DEPTH))
        .chain(StageSpec::element("videoconvert").prop("n-threads", 3u32))
        .chain(
            StageSpec::element("hailonet")
                .prop("hef-path", model.hef_path.display().to_string())
                .prop("batch-size", model.batch_size)
                .prop("force-writable", true),
        )
        .chain(queue("queue_hailofilter", QUEUE_DEPTH))
        .chain(
            StageSpec::element("hailofilter")
                .prop("function-name", model.function_name.as_str())
                .prop("so-path", model.postprocess_so.display().to_string())
                .prop("qos", false),
        )
        .chain(queue("queue_hmuc", QUEUE_DEPTH))
        .link_into(MUXER_STAGE, Some("sink_1"))
        // merged stream
        .resume(MUXER_STAGE)
        .chain(queue("queue_hailo_python", QUEUE_DEPTH))
        .chain(PERSON_TRACKER.stage())
        .chain(queue("queue_user_callback", QUEUE_DEPTH))
        .chain(StageSpec::element("identity").named(CALLBACK_STAGE))
        .chain(queue("queue_hailooverlay", QUEUE_DEPTH))
        .chain(StageSpec::element("hailooverlay"))
        .chain(queue("queue_videoconvert", QUEUE_DEPTH))
        .chain(
            StageSpec::element("videoconvert")
                .prop("n-threads", 3u32)
                .prop("qos", false),
        )
        .chain(queue("queue_hailo_display", QUEUE_DEPTH))
        .chain(
            StageSpec::element("fpsdisplaysink")
                .named(DISPLAY_STAGE)
                .prop("video-sink", display.video_sink.as_str())
                .prop("sync", display.sync)
                .prop("text-overlay", display.show_fps)
                .prop("signal-fps-measurements", true),
        )
        .finish()?;

    check_spine(&graph)?;
    Ok(graph)
}

/// The spine must have the tee feeding two branches and the muxer fed by
/// exactly two.
fn check_spine(graph: &Graph) -> Result<(), GraphError> {
    for (stage, found) in [
        (TEE_STAGE, graph.downstream(TEE_STAGE).count()),
        (MUXER_STAGE, graph.upstream(MUXER_STAGE).count()),
    ] {
        if found != 2 {
            return Err(GraphError::Spine {
                stage: stage.to_string(),
                expected: 2,
                found,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::graph::PropValue;
    use crate::source::SourceKind;

    fn config(kind: SourceKind, input: &str) -> PipelineConfig {
        PipelineConfig::new(SourceSettings::new(kind, input))
    }

    #[test]
    fn spine_order_after_muxer_is_fixed() -> Result<()> {
        let graph = build_topology(&config(SourceKind::Usb, "/dev/video0"))?;
        let factories: Vec<&str> = graph
            .walk_from(MUXER_STAGE)
            .into_iter()
            .filter_map(|name| graph.stage(name))
            .map(|s| s.spec.factory())
            .filter(|f| *f != "queue")
            .collect();
        assert_eq!(
            factories,
            vec![
                "hailomuxer",
                "hailotracker",
                "identity",
                "hailooverlay",
                "videoconvert",
                "fpsdisplaysink"
            ]
        );
        Ok(())
    }

    #[test]
    fn inference_branch_runs_net_then_decoder() -> Result<()> {
        let graph = build_topology(&config(SourceKind::Camera, ""))?;
        let branches: Vec<_> = graph.downstream(TEE_STAGE).collect();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].to, "bypass_queue");

        let inference: Vec<&str> = graph
            .walk_from(&branches[1].to)
            .into_iter()
            .filter_map(|name| graph.stage(name))
            .map(|s| s.spec.factory())
            .collect();
        assert_eq!(
            inference,
            vec![
                "queue",
                "videoconvert",
                "hailonet",
                "queue",
                "hailofilter",
                "queue",
                "hailomuxer",
                "queue",
                "hailotracker",
                "queue",
                "identity",
                "queue",
                "hailooverlay",
                "queue",
                "videoconvert",
                "queue",
                "fpsdisplaysink"
            ]
        );
        Ok(())
    }

    #[test]
    fn bypass_queue_is_the_deep_one() -> Result<()> {
        let graph = build_topology(&config(SourceKind::File, "clip.mp4"))?;
        for stage in graph.stages().iter().filter(|s| s.spec.factory() == "queue") {
            let depth = stage.spec.get("max-size-buffers");
            if stage.name == "bypass_queue" {
                assert_eq!(depth, Some(&PropValue::Int(20)));
            } else {
                assert_eq!(depth, Some(&PropValue::Int(3)), "{}", stage.name);
            }
        }
        let muxer_inputs: Vec<_> = graph
            .upstream(MUXER_STAGE)
            .map(|l| (l.from.as_str(), l.to_pad.as_deref()))
            .collect();
        assert_eq!(
            muxer_inputs,
            vec![("bypass_queue", Some("sink_0")), ("queue_hmuc", Some("sink_1"))]
        );
        Ok(())
    }

    #[test]
    fn model_and_display_parameters_reach_their_stages() -> Result<()> {
        let mut cfg = config(SourceKind::Usb, "/dev/video0");
        cfg.model.batch_size = 4;
        cfg.display.sync = false;
        cfg.display.show_fps = true;
        let graph = build_topology(&cfg)?;

        let net = graph
            .stages()
            .iter()
            .find(|s| s.spec.factory() == "hailonet")
            .expect("hailonet stage");
        assert_eq!(net.spec.get("batch-size"), Some(&PropValue::Int(4)));
        assert_eq!(net.spec.get("force-writable"), Some(&PropValue::Bool(true)));

        let sink = graph.stage(DISPLAY_STAGE).expect("display stage");
        assert_eq!(sink.spec.get("sync"), Some(&PropValue::Bool(false)));
        assert_eq!(sink.spec.get("text-overlay"), Some(&PropValue::Bool(true)));

        let tracker = graph.stage("hailo_tracker").expect("tracker stage");
        assert_eq!(tracker.spec.get("iou-thr"), Some(&PropValue::Float(0.9)));
        assert_eq!(tracker.spec.get("keep-tracked-frames"), Some(&PropValue::Int(15)));
        Ok(())
    }

    #[test]
    fn launch_string_matches_reference_layout() -> Result<()> {
        let graph = build_topology(&config(SourceKind::Usb, "/dev/video0"))?;
        let launch = graph.to_launch_string();
        assert!(launch.starts_with("hailomuxer name=hmux v4l2src name=src_0 device=/dev/video0 ! "));
        assert!(launch.contains("tee name=t ! queue name=bypass_queue"));
        assert!(launch.contains("! hmux.sink_0 t. ! queue name=queue_hailonet"));
        assert!(launch.contains("! hmux.sink_1 hmux. ! queue name=queue_hailo_python"));
        assert!(launch.contains("identity name=identity_callback"));
        assert!(launch.ends_with("signal-fps-measurements=true"));
        Ok(())
    }

    #[test]
    fn invalid_configuration_fails_before_any_stage() {
        let mut cfg = config(SourceKind::File, "");
        assert!(matches!(
            build_topology(&cfg),
            Err(Error::Config(ConfigError::MissingInput { kind: "file" }))
        ));

        cfg.source.input = "clip.mp4".to_string();
        cfg.model.batch_size = 0;
        assert!(matches!(
            build_topology(&cfg),
            Err(Error::Config(ConfigError::Zero { .. }))
        ));
    }

    #[test]
    fn single_branch_tee_is_a_spine_error() {
        let graph = GraphBuilder::new()
            .chain(StageSpec::element("videotestsrc"))
            .chain(StageSpec::element("tee").named(TEE_STAGE))
            .chain(StageSpec::element("fakesink"))
            .finish()
            .expect("graph");
        assert!(matches!(
            check_spine(&graph),
            Err(GraphError::Spine { stage, expected: 2, found: 1 }) if stage == TEE_STAGE
        ));

        let graph = build_topology(&config(SourceKind::Camera, "")).expect("topology");
        assert!(check_spine(&graph).is_ok());
    }
}
