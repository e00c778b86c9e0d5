//! Eye Catcher
//!
//! Pose-tracking media pipeline that steers an animated eye toward the person
//! in front of the camera.
//!
//! # Architecture
//!
//! A frame source (camera, USB webcam or file) is normalized to the network's
//! input caps and fed through a pose-estimation spine. A side branch keeps the
//! original frame at full resolution while the inference branch scales down,
//! runs the model and decodes detections; a muxer rejoins both so results are
//! expressed in source coordinates. A passthrough stage then hands every frame
//! to the reducer, which turns the nose position of each tracked person into a
//! normalized gaze target and publishes it to cross-process shared state.
//!
//! # Module Structure
//!
//! - `graph`: Typed stage graph and its launch-string rendering
//! - `source`: Source fragments per input kind
//! - `pipeline`: Full topology assembly around the inference spine
//! - `detect`: Detection and landmark types read from the decoder
//! - `reducer`: Per-frame reduction into gaze targets
//! - `shared`: Cross-process shared gaze target and config block
//! - `config`: Layered configuration (file, environment, CLI)
//! - `gst`: GStreamer backend (feature `gstreamer`)

pub mod config;
pub mod detect;
pub mod error;
pub mod graph;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod pipeline;
pub mod reducer;
pub mod shared;
pub mod source;

pub use config::{ConfigBuilder, EyeCatcherConfig};
pub use detect::{decode_detections, BoundingBox, Detection, Keypoint, LandmarkSet};
pub use error::{ConfigError, Error, GraphError, Result, SharedStateError};
pub use graph::{Graph, GraphBuilder, PropValue, StageSpec};
pub use pipeline::{build_topology, PipelineConfig, CALLBACK_STAGE, DISPLAY_STAGE};
pub use reducer::{FrameInput, FrameObserver, FrameReducer, GazeMapping, ReducerStats};
#[cfg(unix)]
pub use shared::SharedState;
pub use shared::{GazeTarget, TargetSink};
pub use source::{source_fragment, NetworkInput, SourceKind, SourceSettings};
