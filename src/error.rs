//! Error taxonomy.
//!
//! Only configuration and graph-construction failures ever leave the library;
//! per-frame conditions (missing buffer data, unparsable detections) are
//! absorbed inside the reducer and never surface here.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Shared(#[from] SharedStateError),
}

/// Fatal: raised before any stage of the graph is described or constructed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown source kind {0:?} (expected camera, usb or file)")]
    UnknownSourceKind(String),
    #[error("unknown pixel format {0:?}")]
    UnknownPixelFormat(String),
    #[error("{kind} source requires an input path")]
    MissingInput { kind: &'static str },
    #[error("{what} not found at {}", path.display())]
    MissingFile { what: &'static str, path: PathBuf },
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("tracking band is empty or inverted (top {top}, bottom {bottom})")]
    Band { top: f32, bottom: f32 },
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
    #[error("{var} has invalid value {value:?}")]
    Env { var: &'static str, value: String },
}

/// Fatal: the graph description is malformed or a stage could not be built.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph has no stages")]
    EmptyGraph,
    #[error("duplicate stage name {0:?}")]
    DuplicateStage(String),
    #[error("unknown stage {0:?}")]
    UnknownStage(String),
    #[error("no open branch to extend (after linking into {0:?})")]
    NoCursor(String),
    #[error("stage {stage:?} links to itself")]
    SelfLink { stage: String },
    #[error("pad {pad:?} of {stage:?} is linked more than once")]
    PadReused { stage: String, pad: String },
    #[error("graph must have exactly one source stage, found {0}")]
    Sources(usize),
    #[error("stage {0:?} has no downstream link and is not the sink")]
    DanglingBranch(String),
    #[error("{stage:?} has {found} branches, expected {expected}")]
    Spine {
        stage: String,
        expected: usize,
        found: usize,
    },
    #[error("element factory {factory:?} is not available (stage {stage:?})")]
    MissingElement { factory: String, stage: String },
    #[error("element {stage:?} has no property {property:?}")]
    UnknownProperty { stage: String, property: String },
    #[error("element {stage:?} rejects {property}={value:?}")]
    InvalidProperty {
        stage: String,
        property: String,
        value: String,
    },
    #[error("invalid caps for {stage:?}: {caps}")]
    InvalidCaps { stage: String, caps: String },
    #[error("failed to link {from} -> {to}: {reason}")]
    Link {
        from: String,
        to: String,
        reason: String,
    },
    #[error("pipeline backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum SharedStateError {
    #[error("shared state I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("shared state at {} is not initialised or has an incompatible layout", path.display())]
    Layout { path: PathBuf },
    #[error("shared state lock failed: {0}")]
    Lock(std::io::Error),
    #[error("config block of {len} bytes exceeds capacity of {capacity}")]
    ConfigTooLarge { len: usize, capacity: usize },
    #[error("config block is not valid: {0}")]
    ConfigCodec(#[from] serde_json::Error),
}
